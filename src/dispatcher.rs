use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{DispatcherConfig, Env};
use crate::credentials::{CredentialRotator, CredentialSet};
use crate::error::GenerationFailure;
use crate::hosting::ImageHost;
use crate::providers::{ChatCompletionsImages, ImagesApi, ProviderAdapter};
use crate::retry::{CredentialOutcome, RetryExecutor};
use crate::store::{ImageStore, REFERENCE_PREFIX};
use crate::types::{GenerationRequest, GenerationResult, ProviderKind, ReferenceImage};
use crate::{ImagegenError, Result};

struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    rotator: Arc<CredentialRotator>,
    executor: RetryExecutor,
}

/// Entry point that walks a provider's credentials until one of them yields an image.
///
/// Rate limiting is the caller's job; see [`crate::RateLimiter`].
pub struct Dispatcher {
    slots: HashMap<ProviderKind, ProviderSlot>,
    store: Arc<ImageStore>,
    host: Option<Arc<dyn ImageHost>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers = self.providers();
        providers.sort_by_key(|kind| kind.as_str());
        f.debug_struct("Dispatcher")
            .field("providers", &providers)
            .field("images_dir", &self.store.images_dir())
            .field("hosting", &self.host.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self {
            slots: HashMap::new(),
            store,
            host: None,
        }
    }

    /// Registers `adapter` under its own [`ProviderKind`], replacing any earlier registration.
    pub fn with_provider(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        credentials: CredentialSet,
        executor: RetryExecutor,
    ) -> Self {
        self.slots.insert(
            adapter.kind(),
            ProviderSlot {
                adapter,
                rotator: Arc::new(CredentialRotator::new(credentials)),
                executor,
            },
        );
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ImageHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn from_config(config: &DispatcherConfig, env: &Env) -> Result<Self> {
        let store = Arc::new(config.image_store());
        let mut dispatcher = Self::new(store.clone());

        if let Some(chat) = &config.chat_completions {
            let adapter = ChatCompletionsImages::new(store.clone())
                .with_base_url(&chat.base_url)
                .with_model(&chat.model)
                .with_options(chat.options.clone())
                .with_headers(chat.headers.clone());
            dispatcher = dispatcher.with_provider(
                Arc::new(adapter),
                chat.keys.resolve(env)?,
                RetryExecutor::new(chat.max_retry_attempts),
            );
        }
        if let Some(images) = &config.images_api {
            let adapter = ImagesApi::new(store.clone())
                .with_base_url(&images.base_url)
                .with_model(&images.model)
                .with_options(images.options.clone());
            dispatcher = dispatcher.with_provider(
                Arc::new(adapter),
                images.keys.resolve(env)?,
                RetryExecutor::new(images.max_retry_attempts),
            );
        }
        if dispatcher.slots.is_empty() {
            return Err(ImagegenError::Config(
                "no provider configured; add a [chat_completions] or [images_api] section"
                    .to_string(),
            ));
        }
        if let Some(host) = config.image_host() {
            dispatcher = dispatcher.with_host(host);
        }
        Ok(dispatcher)
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    pub fn host(&self) -> Option<&dyn ImageHost> {
        self.host.as_deref()
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        self.slots.keys().copied().collect()
    }

    pub fn rotator(&self, provider: ProviderKind) -> Option<&CredentialRotator> {
        self.slots.get(&provider).map(|slot| slot.rotator.as_ref())
    }

    pub async fn generate(
        &self,
        prompt: &str,
        reference_images: Vec<ReferenceImage>,
        provider: ProviderKind,
    ) -> GenerationResult {
        let request = GenerationRequest::new(prompt).with_reference_images(reference_images);
        self.dispatch(provider, request).await
    }

    /// Never fails with [`ImagegenError`]; every path ends in a [`GenerationResult`].
    pub async fn dispatch(
        &self,
        provider: ProviderKind,
        mut request: GenerationRequest,
    ) -> GenerationResult {
        if request.prompt.trim().is_empty() {
            return Err(GenerationFailure::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        let Some(slot) = self.slots.get(&provider) else {
            return Err(GenerationFailure::InvalidRequest(format!(
                "provider {provider} is not configured"
            )));
        };

        if provider == ProviderKind::ImagesApi {
            request.reference_images =
                self.host_inline_references(std::mem::take(&mut request.reference_images))
                    .await;
        }

        let rounds = slot.rotator.len();
        let mut last = None;
        for round in 0..rounds {
            let credential = slot.rotator.current().await;
            tracing::info!(
                %provider,
                key_index = credential.ordinal(),
                keys = rounds,
                "generating image"
            );

            match slot
                .executor
                .run(slot.adapter.as_ref(), &credential, &request)
                .await
            {
                CredentialOutcome::Generated(image) => return Ok(image),
                CredentialOutcome::Terminal(failure) => {
                    tracing::warn!(%provider, error = %failure, "generation stopped");
                    return Err(failure);
                }
                CredentialOutcome::Exhausted { attempts, last: failure } => {
                    tracing::warn!(
                        %provider,
                        key_index = credential.ordinal(),
                        attempts,
                        error = %failure.message,
                        "api key exhausted"
                    );
                    last = Some(Box::new(failure.into_generation_failure()));
                    if round + 1 < rounds {
                        slot.rotator.advance().await;
                    }
                }
            }
        }

        tracing::error!(%provider, keys = rounds, "all api keys exhausted");
        Err(GenerationFailure::AllCredentialsExhausted { last })
    }

    /// The images API only takes URLs; inline references are stored and published first.
    async fn host_inline_references(&self, images: Vec<ReferenceImage>) -> Vec<ReferenceImage> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let (media_type, data) = match image {
                ReferenceImage::Url { url } => {
                    out.push(ReferenceImage::Url { url });
                    continue;
                }
                ReferenceImage::Inline { media_type, data } => (media_type, data),
            };
            let Some(host) = self.host.as_deref() else {
                tracing::warn!("no image host configured, dropping inline reference image");
                continue;
            };

            let format = media_type.strip_prefix("image/").unwrap_or("png");
            let published = match self.store.save_base64(REFERENCE_PREFIX, &data, format).await {
                Ok(saved) => host.publish(&saved.path).await,
                Err(err) => Err(err),
            };
            match published {
                Ok(url) => out.push(ReferenceImage::Url { url }),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to host reference image, dropping it");
                }
            }
        }
        out
    }
}
