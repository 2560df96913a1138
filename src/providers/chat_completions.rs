use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use super::{
    AttemptFailure, AttemptOutcome, Extractor, FailureKind, ProviderAdapter, ResponseBody,
    error_message, extract_first, is_quota_status, join_endpoint,
};
use crate::error::ImagegenError;
use crate::store::ImageStore;
use crate::types::{ChatCompletionsOptions, GenerationRequest, ProviderKind, split_data_uri};
use crate::utils::http::response_text_bounded;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash-image-preview:free";
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

const CHAT_COMPLETIONS_ENDPOINT: &str = "v1/chat/completions";

pub fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "HTTP-Referer".to_string(),
            "https://github.com/astrbot".to_string(),
        ),
        ("X-Title".to_string(), "AstrBot LLM Draw Plus".to_string()),
    ])
}

fn data_uri_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"data:image/([^;]+);base64,([A-Za-z0-9+/=]+)").expect("data uri regex is valid")
    })
}

/// Where the chat answer put its image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChatImage {
    Inline { format: String, data: String },
    Remote { url: String },
}

impl ChatImage {
    fn from_url(url: &str) -> Option<Self> {
        let url = url.trim();
        if let Some((media_type, data)) = split_data_uri(url) {
            let format = media_type.trim_start_matches("image/").to_string();
            return Some(Self::Inline {
                format,
                data: data.to_string(),
            });
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Some(Self::Remote {
                url: url.to_string(),
            });
        }
        None
    }
}

fn first_message(body: ResponseBody<'_>) -> Option<&Value> {
    body.json?.get("choices")?.get(0)?.get("message")
}

/// `choices[0].message.images[].image_url.url`, as OpenRouter returns Gemini images.
fn native_images(body: ResponseBody<'_>) -> Option<ChatImage> {
    let images = first_message(body)?.get("images")?.as_array()?;
    images.iter().find_map(|item| {
        let url = item
            .get("image_url")
            .and_then(|image_url| image_url.get("url").or(Some(image_url)))
            .or_else(|| item.get("url"))
            .and_then(Value::as_str)?;
        ChatImage::from_url(url)
    })
}

/// First `data:image/...;base64,...` embedded in the message text.
fn content_data_uri(body: ResponseBody<'_>) -> Option<ChatImage> {
    let content = first_message(body)?.get("content")?;
    let texts: Vec<&str> = match content {
        Value::String(text) => vec![text.as_str()],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    };
    texts.into_iter().find_map(|text| {
        let captures = data_uri_regex().captures(text)?;
        Some(ChatImage::Inline {
            format: captures[1].to_string(),
            data: captures[2].to_string(),
        })
    })
}

const EXTRACTORS: &[(&str, Extractor<ChatImage>)] = &[
    ("message.images", native_images),
    ("message.content", content_data_uri),
];

pub(crate) fn extract_image(json: &Value) -> Option<(&'static str, ChatImage)> {
    extract_first(
        ResponseBody {
            json: Some(json),
            text: "",
        },
        EXTRACTORS,
    )
}

/// Image generation through a multimodal `/v1/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatCompletionsImages {
    http: reqwest::Client,
    base_url: String,
    model: String,
    options: ChatCompletionsOptions,
    headers: BTreeMap<String, String>,
    store: Arc<ImageStore>,
}

impl ChatCompletionsImages {
    pub fn new(store: Arc<ImageStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            options: ChatCompletionsOptions::default(),
            headers: default_headers(),
            store,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_options(mut self, options: ChatCompletionsOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn endpoint(&self) -> String {
        join_endpoint(&self.base_url, CHAT_COMPLETIONS_ENDPOINT)
    }

    pub fn build_body(&self, request: &GenerationRequest) -> Value {
        let options = request.chat_completions.as_ref().unwrap_or(&self.options);
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model);
        let text = format!("Generate an image: {}", request.prompt);

        let content = if request.reference_images.is_empty() {
            Value::String(text)
        } else {
            let mut parts = vec![serde_json::json!({ "type": "text", "text": text })];
            parts.extend(request.reference_images.iter().map(|image| {
                serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": image.to_image_url() }
                })
            }));
            Value::Array(parts)
        };

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert(
            "messages".to_string(),
            serde_json::json!([{ "role": "user", "content": content }]),
        );
        body.insert("max_tokens".to_string(), options.max_tokens.into());
        body.insert(
            "temperature".to_string(),
            serde_json::json!(options.temperature),
        );
        Value::Object(body)
    }

    async fn store_image(&self, image: ChatImage) -> AttemptOutcome {
        let prefix = ProviderKind::ChatCompletions.file_prefix();
        let saved = match image {
            ChatImage::Inline { format, data } => {
                self.store.save_base64(prefix, &data, &format).await
            }
            ChatImage::Remote { url } => self.store.download(prefix, &url).await,
        };
        match saved {
            Ok(image) => AttemptOutcome::Generated(image),
            Err(err) => {
                tracing::warn!(error = %err, "failed to persist chat completion image");
                AttemptOutcome::StorageFailed(err.to_string())
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for ChatCompletionsImages {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ChatCompletions
    }

    async fn attempt(&self, api_key: &str, request: &GenerationRequest) -> AttemptOutcome {
        let body = self.build_body(request);
        let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
        tracing::debug!(
            model,
            reference_images = request.reference_images.len(),
            "sending chat completion image request"
        );

        let mut req = self.http.post(self.endpoint()).bearer_auth(api_key);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let response = match req.json(&body).send().await {
            Ok(response) => response,
            Err(err) => return AttemptOutcome::Failed(AttemptFailure::network(&err)),
        };

        let status = response.status();
        let text = match response_text_bounded(response).await {
            Ok(text) => text,
            Err(ImagegenError::Http(err)) => {
                return AttemptOutcome::Failed(AttemptFailure::network(&err));
            }
            Err(err) => {
                return AttemptOutcome::Failed(AttemptFailure::transient(
                    Some(status.as_u16()),
                    err.to_string(),
                ));
            }
        };
        let json = serde_json::from_str::<Value>(&text).ok();

        if status.is_success() {
            let Some(json) = json.as_ref().filter(|value| value.get("choices").is_some()) else {
                return AttemptOutcome::Failed(AttemptFailure::transient(
                    Some(status.as_u16()),
                    "chat completion response has no choices",
                ));
            };
            return match extract_image(json) {
                Some((source, image)) => {
                    tracing::debug!(source, "found image in chat completion");
                    self.store_image(image).await
                }
                None => {
                    tracing::info!("chat completion succeeded but carried no image");
                    AttemptOutcome::NoImage
                }
            };
        }

        let message = error_message(status, json.as_ref());
        let kind = if is_quota_status(status, &text, &[]) {
            FailureKind::Quota
        } else {
            FailureKind::Transient
        };
        AttemptOutcome::Failed(AttemptFailure {
            kind,
            status: Some(status.as_u16()),
            message,
        })
    }
}
