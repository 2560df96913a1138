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
use crate::types::{GenerationRequest, ImagesApiOptions, ProviderKind, ReferenceImage};
use crate::utils::http::response_text_bounded;

pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com";
pub const DEFAULT_MODEL: &str = "doubao-seedream-4-0-250828";
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

const IMAGES_ENDPOINT: &str = "api/v3/images/generations";
/// Besides 429/402, this provider signals exhausted keys with 403.
const EXTRA_QUOTA_STATUSES: &[u16] = &[403];

fn http_url_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"https?://[^\s"]+"#).expect("http url regex is valid"))
}

fn non_empty(url: &str) -> Option<String> {
    let url = url.trim();
    (!url.is_empty()).then(|| url.to_string())
}

/// `data[].url`
fn data_urls(body: ResponseBody<'_>) -> Option<String> {
    body.json?
        .get("data")?
        .as_array()?
        .iter()
        .find_map(|item| item.get("url").and_then(Value::as_str).and_then(non_empty))
}

/// `images[].url` or `images[]` as plain strings.
fn images_urls(body: ResponseBody<'_>) -> Option<String> {
    body.json?.get("images")?.as_array()?.iter().find_map(|item| {
        item.as_str()
            .or_else(|| item.get("url").and_then(Value::as_str))
            .and_then(non_empty)
    })
}

/// `output.images[]`
fn output_images(body: ResponseBody<'_>) -> Option<String> {
    body.json?
        .get("output")?
        .get("images")?
        .as_array()?
        .iter()
        .find_map(|item| item.as_str().and_then(non_empty))
}

/// Any http(s) URL in the raw body; covers streamed and non-JSON answers.
fn raw_url(body: ResponseBody<'_>) -> Option<String> {
    http_url_regex()
        .find(body.text)
        .map(|found| found.as_str().to_string())
}

const EXTRACTORS: &[(&str, Extractor<String>)] = &[
    ("data", data_urls),
    ("images", images_urls),
    ("output.images", output_images),
    ("raw", raw_url),
];

pub(crate) fn extract_image_url(json: Option<&Value>, text: &str) -> Option<(&'static str, String)> {
    extract_first(ResponseBody { json, text }, EXTRACTORS)
}

/// Image generation through a dedicated `/api/v3/images/generations` endpoint.
///
/// Reference images must already be reachable by URL; inline references are skipped.
#[derive(Clone)]
pub struct ImagesApi {
    http: reqwest::Client,
    base_url: String,
    model: String,
    options: ImagesApiOptions,
    store: Arc<ImageStore>,
}

impl ImagesApi {
    pub fn new(store: Arc<ImageStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            options: ImagesApiOptions::default(),
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

    pub fn with_options(mut self, options: ImagesApiOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoint(&self) -> String {
        join_endpoint(&self.base_url, IMAGES_ENDPOINT)
    }

    pub fn build_body(&self, request: &GenerationRequest) -> Value {
        let options = request.images_api.as_ref().unwrap_or(&self.options);
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model);

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        body.insert(
            "response_format".to_string(),
            Value::String(options.response_format.clone()),
        );
        body.insert("size".to_string(), Value::String(options.size.clone()));
        body.insert("watermark".to_string(), Value::Bool(options.watermark));
        body.insert(
            "sequential_image_generation".to_string(),
            Value::String(options.sequential_image_generation.clone()),
        );
        body.insert(
            "sequential_image_generation_options".to_string(),
            serde_json::json!({ "max_images": options.max_images.max(1) }),
        );

        let image_urls: Vec<Value> = request
            .reference_images
            .iter()
            .filter_map(|image| match image {
                ReferenceImage::Url { url } => Some(Value::String(url.clone())),
                ReferenceImage::Inline { .. } => None,
            })
            .collect();
        if !image_urls.is_empty() {
            body.insert("image".to_string(), Value::Array(image_urls));
        }
        if options.stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ProviderAdapter for ImagesApi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ImagesApi
    }

    async fn attempt(&self, api_key: &str, request: &GenerationRequest) -> AttemptOutcome {
        let skipped = request
            .reference_images
            .iter()
            .filter(|image| matches!(image, ReferenceImage::Inline { .. }))
            .count();
        if skipped > 0 {
            tracing::warn!(skipped, "images api only accepts reference image urls");
        }

        let body = self.build_body(request);
        let response = match self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
        {
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
            let Some((source, url)) = extract_image_url(json.as_ref(), &text) else {
                tracing::info!("images api succeeded but returned no image url");
                return AttemptOutcome::NoImage;
            };
            tracing::debug!(source, url = %url, "found image url");
            return match self
                .store
                .download(ProviderKind::ImagesApi.file_prefix(), &url)
                .await
            {
                Ok(image) => AttemptOutcome::Generated(image),
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "failed to download generated image");
                    AttemptOutcome::StorageFailed(err.to_string())
                }
            };
        }

        let kind = if is_quota_status(status, &text, EXTRA_QUOTA_STATUSES) {
            FailureKind::Quota
        } else {
            FailureKind::Transient
        };
        let mut message = error_message(status, json.as_ref());
        if json.is_none() && !text.trim().is_empty() {
            let snippet: String = text.chars().take(200).collect();
            message = format!("{message} {snippet}");
        }
        AttemptOutcome::Failed(AttemptFailure {
            kind,
            status: Some(status.as_u16()),
            message,
        })
    }
}
