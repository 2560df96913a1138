pub mod chat_completions;
pub mod images_api;

pub use chat_completions::ChatCompletionsImages;
pub use images_api::ImagesApi;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GenerationFailure;
use crate::types::{GeneratedImage, GenerationRequest, ProviderKind};

/// Encodes a [`GenerationRequest`] for one provider, sends it with one api key, and decodes the
/// answer into a stored image.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One HTTP round trip. Never retries on its own.
    async fn attempt(&self, api_key: &str, request: &GenerationRequest) -> AttemptOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limit or insufficient balance: move on to the next key without retrying.
    Quota,
    /// Non-2xx or unusable body: retry with backoff.
    Transient,
    /// Timeout or connection failure: retry with backoff.
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
}

impl AttemptFailure {
    pub fn network(err: &reqwest::Error) -> Self {
        Self {
            kind: FailureKind::Network,
            status: None,
            message: err.to_string(),
        }
    }

    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            status,
            message: message.into(),
        }
    }

    pub fn into_generation_failure(self) -> GenerationFailure {
        match self.kind {
            FailureKind::Quota => GenerationFailure::QuotaExceeded(self.message),
            FailureKind::Transient => GenerationFailure::TransientProvider(self.message),
            FailureKind::Network => GenerationFailure::Network(self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Generated(GeneratedImage),
    /// 2xx answer without any extractable image.
    NoImage,
    /// 2xx answer whose image could not be decoded, downloaded or written.
    StorageFailed(String),
    Failed(AttemptFailure),
}

/// Borrowed view of a provider answer for the extraction strategies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResponseBody<'a> {
    pub json: Option<&'a Value>,
    pub text: &'a str,
}

pub(crate) type Extractor<T> = fn(ResponseBody<'_>) -> Option<T>;

/// Runs `(name, extractor)` pairs in order and stops at the first hit.
pub(crate) fn extract_first<T>(
    body: ResponseBody<'_>,
    chain: &[(&'static str, Extractor<T>)],
) -> Option<(&'static str, T)> {
    chain
        .iter()
        .find_map(|(name, extractor)| extractor(body).map(|found| (*name, found)))
}

/// `error.message` from a JSON error body, falling back to the status line.
pub(crate) fn error_message(status: reqwest::StatusCode, json: Option<&Value>) -> String {
    json.and_then(|value| value.get("error"))
        .and_then(|error| {
            error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
        })
        .filter(|message| !message.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

/// 429 always means quota; 402 only when the body says the balance is insufficient.
pub(crate) fn is_quota_status(status: reqwest::StatusCode, body: &str, extra: &[u16]) -> bool {
    let code = status.as_u16();
    code == 429
        || extra.contains(&code)
        || (code == 402 && body.to_ascii_lowercase().contains("insufficient"))
}

pub(crate) fn join_endpoint(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if base.ends_with(&format!("/{endpoint}")) {
        base.to_string()
    } else {
        format!("{base}/{endpoint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn quota_classification() {
        assert!(is_quota_status(StatusCode::TOO_MANY_REQUESTS, "", &[]));
        assert!(is_quota_status(
            StatusCode::PAYMENT_REQUIRED,
            r#"{"error":{"message":"Insufficient credits"}}"#,
            &[]
        ));
        assert!(!is_quota_status(StatusCode::PAYMENT_REQUIRED, "pay up", &[]));
        assert!(!is_quota_status(StatusCode::FORBIDDEN, "", &[]));
        assert!(is_quota_status(StatusCode::FORBIDDEN, "", &[403]));
        assert!(!is_quota_status(StatusCode::INTERNAL_SERVER_ERROR, "", &[403]));
    }

    #[test]
    fn error_message_prefers_body() {
        let body = serde_json::json!({ "error": { "message": "model overloaded" } });
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, Some(&body)),
            "model overloaded"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, None), "HTTP 502");
    }

    #[test]
    fn join_endpoint_does_not_duplicate_suffix() {
        assert_eq!(
            join_endpoint("https://openrouter.ai/api/", "v1/chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            join_endpoint("http://proxy/v1/chat/completions", "/v1/chat/completions"),
            "http://proxy/v1/chat/completions"
        );
    }

    #[test]
    fn extract_first_stops_at_first_hit() {
        fn never(_: ResponseBody<'_>) -> Option<u8> {
            None
        }
        fn one(_: ResponseBody<'_>) -> Option<u8> {
            Some(1)
        }
        fn two(_: ResponseBody<'_>) -> Option<u8> {
            Some(2)
        }
        let body = ResponseBody {
            json: None,
            text: "",
        };
        let chain: &[(&'static str, Extractor<u8>)] = &[("never", never), ("one", one), ("two", two)];
        assert_eq!(extract_first(body, chain), Some(("one", 1)));
    }
}
