use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagegenError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, ImagegenError>;

/// Terminal outcome of one `Dispatcher::generate` call that did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationFailure {
    #[error("quota exhausted or rate limited: {0}")]
    QuotaExceeded(String),
    #[error("provider error: {0}")]
    TransientProvider(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned no image")]
    NoImageProduced,
    #[error("failed to persist image: {0}")]
    Storage(String),
    #[error("all credentials exhausted")]
    AllCredentialsExhausted {
        /// Most recent per-attempt failure, if any attempt was made.
        last: Option<Box<GenerationFailure>>,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The three message families a chat host shows to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Generation,
    Parameter,
    Network,
}

impl GenerationFailure {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Network(_) => FailureCategory::Network,
            Self::InvalidRequest(_) => FailureCategory::Parameter,
            Self::AllCredentialsExhausted { last: Some(last) } => match last.as_ref() {
                Self::Network(_) => FailureCategory::Network,
                _ => FailureCategory::Generation,
            },
            _ => FailureCategory::Generation,
        }
    }

    pub fn user_message(&self) -> String {
        match self.category() {
            FailureCategory::Network => format!("Network error, image generation failed: {self}"),
            FailureCategory::Parameter => {
                format!("Parameter error, image generation failed: {self}")
            }
            FailureCategory::Generation => {
                "Image generation failed, please check the API configuration and network connection."
                    .to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_after_network_failures_is_a_network_category() {
        let failure = GenerationFailure::AllCredentialsExhausted {
            last: Some(Box::new(GenerationFailure::Network("timed out".to_string()))),
        };
        assert_eq!(failure.category(), FailureCategory::Network);
        assert!(failure.user_message().starts_with("Network error"));
    }

    #[test]
    fn no_image_is_a_generation_failure() {
        let failure = GenerationFailure::NoImageProduced;
        assert_eq!(failure.category(), FailureCategory::Generation);
        assert_eq!(
            GenerationFailure::InvalidRequest("empty prompt".to_string()).category(),
            FailureCategory::Parameter
        );
    }
}
