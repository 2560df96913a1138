//! Turning a locally stored image into something a remote party can fetch.

use std::path::Path;

use async_trait::async_trait;

use crate::types::GeneratedImage;
use crate::{ImagegenError, Result};

#[async_trait]
pub trait ImageHost: Send + Sync {
    /// Makes `path` reachable over HTTP and returns its URL.
    async fn publish(&self, path: &Path) -> Result<String>;
}

/// Assumes the images directory is already served under `base_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPrefixHost {
    base_url: String,
}

impl StaticPrefixHost {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ImageHost for StaticPrefixHost {
    async fn publish(&self, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                ImagegenError::InvalidResponse(format!(
                    "cannot publish path without a file name: {}",
                    path.display()
                ))
            })?;
        Ok(format!("{}/{name}", self.base_url.trim_end_matches('/')))
    }
}

/// Published URL when a host is available and succeeds, otherwise the local path.
pub async fn deliverable_location(image: &GeneratedImage, host: Option<&dyn ImageHost>) -> String {
    let local = image.path.display().to_string();
    let Some(host) = host else {
        return local;
    };
    match host.publish(&image.path).await {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(path = %local, error = %err, "image hosting failed, using local path");
            local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct BrokenHost;

    #[async_trait]
    impl ImageHost for BrokenHost {
        async fn publish(&self, _: &Path) -> Result<String> {
            Err(ImagegenError::Config("callback api base not set".to_string()))
        }
    }

    fn image() -> GeneratedImage {
        GeneratedImage {
            url: "file:///data/images/chat_image_20250101_120000_abcd1234.png".to_string(),
            path: PathBuf::from("/data/images/chat_image_20250101_120000_abcd1234.png"),
        }
    }

    #[tokio::test]
    async fn static_prefix_host_appends_file_name() {
        let host = StaticPrefixHost::new("https://files.example.com/images/");
        assert_eq!(
            deliverable_location(&image(), Some(&host as &dyn ImageHost)).await,
            "https://files.example.com/images/chat_image_20250101_120000_abcd1234.png"
        );
    }

    #[tokio::test]
    async fn falls_back_to_local_path() {
        let expected = "/data/images/chat_image_20250101_120000_abcd1234.png";
        assert_eq!(deliverable_location(&image(), None).await, expected);
        assert_eq!(
            deliverable_location(&image(), Some(&BrokenHost as &dyn ImageHost)).await,
            expected
        );
    }
}
