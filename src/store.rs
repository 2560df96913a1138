use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use regex::Regex;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::sync::Mutex;

use crate::types::GeneratedImage;
use crate::utils::http::{
    MAX_ERROR_BODY_BYTES, MAX_RESPONSE_BODY_BYTES, response_bytes_bounded, response_text_truncated,
};
use crate::{ImagegenError, Result};

pub const DEFAULT_IMAGE_TTL: Duration = Duration::from_secs(15 * 60);
pub const REFERENCE_PREFIX: &str = "reference";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

fn managed_file_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"^(?:chat_image|ark_image|reference)_\d{8}_\d{6}_[0-9A-Za-z]{8}\.(?:png|jpe?g|webp|gif)$",
        )
        .expect("managed file regex is valid")
    })
}

/// Persists generated images under `{data_dir}/images` and expires them lazily.
#[derive(Debug)]
pub struct ImageStore {
    images_dir: PathBuf,
    ttl: Duration,
    http: reqwest::Client,
    max_download_bytes: usize,
    last_saved: Mutex<Option<GeneratedImage>>,
}

impl ImageStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            images_dir: data_dir.as_ref().join("images"),
            ttl: DEFAULT_IMAGE_TTL,
            http,
            max_download_bytes: MAX_RESPONSE_BODY_BYTES,
            last_saved: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_max_download_bytes(mut self, max_bytes: usize) -> Self {
        self.max_download_bytes = max_bytes;
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub async fn last_saved(&self) -> Option<GeneratedImage> {
        self.last_saved.lock().await.clone()
    }

    /// Writes `bytes` to a fresh file; the url of the result is a `file://` link to it.
    pub async fn save(&self, prefix: &str, bytes: &[u8], format: &str) -> Result<GeneratedImage> {
        let path = self.persist(prefix, bytes, &normalize_extension(format)).await?;
        let image = GeneratedImage {
            url: format!("file://{}", path.display()),
            path,
        };
        self.record(&image).await;
        tracing::info!(path = %image.path.display(), bytes = bytes.len(), "image saved");
        Ok(image)
    }

    pub async fn save_base64(
        &self,
        prefix: &str,
        data: &str,
        format: &str,
    ) -> Result<GeneratedImage> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
        self.save(prefix, &bytes, format).await
    }

    /// Fetches `url` and stores the body. The result keeps the remote url.
    pub async fn download(&self, prefix: &str, url: &str) -> Result<GeneratedImage> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ImagegenError::Api { status, body });
        }

        let extension = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(extension_from_content_type)
            .unwrap_or("png");
        let bytes = response_bytes_bounded(response, self.max_download_bytes).await?;

        let path = self.persist(prefix, &bytes, extension).await?;
        let image = GeneratedImage {
            url: url.to_string(),
            path,
        };
        self.record(&image).await;
        tracing::info!(url, path = %image.path.display(), "image downloaded");
        Ok(image)
    }

    /// Removes managed files whose modification time is older than the ttl.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.images_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(err) => {
                tracing::error!(dir = %self.images_dir.display(), error = %err, "image sweep failed");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "image sweep stopped listing early");
                    break;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !managed_file_regex().is_match(name) {
                continue;
            }

            let path = entry.path();
            let expired = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => now
                    .duration_since(modified)
                    .map(|age| age > self.ttl)
                    .unwrap_or(false),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to stat image");
                    continue;
                }
            };
            if !expired {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(path = %path.display(), "removed expired image");
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove expired image");
                }
            }
        }
        removed
    }

    async fn persist(&self, prefix: &str, bytes: &[u8], extension: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.images_dir).await?;
        self.sweep_expired().await;

        let path = self
            .images_dir
            .join(format!("{prefix}_{}_{}.{extension}", timestamp(), random_suffix()));
        tokio::fs::write(&path, bytes).await?;
        Ok(std::path::absolute(&path)?)
    }

    async fn record(&self, image: &GeneratedImage) {
        *self.last_saved.lock().await = Some(image.clone());
    }
}

fn normalize_extension(format: &str) -> String {
    let format = format.trim().to_ascii_lowercase();
    match format.as_str() {
        "png" | "jpg" | "jpeg" | "webp" | "gif" => format,
        _ => "png".to_string(),
    }
}

fn extension_from_content_type(content_type: &str) -> &'static str {
    let Some((_, subtype)) = content_type.split_once('/') else {
        return "png";
    };
    let subtype = subtype.split(';').next().unwrap_or_default().trim();
    match subtype.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "jpg",
        "webp" => "webp",
        "gif" => "gif",
        _ => "png",
    }
}

fn timestamp() -> String {
    const FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]_[hour][minute][second]");
    OffsetDateTime::now_utc()
        .format(FORMAT)
        .unwrap_or_else(|_| "00000000_000000".to_string())
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    if getrandom::fill(&mut bytes).is_err() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.subsec_nanos())
            .unwrap_or(0);
        bytes = nanos.to_le_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    fn age_file(path: &Path, age: Duration) {
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open for mtime");
        file.set_modified(SystemTime::now() - age)
            .expect("set mtime");
    }

    #[tokio::test]
    async fn saved_bytes_read_back_identically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        let image = store.save("chat_image", &bytes, "png").await?;

        assert!(image.path.is_absolute());
        assert!(image.path.starts_with(std::path::absolute(store.images_dir())?));
        assert_eq!(tokio::fs::read(&image.path).await?, bytes);
        assert!(image.url.starts_with("file://"));
        assert_eq!(store.last_saved().await, Some(image));
        Ok(())
    }

    #[tokio::test]
    async fn file_names_follow_the_managed_pattern() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        let first = store.save("ark_image", b"a", "jpeg").await?;
        let second = store.save("ark_image", b"b", "jpeg").await?;

        for image in [&first, &second] {
            let name = image.path.file_name().unwrap().to_str().unwrap();
            assert!(managed_file_regex().is_match(name), "{name}");
            assert!(name.ends_with(".jpeg"));
        }
        assert_ne!(first.path, second.path);
        Ok(())
    }

    #[tokio::test]
    async fn save_sweeps_expired_files_before_writing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        std::fs::create_dir_all(store.images_dir())?;

        let stale = store.images_dir().join("chat_image_20240101_000000_deadbeef.png");
        let fresh = store.images_dir().join("chat_image_20240101_000500_cafebabe.png");
        let foreign = store.images_dir().join("notes.png");
        for path in [&stale, &fresh, &foreign] {
            std::fs::write(path, b"x")?;
        }
        age_file(&stale, Duration::from_secs(16 * 60));
        age_file(&fresh, Duration::from_secs(10 * 60));
        age_file(&foreign, Duration::from_secs(60 * 60));

        store.save("chat_image", b"new", "png").await?;

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
        Ok(())
    }

    #[tokio::test]
    async fn sweeping_twice_removes_nothing_the_second_time() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        std::fs::create_dir_all(store.images_dir())?;
        let stale = store.images_dir().join("ark_image_20240101_000000_00000000.jpg");
        std::fs::write(&stale, b"x")?;
        age_file(&stale, Duration::from_secs(20 * 60));

        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.sweep_expired().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("never-created"));
        assert_eq!(store.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn save_base64_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        let err = store
            .save_base64("chat_image", "not base64 at all!", "png")
            .await
            .unwrap_err();
        assert!(matches!(err, ImagegenError::Base64(_)));
        assert!(store.last_saved().await.is_none());
    }

    #[tokio::test]
    async fn download_uses_content_type_for_extension() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/img/1");
                then.status(200)
                    .header("content-type", "image/jpeg; charset=binary")
                    .body(b"jpeg-bytes".to_vec());
            })
            .await;

        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        let url = server.url("/img/1");
        let image = store.download("ark_image", &url).await?;

        mock.assert_async().await;
        assert_eq!(image.url, url);
        assert_eq!(image.path.extension().and_then(|e| e.to_str()), Some("jpg"));
        assert_eq!(tokio::fs::read(&image.path).await?, b"jpeg-bytes");
        assert_eq!(store.last_saved().await, Some(image));
        Ok(())
    }

    #[tokio::test]
    async fn download_failure_is_an_api_error() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404).body("gone");
            })
            .await;

        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        let err = store
            .download("ark_image", &server.url("/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImagegenError::Api { status, .. } if status.as_u16() == 404));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_download_is_rejected() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/huge.png");
                then.status(200)
                    .header("content-type", "image/png")
                    .body(vec![0u8; 4096]);
            })
            .await;

        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path()).with_max_download_bytes(1024);
        let err = store
            .download("ark_image", &server.url("/huge.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, ImagegenError::InvalidResponse(_)), "{err:?}");
        assert!(store.last_saved().await.is_none());
        let leftovers = std::fs::read_dir(store.images_dir())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn content_type_mapping() {
        assert_eq!(extension_from_content_type("image/jpeg"), "jpg");
        assert_eq!(extension_from_content_type("image/webp"), "webp");
        assert_eq!(extension_from_content_type("application/octet-stream"), "png");
        assert_eq!(extension_from_content_type("garbage"), "png");
        assert_eq!(normalize_extension("JPEG"), "jpeg");
        assert_eq!(normalize_extension("svg+xml"), "png");
    }
}
