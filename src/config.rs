use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::CredentialSet;
use crate::hosting::{ImageHost, StaticPrefixHost};
use crate::providers::{chat_completions, images_api};
use crate::rate_limit::RateLimiter;
use crate::retry::DEFAULT_MAX_ATTEMPTS;
use crate::store::ImageStore;
use crate::types::{ChatCompletionsOptions, ImagesApiOptions};
use crate::{ImagegenError, Result};

/// Variable lookup that consults a parsed `.env` file before the process environment.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(String::as_str).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub fn load_dotenv(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse_dotenv(&contents))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.dotenv.get(key).cloned().or_else(|| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
        })
    }
}

/// `KEY=value` lines; `export`, quotes and `#` comments are tolerated, blank values dropped.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let value = unquote(value.trim());
            (!key.is_empty() && !value.trim().is_empty())
                .then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(value)
}

/// Where a provider's api keys come from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeySources {
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Single-key form from older configs; ignored once `api_keys` is set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Names of variables holding additional keys.
    #[serde(default)]
    pub api_key_env: Vec<String>,
}

impl KeySources {
    pub fn resolve(&self, env: &Env) -> Result<CredentialSet> {
        let mut keys: Vec<String> = self
            .api_keys
            .iter()
            .filter(|key| !key.trim().is_empty())
            .cloned()
            .collect();
        if keys.is_empty() {
            keys.extend(self.api_key.clone());
        }
        for name in &self.api_key_env {
            match env.get(name) {
                Some(value) => keys.push(value),
                None => tracing::warn!(variable = %name, "api key variable is not set"),
            }
        }
        CredentialSet::new(keys)
    }
}

fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_chat_base_url() -> String {
    chat_completions::DEFAULT_BASE_URL.to_string()
}

fn default_chat_model() -> String {
    chat_completions::DEFAULT_MODEL.to_string()
}

fn default_images_base_url() -> String {
    images_api::DEFAULT_BASE_URL.to_string()
}

fn default_images_model() -> String {
    images_api::DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsConfig {
    #[serde(flatten)]
    pub keys: KeySources,
    #[serde(default = "default_chat_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(flatten)]
    pub options: ChatCompletionsOptions,
    #[serde(default = "chat_completions::default_headers")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesApiConfig {
    #[serde(flatten)]
    pub keys: KeySources,
    #[serde(default = "default_images_base_url")]
    pub base_url: String,
    #[serde(default = "default_images_model")]
    pub model: String,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(flatten)]
    pub options: ImagesApiOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Calls per rate key per minute; zero or negative disables throttling.
    #[serde(default = "default_calls_per_minute")]
    pub calls_per_minute: i64,
}

fn default_calls_per_minute() -> i64 {
    5
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: default_calls_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_ttl_secs() -> u64 {
    15 * 60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostingConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub chat_completions: Option<ChatCompletionsConfig>,
    #[serde(default)]
    pub images_api: Option<ImagesApiConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hosting: Option<HostingConfig>,
}

impl DispatcherConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ImagegenError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit.calls_per_minute)
    }

    pub fn image_store(&self) -> ImageStore {
        ImageStore::new(&self.storage.data_dir).with_ttl(Duration::from_secs(self.storage.ttl_secs))
    }

    pub fn image_host(&self) -> Option<Arc<dyn ImageHost>> {
        self.hosting
            .as_ref()
            .filter(|hosting| !hosting.base_url.trim().is_empty())
            .map(|hosting| Arc::new(StaticPrefixHost::new(&hosting.base_url)) as Arc<dyn ImageHost>)
    }
}
