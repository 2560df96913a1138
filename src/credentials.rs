use tokio::sync::Mutex;

use crate::{ImagegenError, Result};

/// Ordered, non-empty list of API keys for one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    keys: Vec<String>,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("len", &self.keys.len())
            .finish()
    }
}

impl CredentialSet {
    pub fn new(keys: Vec<String>) -> Result<Self> {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(ImagegenError::Config(
                "credential set must contain at least one api key".to_string(),
            ));
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> &str {
        &self.keys[index % self.keys.len()]
    }
}

/// A credential handed out by the rotator, tagged with its position.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub index: usize,
    pub api_key: String,
}

impl Credential {
    /// 1-based position, the form every log line reports as `key_index`.
    pub fn ordinal(&self) -> usize {
        key_ordinal(self.index)
    }
}

fn key_ordinal(index: usize) -> usize {
    index + 1
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Shared rotation cursor over a [`CredentialSet`].
///
/// The cursor only moves forward on failure and is never reset, so concurrent callers for the
/// same provider keep starting from the last credential that has not been exhausted.
#[derive(Debug)]
pub struct CredentialRotator {
    set: CredentialSet,
    cursor: Mutex<usize>,
}

impl CredentialRotator {
    pub fn new(set: CredentialSet) -> Self {
        Self {
            set,
            cursor: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub async fn current(&self) -> Credential {
        let cursor = self.cursor.lock().await;
        Credential {
            index: *cursor,
            api_key: self.set.get(*cursor).to_string(),
        }
    }

    pub async fn position(&self) -> usize {
        *self.cursor.lock().await
    }

    /// Moves to the next credential and returns the new position.
    pub async fn advance(&self) -> usize {
        let mut cursor = self.cursor.lock().await;
        if self.set.len() > 1 {
            *cursor = (*cursor + 1) % self.set.len();
            tracing::info!(key_index = key_ordinal(*cursor), "rotated to next api key");
        }
        *cursor
    }
}
