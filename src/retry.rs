use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::GenerationFailure;
use crate::providers::{AttemptFailure, AttemptOutcome, FailureKind, ProviderAdapter};
use crate::types::{GeneratedImage, GenerationRequest};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const MAX_BACKOFF_SECS: u64 = 10;

/// Delay before attempt `attempt` (0-based): none for the first, then `min(2^attempt, 10)` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let secs = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How one credential's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOutcome {
    Generated(GeneratedImage),
    /// Stop the whole request; rotating keys would not help.
    Terminal(GenerationFailure),
    /// Give up on this key. A quota failure ends the run after one attempt.
    Exhausted { attempts: u32, last: AttemptFailure },
}

#[derive(Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryExecutor {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run(
        &self,
        adapter: &dyn ProviderAdapter,
        credential: &Credential,
        request: &GenerationRequest,
    ) -> CredentialOutcome {
        let provider = adapter.kind();
        let mut last = None;

        for attempt in 0..self.max_attempts {
            let delay = backoff_delay(attempt);
            if !delay.is_zero() {
                tracing::info!(
                    %provider,
                    key_index = credential.ordinal(),
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    "retrying after backoff"
                );
                self.sleeper.sleep(delay).await;
            }

            match adapter.attempt(&credential.api_key, request).await {
                AttemptOutcome::Generated(image) => return CredentialOutcome::Generated(image),
                AttemptOutcome::NoImage => {
                    return CredentialOutcome::Terminal(GenerationFailure::NoImageProduced);
                }
                AttemptOutcome::StorageFailed(message) => {
                    return CredentialOutcome::Terminal(GenerationFailure::Storage(message));
                }
                AttemptOutcome::Failed(failure) if failure.kind == FailureKind::Quota => {
                    tracing::warn!(
                        %provider,
                        key_index = credential.ordinal(),
                        status = failure.status,
                        "api key quota exhausted"
                    );
                    return CredentialOutcome::Exhausted {
                        attempts: attempt + 1,
                        last: failure,
                    };
                }
                AttemptOutcome::Failed(failure) => {
                    tracing::warn!(
                        %provider,
                        key_index = credential.ordinal(),
                        attempt = attempt + 1,
                        status = failure.status,
                        error = %failure.message,
                        "attempt failed"
                    );
                    last = Some(failure);
                }
            }
        }

        CredentialOutcome::Exhausted {
            attempts: self.max_attempts,
            last: last.unwrap_or_else(|| AttemptFailure::transient(None, "no attempt made")),
        }
    }
}
