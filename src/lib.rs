mod error;

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod hosting;
pub mod logging;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod types;
pub mod utils;

pub use config::{DispatcherConfig, Env, KeySources, parse_dotenv};
pub use credentials::{Credential, CredentialRotator, CredentialSet};
pub use dispatcher::Dispatcher;
pub use error::{FailureCategory, GenerationFailure, ImagegenError, Result};
pub use hosting::{ImageHost, StaticPrefixHost, deliverable_location};
pub use providers::{
    AttemptFailure, AttemptOutcome, ChatCompletionsImages, FailureKind, ImagesApi, ProviderAdapter,
};
pub use rate_limit::{CallerIdentity, RateDecision, RateLimiter};
pub use retry::{CredentialOutcome, RetryExecutor, Sleeper, TokioSleeper, backoff_delay};
pub use store::ImageStore;
pub use types::{
    ChatCompletionsOptions, GeneratedImage, GenerationRequest, GenerationResult, ImagesApiOptions,
    ProviderKind, ReferenceImage,
};
