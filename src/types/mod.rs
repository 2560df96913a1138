use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GenerationFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Multimodal chat-completion endpoint that answers with inline images.
    #[serde(alias = "chat", alias = "openrouter")]
    ChatCompletions,
    /// Dedicated `/api/v3/images/generations` endpoint that answers with image URLs.
    #[serde(alias = "images", alias = "ark")]
    ImagesApi,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::ImagesApi => "images_api",
        }
    }

    /// Filename prefix for images this provider produces.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_image",
            Self::ImagesApi => "ark_image",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferenceImage {
    /// Base64 payload without the `data:` prefix.
    Inline { media_type: String, data: String },
    Url { url: String },
}

impl ReferenceImage {
    /// Accepts either a full `data:image/...;base64,` URI or a bare base64 payload (assumed PNG).
    pub fn inline(data: impl Into<String>) -> Self {
        let data = data.into();
        if let Some((media_type, payload)) = split_data_uri(&data) {
            return Self::Inline {
                media_type: media_type.to_string(),
                data: payload.to_string(),
            };
        }
        Self::Inline {
            media_type: "image/png".to_string(),
            data,
        }
    }

    pub fn from_bytes(bytes: &[u8], media_type: impl Into<String>) -> Self {
        use base64::Engine as _;
        Self::Inline {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }

    /// The form the chat-completions `image_url` part expects.
    pub fn to_image_url(&self) -> String {
        match self {
            Self::Inline { media_type, data } => format!("data:{media_type};base64,{data}"),
            Self::Url { url } => url.clone(),
        }
    }
}

/// Splits `data:<media_type>;base64,<payload>` into its two halves.
pub(crate) fn split_data_uri(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    if !media_type.starts_with("image/") {
        return None;
    }
    Some((media_type, payload))
}

/// Tuning for the chat-completions provider. Ignored by the images API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionsOptions {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ChatCompletionsOptions {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Tuning for the images-API provider. Ignored by chat completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesApiOptions {
    #[serde(default = "default_response_format")]
    pub response_format: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_true")]
    pub watermark: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_sequential")]
    pub sequential_image_generation: String,
    #[serde(default = "default_max_images")]
    pub max_images: u32,
}

fn default_response_format() -> String {
    "url".to_string()
}

fn default_size() -> String {
    "2K".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sequential() -> String {
    "auto".to_string()
}

fn default_max_images() -> u32 {
    1
}

impl Default for ImagesApiOptions {
    fn default() -> Self {
        Self {
            response_format: default_response_format(),
            size: default_size(),
            watermark: true,
            stream: false,
            sequential_image_generation: default_sequential(),
            max_images: default_max_images(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub reference_images: Vec<ReferenceImage>,
    /// Overrides the provider's configured model when set.
    pub model: Option<String>,
    pub chat_completions: Option<ChatCompletionsOptions>,
    pub images_api: Option<ImagesApiOptions>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_reference_images(mut self, images: Vec<ReferenceImage>) -> Self {
        self.reference_images = images;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A persisted image: where the provider served it and where it lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedImage {
    /// Remote URL for downloaded images, `file://` URL for decoded inline images.
    pub url: String,
    pub path: PathBuf,
}

pub type GenerationResult = std::result::Result<GeneratedImage, GenerationFailure>;
