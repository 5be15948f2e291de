//! Model and endpoint descriptors for the vendor plugin layer.

use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::Deserialize;

/// Provider family a model belongs to. The family selects the plugin that
/// builds requests and translates the vendor's streaming dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderFamily {
    /// OpenAI chat completions.
    OpenAiChat,
    /// OpenAI legacy text completions.
    OpenAiCompletion,
    /// OpenAI chat completions with image input.
    OpenAiVision,
    /// OpenAI reasoning models (`o3*`, `gpt-5.1-reasoning`).
    OpenAiReasoning,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini chat.
    GeminiChat,
    /// Google Gemini with image input.
    GeminiVision,
    /// xAI Grok responses API.
    Grok,
    /// Azure-hosted or other OpenAI-compatible REST endpoint.
    AzureRest,
    /// Local HTTP stub for development and tests.
    Local,
}

/// A model descriptor: the provider family, its endpoints and token limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Provider family handling this model.
    pub provider: ProviderFamily,

    /// Endpoint descriptors. Requests are spread across endpoints with
    /// available rate capacity.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Maximum context window in tokens.
    #[serde(default = "default_max_token_length")]
    pub max_token_length: usize,

    /// Maximum tokens the model may return.
    #[serde(default = "default_max_return_tokens")]
    pub max_return_tokens: usize,

    /// Whether the provider supports incremental streaming.
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
}

/// One outbound endpoint for a model.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Optional display name; defaults to the URL host.
    #[serde(default)]
    pub name: Option<String>,

    /// Base URL of the endpoint.
    pub url: String,

    /// API key for this endpoint.
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Extra headers sent with every request to this endpoint.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Endpoint-specific request parameters merged into the outbound body.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Token-bucket refill rate; the bucket capacity equals the rate.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl EndpointConfig {
    /// Display name for logs and monitors.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

fn default_max_token_length() -> usize {
    8192
}

fn default_max_return_tokens() -> usize {
    1024
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_true() -> bool {
    true
}
