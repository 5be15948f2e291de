//! Pathway declarations: prompt templates, model binding and execution policy.

use indexmap::IndexMap;
use serde::Deserialize;

/// Declared shape of a pathway result, applied by the output parsers after
/// the model call completes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum OutputKind {
    /// Scalar text, returned as-is.
    Text,
    /// A numbered list (`1.`, `1)`, `1-`, `1:` item markers).
    NumberedList,
    /// A numbered list of objects parsed against a space-separated field spec.
    NumberedObjectList {
        /// Space-separated field names, e.g. `"name age"`.
        fields: String,
    },
    /// A comma-separated list, commas inside quotes preserved.
    CommaList,
    /// A JSON object or array extracted and repaired from the model text.
    Json,
}

impl Default for OutputKind {
    fn default() -> Self {
        Self::Text
    }
}

/// A tool the model may invoke from a pathway. Invocations are routed to the
/// pathway named `sys_tool_<name>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Tool name as presented to the model.
    pub name: String,
    /// Natural-language description of what the tool does.
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: serde_json::Value,
}

/// A deterministic pathway declaration. Immutable after registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathwayConfig {
    /// Prompt templates, rendered in order. `{{messages}}` splices the chat
    /// history, `{{text}}` and other names bind declared inputs.
    pub prompts: Vec<String>,

    /// Name of the model this pathway dispatches to.
    pub model: String,

    /// Declared input parameters with their default values.
    pub inputs: IndexMap<String, serde_json::Value>,

    /// Declared result shape.
    pub output: OutputKind,

    /// Split oversized primary input into semantic chunks and map the
    /// pathway over them sequentially.
    pub use_input_chunking: bool,

    /// Allow concurrent identical requests to run separately instead of
    /// coalescing onto one upstream call.
    pub enable_duplicate_requests: bool,

    /// Expose this pathway as an OpenAI-compatible chat model under the
    /// given alias.
    pub emulate_openai_chat_model: Option<String>,

    /// Request deadline in seconds.
    pub timeout_secs: u64,

    /// Upstream attempt budget for retryable failures.
    pub max_retries: u32,

    /// Tools the model may call while this pathway runs.
    pub tools: Vec<ToolConfig>,

    /// Pathway re-invoked with the same inputs when this one fails
    /// non-retryably.
    pub fallback_pathway: Option<String>,
}

impl Default for PathwayConfig {
    fn default() -> Self {
        Self {
            prompts: vec!["{{text}}".to_string()],
            model: String::new(),
            inputs: IndexMap::new(),
            output: OutputKind::default(),
            use_input_chunking: false,
            enable_duplicate_requests: false,
            emulate_openai_chat_model: None,
            timeout_secs: 60,
            max_retries: 3,
            tools: Vec::new(),
            fallback_pathway: None,
        }
    }
}
