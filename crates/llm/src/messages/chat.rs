//! The internal chat message model.
//!
//! Content arriving from callers is ambiguous: a message body may be null, a
//! string, or a sequence whose elements are typed objects, plain strings, or
//! JSON-encoded strings of typed objects. Deserialization resolves the
//! string-vs-object ambiguity exactly once, into the [`ContentPart`] tagged
//! sum; the normalizer (`super::normalize`) then enforces the structural
//! invariants before any outbound encoding.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Null content is legal only on assistant messages carrying tool calls.
    #[serde(default)]
    pub content: MessageContent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A plain text message with the given role.
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// The assistant turn recording emitted tool calls; content is null by
    /// construction.
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            name: None,
            content: MessageContent::Null,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// A tool result message answering the call with the given id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            name: None,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Concatenated text view of the content, for token accounting and
    /// legacy endpoints.
    pub fn content_text(&self) -> String {
        match &self.content {
            MessageContent::Null => String::new(),
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => super::normalize::render_parts_as_text(parts),
        }
    }
}

/// Message content container: null, plain text, or a part sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Absent content; only valid alongside tool calls.
    #[default]
    Null,
    /// Plain text.
    Text(String),
    /// Ordered typed parts.
    Parts(Vec<ContentPart>),
}

/// A typed content part.
///
/// Serializes with a `type` tag. Deserialization is tolerant: plain strings
/// become text parts, JSON-encoded strings of recognized types decode to the
/// object they encode, and anything unrecognized is preserved as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        text: String,
    },
    /// An image reference.
    ImageUrl {
        image_url: ImageUrl,
    },
    /// A file reference carried through chat history. The model never sees
    /// raw bytes; it sees the reference or a textual placeholder.
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        gcs: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    /// A tool invocation embedded in content (Anthropic-style).
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// A tool result embedded in content (Anthropic-style).
    ToolResult {
        tool_use_id: String,
        content: Value,
    },
}

/// Image reference payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl<'de> Deserialize<'de> for ContentPart {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(super::normalize::part_from_value(value))
    }
}

/// A tool call emitted by the model.
///
/// Accepts both object form and the JSON-encoded string form some callers
/// put into chat history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: ToolCallType,
    pub function: FunctionCall,
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let value = match value {
            Value::String(encoded) => {
                serde_json::from_str(&encoded).map_err(|e| serde::de::Error::custom(format!("tool call: {e}")))?
            }
            other => other,
        };

        #[derive(Deserialize)]
        struct Repr {
            id: String,
            #[serde(rename = "type", default)]
            call_type: ToolCallType,
            function: FunctionCall,
        }

        let repr: Repr = serde_json::from_value(value).map_err(serde::de::Error::custom)?;

        Ok(ToolCall {
            id: repr.id,
            call_type: repr.call_type,
            function: repr.function,
        })
    }
}

/// Tool call kind; only functions exist today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallType {
    #[default]
    Function,
}

/// Function name plus its arguments as a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn null_content_deserializes() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "sum", "arguments": "{}"}}]
        }))
        .unwrap();

        assert_eq!(message.content, MessageContent::Null);
        assert_eq!(message.tool_calls.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn string_elements_in_sequences_become_text_parts() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": ["hello", {"type": "text", "text": "world"}]
        }))
        .unwrap();

        let MessageContent::Parts(parts) = &message.content else {
            panic!("expected parts");
        };

        assert_eq!(parts[0], ContentPart::Text { text: "hello".into() });
        assert_eq!(parts[1], ContentPart::Text { text: "world".into() });
    }

    #[test]
    fn json_encoded_recognized_parts_decode() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [r#"{"type":"image_url","image_url":{"url":"https://x/y.png"}}"#]
        }))
        .unwrap();

        let MessageContent::Parts(parts) = &message.content else {
            panic!("expected parts");
        };

        assert_eq!(
            parts[0],
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://x/y.png".into()
                }
            }
        );
    }

    #[test]
    fn json_encoded_unrecognized_parts_stay_text() {
        let raw = r#"{"type":"mystery","data":1}"#;
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [raw]
        }))
        .unwrap();

        let MessageContent::Parts(parts) = &message.content else {
            panic!("expected parts");
        };

        assert_eq!(parts[0], ContentPart::Text { text: raw.into() });
    }

    #[test]
    fn tool_calls_accept_json_encoded_strings() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [r#"{"id":"c1","type":"function","function":{"name":"sum","arguments":"{\"a\":1}"}}"#]
        }))
        .unwrap();

        let calls = message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "sum");
        assert_eq!(calls[0].function.arguments, r#"{"a":1}"#);
    }
}
