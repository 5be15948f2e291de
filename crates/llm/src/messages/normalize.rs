//! Message-content normalization applied before any outbound encoding.
//!
//! Normalization is idempotent and enforces the structural invariants every
//! plugin relies on: null content survives only on assistant messages that
//! carry tool calls, sequences contain only typed parts, and messages with
//! nothing left to say are dropped.

use serde_json::{Map, Value};

use super::chat::{ChatMessage, ChatRole, ContentPart, ImageUrl, MessageContent};

/// Content-part types decoded from JSON-encoded string elements. Anything
/// else stays text, preserving the raw string.
const RECOGNIZED_TYPES: &[&str] = &["text", "image", "image_url", "tool_use", "tool_result", "file"];

/// Normalize a chat history in place and drop empty messages.
pub fn normalize_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter_map(|mut message| {
            // Empty tool-call lists carry no information.
            if message.tool_calls.as_ref().is_some_and(Vec::is_empty) {
                message.tool_calls = None;
            }

            let has_tool_calls = message.tool_calls.is_some();

            message.content = match message.content {
                MessageContent::Null => {
                    if message.role == ChatRole::Assistant && has_tool_calls {
                        MessageContent::Null
                    } else {
                        MessageContent::Text(String::new())
                    }
                }
                other => other,
            };

            let empty = match &message.content {
                MessageContent::Null => false,
                MessageContent::Text(text) => text.is_empty(),
                MessageContent::Parts(parts) => parts.is_empty(),
            };

            if empty && !has_tool_calls {
                return None;
            }

            Some(message)
        })
        .collect()
}

/// Resolve one raw content element into a typed part.
///
/// Strings that are JSON objects of a recognized type decode into that
/// object; other strings are text verbatim. Objects of unrecognized types
/// are preserved as text carrying their JSON rendering.
pub(crate) fn part_from_value(value: Value) -> ContentPart {
    match value {
        Value::String(text) => part_from_string(text),
        Value::Object(map) => part_from_map(map),
        other => ContentPart::Text { text: other.to_string() },
    }
}

fn part_from_string(text: String) -> ContentPart {
    if text.trim_start().starts_with('{')
        && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text)
        && map
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| RECOGNIZED_TYPES.contains(&kind))
    {
        return part_from_map(map);
    }

    ContentPart::Text { text }
}

fn part_from_map(map: Map<String, Value>) -> ContentPart {
    let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "text" => ContentPart::Text {
            text: string_field(&map, "text"),
        },
        "image" | "image_url" => ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: map
                    .get("image_url")
                    .and_then(|v| v.get("url"))
                    .or_else(|| map.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
        },
        "file" => ContentPart::File {
            url: optional_string_field(&map, "url"),
            gcs: optional_string_field(&map, "gcs"),
            hash: optional_string_field(&map, "hash"),
            filename: optional_string_field(&map, "filename"),
        },
        "tool_use" => ContentPart::ToolUse {
            id: string_field(&map, "id"),
            name: string_field(&map, "name"),
            input: map.get("input").cloned().unwrap_or(Value::Null),
        },
        "tool_result" => ContentPart::ToolResult {
            tool_use_id: string_field(&map, "tool_use_id"),
            content: map.get("content").cloned().unwrap_or(Value::Null),
        },
        _ => ContentPart::Text {
            text: Value::Object(map).to_string(),
        },
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn optional_string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Render a part sequence as plain text for providers without content-part
/// support: text parts concatenated, short descriptors for everything else.
pub fn render_parts_as_text(parts: &[ContentPart]) -> String {
    let mut out = String::new();

    for part in parts {
        let descriptor = match part {
            ContentPart::Text { text } => {
                out.push_str(text);
                continue;
            }
            ContentPart::ImageUrl { image_url } => format!("[Image: {}]", image_url.url),
            ContentPart::File { url, filename, hash, .. } => {
                let name = filename
                    .as_deref()
                    .or(url.as_deref())
                    .or(hash.as_deref())
                    .unwrap_or("unknown");
                format!("[File: {name}]")
            }
            ContentPart::ToolUse { name, .. } => format!("[Tool use: {name}]"),
            ContentPart::ToolResult { tool_use_id, .. } => format!("[Tool result: {tool_use_id}]"),
        };

        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&descriptor);
    }

    out
}
