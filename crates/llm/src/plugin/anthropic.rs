pub(crate) mod stream;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::stream::{AnthropicStreamEvent, AnthropicStreamProcessor};
use crate::{
    LlmError,
    http_client::http_client,
    messages::{
        chat::{ChatRole, ContentPart, MessageContent, ToolCall, ToolCallType},
        normalize::{normalize_messages, render_parts_as_text},
        openai::unix_now,
    },
    plugin::{ChunkSink, ModelTurn, Plugin, PluginRequest, StreamCollector, ensure_success},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

/// Plugin for the Anthropic messages API.
pub struct AnthropicPlugin;

#[async_trait]
impl Plugin for AnthropicPlugin {
    async fn execute(
        &self,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let url = format!("{}/messages", endpoint.url.trim_end_matches('/'));
        let body = AnthropicRequest::build(request);

        let mut builder = http_client()
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");

        if let Some(key) = &endpoint.api_key {
            builder = builder.header("x-api-key", key.expose_secret());
        }

        for (name, value) in &endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.json(&body).send().await.map_err(LlmError::connection)?;
        let response = ensure_success(response, PROVIDER).await?;

        if request.stream {
            self.translate_stream(response, request, sink).await
        } else {
            let parsed: AnthropicResponse = response.json().await.map_err(|e| {
                log::error!("failed to parse {PROVIDER} response: {e}");
                LlmError::NonRetryable {
                    message: format!("malformed provider response: {e}"),
                    status: None,
                }
            })?;

            Ok(parsed.into_turn())
        }
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

impl AnthropicPlugin {
    async fn translate_stream(
        &self,
        response: reqwest::Response,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let mut events = response.bytes_stream().eventsource();
        let mut processor = AnthropicStreamProcessor::new(request.reported_model.clone());
        let mut collector = StreamCollector::new();
        let created = unix_now();

        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in {PROVIDER} stream");
                continue;
            };

            let Ok(parsed) = serde_json::from_str::<AnthropicStreamEvent>(&event.data) else {
                log::warn!("failed to parse {PROVIDER} streaming event");
                continue;
            };

            if let Some(chunk) = processor.process_event(parsed) {
                collector.push(chunk, sink);
            }
        }

        Ok(collector.into_turn(processor.message_id(), created, &request.reported_model, sink))
    }
}

/// Outbound request in the Anthropic messages shape.
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    Image { source: AnthropicImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicImageSource {
    Url { url: String },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

impl AnthropicRequest {
    /// The messages API has no system or tool roles: system turns move to
    /// the dedicated field, tool results become `tool_result` blocks on a
    /// user turn, and assistant tool calls become `tool_use` blocks.
    fn build(request: &PluginRequest) -> Self {
        let normalized = normalize_messages(request.messages.clone());

        let mut system_parts = Vec::new();
        let mut messages: Vec<AnthropicMessage> = Vec::new();

        for message in &normalized {
            match message.role {
                ChatRole::System => system_parts.push(message.content_text()),
                ChatRole::User => messages.push(AnthropicMessage {
                    role: "user",
                    content: content_blocks(&message.content),
                }),
                ChatRole::Assistant => {
                    let mut content = content_blocks(&message.content);

                    for call in message.tool_calls.iter().flatten() {
                        content.push(AnthropicBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input: serde_json::from_str(&call.function.arguments)
                                .unwrap_or(Value::String(call.function.arguments.clone())),
                        });
                    }

                    messages.push(AnthropicMessage {
                        role: "assistant",
                        content,
                    });
                }
                ChatRole::Tool => messages.push(AnthropicMessage {
                    role: "user",
                    content: vec![AnthropicBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: Value::String(message.content_text()),
                    }],
                }),
            }
        }

        Self {
            model: request.model.clone(),
            max_tokens: request.params.max_tokens.unwrap_or(1024),
            messages,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            tools: request
                .tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect(),
            stream: request.stream.then_some(true),
        }
    }
}

fn content_blocks(content: &MessageContent) -> Vec<AnthropicBlock> {
    match content {
        MessageContent::Null => Vec::new(),
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![AnthropicBlock::Text { text: text.clone() }]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => AnthropicBlock::Text { text: text.clone() },
                ContentPart::ImageUrl { image_url } => AnthropicBlock::Image {
                    source: AnthropicImageSource::Url {
                        url: image_url.url.clone(),
                    },
                },
                ContentPart::ToolUse { id, name, input } => AnthropicBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
                ContentPart::ToolResult { tool_use_id, content } => AnthropicBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                },
                file @ ContentPart::File { .. } => AnthropicBlock::Text {
                    text: render_parts_as_text(std::slice::from_ref(file)),
                },
            })
            .collect(),
    }
}

/// Response from the Anthropic messages API.
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

impl AnthropicResponse {
    fn into_turn(self) -> ModelTurn {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in self.content {
            match block.block_type.as_str() {
                "text" => text.push_str(&block.text.unwrap_or_default()),
                "tool_use" => tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4())),
                    call_type: ToolCallType::Function,
                    function: crate::messages::chat::FunctionCall {
                        name: block.name.unwrap_or_default(),
                        arguments: block
                            .input
                            .as_ref()
                            .map(|input| serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()))
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                }),
                other => log::warn!("ignoring unsupported {PROVIDER} content block type: {other}"),
            }
        }

        ModelTurn {
            text,
            tool_calls,
            finish_reason: stream::map_stop_reason(self.stop_reason.as_deref()),
            citations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Json, Router,
        extract::State,
        http::HeaderMap,
        response::IntoResponse,
        routing::post,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::chat::ChatMessage;
    use crate::messages::openai::FinishReason;
    use crate::plugin::SamplingParams;

    #[derive(Clone)]
    struct CaptureState {
        captured: Arc<Mutex<Option<(HeaderMap, Value)>>>,
    }

    async fn handle_messages(
        State(state): State<CaptureState>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        *state.captured.lock().unwrap() = Some((headers, body));

        Json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "Bonjour"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
    }

    fn plugin_request() -> PluginRequest {
        PluginRequest {
            request_id: "req-1".to_string(),
            model: "claude-sonnet-4".to_string(),
            reported_model: "claude-sonnet-4".to_string(),
            messages: vec![
                ChatMessage::text(ChatRole::System, "Translate to French."),
                ChatMessage::text(ChatRole::User, "Hello"),
            ],
            params: SamplingParams {
                max_tokens: Some(128),
                ..Default::default()
            },
            tools: Vec::new(),
            stream: false,
        }
    }

    #[tokio::test]
    async fn system_messages_move_to_the_system_field() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
        };

        let app = Router::new()
            .route("/v1/messages", post(handle_messages))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let endpoint = config::EndpointConfig {
            name: None,
            url: format!("http://{address}/v1"),
            api_key: Some(secrecy::SecretString::from("test-key".to_string())),
            headers: Default::default(),
            params: Default::default(),
            requests_per_second: 100,
        };

        let turn = AnthropicPlugin
            .execute(&endpoint, &plugin_request(), &ChunkSink::disabled())
            .await
            .unwrap();

        assert_eq!(turn.text, "Bonjour");
        assert_eq!(turn.finish_reason, FinishReason::Stop);

        let (headers, body) = state.captured.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "test-key");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);

        assert_eq!(body["system"], "Translate to French.");
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "Hello");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn tool_turns_become_tool_result_blocks() {
        let mut request = plugin_request();
        request.messages = vec![
            ChatMessage::text(ChatRole::User, "Sum 2 and 3"),
            ChatMessage::assistant_tool_calls(vec![ToolCall {
                id: "toolu_1".into(),
                call_type: ToolCallType::Function,
                function: crate::messages::chat::FunctionCall {
                    name: "sum".into(),
                    arguments: r#"{"a":2,"b":3}"#.into(),
                },
            }]),
            ChatMessage::tool_result("toolu_1", "5"),
        ];

        let body = AnthropicRequest::build(&request);
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["messages"][1]["role"], "assistant");
        assert_eq!(value["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(value["messages"][1]["content"][0]["input"], json!({"a": 2, "b": 3}));

        assert_eq!(value["messages"][2]["role"], "user");
        assert_eq!(value["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(value["messages"][2]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn response_blocks_aggregate_into_a_turn() {
        let response = AnthropicResponse {
            content: vec![
                AnthropicResponseBlock {
                    block_type: "text".into(),
                    text: Some("Calling the tool.".into()),
                    id: None,
                    name: None,
                    input: None,
                },
                AnthropicResponseBlock {
                    block_type: "tool_use".into(),
                    text: None,
                    id: Some("toolu_9".into()),
                    name: Some("sum".into()),
                    input: Some(json!({"a": 2, "b": 3})),
                },
            ],
            stop_reason: Some("tool_use".into()),
        };

        let turn = response.into_turn();
        assert_eq!(turn.text, "Calling the tool.");
        assert_eq!(turn.finish_reason, FinishReason::ToolCalls);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].function.name, "sum");
    }
}
