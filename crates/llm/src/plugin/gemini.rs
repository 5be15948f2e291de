use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    LlmError,
    http_client::http_client,
    messages::{
        chat::{ChatMessage, ChatRole, ContentPart, MessageContent, ToolCallType},
        normalize::{normalize_messages, render_parts_as_text},
        openai::{
            CompletionChunk, FinishReason, FunctionStart, MessageDelta, StreamingToolCall, unix_now,
        },
    },
    plugin::{ChunkSink, ModelTurn, Plugin, PluginRequest, StreamCollector, ensure_success},
};

const PROVIDER: &str = "gemini";

/// Plugin for Google Gemini chat and vision models.
pub struct GeminiPlugin;

#[async_trait]
impl Plugin for GeminiPlugin {
    async fn execute(
        &self,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let base = endpoint.url.trim_end_matches('/');
        let key = endpoint
            .api_key
            .as_ref()
            .map(|key| key.expose_secret().to_string())
            .unwrap_or_default();

        let url = if request.stream {
            format!("{base}/models/{}:streamGenerateContent?alt=sse&key={key}", request.model)
        } else {
            format!("{base}/models/{}:generateContent?key={key}", request.model)
        };

        let body = GeminiRequest::build(request);

        let mut builder = http_client().post(&url).header("Content-Type", "application/json");

        for (name, value) in &endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.json(&body).send().await.map_err(LlmError::connection)?;
        let response = ensure_success(response, PROVIDER).await?;

        if request.stream {
            self.translate_stream(response, request, sink).await
        } else {
            let parsed: GeminiResponse = response.json().await.map_err(|e| {
                log::error!("failed to parse {PROVIDER} response: {e}");
                LlmError::NonRetryable {
                    message: format!("malformed provider response: {e}"),
                    status: None,
                }
            })?;

            if parsed.candidates.is_empty() {
                return Err(LlmError::NonRetryable {
                    message: "provider response contained no candidates".to_string(),
                    status: None,
                });
            }

            let mut translator = GeminiTranslator::new(request.request_id.clone(), request.reported_model.clone());
            let sink = ChunkSink::disabled();
            let mut collector = StreamCollector::new();

            for chunk in translator.translate(parsed) {
                collector.push(chunk, &sink);
            }

            Ok(collector.into_turn(&request.request_id, translator.created, &request.reported_model, &sink))
        }
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

impl GeminiPlugin {
    async fn translate_stream(
        &self,
        response: reqwest::Response,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let mut events = response.bytes_stream().eventsource();
        let mut translator = GeminiTranslator::new(request.request_id.clone(), request.reported_model.clone());
        let mut collector = StreamCollector::new();

        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in {PROVIDER} stream");
                continue;
            };

            let Ok(payload) = serde_json::from_str::<GeminiResponse>(&event.data) else {
                log::warn!("failed to parse {PROVIDER} streaming chunk");
                continue;
            };

            for chunk in translator.translate(payload) {
                collector.push(chunk, sink);
            }
        }

        Ok(collector.into_turn(&request.request_id, translator.created, &request.reported_model, sink))
    }
}

/// Maps Gemini payloads (one-shot or streamed, same shape) onto normalized
/// chunks. Gemini emits function calls atomically, so each becomes a single
/// complete tool-call fragment.
struct GeminiTranslator {
    chunk_id: String,
    reported_model: String,
    created: u64,
    tool_index: usize,
}

impl GeminiTranslator {
    fn new(chunk_id: String, reported_model: String) -> Self {
        Self {
            chunk_id,
            reported_model,
            created: unix_now(),
            tool_index: 0,
        }
    }

    fn chunk(&self, delta: MessageDelta, finish_reason: Option<FinishReason>) -> CompletionChunk {
        CompletionChunk::single(&self.chunk_id, self.created, &self.reported_model, delta, finish_reason)
    }

    fn translate(&mut self, payload: GeminiResponse) -> Vec<CompletionChunk> {
        let mut chunks = Vec::new();

        let Some(candidate) = payload.candidates.into_iter().next() else {
            return chunks;
        };

        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(text) = part.text {
                    chunks.push(self.chunk(MessageDelta::text(text), None));
                }

                if let Some(call) = part.function_call {
                    let fragment = StreamingToolCall::Start {
                        index: self.tool_index,
                        id: format!("call_{}", uuid::Uuid::new_v4()),
                        call_type: ToolCallType::Function,
                        function: FunctionStart {
                            name: call.name,
                            arguments: call.args.to_string(),
                        },
                    };
                    self.tool_index += 1;

                    chunks.push(self.chunk(
                        MessageDelta {
                            tool_calls: Some(vec![fragment]),
                            ..MessageDelta::default()
                        },
                        None,
                    ));
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            let finish = if self.tool_index > 0 && reason == "STOP" {
                // Gemini reports STOP even when the candidate carried calls.
                FinishReason::ToolCalls
            } else {
                map_finish_reason(&reason)
            };

            chunks.push(self.chunk(MessageDelta::default(), Some(finish)));
        }

        chunks
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
        other => {
            log::warn!("unknown finish reason from Gemini: {other}");
            FinishReason::Stop
        }
    }
}

/// Outbound request in the Gemini `generateContent` shape.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiToolDeclarations>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<GeminiFileData>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFileData {
    file_uri: String,
    mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiToolDeclarations {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

impl GeminiRequest {
    fn build(request: &PluginRequest) -> Self {
        let normalized = normalize_messages(request.messages.clone());

        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for message in &normalized {
            match message.role {
                ChatRole::System => system_parts.push(GeminiPart {
                    text: Some(message.content_text()),
                    ..GeminiPart::default()
                }),
                ChatRole::User => contents.push(GeminiContent {
                    role: Some("user"),
                    parts: message_parts(message),
                }),
                ChatRole::Assistant => {
                    let mut parts = message_parts(message);

                    for call in message.tool_calls.iter().flatten() {
                        parts.push(GeminiPart {
                            function_call: Some(GeminiFunctionCall {
                                name: call.function.name.clone(),
                                args: serde_json::from_str(&call.function.arguments)
                                    .unwrap_or(Value::String(call.function.arguments.clone())),
                            }),
                            ..GeminiPart::default()
                        });
                    }

                    contents.push(GeminiContent {
                        role: Some("model"),
                        parts,
                    });
                }
                ChatRole::Tool => contents.push(GeminiContent {
                    role: Some("user"),
                    parts: vec![GeminiPart {
                        function_response: Some(GeminiFunctionResponse {
                            name: message.name.clone().unwrap_or_else(|| {
                                message.tool_call_id.clone().unwrap_or_default()
                            }),
                            response: Value::String(message.content_text()),
                        }),
                        ..GeminiPart::default()
                    }],
                }),
            }
        }

        let params = &request.params;

        let generation_config = if params.temperature.is_some() || params.max_tokens.is_some() || params.top_p.is_some()
        {
            Some(GenerationConfig {
                temperature: params.temperature,
                max_output_tokens: params.max_tokens,
                top_p: params.top_p,
            })
        } else {
            None
        };

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiToolDeclarations {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|tool| GeminiFunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        Self {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(GeminiContent {
                    role: None,
                    parts: system_parts,
                })
            },
            generation_config,
            tools,
        }
    }
}

fn message_parts(message: &ChatMessage) -> Vec<GeminiPart> {
    match &message.content {
        MessageContent::Null => Vec::new(),
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![GeminiPart {
                    text: Some(text.clone()),
                    ..GeminiPart::default()
                }]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => GeminiPart {
                    text: Some(text.clone()),
                    ..GeminiPart::default()
                },
                ContentPart::ImageUrl { image_url } => GeminiPart {
                    file_data: Some(GeminiFileData {
                        mime_type: guess_image_mime(&image_url.url).to_string(),
                        file_uri: image_url.url.clone(),
                    }),
                    ..GeminiPart::default()
                },
                other => GeminiPart {
                    text: Some(render_parts_as_text(std::slice::from_ref(other))),
                    ..GeminiPart::default()
                },
            })
            .collect(),
    }
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url);

    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// Inbound Gemini payload, shared by one-shot and streamed responses.
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}
