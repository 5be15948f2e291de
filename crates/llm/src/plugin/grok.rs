use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    LlmError,
    http_client::http_client,
    messages::{
        chat::{ChatRole, ToolCallType},
        normalize::normalize_messages,
        openai::{
            Citation, CompletionChunk, FinishReason, FunctionDelta, FunctionStart, MessageDelta, StreamingToolCall,
            unix_now,
        },
    },
    plugin::{ChunkSink, ModelTurn, Plugin, PluginRequest, StreamCollector, ensure_success},
};

const PROVIDER: &str = "grok";

/// Plugin for the xAI responses API.
///
/// Web and X search results arrive as citation events; they are surfaced
/// twice, as inline `[[n]](url)` markdown in the delta stream on first
/// appearance and as an out-of-band citation list on the aggregated turn.
pub struct GrokPlugin;

#[async_trait]
impl Plugin for GrokPlugin {
    async fn execute(
        &self,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let base = endpoint.url.trim_end_matches('/');
        let url = if base.ends_with("/responses") {
            base.to_string()
        } else {
            format!("{base}/responses")
        };

        let body = build_request(request);

        let mut builder = http_client().post(&url).header("Content-Type", "application/json");

        if let Some(key) = &endpoint.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        for (name, value) in &endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.json(&body).send().await.map_err(LlmError::connection)?;
        let response = ensure_success(response, PROVIDER).await?;

        if request.stream {
            self.translate_stream(response, request, sink).await
        } else {
            let parsed: GrokResponse = response.json().await.map_err(|e| {
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

impl GrokPlugin {
    async fn translate_stream(
        &self,
        response: reqwest::Response,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let mut events = response.bytes_stream().eventsource();
        let mut translator = GrokTranslator::new(request.request_id.clone(), request.reported_model.clone());
        let mut collector = StreamCollector::new();

        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in {PROVIDER} stream");
                continue;
            };

            if event.data == "[DONE]" {
                break;
            }

            let Ok(parsed) = serde_json::from_str::<GrokStreamEvent>(&event.data) else {
                log::warn!("failed to parse {PROVIDER} streaming event");
                continue;
            };

            for chunk in translator.translate(parsed) {
                collector.push(chunk, sink);
            }
        }

        Ok(collector.into_turn(translator.response_id(), translator.created, &request.reported_model, sink))
    }
}

fn build_request(request: &PluginRequest) -> Value {
    let normalized = normalize_messages(request.messages.clone());
    let mut input = Vec::new();

    for message in &normalized {
        match message.role {
            ChatRole::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.content_text(),
            })),
            ChatRole::Assistant if message.tool_calls.is_some() => {
                let text = message.content_text();
                if !text.is_empty() {
                    input.push(json!({"role": "assistant", "content": text}));
                }

                for call in message.tool_calls.iter().flatten() {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }));
                }
            }
            role => {
                let role = match role {
                    ChatRole::System => "system",
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                };

                input.push(json!({"role": role, "content": message.content_text()}));
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "input": input,
    });

    if request.stream {
        body["stream"] = json!(true);
    }

    if let Some(temperature) = request.params.temperature {
        body["temperature"] = json!(temperature);
    }

    if let Some(max_tokens) = request.params.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }

    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect(),
        );
    }

    body
}

/// Streaming event from the responses API, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GrokStreamEvent {
    #[serde(rename = "response.created")]
    Created { response: GrokResponseHead },

    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },

    #[serde(rename = "response.tool_call.delta")]
    ToolCallDelta {
        index: usize,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },

    #[serde(rename = "response.citation.added")]
    CitationAdded { citation: GrokCitation },

    #[serde(rename = "response.completed")]
    Completed {
        #[serde(default)]
        response: Option<GrokResponseHead>,
    },

    /// Events the translator has no mapping for (`response.in_progress`,
    /// output item bookkeeping). Ignored.
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct GrokResponseHead {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<GrokIncompleteDetails>,
}

#[derive(Debug, Deserialize)]
struct GrokIncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrokCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

/// Translates responses-API events into normalized chunks.
struct GrokTranslator {
    response_id: String,
    reported_model: String,
    created: u64,
    /// Tool-call indexes already opened with a `Start` fragment.
    open_tools: std::collections::HashSet<usize>,
    /// Cited URLs in order of first appearance.
    cited_urls: Vec<String>,
}

impl GrokTranslator {
    fn new(response_id: String, reported_model: String) -> Self {
        Self {
            response_id,
            reported_model,
            created: unix_now(),
            open_tools: std::collections::HashSet::new(),
            cited_urls: Vec::new(),
        }
    }

    fn response_id(&self) -> &str {
        &self.response_id
    }

    fn chunk(&self, delta: MessageDelta, finish_reason: Option<FinishReason>) -> CompletionChunk {
        CompletionChunk::single(&self.response_id, self.created, &self.reported_model, delta, finish_reason)
    }

    fn translate(&mut self, event: GrokStreamEvent) -> Vec<CompletionChunk> {
        match event {
            GrokStreamEvent::Created { response } => {
                if let Some(id) = response.id {
                    self.response_id = id;
                }

                vec![self.chunk(MessageDelta::assistant_role(), None)]
            }

            GrokStreamEvent::OutputTextDelta { delta } => vec![self.chunk(MessageDelta::text(delta), None)],

            GrokStreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let fragment = if self.open_tools.insert(index) {
                    StreamingToolCall::Start {
                        index,
                        id: id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                        call_type: ToolCallType::Function,
                        function: FunctionStart {
                            name: name.unwrap_or_default(),
                            arguments,
                        },
                    }
                } else {
                    StreamingToolCall::Delta {
                        index,
                        function: FunctionDelta { arguments },
                    }
                };

                vec![self.chunk(
                    MessageDelta {
                        tool_calls: Some(vec![fragment]),
                        ..MessageDelta::default()
                    },
                    None,
                )]
            }

            GrokStreamEvent::CitationAdded { citation } => {
                if self.cited_urls.contains(&citation.url) {
                    return Vec::new();
                }

                self.cited_urls.push(citation.url.clone());
                let number = self.cited_urls.len();

                vec![self.chunk(
                    MessageDelta {
                        content: Some(format!("[[{number}]]({})", citation.url)),
                        citations: Some(vec![Citation {
                            index: number,
                            url: citation.url,
                            title: citation.title,
                        }]),
                        ..MessageDelta::default()
                    },
                    None,
                )]
            }

            GrokStreamEvent::Completed { response } => {
                let finish = if !self.open_tools.is_empty() {
                    FinishReason::ToolCalls
                } else {
                    map_status(response.as_ref())
                };

                vec![self.chunk(MessageDelta::default(), Some(finish))]
            }

            GrokStreamEvent::Other => Vec::new(),
        }
    }
}

fn map_status(head: Option<&GrokResponseHead>) -> FinishReason {
    let Some(head) = head else {
        return FinishReason::Stop;
    };

    match head.status.as_deref() {
        Some("incomplete") => match head.incomplete_details.as_ref().and_then(|d| d.reason.as_deref()) {
            Some("max_output_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Length,
        },
        _ => FinishReason::Stop,
    }
}

/// One-shot response from the responses API.
#[derive(Debug, Deserialize)]
struct GrokResponse {
    #[serde(default)]
    output: Vec<GrokOutputItem>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<GrokIncompleteDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GrokOutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<GrokOutputContent>,
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        #[serde(default)]
        call_id: Option<String>,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GrokOutputContent {
    #[serde(rename = "output_text")]
    OutputText {
        text: String,
        #[serde(default)]
        citations: Vec<GrokCitation>,
    },
    #[serde(other)]
    Other,
}

impl GrokResponse {
    fn into_turn(self) -> ModelTurn {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut citations = Vec::new();

        for item in self.output {
            match item {
                GrokOutputItem::Message { content } => {
                    for piece in content {
                        if let GrokOutputContent::OutputText {
                            text: fragment,
                            citations: cited,
                        } = piece
                        {
                            text.push_str(&fragment);

                            for citation in cited {
                                let number = citations.len() + 1;
                                citations.push(Citation {
                                    index: number,
                                    url: citation.url,
                                    title: citation.title,
                                });
                            }
                        }
                    }
                }
                GrokOutputItem::FunctionCall { call_id, name, arguments } => {
                    tool_calls.push(crate::messages::chat::ToolCall {
                        id: call_id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                        call_type: ToolCallType::Function,
                        function: crate::messages::chat::FunctionCall { name, arguments },
                    });
                }
                GrokOutputItem::Other => {}
            }
        }

        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            map_status(Some(&GrokResponseHead {
                id: None,
                status: self.status,
                incomplete_details: self.incomplete_details,
            }))
        };

        ModelTurn {
            text,
            tool_calls,
            finish_reason,
            citations,
        }
    }
}
