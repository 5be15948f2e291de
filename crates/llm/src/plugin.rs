//! The uniform execution contract over provider families.
//!
//! A plugin builds the vendor request from normalized messages, issues the
//! call, and (when streaming) feeds normalized chunks through the
//! [`ChunkSink`] while aggregating the final [`ModelTurn`]. One concrete
//! plugin exists per wire dialect; provider families sharing a dialect share
//! the plugin (the OpenAI chat dialect also serves vision, reasoning,
//! Azure-compatible REST and the local stub).

pub mod anthropic;
pub mod gemini;
pub mod grok;
pub mod openai_chat;
pub mod openai_completion;

use std::collections::BTreeMap;

use async_trait::async_trait;
use config::ProviderFamily;
use tokio::sync::mpsc;

use crate::messages::{
    chat::{ChatMessage, FunctionCall, ToolCall, ToolCallType},
    openai::{Citation, CompletionChunk, FinishReason, MessageDelta, StreamingToolCall},
};

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

/// One model invocation, assembled by the executor.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// Gateway request identifier; becomes the chunk id prefix.
    pub request_id: String,
    /// Vendor model name sent on the wire.
    pub model: String,
    /// Model name stamped on emitted chunks: the pathway's emulated alias
    /// when declared, the requested model otherwise.
    pub reported_model: String,
    /// Normalized conversation.
    pub messages: Vec<ChatMessage>,
    /// Sampling parameters.
    pub params: SamplingParams,
    /// Tools the model may call.
    pub tools: Vec<config::ToolConfig>,
    /// Whether to stream deltas through the sink.
    pub stream: bool,
}

/// The aggregated result of one model turn.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    /// Aggregated text.
    pub text: String,
    /// Completed tool calls, in emission order.
    pub tool_calls: Vec<ToolCall>,
    /// Terminal status.
    pub finish_reason: FinishReason,
    /// Out-of-band citations accumulated from grounded providers.
    pub citations: Vec<Citation>,
}

/// Receives normalized chunks as the provider stream is translated.
///
/// A disabled sink drops everything, letting the same plugin code serve
/// non-streaming calls.
#[derive(Debug, Clone, Default)]
pub struct ChunkSink {
    tx: Option<mpsc::UnboundedSender<CompletionChunk>>,
}

impl ChunkSink {
    /// A sink that discards chunks.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A live sink and the receiver draining it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CompletionChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Whether anything is listening.
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Emit one chunk. Emission never fails: a dropped receiver means the
    /// consumer went away and the stream tail is discarded.
    pub fn emit(&self, chunk: CompletionChunk) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(chunk);
        }
    }
}

/// The uniform execution contract.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Run one model turn against the given endpoint.
    async fn execute(
        &self,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn>;

    /// Wire-dialect name for logs.
    fn name(&self) -> &'static str;

    /// Whether the dialect supports incremental streaming.
    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Select the plugin implementing a provider family's dialect.
pub fn plugin_for(family: ProviderFamily) -> Box<dyn Plugin> {
    use openai_chat::{OpenAiChatPlugin, OpenAiStyle};

    match family {
        ProviderFamily::OpenAiChat => Box::new(OpenAiChatPlugin::new(OpenAiStyle::Chat)),
        ProviderFamily::OpenAiVision => Box::new(OpenAiChatPlugin::new(OpenAiStyle::Vision)),
        ProviderFamily::OpenAiReasoning => Box::new(OpenAiChatPlugin::new(OpenAiStyle::Reasoning)),
        ProviderFamily::AzureRest => Box::new(OpenAiChatPlugin::new(OpenAiStyle::AzureRest)),
        ProviderFamily::Local => Box::new(OpenAiChatPlugin::new(OpenAiStyle::Local)),
        ProviderFamily::OpenAiCompletion => Box::new(openai_completion::OpenAiCompletionPlugin),
        ProviderFamily::Anthropic => Box::new(anthropic::AnthropicPlugin),
        ProviderFamily::GeminiChat | ProviderFamily::GeminiVision => Box::new(gemini::GeminiPlugin),
        ProviderFamily::Grok => Box::new(grok::GrokPlugin),
    }
}

/// Builds tool calls from streamed fragments keyed by
/// `(choice_index, tool_call_index)`.
///
/// Argument fragments are buffered verbatim and never JSON-parsed
/// mid-stream; a fragment in isolation is intentionally not valid JSON.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<(u32, usize), ToolCallBuilder>,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    /// Fold one delta's tool-call fragments into the accumulator.
    pub fn observe(&mut self, choice_index: u32, fragments: &[StreamingToolCall]) {
        for fragment in fragments {
            match fragment {
                StreamingToolCall::Start { index, id, function, .. } => {
                    let builder = self.calls.entry((choice_index, *index)).or_default();

                    if builder.id.is_none() {
                        builder.id = Some(id.clone());
                    }
                    if builder.name.is_none() {
                        builder.name = Some(function.name.clone());
                    }

                    builder.arguments.push_str(&function.arguments);
                }
                StreamingToolCall::Delta { index, function } => {
                    let builder = self.calls.entry((choice_index, *index)).or_default();
                    builder.arguments.push_str(&function.arguments);
                }
            }
        }
    }

    /// Whether any call is open.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain the assembled calls in `(choice, index)` order.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .map(|builder| ToolCall {
                id: builder.id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                call_type: ToolCallType::Function,
                function: FunctionCall {
                    name: builder.name.unwrap_or_default(),
                    arguments: builder.arguments,
                },
            })
            .collect()
    }
}

/// Shared aggregation for streaming translators.
///
/// Routes every chunk through one place so the stream invariants hold for
/// all dialects: exactly one terminal chunk, nothing emitted after it, and
/// the final turn reflects everything emitted.
#[derive(Debug, Default)]
pub(crate) struct StreamCollector {
    text: String,
    accumulator: ToolCallAccumulator,
    finish: Option<FinishReason>,
    citations: Vec<Citation>,
}

impl StreamCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a chunk and forward it to the sink. Chunks after the terminal
    /// one are dropped.
    pub(crate) fn push(&mut self, chunk: CompletionChunk, sink: &ChunkSink) {
        if self.finish.is_some() {
            log::warn!("dropping chunk emitted after the terminal chunk");
            return;
        }

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text.push_str(content);
            }

            if let Some(fragments) = &choice.delta.tool_calls {
                self.accumulator.observe(choice.index, fragments);
            }

            if let Some(citations) = &choice.delta.citations {
                self.citations.extend(citations.iter().cloned());
            }

            if let Some(reason) = choice.finish_reason {
                self.finish = Some(reason);
            }
        }

        sink.emit(chunk);
    }

    /// Close the stream: when no terminal chunk arrived, synthesize one so
    /// downstream consumers always observe a finish reason.
    pub(crate) fn into_turn(
        mut self,
        id: &str,
        created: u64,
        model: &str,
        sink: &ChunkSink,
    ) -> ModelTurn {
        if self.finish.is_none() {
            let reason = if self.accumulator.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            };

            self.finish = Some(reason);
            sink.emit(CompletionChunk::single(
                id,
                created,
                model,
                MessageDelta::default(),
                Some(reason),
            ));
        }

        ModelTurn {
            text: self.text,
            tool_calls: self.accumulator.finish(),
            finish_reason: self.finish.unwrap_or(FinishReason::Stop),
            citations: self.citations,
        }
    }
}

/// Map a non-success provider response into a classified error, preserving
/// the provider's message.
pub(crate) async fn ensure_success(response: reqwest::Response, provider: &str) -> crate::Result<reqwest::Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    log::error!("{provider} API error ({status}): {error_text}");

    Err(crate::LlmError::from_status(status.as_u16(), error_text))
}
