//! Translation of the Anthropic event-framed stream into normalized chunks.
//!
//! Anthropic streams typed events (`message_start`, `content_block_start`,
//! `content_block_delta`, `content_block_stop`, `message_delta`,
//! `message_stop`) where OpenAI streams flat deltas. The processor keeps the
//! little state the mapping needs: the message id, the stop reason latched
//! from `message_delta`, and the index mapping for open tool-use blocks.
//! The terminal chunk is emitted at `message_stop` with the latched reason.

use std::collections::HashMap;

use serde::Deserialize;

use crate::messages::{
    chat::ToolCallType,
    openai::{
        CompletionChunk, FinishReason, FunctionDelta, FunctionStart, MessageDelta, StreamingToolCall, unix_now,
    },
};

/// Anthropic streaming event, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AnthropicStreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaData,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageStart {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text {
        #[allow(dead_code)]
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageDeltaData {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Map an Anthropic stop reason onto the normalized finish reasons.
pub(crate) fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        Some(other) => {
            log::warn!("unknown stop reason from Anthropic: {other}");
            FinishReason::Stop
        }
        None => FinishReason::Stop,
    }
}

/// State machine converting Anthropic stream events to normalized chunks.
pub(crate) struct AnthropicStreamProcessor {
    reported_model: String,
    message_id: String,
    created: u64,
    /// Anthropic block index to tool-call index in emission order.
    open_tools: HashMap<u32, usize>,
    latched_stop: Option<FinishReason>,
}

impl AnthropicStreamProcessor {
    pub(crate) fn new(reported_model: String) -> Self {
        Self {
            reported_model,
            message_id: String::new(),
            created: unix_now(),
            open_tools: HashMap::new(),
            latched_stop: None,
        }
    }

    pub(crate) fn message_id(&self) -> &str {
        &self.message_id
    }

    fn chunk(&self, delta: MessageDelta, finish_reason: Option<FinishReason>) -> CompletionChunk {
        CompletionChunk::single(&self.message_id, self.created, &self.reported_model, delta, finish_reason)
    }

    /// Process one event, producing at most one normalized chunk.
    pub(crate) fn process_event(&mut self, event: AnthropicStreamEvent) -> Option<CompletionChunk> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.message_id = message.id;
                Some(self.chunk(MessageDelta::assistant_role(), None))
            }

            AnthropicStreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name } => {
                    let tool_index = self.open_tools.len();
                    self.open_tools.insert(index, tool_index);

                    let fragment = StreamingToolCall::Start {
                        index: tool_index,
                        id,
                        call_type: ToolCallType::Function,
                        function: FunctionStart {
                            name,
                            arguments: String::new(),
                        },
                    };

                    Some(self.chunk(
                        MessageDelta {
                            tool_calls: Some(vec![fragment]),
                            ..MessageDelta::default()
                        },
                        None,
                    ))
                }
                ContentBlock::Text { .. } => None,
            },

            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => Some(self.chunk(MessageDelta::text(text), None)),
                BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.open_tools.get(&index).copied() else {
                        log::warn!("input_json_delta for unknown content block {index}");
                        return None;
                    };

                    let fragment = StreamingToolCall::Delta {
                        index: tool_index,
                        function: FunctionDelta {
                            arguments: partial_json,
                        },
                    };

                    Some(self.chunk(
                        MessageDelta {
                            tool_calls: Some(vec![fragment]),
                            ..MessageDelta::default()
                        },
                        None,
                    ))
                }
            },

            AnthropicStreamEvent::MessageDelta { delta } => {
                self.latched_stop = Some(map_stop_reason(delta.stop_reason.as_deref()));
                None
            }

            AnthropicStreamEvent::MessageStop => {
                let reason = self.latched_stop.take().unwrap_or(FinishReason::Stop);
                Some(self.chunk(MessageDelta::default(), Some(reason)))
            }

            AnthropicStreamEvent::Error { error } => {
                log::error!("Anthropic stream error event: {} - {}", error.error_type, error.message);
                None
            }

            AnthropicStreamEvent::ContentBlockStop { .. } | AnthropicStreamEvent::Ping => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::plugin::{ChunkSink, StreamCollector};

    fn event(value: Value) -> AnthropicStreamEvent {
        serde_json::from_value(value).unwrap()
    }

    fn run(events: Vec<Value>) -> (Vec<CompletionChunk>, crate::plugin::ModelTurn) {
        let mut processor = AnthropicStreamProcessor::new("claude-sonnet-4".to_string());
        let (sink, mut rx) = ChunkSink::channel();
        let mut collector = StreamCollector::new();

        for value in events {
            if let Some(chunk) = processor.process_event(event(value)) {
                collector.push(chunk, &sink);
            }
        }

        let turn = collector.into_turn(processor.message_id(), 0, "claude-sonnet-4", &sink);

        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }

        (chunks, turn)
    }

    #[test]
    fn text_stream_maps_to_content_deltas() {
        let (chunks, turn) = run(vec![
            json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude", "role": "assistant", "content": [], "usage": {"input_tokens": 1, "output_tokens": 0}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
            json!({"type": "message_stop"}),
        ]);

        assert_eq!(turn.text, "Hello");
        assert_eq!(turn.finish_reason, FinishReason::Stop);

        let terminals: Vec<_> = chunks.iter().filter(|c| c.finish_reason().is_some()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(chunks.last().unwrap().finish_reason().is_some());
        assert!(chunks.iter().all(|c| c.id == "msg_1"));
    }

    #[test]
    fn tool_use_stream_accumulates_arguments() {
        let (chunks, turn) = run(vec![
            json!({"type": "message_start", "message": {"id": "msg_2", "model": "claude", "role": "assistant", "content": [], "usage": {"input_tokens": 1, "output_tokens": 0}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "sum"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "2,\"b\":3}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 4}}),
            json!({"type": "message_stop"}),
        ]);

        assert_eq!(turn.finish_reason, FinishReason::ToolCalls);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "toolu_1");
        assert_eq!(turn.tool_calls[0].function.name, "sum");

        let parsed: Value = serde_json::from_str(&turn.tool_calls[0].function.arguments).unwrap();
        assert_eq!(parsed, json!({"a": 2, "b": 3}));

        assert_eq!(chunks.last().unwrap().finish_reason(), Some(FinishReason::ToolCalls));
    }

    #[test]
    fn max_tokens_maps_to_length() {
        let (_, turn) = run(vec![
            json!({"type": "message_start", "message": {"id": "msg_3", "model": "claude", "role": "assistant", "content": [], "usage": {"input_tokens": 1, "output_tokens": 0}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "truncated"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "max_tokens"}, "usage": {"output_tokens": 9}}),
            json!({"type": "message_stop"}),
        ]);

        assert_eq!(turn.finish_reason, FinishReason::Length);
    }

    #[test]
    fn refusal_maps_to_content_filter() {
        assert_eq!(map_stop_reason(Some("refusal")), FinishReason::ContentFilter);
    }

    #[test]
    fn a_stream_cut_before_message_stop_still_terminates() {
        let (chunks, turn) = run(vec![
            json!({"type": "message_start", "message": {"id": "msg_4", "model": "claude", "role": "assistant", "content": [], "usage": {"input_tokens": 1, "output_tokens": 0}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "partial"}}),
        ]);

        assert_eq!(turn.text, "partial");
        assert_eq!(turn.finish_reason, FinishReason::Stop);
        assert_eq!(chunks.iter().filter(|c| c.finish_reason().is_some()).count(), 1);
    }
}
