use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::{
    LlmError,
    http_client::http_client,
    messages::{
        normalize::normalize_messages,
        openai::{CompletionChunk, FinishReason, MessageDelta, unix_now},
    },
    plugin::{ChunkSink, ModelTurn, Plugin, PluginRequest, StreamCollector, ensure_success},
};

/// Plugin for legacy `/completions` endpoints.
///
/// The wire format has no messages and no content parts: the conversation is
/// rendered to a single prompt string, non-text parts becoming short
/// descriptors.
pub struct OpenAiCompletionPlugin;

const PROVIDER: &str = "openai-completion";

#[async_trait]
impl Plugin for OpenAiCompletionPlugin {
    async fn execute(
        &self,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let base = endpoint.url.trim_end_matches('/');
        let url = if base.ends_with("/completions") {
            base.to_string()
        } else {
            format!("{base}/completions")
        };

        let prompt = normalize_messages(request.messages.clone())
            .iter()
            .map(|message| message.content_text())
            .collect::<Vec<_>>()
            .join("\n");

        let body = CompletionRequestBody {
            model: &request.model,
            prompt: &prompt,
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            stream: request.stream.then_some(true),
            extra: &endpoint.params,
        };

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
            let parsed: CompletionResponseBody = response.json().await.map_err(|e| {
                log::error!("failed to parse {PROVIDER} response: {e}");
                LlmError::NonRetryable {
                    message: format!("malformed provider response: {e}"),
                    status: None,
                }
            })?;

            let Some(choice) = parsed.choices.into_iter().next() else {
                return Err(LlmError::NonRetryable {
                    message: "provider response contained no choices".to_string(),
                    status: None,
                });
            };

            Ok(ModelTurn {
                text: choice.text,
                tool_calls: Vec::new(),
                finish_reason: choice.finish_reason.unwrap_or(FinishReason::Stop),
                citations: Vec::new(),
            })
        }
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

impl OpenAiCompletionPlugin {
    async fn translate_stream(
        &self,
        response: reqwest::Response,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let mut events = response.bytes_stream().eventsource();
        let mut collector = StreamCollector::new();
        let mut chunk_id = request.request_id.clone();
        let created = unix_now();

        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in {PROVIDER} stream");
                continue;
            };

            if event.data == "[DONE]" {
                break;
            }

            let parsed: CompletionStreamChunk = serde_json::from_str(&event.data).map_err(|e| {
                log::error!("malformed {PROVIDER} streaming chunk: {e}");
                LlmError::NonRetryable {
                    message: format!("malformed streaming chunk: {e}"),
                    status: None,
                }
            })?;

            chunk_id = parsed.id.unwrap_or(chunk_id);

            let Some(choice) = parsed.choices.into_iter().next() else {
                continue;
            };

            let delta = if choice.text.is_empty() {
                MessageDelta::default()
            } else {
                MessageDelta::text(choice.text)
            };

            collector.push(
                CompletionChunk::single(&chunk_id, created, &request.reported_model, delta, choice.finish_reason),
                sink,
            );
        }

        Ok(collector.into_turn(&chunk_id, created, &request.reported_model, sink))
    }
}

#[derive(Serialize)]
struct CompletionRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    extra: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct CompletionResponseBody {
    choices: Vec<CompletionResponseChoice>,
}

#[derive(Deserialize)]
struct CompletionResponseChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<FinishReason>,
}

#[derive(Deserialize)]
struct CompletionStreamChunk {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<CompletionResponseChoice>,
}
