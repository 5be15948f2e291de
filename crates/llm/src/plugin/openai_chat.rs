use std::collections::BTreeMap;

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
        chat::{ChatMessage, ToolCall, ToolCallType},
        normalize::normalize_messages,
        openai::{CompletionChunk, FinishReason, FunctionDefinition, ToolDefinition, unix_now},
    },
    plugin::{ChunkSink, ModelTurn, Plugin, PluginRequest, StreamCollector, ensure_success},
};

/// Variations of the OpenAI chat-completions dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiStyle {
    /// Plain chat completions.
    Chat,
    /// Chat completions with image input.
    Vision,
    /// Reasoning models (`o3*`, `gpt-5.1-reasoning`): the return budget is
    /// `max_completion_tokens`, and tool-call deltas may arrive after long
    /// silences. No inactivity cutoff applies below the pathway timeout.
    Reasoning,
    /// Azure-hosted or other OpenAI-compatible REST; authenticates with the
    /// `api-key` header.
    AzureRest,
    /// Local development stub; no authentication.
    Local,
}

/// Plugin for every provider speaking the OpenAI chat wire format.
pub struct OpenAiChatPlugin {
    style: OpenAiStyle,
}

impl OpenAiChatPlugin {
    pub fn new(style: OpenAiStyle) -> Self {
        Self { style }
    }

    fn url(&self, endpoint: &config::EndpointConfig) -> String {
        let base = endpoint.url.trim_end_matches('/');

        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn request_builder(&self, url: &str, endpoint: &config::EndpointConfig) -> reqwest::RequestBuilder {
        let mut builder = http_client().post(url).header("Content-Type", "application/json");

        if let Some(key) = &endpoint.api_key {
            builder = match self.style {
                OpenAiStyle::AzureRest => builder.header("api-key", key.expose_secret()),
                _ => builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret())),
            };
        }

        for (name, value) in &endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
    }

    fn body<'a>(
        &self,
        endpoint: &'a config::EndpointConfig,
        request: &'a PluginRequest,
        messages: &'a [ChatMessage],
        stream: bool,
    ) -> ChatRequestBody<'a> {
        let params = &request.params;

        let (max_tokens, max_completion_tokens) = match self.style {
            OpenAiStyle::Reasoning => (None, params.max_tokens),
            _ => (params.max_tokens, None),
        };

        ChatRequestBody {
            model: &request.model,
            messages,
            temperature: params.temperature,
            max_tokens,
            max_completion_tokens,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            stream: stream.then_some(true),
            tools: tool_definitions(&request.tools),
            extra: &endpoint.params,
        }
    }
}

#[async_trait]
impl Plugin for OpenAiChatPlugin {
    async fn execute(
        &self,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let url = self.url(endpoint);
        let messages = normalize_messages(request.messages.clone());

        if request.stream {
            self.execute_stream(&url, endpoint, request, &messages, sink).await
        } else {
            self.execute_once(&url, endpoint, request, &messages).await
        }
    }

    fn name(&self) -> &'static str {
        match self.style {
            OpenAiStyle::Chat => "openai-chat",
            OpenAiStyle::Vision => "openai-vision",
            OpenAiStyle::Reasoning => "openai-reasoning",
            OpenAiStyle::AzureRest => "azure-rest",
            OpenAiStyle::Local => "local",
        }
    }
}

impl OpenAiChatPlugin {
    async fn execute_once(
        &self,
        url: &str,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        messages: &[ChatMessage],
    ) -> crate::Result<ModelTurn> {
        let body = self.body(endpoint, request, messages, false);

        let response = self
            .request_builder(url, endpoint)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::connection)?;

        let response = ensure_success(response, self.name()).await?;

        let parsed: ChatResponseBody = response.json().await.map_err(|e| {
            log::error!("failed to parse {} chat completion response: {e}", self.name());
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
            text: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or(FinishReason::Stop),
            citations: Vec::new(),
        })
    }

    async fn execute_stream(
        &self,
        url: &str,
        endpoint: &config::EndpointConfig,
        request: &PluginRequest,
        messages: &[ChatMessage],
        sink: &ChunkSink,
    ) -> crate::Result<ModelTurn> {
        let body = self.body(endpoint, request, messages, true);

        let response = self
            .request_builder(url, endpoint)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::connection)?;

        let response = ensure_success(response, self.name()).await?;

        let mut events = response.bytes_stream().eventsource();
        let mut collector = StreamCollector::new();
        let mut chunk_id = request.request_id.clone();
        let created = unix_now();

        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in {} stream", self.name());
                continue;
            };

            if event.data == "[DONE]" {
                break;
            }

            let mut chunk: CompletionChunk = serde_json::from_str(&event.data).map_err(|e| {
                log::error!("malformed {} streaming chunk: {e}", self.name());
                LlmError::NonRetryable {
                    message: format!("malformed streaming chunk: {e}"),
                    status: None,
                }
            })?;

            chunk_id = chunk.id.clone();
            chunk.model = request.reported_model.clone();

            collector.push(chunk, sink);
        }

        Ok(collector.into_turn(&chunk_id, created, &request.reported_model, sink))
    }
}

/// Convert declared tools into the OpenAI wire shape.
pub(crate) fn tool_definitions(tools: &[config::ToolConfig]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|tool| ToolDefinition {
            tool_type: ToolCallType::Function,
            function: FunctionDefinition {
                name: tool.name.clone(),
                description: Some(tool.description.clone()),
                parameters: Some(tool.parameters.clone()),
            },
        })
        .collect()
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatResponseChoice>,
}

#[derive(Deserialize)]
struct ChatResponseChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<FinishReason>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode, header},
        response::IntoResponse,
        routing::post,
    };
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::chat::{ChatMessage, ChatRole};
    use crate::plugin::SamplingParams;

    #[derive(Clone)]
    struct CaptureState {
        captured: Arc<Mutex<Option<(HeaderMap, Value)>>>,
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}")
    }

    fn endpoint(url: String) -> config::EndpointConfig {
        config::EndpointConfig {
            name: None,
            url,
            api_key: Some(secrecy::SecretString::from("test-key".to_string())),
            headers: Default::default(),
            params: Default::default(),
            requests_per_second: 100,
        }
    }

    fn request(stream: bool) -> PluginRequest {
        PluginRequest {
            request_id: "req-1".to_string(),
            model: "gpt-4o".to_string(),
            reported_model: "cortex-chat".to_string(),
            messages: vec![ChatMessage::text(ChatRole::User, "Hello!")],
            params: SamplingParams {
                temperature: Some(0.3),
                max_tokens: Some(64),
                ..Default::default()
            },
            tools: Vec::new(),
            stream,
        }
    }

    #[tokio::test]
    async fn non_streaming_call_builds_the_expected_body() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
        };

        async fn handler(
            State(state): State<CaptureState>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> impl IntoResponse {
            *state.captured.lock().unwrap() = Some((headers, body));

            Json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
            }))
        }

        let app = Router::new()
            .route("/chat/completions", post(handler))
            .with_state(state.clone());
        let base = serve(app).await;

        let plugin = OpenAiChatPlugin::new(OpenAiStyle::Chat);
        let turn = plugin
            .execute(&endpoint(base), &request(false), &ChunkSink::disabled())
            .await
            .unwrap();

        assert_eq!(turn.text, "Hi there");
        assert_eq!(turn.finish_reason, FinishReason::Stop);
        assert!(turn.tool_calls.is_empty());

        let (headers, body) = state.captured.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer test-key");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["messages"][0]["content"], "Hello!");
        assert!(body.get("stream").is_none());
    }

    #[tokio::test]
    async fn azure_style_authenticates_with_api_key_header() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
        };

        async fn handler(
            State(state): State<CaptureState>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> impl IntoResponse {
            *state.captured.lock().unwrap() = Some((headers, body));

            Json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "ok"},
                    "finish_reason": "stop"
                }]
            }))
        }

        let app = Router::new()
            .route("/chat/completions", post(handler))
            .with_state(state.clone());
        let base = serve(app).await;

        let plugin = OpenAiChatPlugin::new(OpenAiStyle::AzureRest);
        plugin
            .execute(&endpoint(base), &request(false), &ChunkSink::disabled())
            .await
            .unwrap();

        let (headers, _) = state.captured.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "test-key");
        assert!(headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn reasoning_style_sends_max_completion_tokens() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
        };

        async fn handler(
            State(state): State<CaptureState>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> impl IntoResponse {
            *state.captured.lock().unwrap() = Some((headers, body));

            Json(json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]
            }))
        }

        let app = Router::new()
            .route("/chat/completions", post(handler))
            .with_state(state.clone());
        let base = serve(app).await;

        let plugin = OpenAiChatPlugin::new(OpenAiStyle::Reasoning);
        plugin
            .execute(&endpoint(base), &request(false), &ChunkSink::disabled())
            .await
            .unwrap();

        let (_, body) = state.captured.lock().unwrap().clone().unwrap();
        assert_eq!(body["max_completion_tokens"], 64);
        assert!(body.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn streaming_passes_chunks_through_with_the_reported_model() {
        async fn handler() -> impl IntoResponse {
            let body = concat!(
                "data: {\"id\":\"chatcmpl-9\",\"object\":\"chat.completion.chunk\",\"created\":5,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
                "data: {\"id\":\"chatcmpl-9\",\"object\":\"chat.completion.chunk\",\"created\":5,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
                "data: {\"id\":\"chatcmpl-9\",\"object\":\"chat.completion.chunk\",\"created\":5,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            );

            ([(header::CONTENT_TYPE, "text/event-stream")], body)
        }

        let app = Router::new().route("/chat/completions", post(handler));
        let base = serve(app).await;

        let (sink, mut rx) = ChunkSink::channel();
        let plugin = OpenAiChatPlugin::new(OpenAiStyle::Chat);
        let turn = plugin.execute(&endpoint(base), &request(true), &sink).await.unwrap();

        assert_eq!(turn.text, "Hello");
        assert_eq!(turn.finish_reason, FinishReason::Stop);

        let mut emitted = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            emitted.push(chunk);
        }

        assert_eq!(emitted.len(), 3);
        assert!(emitted.iter().all(|chunk| chunk.model == "cortex-chat"));
        assert_eq!(emitted.last().unwrap().finish_reason(), Some(FinishReason::Stop));
        assert_eq!(
            emitted.iter().filter(|chunk| chunk.finish_reason().is_some()).count(),
            1
        );
    }

    #[tokio::test]
    async fn provider_rate_limits_classify_as_retryable() {
        async fn handler() -> impl IntoResponse {
            (StatusCode::TOO_MANY_REQUESTS, "slow down")
        }

        let app = Router::new().route("/chat/completions", post(handler));
        let base = serve(app).await;

        let plugin = OpenAiChatPlugin::new(OpenAiStyle::Chat);
        let err = plugin
            .execute(&endpoint(base), &request(false), &ChunkSink::disabled())
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Retryable { status: Some(429), .. }));
    }
}
