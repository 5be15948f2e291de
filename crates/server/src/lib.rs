//! The OpenAI-compatible REST surface.
//!
//! Exposes `/v1/models`, `/v1/completions` and `/v1/chat/completions` over
//! the pathway executor. A requested model resolves to the pathway that
//! emulates it, or to a transient passthrough pathway when the name belongs
//! to a configured model directly.

mod error;

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Sse, sse::Event},
    routing::{get, post},
};
use executor::{Pathway, PathwayExecutor, PathwayInput, Runtime};
use futures::StreamExt;
use llm::{
    messages::chat::{ChatMessage, ChatRole},
    messages::openai::{
        ChatChoice, ChatCompletionRequest, ChatCompletionResponse, CompletionChoice, CompletionRequest,
        CompletionResponse, FinishReason, Model, ModelsResponse, ObjectType, Usage,
    },
    plugin::SamplingParams,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::RestError;

/// Configuration for serving Cortex.
pub struct ServeConfig {
    /// The socket address the server binds to.
    pub listen_address: SocketAddr,
    /// The loaded gateway configuration.
    pub config: config::Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Version string logged on startup.
    pub version: String,
}

/// Starts and runs the gateway with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        version,
    }: ServeConfig,
) -> anyhow::Result<()> {
    log::info!("Cortex {version}");

    let enable_rest = config.server.enable_rest;
    let runtime = Runtime::new(config)?;
    let executor = PathwayExecutor::new(runtime);

    let mut app = Router::new();

    if enable_rest {
        app = app.merge(router(executor));
        log::info!("OpenAI-compatible REST surface enabled");
    } else {
        log::info!("REST surface disabled; the typed query surface is the only entry point");
    }

    let listener = TcpListener::bind(listen_address).await?;
    log::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
        .await?;

    Ok(())
}

/// Creates the axum router for the REST endpoints.
pub fn router(executor: PathwayExecutor) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(executor)
}

/// Resolve a requested model name to the pathway serving it: an emulated
/// alias wins, a configured model gets a transient passthrough pathway.
fn resolve_pathway(executor: &PathwayExecutor, model: &str) -> Result<Arc<Pathway>, RestError> {
    if let Some(pathway) = executor.runtime().registry().by_emulated_model(model) {
        return Ok(pathway);
    }

    if executor.runtime().model(model).is_some() {
        let passthrough = config::PathwayConfig {
            prompts: vec!["{{messages}}".to_string()],
            model: model.to_string(),
            ..config::PathwayConfig::default()
        };

        return Ok(Arc::new(Pathway::compile(model, passthrough)));
    }

    Err(RestError::model_not_found(model))
}

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses. With `stream: true`
/// the response is sent as Server-Sent Events terminated by `data: [DONE]`.
async fn chat_completions(
    State(executor): State<PathwayExecutor>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<axum::response::Response, RestError> {
    log::debug!(
        "chat completions for model '{}' with {} message(s), streaming: {}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let mut pathway = resolve_pathway(&executor, &request.model)?;

    // Caller-declared tools override the pathway's own set; legacy
    // `functions` entries are treated as tool definitions.
    let mut tools: Vec<config::ToolConfig> = Vec::new();

    for definition in request.tools.iter().flatten() {
        tools.push(tool_config(&definition.function));
    }

    for function in request.functions.iter().flatten() {
        tools.push(tool_config(function));
    }

    if !tools.is_empty() {
        let mut adjusted = pathway.config.clone();
        adjusted.tools = tools;
        pathway = Arc::new(Pathway::compile(&pathway.name, adjusted));
    }

    let input = PathwayInput {
        chat_history: request.messages,
        sampling: SamplingParams {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
        },
        ..PathwayInput::default()
    };

    if request.stream.unwrap_or(false) {
        let (_request_id, chunks) = executor
            .run_compiled_streaming(pathway, input)
            .await
            .map_err(RestError::from)?;

        let event_stream = futures::stream::unfold(chunks, |mut chunks| async move {
            chunks.recv().await.map(|chunk| (chunk, chunks))
        })
        .map(|chunk| {
            let event = match serde_json::to_string(&chunk) {
                Ok(json) => Event::default().data(json),
                Err(e) => {
                    log::error!("failed to serialize chunk: {e}");
                    Event::default().data(r#"{"error":"serialization failed"}"#)
                }
            };

            Ok::<_, Infallible>(event)
        });

        let with_done = event_stream.chain(futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

        return Ok(Sse::new(with_done).into_response());
    }

    let model = request.model;
    let reply = executor.run_compiled(pathway, input).await;

    if let Some(error) = reply.errors.first() {
        return Err(RestError::upstream(error));
    }

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: ObjectType::ChatCompletion,
        created: unix_now(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text(ChatRole::Assistant, reply.result),
            finish_reason: FinishReason::Stop,
        }],
        usage: Usage::default(),
    };

    Ok(Json(response).into_response())
}

/// Handle legacy text completion requests.
async fn completions(
    State(executor): State<PathwayExecutor>,
    Json(request): Json<CompletionRequest>,
) -> Result<axum::response::Response, RestError> {
    log::debug!("legacy completions for model '{}'", request.model);

    let pathway = resolve_pathway(&executor, &request.model)?;

    let input = PathwayInput {
        chat_history: vec![ChatMessage::text(ChatRole::User, request.prompt.joined())],
        sampling: SamplingParams {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            ..SamplingParams::default()
        },
        ..PathwayInput::default()
    };

    let reply = executor.run_compiled(pathway, input).await;

    if let Some(error) = reply.errors.first() {
        return Err(RestError::upstream(error));
    }

    let response = CompletionResponse {
        id: format!("cmpl-{}", uuid::Uuid::new_v4()),
        object: ObjectType::TextCompletion,
        created: unix_now(),
        model: request.model,
        choices: vec![CompletionChoice {
            text: reply.result,
            index: 0,
            finish_reason: FinishReason::Stop,
        }],
        usage: Usage::default(),
    };

    Ok(Json(response).into_response())
}

/// Handle list models requests: configured model names plus the emulated
/// chat-model aliases claimed by pathways.
async fn list_models(State(executor): State<PathwayExecutor>) -> Json<ModelsResponse> {
    let runtime = executor.runtime();

    let mut data: Vec<Model> = runtime
        .model_names()
        .map(|name| Model {
            id: name.to_string(),
            object: ObjectType::Model,
            created: 0,
            owned_by: "cortex".to_string(),
        })
        .collect();

    data.extend(runtime.registry().emulated_aliases().map(|(alias, _)| Model {
        id: alias.to_string(),
        object: ObjectType::Model,
        created: 0,
        owned_by: "cortex-pathway".to_string(),
    }));

    data.sort_by(|a, b| a.id.cmp(&b.id));

    log::debug!("returning {} models", data.len());

    Json(ModelsResponse {
        object: ObjectType::List,
        data,
    })
}

fn tool_config(function: &llm::messages::openai::FunctionDefinition) -> config::ToolConfig {
    config::ToolConfig {
        name: function.name.clone(),
        description: function.description.clone().unwrap_or_default(),
        parameters: function
            .parameters
            .clone()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
