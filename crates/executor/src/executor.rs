//! The request executor: admission, prompt assembly, dispatch, and result
//! finalization.

use std::sync::Arc;

use futures::future::BoxFuture;
use llm::{
    messages::{
        chat::{ChatMessage, ChatRole},
        openai::{CompletionChunk, FinishReason},
    },
    plugin::{ChunkSink, ModelTurn, PluginRequest, SamplingParams},
};
use rate_limit::{DispatchError, RetryPolicy};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ExecutorError, Pathway, Runtime, agent,
    parser::apply_output,
    progress::ProgressEvent,
    runtime::ModelRuntime,
    template,
};

/// Caller inputs common to every pathway operation.
#[derive(Debug, Clone, Default)]
pub struct PathwayInput {
    /// The primary text input.
    pub text: Option<String>,
    /// Conversation so far.
    pub chat_history: Vec<ChatMessage>,
    /// Context identifier echoed back on the reply.
    pub context_id: Option<String>,
    /// Ordered contexts whose file collections back this request.
    pub agent_context: Vec<files::ContextRef>,
    /// Chat the request belongs to, for file-collection membership.
    pub chat_id: Option<String>,
    /// Mirror normalized chunks onto the progress bus.
    pub stream: bool,
    /// Return the request id immediately and run in the background.
    pub async_mode: bool,
    /// Pathway-declared parameter values.
    pub params: Map<String, Value>,
    /// Sampling overrides from the caller.
    pub sampling: SamplingParams,
}

/// Reply of one pathway operation. With `async_mode`, `result` is the
/// request id to subscribe on.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PathwayReply {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Result of one executed request before reply shaping.
pub(crate) struct ExecOutcome {
    pub result: String,
    pub tool: Option<String>,
    pub warnings: Vec<String>,
}

/// A native replacement for a pathway's default execution.
///
/// Registered on the runtime under the pathway name; the executor hands it
/// the bound arguments plus handles for the default prompt pipeline and the
/// resolver, mirroring what declarative pathways get.
#[async_trait::async_trait]
pub trait PathwayOverride: Send + Sync {
    /// Produce the pathway's raw result text.
    async fn execute(&self, ctx: OverrideContext<'_>) -> crate::Result<String>;
}

/// Everything an override may reach: the bound arguments, the default
/// prompt pipeline, and the executor for resolving other pathways.
pub struct OverrideContext<'a> {
    /// Declared defaults overlaid with caller parameters.
    pub args: &'a Map<String, Value>,
    executor: &'a PathwayExecutor,
    pathway: &'a Arc<Pathway>,
    state: &'a PromptState<'a>,
}

impl OverrideContext<'_> {
    /// Run the pathway's declared prompt sequence as if no override were
    /// registered, returning the aggregated text.
    pub async fn run_all_prompts(&self) -> crate::Result<String> {
        let (text, _) = self
            .executor
            .run_all_prompts(self.pathway, self.args, self.state)
            .await?;

        Ok(text)
    }

    /// The executor, for invoking other pathways.
    pub fn resolver(&self) -> &PathwayExecutor {
        self.executor
    }
}

/// Borrowed per-attempt execution state shared by the prompt pipeline and
/// overrides.
pub struct PromptState<'a> {
    model: &'a Arc<ModelRuntime>,
    reported_model: &'a str,
    history: &'a [ChatMessage],
    request_id: &'a str,
    sink: &'a ChunkSink,
    cancel: &'a CancellationToken,
    sampling: SamplingParams,
}

/// Compiles pathway invocations into executed requests against the runtime.
#[derive(Clone)]
pub struct PathwayExecutor {
    runtime: Arc<Runtime>,
}

impl PathwayExecutor {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run a pathway to completion (or, with `async_mode`, to admission).
    pub async fn run(&self, pathway_name: &str, input: PathwayInput) -> PathwayReply {
        let Some(pathway) = self.runtime.registry().get(pathway_name) else {
            return PathwayReply {
                errors: vec![format!("unknown pathway '{pathway_name}'")],
                context_id: input.context_id,
                ..PathwayReply::default()
            };
        };

        let request_id = new_request_id();
        let context_id = input.context_id.clone();

        if input.async_mode {
            let executor = self.clone();
            let background_id = request_id.clone();
            let background_pathway = Arc::clone(&pathway);

            tokio::spawn(async move {
                if let Err(e) = executor
                    .execute_request(background_pathway, input, background_id.clone(), None, None)
                    .await
                {
                    log::debug!("async request {background_id} failed: {e}");
                }
            });

            return PathwayReply {
                result: request_id,
                context_id,
                ..PathwayReply::default()
            };
        }

        match self.execute_request(pathway, input, request_id, None, None).await {
            Ok(outcome) => PathwayReply {
                result: outcome.result,
                context_id,
                tool: outcome.tool,
                warnings: outcome.warnings,
                errors: Vec::new(),
            },
            Err(e) => PathwayReply {
                context_id,
                errors: vec![e.to_string()],
                ..PathwayReply::default()
            },
        }
    }

    /// Run an already-compiled pathway, bypassing registry lookup. Used by
    /// the REST surface for transient passthrough pathways.
    pub async fn run_compiled(&self, pathway: Arc<Pathway>, input: PathwayInput) -> PathwayReply {
        let context_id = input.context_id.clone();

        match self
            .execute_request(pathway, input, new_request_id(), None, None)
            .await
        {
            Ok(outcome) => PathwayReply {
                result: outcome.result,
                context_id,
                tool: outcome.tool,
                warnings: outcome.warnings,
                errors: Vec::new(),
            },
            Err(e) => PathwayReply {
                context_id,
                errors: vec![e.to_string()],
                ..PathwayReply::default()
            },
        }
    }

    /// Streaming variant of [`run_compiled`](Self::run_compiled).
    pub async fn run_compiled_streaming(
        &self,
        pathway: Arc<Pathway>,
        mut input: PathwayInput,
    ) -> crate::Result<(String, mpsc::UnboundedReceiver<CompletionChunk>)> {
        input.stream = true;

        let request_id = new_request_id();
        let (sink, chunk_rx) = ChunkSink::channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        spawn_chunk_forwarder(Arc::clone(&self.runtime), request_id.clone(), chunk_rx, Some(out_tx));

        let executor = self.clone();
        let background_id = request_id.clone();

        tokio::spawn(async move {
            if let Err(e) = executor
                .execute_request(pathway, input, background_id.clone(), Some(sink), None)
                .await
            {
                log::debug!("streaming request {background_id} failed: {e}");
            }
        });

        Ok((request_id, out_rx))
    }

    /// Run a pathway with live chunk delivery for the REST SSE writer.
    /// Chunks are simultaneously mirrored onto the progress bus.
    pub async fn run_streaming(
        &self,
        pathway_name: &str,
        input: PathwayInput,
    ) -> crate::Result<(String, mpsc::UnboundedReceiver<CompletionChunk>)> {
        let pathway = self
            .runtime
            .registry()
            .get(pathway_name)
            .ok_or_else(|| ExecutorError::UnknownPathway(pathway_name.to_string()))?;

        self.run_compiled_streaming(pathway, input).await
    }

    /// Merged progress subscription over the given request ids. Already
    /// finished requests yield their retained terminal event.
    pub fn subscribe_progress(&self, request_ids: &[String]) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        for request_id in request_ids {
            let subscription = self.runtime.bus().subscribe(request_id);
            let tx = tx.clone();

            tokio::spawn(async move {
                if let Some(initial) = subscription.initial {
                    let _ = tx.send(initial);
                    return;
                }

                let mut receiver = subscription.receiver;

                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let terminal = event.is_terminal();

                            if tx.send(event).is_err() || terminal {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("progress subscriber lagged, skipped {skipped} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        rx
    }

    /// Cancel a running request.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.runtime.cancel(request_id)
    }

    /// Invoke a tool pathway on behalf of the agent loop, under the parent
    /// request's cancellation token.
    pub(crate) fn run_tool(
        &self,
        pathway: Arc<Pathway>,
        arguments: Map<String, Value>,
        parent_cancel: &CancellationToken,
    ) -> BoxFuture<'static, crate::Result<String>> {
        let executor = self.clone();
        let parent_cancel = parent_cancel.clone();

        Box::pin(async move {
            let input = PathwayInput {
                text: arguments.get("text").and_then(Value::as_str).map(str::to_string),
                params: arguments,
                ..PathwayInput::default()
            };

            let outcome = executor
                .execute_request(pathway, input, new_request_id(), None, Some(&parent_cancel))
                .await?;

            Ok(outcome.result)
        })
    }

    /// Execute one admitted request: coalesce duplicates, enforce the
    /// deadline, follow the declared fallback chain, and publish the
    /// terminal progress event.
    pub(crate) async fn execute_request(
        &self,
        pathway: Arc<Pathway>,
        input: PathwayInput,
        request_id: String,
        external_sink: Option<ChunkSink>,
        parent_cancel: Option<&CancellationToken>,
    ) -> crate::Result<ExecOutcome> {
        let runtime = Arc::clone(&self.runtime);

        let sink = match external_sink {
            Some(sink) => sink,
            None if input.stream => {
                let (sink, chunk_rx) = ChunkSink::channel();
                spawn_chunk_forwarder(Arc::clone(&runtime), request_id.clone(), chunk_rx, None);
                sink
            }
            None => ChunkSink::disabled(),
        };

        let dedup_key =
            (!pathway.config.enable_duplicate_requests).then(|| execution_fingerprint(&pathway, &input));

        if let Some(key) = dedup_key {
            if let Some(result) = runtime.results.get(&key) {
                runtime
                    .bus()
                    .publish(ProgressEvent::terminal(&request_id, encode_result(&result)));

                return Ok(ExecOutcome {
                    result,
                    tool: None,
                    warnings: Vec::new(),
                });
            }

            let leader = runtime.inflight.get(&key).map(|entry| entry.value().clone());

            if let Some(leader) = leader {
                return self.follow(&leader, &request_id).await;
            }

            runtime.inflight.insert(key, request_id.clone());
        }

        let cancel = parent_cancel
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        runtime.cancellations.insert(request_id.clone(), cancel.clone());

        let mut current = pathway;
        let mut warnings: Vec<String> = Vec::new();
        let mut visited: Vec<String> = vec![current.name.clone()];

        let outcome = loop {
            let attempt = {
                let work = self.execute_inner(&current, &input, &request_id, &sink, &cancel);
                tokio::pin!(work);

                tokio::select! {
                    result = &mut work => result,
                    () = cancel.cancelled() => Err(ExecutorError::Cancelled),
                    () = tokio::time::sleep(current.timeout()) => {
                        cancel.cancel();
                        Err(ExecutorError::Timeout(current.timeout()))
                    }
                }
            };

            match attempt {
                Ok(outcome) => break Ok(outcome),
                Err(e) if e.triggers_fallback() => {
                    let next = current
                        .config
                        .fallback_pathway
                        .as_ref()
                        .filter(|name| !visited.iter().any(|seen| seen == *name))
                        .and_then(|name| runtime.registry().get(name));

                    match next {
                        Some(fallback) => {
                            log::warn!(
                                "pathway '{}' failed ({e}); falling back to '{}'",
                                current.name,
                                fallback.name
                            );
                            warnings.push(format!(
                                "pathway '{}' failed; fell back to '{}'",
                                current.name, fallback.name
                            ));
                            visited.push(fallback.name.clone());
                            current = fallback;
                        }
                        None => break Err(e),
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let finished = match outcome {
            Ok(mut outcome) => {
                outcome.warnings.extend(warnings);

                if let Some(key) = dedup_key {
                    runtime.results.insert(key, outcome.result.clone());
                }

                runtime
                    .bus()
                    .publish(ProgressEvent::terminal(&request_id, encode_result(&outcome.result)));

                Ok(outcome)
            }
            Err(e) => {
                runtime.bus().publish(ProgressEvent::failed(&request_id, &e.to_string()));
                Err(e)
            }
        };

        runtime.cancellations.remove(&request_id);

        // Followers race between the in-flight table and the retained
        // terminal event; the leader entry must outlive the publish.
        if let Some(key) = dedup_key {
            runtime.inflight.remove(&key);
        }

        finished
    }

    /// Wait on the leader of a coalesced duplicate, mirroring its events
    /// onto this request's id.
    async fn follow(&self, leader: &str, request_id: &str) -> crate::Result<ExecOutcome> {
        let subscription = self.runtime.bus().subscribe(leader);

        let terminal = match subscription.initial {
            Some(event) if event.is_terminal() => event,
            _ => {
                let mut receiver = subscription.receiver;

                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let mut mirrored = event.clone();
                            mirrored.request_id = request_id.to_string();
                            self.runtime.bus().publish(mirrored);

                            if event.is_terminal() {
                                break event;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return Err(ExecutorError::InputValidation(
                                "coalesced request ended without a terminal event".to_string(),
                            ));
                        }
                    }
                }
            }
        };

        if let Some(data) = &terminal.data {
            let result: String = serde_json::from_str(data)
                .map_err(|e| ExecutorError::InputValidation(format!("malformed terminal data: {e}")))?;

            return Ok(ExecOutcome {
                result,
                tool: None,
                warnings: Vec::new(),
            });
        }

        let info = terminal.info.as_deref().unwrap_or("ERROR: request failed");
        Err(ExecutorError::Llm(llm::LlmError::NonRetryable {
            message: info.to_string(),
            status: None,
        }))
    }

    /// The prepare → dispatch → tool-step → finalize states of one attempt.
    async fn execute_inner(
        &self,
        pathway: &Arc<Pathway>,
        input: &PathwayInput,
        request_id: &str,
        sink: &ChunkSink,
        cancel: &CancellationToken,
    ) -> crate::Result<ExecOutcome> {
        let runtime = &self.runtime;

        let model = runtime
            .model(&pathway.config.model)
            .ok_or_else(|| ExecutorError::UnknownModel(pathway.config.model.clone()))?;

        let reported_model = pathway
            .config
            .emulate_openai_chat_model
            .clone()
            .unwrap_or_else(|| model.name.clone());

        // Bind declared defaults, then caller parameters.
        let mut bindings = Map::new();

        for (name, default) in &pathway.config.inputs {
            bindings.insert(name.clone(), default.clone());
        }

        for (name, value) in &input.params {
            bindings.insert(name.clone(), value.clone());
        }

        if let Some(text) = &input.text {
            bindings.insert("text".to_string(), Value::String(text.clone()));
        }

        // Strip file references into the per-request manifest.
        let mut history = input.chat_history.clone();

        if !input.agent_context.is_empty() {
            let chat_id = input.chat_id.clone().unwrap_or_else(|| request_id.to_string());

            history = runtime
                .files()
                .sync_and_strip(history, &input.agent_context, &chat_id)
                .await?
                .history;
        }

        runtime.bus().publish(ProgressEvent::marker(request_id, 0.1));

        let state = PromptState {
            model: &model,
            reported_model: &reported_model,
            history: &history,
            request_id,
            sink,
            cancel,
            sampling: input.sampling,
        };

        let (final_text, tool_info) = match runtime.override_for(&pathway.name) {
            Some(handler) => {
                let ctx = OverrideContext {
                    args: &bindings,
                    executor: self,
                    pathway,
                    state: &state,
                };

                (handler.execute(ctx).await?, None)
            }
            None => self.run_all_prompts(pathway, &bindings, &state).await?,
        };

        let parsed = apply_output(&pathway.config.output, &final_text);

        let result = match parsed {
            Value::String(text) => text,
            shaped => serde_json::to_string(&shaped)
                .map_err(|e| ExecutorError::Template(format!("result serialization failed: {e}")))?,
        };

        Ok(ExecOutcome {
            result,
            tool: tool_info,
            warnings: Vec::new(),
        })
    }

    /// Run the pathway's prompt sequence in order, feeding each prompt the
    /// previous result, chunking or driving the tool loop as declared.
    async fn run_all_prompts(
        &self,
        pathway: &Arc<Pathway>,
        bindings: &Map<String, Value>,
        state: &PromptState<'_>,
    ) -> crate::Result<(String, Option<String>)> {
        let mut bindings = bindings.clone();

        let text_value = bindings
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut tool_info = None;
        let mut previous = Value::String(String::new());
        let mut final_text = String::new();

        for prompt_source in &pathway.config.prompts {
            bindings.insert("previous_result".to_string(), previous.clone());

            let result_text = if pathway.config.use_input_chunking && !text_value.is_empty() {
                self.run_chunked(
                    pathway,
                    state.model,
                    prompt_source,
                    &bindings,
                    state.history,
                    &text_value,
                    state.request_id,
                    state.reported_model,
                    state.sink,
                    state.cancel,
                    state.sampling,
                )
                .await?
            } else if !pathway.config.tools.is_empty() {
                let messages = assemble_messages(prompt_source, &bindings, state.history)?;

                let outcome = agent::run_tool_loop(
                    &self.runtime,
                    self,
                    pathway,
                    state.model,
                    state.request_id,
                    state.reported_model,
                    messages,
                    state.sink,
                    state.cancel,
                )
                .await?;

                if !outcome.executed_tools.is_empty() {
                    tool_info = Some(serde_json::json!({"toolUsed": outcome.executed_tools}).to_string());
                }

                outcome.text
            } else {
                let messages = assemble_messages(prompt_source, &bindings, state.history)?;

                invoke_model(
                    state.model,
                    pathway,
                    state.request_id,
                    state.reported_model,
                    messages,
                    Vec::new(),
                    state.sink,
                    state.cancel,
                    state.sampling,
                )
                .await?
                .text
            };

            previous = Value::String(result_text.clone());
            final_text = result_text;
        }

        Ok((final_text, tool_info))
    }

    /// Map one prompt over semantic chunks of the primary text, publishing
    /// per-chunk progress and concatenating results in order.
    #[allow(clippy::too_many_arguments)]
    async fn run_chunked(
        &self,
        pathway: &Arc<Pathway>,
        model: &Arc<ModelRuntime>,
        prompt_source: &str,
        bindings: &Map<String, Value>,
        history: &[ChatMessage],
        text: &str,
        request_id: &str,
        reported_model: &str,
        sink: &ChunkSink,
        cancel: &CancellationToken,
        sampling: SamplingParams,
    ) -> crate::Result<String> {
        let tokenizer = self.runtime.tokenizer().as_ref();

        // Budget: context window minus prompt overhead and return reserve.
        let mut probe = bindings.clone();
        probe.insert("text".to_string(), Value::String(String::new()));
        let prompt_overhead = tokenizer.count(&template::render(prompt_source, &probe)?);
        let history_overhead = crate::compress::history_tokens(tokenizer, history);

        let budget = model
            .config
            .max_token_length
            .saturating_sub(prompt_overhead + history_overhead)
            .saturating_sub(model.config.max_return_tokens)
            .max(1);

        let chunks = chunker::semantic_chunks(tokenizer, text, budget)?;
        let total = chunks.len().max(1);
        let mut pieces = Vec::with_capacity(chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            let mut chunk_bindings = bindings.clone();
            chunk_bindings.insert("text".to_string(), Value::String(chunk.clone()));

            let messages = assemble_messages(prompt_source, &chunk_bindings, history)?;

            let turn = invoke_model(
                model,
                pathway,
                request_id,
                reported_model,
                messages,
                Vec::new(),
                sink,
                cancel,
                sampling,
            )
            .await?;

            pieces.push(turn.text);

            let completed = index + 1;

            if completed < total {
                self.runtime
                    .bus()
                    .publish(ProgressEvent::marker(request_id, completed as f64 / total as f64));
            }
        }

        Ok(pieces.concat())
    }
}

/// One model invocation through the rate-limited dispatcher.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn invoke_model(
    model: &Arc<ModelRuntime>,
    pathway: &Arc<Pathway>,
    request_id: &str,
    reported_model: &str,
    messages: Vec<ChatMessage>,
    tools: Vec<config::ToolConfig>,
    sink: &ChunkSink,
    cancel: &CancellationToken,
    sampling: SamplingParams,
) -> crate::Result<ModelTurn> {
    let params = SamplingParams {
        max_tokens: sampling.max_tokens.or(Some(model.config.max_return_tokens as u32)),
        ..sampling
    };

    let request = PluginRequest {
        request_id: request_id.to_string(),
        model: model.name.clone(),
        reported_model: reported_model.to_string(),
        messages,
        params,
        tools,
        stream: sink.is_active() && model.config.supports_streaming,
    };

    let policy = RetryPolicy::with_attempts(pathway.config.max_retries);

    let turn = model
        .dispatcher
        .execute(&policy, cancel, |endpoint| {
            let request = request.clone();
            let sink = sink.clone();
            let plugin = &model.plugin;
            async move { plugin.execute(endpoint.config(), &request, &sink).await }
        })
        .await
        .map_err(|e| match e {
            DispatchError::Cancelled => ExecutorError::Cancelled,
            DispatchError::NoEndpoints => {
                ExecutorError::InputValidation(format!("model '{}' has no endpoints", model.name))
            }
            DispatchError::Upstream(inner) => ExecutorError::Llm(inner),
        })?;

    if turn.finish_reason == FinishReason::ContentFilter && turn.text.is_empty() {
        return Err(ExecutorError::Llm(llm::LlmError::Refusal(
            "the provider filtered the completion".to_string(),
        )));
    }

    Ok(turn)
}

/// Render one prompt template into the outbound message list. Templates
/// carrying the history marker become a system preamble plus the spliced
/// history; plain templates append as the closing user turn.
fn assemble_messages(
    source: &str,
    bindings: &Map<String, Value>,
    history: &[ChatMessage],
) -> crate::Result<Vec<ChatMessage>> {
    let rendered = template::render(source, bindings)?;

    if template::splices_messages(source) {
        let mut messages = Vec::with_capacity(history.len() + 1);

        if !rendered.trim().is_empty() {
            messages.push(ChatMessage::text(ChatRole::System, rendered));
        }

        messages.extend_from_slice(history);
        Ok(messages)
    } else {
        let mut messages = history.to_vec();
        messages.push(ChatMessage::text(ChatRole::User, rendered));
        Ok(messages)
    }
}

/// Key for duplicate-request coalescing: the pathway fingerprint plus the
/// canonicalized inputs.
fn execution_fingerprint(pathway: &Pathway, input: &PathwayInput) -> u64 {
    use xxhash_rust::xxh3::Xxh3;

    let mut hasher = Xxh3::new();
    hasher.update(&pathway.fingerprint.to_le_bytes());

    if let Some(text) = &input.text {
        hasher.update(text.as_bytes());
    }

    let canonical: std::collections::BTreeMap<&String, &Value> = input.params.iter().collect();

    if let Ok(encoded) = serde_json::to_vec(&canonical) {
        hasher.update(&encoded);
    }

    if let Ok(encoded) = serde_json::to_vec(&input.chat_history) {
        hasher.update(&encoded);
    }

    hasher.digest()
}

/// JSON-encode the final serialized result for the terminal `data` payload.
fn encode_result(result: &str) -> String {
    serde_json::to_string(result).unwrap_or_else(|_| "\"\"".to_string())
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Drain translated chunks: mirror each onto the progress bus as a
/// JSON-encoded `data` event and forward to the optional REST writer.
fn spawn_chunk_forwarder(
    runtime: Arc<Runtime>,
    request_id: String,
    mut chunks: mpsc::UnboundedReceiver<CompletionChunk>,
    rest_writer: Option<mpsc::UnboundedSender<CompletionChunk>>,
) {
    tokio::spawn(async move {
        while let Some(chunk) = chunks.recv().await {
            match serde_json::to_string(&chunk) {
                Ok(encoded) => runtime.bus().publish(ProgressEvent {
                    request_id: request_id.clone(),
                    progress: 0.0,
                    data: Some(encoded),
                    info: None,
                }),
                Err(e) => log::error!("failed to serialize chunk for the progress bus: {e}"),
            }

            // A dropped REST consumer only stops the SSE side; the bus
            // mirror continues.
            if let Some(writer) = &rest_writer {
                let _ = writer.send(chunk);
            }
        }
    });
}
