//! The bounded agent loop driving a model through tool invocations.

use std::sync::Arc;

use llm::{
    messages::{
        chat::ChatMessage,
        openai::FinishReason,
    },
    plugin::ChunkSink,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    Pathway, Runtime,
    compress,
    executor::{PathwayExecutor, invoke_model},
    progress::ProgressEvent,
    runtime::ModelRuntime,
};

/// Upper bound on model round-trips under one logical request.
const MAX_ITERATIONS: usize = 16;

/// The outcome of a tool loop: the final text and the tools that ran.
pub(crate) struct ToolLoopOutcome {
    pub text: String,
    pub executed_tools: Vec<String>,
}

/// Drive the model until it stops asking for tools.
///
/// Each round invokes the model with the pathway's tool schemas; completed
/// tool calls are resolved against `sys_tool_<name>` pathways, their results
/// appended as tool messages, and the model re-driven. Malformed tool
/// arguments are surfaced back to the model as a failed tool result rather
/// than failing the request.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_tool_loop(
    runtime: &Arc<Runtime>,
    executor: &PathwayExecutor,
    pathway: &Arc<Pathway>,
    model: &Arc<ModelRuntime>,
    request_id: &str,
    reported_model: &str,
    mut messages: Vec<ChatMessage>,
    sink: &ChunkSink,
    cancel: &CancellationToken,
) -> crate::Result<ToolLoopOutcome> {
    let mut executed_tools = Vec::new();
    let mut progress = 0.1f64;
    let mut last_text = String::new();

    for iteration in 0..MAX_ITERATIONS {
        let turn = invoke_model(
            model,
            pathway,
            request_id,
            reported_model,
            messages.clone(),
            pathway.config.tools.clone(),
            sink,
            cancel,
            Default::default(),
        )
        .await?;

        last_text = turn.text.clone();

        progress += (0.1f64).min((1.0 - progress) / 2.0);
        runtime.bus().publish(ProgressEvent::marker(request_id, progress));

        if turn.finish_reason != FinishReason::ToolCalls || turn.tool_calls.is_empty() {
            return Ok(ToolLoopOutcome {
                text: turn.text,
                executed_tools,
            });
        }

        log::debug!(
            "tool loop iteration {iteration}: {} call(s) for pathway '{}'",
            turn.tool_calls.len(),
            pathway.name
        );

        let calls = turn.tool_calls.clone();
        messages.push(ChatMessage::assistant_tool_calls(turn.tool_calls));

        for call in calls {
            let result = resolve_tool_call(runtime, executor, &call.function.name, &call.function.arguments, cancel)
                .await;

            executed_tools.push(call.function.name.clone());
            messages.push(ChatMessage::tool_result(call.id, result));
        }

        if compress::over_threshold(runtime.tokenizer().as_ref(), &messages, model.config.max_token_length) {
            let summary = compress::summarize(model, &messages, cancel).await;
            messages = compress::apply(messages, summary);
        }
    }

    log::warn!(
        "tool loop for pathway '{}' hit the {MAX_ITERATIONS}-iteration cap",
        pathway.name
    );

    Ok(ToolLoopOutcome {
        text: last_text,
        executed_tools,
    })
}

/// Run one tool call, returning the string fed back to the model. All
/// failures become a `{"success":false,...}` tool result.
async fn resolve_tool_call(
    runtime: &Arc<Runtime>,
    executor: &PathwayExecutor,
    tool_name: &str,
    raw_arguments: &str,
    cancel: &CancellationToken,
) -> String {
    let arguments: Value = match serde_json::from_str(raw_arguments) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("tool '{tool_name}' received unparsable arguments: {e}");
            return failure(format!("tool arguments failed to parse: {e}"));
        }
    };

    let Some(tool_pathway) = runtime.registry().tool_pathway(tool_name) else {
        return failure(format!("no pathway registered for tool '{tool_name}'"));
    };

    let arguments = match arguments {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    match executor.run_tool(tool_pathway, arguments, cancel).await {
        Ok(result) => result,
        Err(e) => failure(e.to_string()),
    }
}

fn failure(error: String) -> String {
    serde_json::json!({"success": false, "error": error}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_serialize_as_tool_results() {
        let result = failure("tool arguments failed to parse: boom".to_string());
        let value: Value = serde_json::from_str(&result).unwrap();

        assert_eq!(value["success"], Value::Bool(false));
        assert!(value["error"].as_str().unwrap().contains("boom"));
    }
}
