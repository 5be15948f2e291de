//! Chat-history compression for long tool conversations.
//!
//! When a conversation outgrows its share of the model context, older turns
//! are replaced with a model-written summary. The summary must keep every
//! distinct user question verbatim, every tool name with its literal
//! arguments, every cited URL and title, and every numeric fact, in the
//! order the tools produced them. Compression never fails the request: any
//! provider error substitutes a stub that still carries the most recent
//! user message.

use std::sync::Arc;

use llm::{
    messages::chat::{ChatMessage, ChatRole, MessageContent},
    plugin::{ChunkSink, PluginRequest, SamplingParams},
};
use rate_limit::RetryPolicy;
use tokio_util::sync::CancellationToken;

use crate::runtime::ModelRuntime;

/// Fraction of the model context window the chat history may occupy before
/// compression kicks in.
pub(crate) const COMPRESSION_THRESHOLD: f64 = 0.6;

/// Most recent user/assistant turns kept verbatim.
const RETAINED_TURNS: usize = 2;

const SUMMARY_INSTRUCTIONS: &str = "Rewrite the conversation transcript below as a compact summary for \
continued use. Rules: quote every distinct user question verbatim; list every tool call with its name and its \
literal arguments; keep the URL and title of every citation; keep every numeric fact (amounts, percentages, \
magnitudes with units); preserve the order between facts and the tool calls that produced them. Target between a \
fifth and two fifths of the transcript's length. Reply with the summary only.";

/// Whether the history is over the compression threshold for this model.
pub(crate) fn over_threshold(tokenizer: &chunker::Tokenizer, messages: &[ChatMessage], max_token_length: usize) -> bool {
    history_tokens(tokenizer, messages) as f64 > COMPRESSION_THRESHOLD * max_token_length as f64
}

/// Total token count of a history, tool calls included.
pub(crate) fn history_tokens(tokenizer: &chunker::Tokenizer, messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|message| {
            let mut tokens = tokenizer.count(&message.content_text());

            for call in message.tool_calls.iter().flatten() {
                tokens += tokenizer.count(&call.function.name);
                tokens += tokenizer.count(&call.function.arguments);
            }

            tokens
        })
        .sum()
}

/// Produce a summary of the history through the given model. Never fails:
/// provider errors yield the fallback stub.
pub(crate) async fn summarize(
    model: &Arc<ModelRuntime>,
    messages: &[ChatMessage],
    cancel: &CancellationToken,
) -> String {
    let transcript = render_transcript(messages);

    let request = PluginRequest {
        request_id: format!("compress-{}", uuid::Uuid::new_v4()),
        model: model.name.clone(),
        reported_model: model.name.clone(),
        messages: vec![
            ChatMessage::text(ChatRole::System, SUMMARY_INSTRUCTIONS),
            ChatMessage::text(ChatRole::User, transcript),
        ],
        params: SamplingParams {
            max_tokens: Some(model.config.max_return_tokens as u32),
            ..Default::default()
        },
        tools: Vec::new(),
        stream: false,
    };

    let policy = RetryPolicy::with_attempts(2);
    let sink = ChunkSink::disabled();

    let outcome = model
        .dispatcher
        .execute(&policy, cancel, |endpoint| {
            let request = request.clone();
            let sink = sink.clone();
            let plugin = &model.plugin;
            async move { plugin.execute(endpoint.config(), &request, &sink).await }
        })
        .await;

    match outcome {
        Ok(turn) if !turn.text.trim().is_empty() => turn.text,
        Ok(_) => {
            log::warn!("history compression returned empty text; substituting the fallback stub");
            fallback_stub(messages)
        }
        Err(e) => {
            log::warn!("history compression failed: {e}; substituting the fallback stub");
            fallback_stub(messages)
        }
    }
}

/// The stub substituted when compression fails. Starts with
/// `Compression failed` and preserves the most recent user message verbatim.
pub(crate) fn fallback_stub(messages: &[ChatMessage]) -> String {
    let latest_user = messages
        .iter()
        .rev()
        .find(|message| message.role == ChatRole::User)
        .map(|message| message.content_text())
        .unwrap_or_default();

    format!("Compression failed. Most recent user message: \"{latest_user}\"")
}

/// Replace older turns with the summary, keeping leading system messages
/// and the most recent user/assistant turns verbatim.
pub(crate) fn apply(messages: Vec<ChatMessage>, summary: String) -> Vec<ChatMessage> {
    let leading_system = messages
        .iter()
        .take_while(|message| message.role == ChatRole::System)
        .count();

    // Walk back to the start of the last RETAINED_TURNS user/assistant
    // turns; trailing tool results travel with their assistant turn.
    let mut retained_from = messages.len();
    let mut turns = 0;

    for (index, message) in messages.iter().enumerate().rev() {
        if matches!(message.role, ChatRole::User | ChatRole::Assistant) {
            turns += 1;
        }

        if turns > RETAINED_TURNS || index < leading_system {
            break;
        }

        retained_from = index;
    }

    let mut compressed: Vec<ChatMessage> = messages[..leading_system].to_vec();

    compressed.push(ChatMessage::text(
        ChatRole::System,
        format!("Earlier conversation summary:\n{summary}"),
    ));

    compressed.extend_from_slice(&messages[retained_from.max(leading_system)..]);

    compressed
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut transcript = String::new();

    for message in messages {
        let role = match message.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };

        transcript.push_str(role);

        if let Some(id) = &message.tool_call_id {
            transcript.push_str(&format!(" ({id})"));
        }

        transcript.push_str(": ");

        if !matches!(&message.content, MessageContent::Null) {
            transcript.push_str(&message.content_text());
        }

        for call in message.tool_calls.iter().flatten() {
            transcript.push_str(&format!(
                "\n  [tool call {} -> {}({})]",
                call.id, call.function.name, call.function.arguments
            ));
        }

        transcript.push('\n');
    }

    transcript
}
