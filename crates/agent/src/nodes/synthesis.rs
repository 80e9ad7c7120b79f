//! Answer synthesis: turn the gathered results into the final reply.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::prompt::DEFAULT_INSTRUCTIONS;
use parley_core::{
    ConversationState, Message, ProviderError, ProviderRequest, Stage, StatePatch, ToolOutcome,
};
use tracing::{debug, info, warn};

use super::{Node, NodeContext};

/// Final answer when generation fails outright.
pub const APOLOGY_TEXT: &str =
    "Sorry, I ran into a problem while preparing my answer. Please try again in a moment.";

/// Final answer when the model returns nothing.
pub const NO_OUTPUT_TEXT: &str = "I don't have anything to add to that.";

const RESULTS_PREAMBLE: &str = "Information gathered from tools:";

/// Outcome of the streaming attempt.
enum Streamed {
    /// `forwarded` is the prefix of `text` observers have seen.
    Complete { text: String, forwarded: String },
    /// The stream broke after `partial` had already been forwarded.
    Broken { partial: String, error: ProviderError },
}

pub struct SynthesisNode {
    ctx: Arc<NodeContext>,
}

impl SynthesisNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    fn request(&self, state: &ConversationState, stream: bool) -> ProviderRequest {
        let settings = &self.ctx.settings;
        let persona = self.ctx.persona(state);
        let context = results_context(results_for_synthesis(state));
        let system = self
            .ctx
            .prompts
            .system_instructions(persona, &context)
            .unwrap_or_else(|e| {
                warn!(persona = %persona, error = %e, "Persona instructions unavailable, using defaults");
                if context.is_empty() {
                    DEFAULT_INSTRUCTIONS.to_string()
                } else {
                    format!("{DEFAULT_INSTRUCTIONS}\n\n{context}")
                }
            });

        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        messages.push(Message::system(system));
        messages.extend(state.messages.iter().cloned());

        ProviderRequest {
            model: settings.model.clone(),
            messages,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            tools: Vec::new(),
            stream,
        }
    }

    /// Forward chunks as they arrive. Leading whitespace is held back until
    /// real content shows up, since a blank answer is replaced later.
    async fn stream(&self, request: ProviderRequest) -> Result<Streamed, ProviderError> {
        let mut rx = self.ctx.provider.stream(request).await?;
        let mut text = String::new();
        let mut sent = 0;

        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(chunk) => {
                    if let Some(delta) = chunk.content.as_deref().filter(|d| !d.is_empty()) {
                        text.push_str(delta);
                        if !text.trim().is_empty() {
                            self.ctx.notifier.streaming_chunk(&text[sent..], false).await;
                            sent = text.len();
                        }
                    }
                    if chunk.done {
                        break;
                    }
                }
                Err(error) => {
                    text.truncate(sent);
                    return Ok(Streamed::Broken {
                        partial: text,
                        error,
                    });
                }
            }
        }
        let forwarded = text[..sent].to_string();
        Ok(Streamed::Complete { text, forwarded })
    }

    async fn complete(&self, state: &ConversationState) -> Result<String, ProviderError> {
        let response = self.ctx.provider.complete(self.request(state, false)).await?;
        Ok(response.message.text().into_owned())
    }

    /// Generate the raw answer. Returns the text (None on total failure) and
    /// what was already forwarded to streaming observers.
    async fn generate(&self, state: &ConversationState) -> (Option<String>, Option<String>) {
        if !self.ctx.settings.streaming_enabled {
            return match self.complete(state).await {
                Ok(text) => (Some(text), None),
                Err(e) => {
                    warn!(error = %e, "Synthesis failed");
                    (None, None)
                }
            };
        }

        let forwarded = match self.stream(self.request(state, true)).await {
            Ok(Streamed::Complete { text, forwarded }) => return (Some(text), Some(forwarded)),
            Ok(Streamed::Broken { partial, error }) => {
                warn!(error = %error, forwarded = partial.len(), "Stream broke, retrying without streaming");
                partial
            }
            Err(error) => {
                warn!(error = %error, "Stream unavailable, retrying without streaming");
                String::new()
            }
        };

        match self.complete(state).await {
            Ok(text) => (Some(text), Some(forwarded)),
            Err(e) => {
                warn!(error = %e, "Non-streaming retry failed");
                (None, Some(forwarded))
            }
        }
    }
}

/// Aggregated results, or this round's raw results when nothing was aggregated.
fn results_for_synthesis(state: &ConversationState) -> &[ToolOutcome] {
    if state.aggregated_results.is_empty() {
        &state.round_results
    } else {
        &state.aggregated_results
    }
}

fn results_context(results: &[ToolOutcome]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut context = String::from(RESULTS_PREAMBLE);
    for result in results {
        context.push_str(&format!("\n- [{}] {}", result.capability, result.render()));
    }
    context
}

/// Strings from `payload.sources` arrays of successful results, deduplicated.
fn collect_sources(results: &[ToolOutcome]) -> Option<Vec<String>> {
    let mut sources: Vec<String> = Vec::new();
    let found = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.payload.as_ref()?.get("sources")?.as_array())
        .flatten()
        .filter_map(|s| s.as_str());
    for source in found {
        if !sources.iter().any(|known| known == source) {
            sources.push(source.to_string());
        }
    }
    (!sources.is_empty()).then_some(sources)
}

fn confirmation_suffix(state: &ConversationState) -> Option<String> {
    if state.side_effects.is_empty() {
        return None;
    }
    let scheduled: Vec<String> = state.side_effects.iter().map(|e| e.describe()).collect();
    Some(format!("\n\nScheduled: {}.", scheduled.join("; ")))
}

#[async_trait]
impl Node for SynthesisNode {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    async fn run(&self, state: &ConversationState) -> StatePatch {
        let notifier = &self.ctx.notifier;
        notifier.progress(Stage::Synthesis, "Writing answer").await;

        let (generated, forwarded) = self.generate(state).await;

        let mut final_text = match generated {
            Some(text) if text.trim().is_empty() => NO_OUTPUT_TEXT.to_string(),
            Some(text) => text,
            None => {
                notifier.error("Answer generation failed").await;
                APOLOGY_TEXT.to_string()
            }
        };
        if let Some(suffix) = confirmation_suffix(state) {
            final_text.push_str(&suffix);
        }

        if let Some(forwarded) = forwarded {
            // Only the unsent remainder goes out, so the stream adds up to the answer.
            if let Some(tail) = final_text
                .strip_prefix(forwarded.as_str())
                .filter(|t| !t.is_empty())
            {
                notifier.streaming_chunk(tail, false).await;
            }
            notifier.streaming_chunk("", true).await;
            notifier.streaming_complete().await;
        }

        let sources = collect_sources(results_for_synthesis(state));
        notifier.completion(final_text.clone(), sources.clone()).await;

        info!(
            round = state.round,
            chars = final_text.len(),
            sources = sources.as_ref().map_or(0, Vec::len),
            "Answer synthesized"
        );
        debug!(persona = %self.ctx.persona(state), "Synthesis persona");

        StatePatch::new()
            .message(Message::assistant(final_text.clone()))
            .final_answer(final_text)
    }

    fn fail_safe(&self, _state: &ConversationState) -> StatePatch {
        StatePatch::new()
            .message(Message::assistant(APOLOGY_TEXT))
            .final_answer(APOLOGY_TEXT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;
    use crate::test_helpers::*;
    use parley_core::{ReminderRequest, SideEffect};

    fn outcome(capability: &str, message: &str, payload: Option<serde_json::Value>) -> ToolOutcome {
        ToolOutcome {
            call_id: format!("call_{capability}"),
            capability: capability.into(),
            success: true,
            message: message.into(),
            payload,
        }
    }

    fn state() -> ConversationState {
        ConversationState::from_history(vec![Message::user("what's new?")])
    }

    #[tokio::test]
    async fn streamed_chunks_add_up_to_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::chunks(&[
            "Rust ", "", "1.88 ", "is out.",
        ])]));
        let (ctx, probe) = node_context(provider, registry(vec![]), EngineSettings::default());

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some("Rust 1.88 is out."));
        assert_eq!(probe.streamed_text(), "Rust 1.88 is out.");

        let chunks = probe.chunks();
        assert_eq!(chunks.last(), Some(&(String::new(), true)));
        assert!(chunks[..chunks.len() - 1].iter().all(|(t, f)| !t.is_empty() && !f));
        assert_eq!(probe.stream_completions(), 1);
        assert_eq!(
            probe.completion().map(|(text, _)| text).as_deref(),
            Some("Rust 1.88 is out.")
        );
    }

    #[tokio::test]
    async fn broken_stream_retries_once_without_streaming() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Scripted::broken_stream(&["Half"]),
            Scripted::text("Whole answer"),
        ]));
        let (ctx, probe) =
            node_context(provider.clone(), registry(vec![]), EngineSettings::default());

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some("Whole answer"));
        assert_eq!(provider.call_count(), 2);
        assert!(!provider.requests()[1].stream);
        assert_eq!(probe.stream_completions(), 1);
    }

    #[tokio::test]
    async fn stream_unavailable_then_retry_streams_whole_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Scripted::Fail(ProviderError::Network("reset".into())),
            Scripted::text("Recovered"),
        ]));
        let (ctx, probe) = node_context(provider, registry(vec![]), EngineSettings::default());

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some("Recovered"));
        assert_eq!(probe.streamed_text(), "Recovered");
    }

    #[tokio::test]
    async fn total_failure_yields_apology() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Scripted::Fail(ProviderError::Network("down".into())),
            Scripted::Fail(ProviderError::Network("still down".into())),
        ]));
        let (ctx, probe) = node_context(provider, registry(vec![]), EngineSettings::default());

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some(APOLOGY_TEXT));
        assert_eq!(probe.errors().len(), 1);
        assert_eq!(probe.streamed_text(), APOLOGY_TEXT);
    }

    #[tokio::test]
    async fn empty_output_becomes_sentinel() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("   ")]));
        let settings = EngineSettings::default().with_streaming(false);
        let (ctx, probe) = node_context(provider, registry(vec![]), settings);

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some(NO_OUTPUT_TEXT));
        assert!(probe.chunks().is_empty());
    }

    #[tokio::test]
    async fn blank_stream_is_held_back_for_sentinel() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::chunks(&["  ", " "])]));
        let (ctx, probe) = node_context(provider, registry(vec![]), EngineSettings::default());

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some(NO_OUTPUT_TEXT));
        assert_eq!(probe.streamed_text(), NO_OUTPUT_TEXT);
        assert_eq!(probe.stream_completions(), 1);
    }

    #[tokio::test]
    async fn leading_whitespace_goes_out_with_first_content() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::chunks(&[
            "\n", " ", "Hi", " there",
        ])]));
        let (ctx, probe) = node_context(provider, registry(vec![]), EngineSettings::default());

        let patch = SynthesisNode::new(ctx).run(&state()).await;
        assert_eq!(patch.final_answer.as_deref(), Some("\n Hi there"));
        let texts: Vec<String> = probe
            .chunks()
            .into_iter()
            .filter(|(_, is_final)| !is_final)
            .map(|(text, _)| text)
            .collect();
        assert_eq!(texts, vec!["\n Hi".to_string(), " there".to_string()]);
    }

    #[tokio::test]
    async fn results_context_sources_and_confirmation() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::chunks(&["Done."])]));
        let (ctx, probe) =
            node_context(provider.clone(), registry(vec![]), EngineSettings::default());

        let mut state = state();
        state.round_results = vec![outcome("web_search", "stale", None)];
        state.aggregated_results = vec![
            outcome(
                "web_search",
                "Rust 1.88 released",
                Some(serde_json::json!({ "sources": ["https://blog.rust-lang.org", "https://blog.rust-lang.org"] })),
            ),
            outcome("set_reminder", "Reminder set", None),
        ];
        state.side_effects = vec![SideEffect::Reminder(ReminderRequest {
            message: "stretch".into(),
            due_at: None,
            delay_secs: Some(600),
            target: None,
        })];

        let patch = SynthesisNode::new(ctx).run(&state).await;
        let answer = patch.final_answer.unwrap();
        assert!(answer.starts_with("Done.\n\nScheduled: reminder \"stretch\""));
        assert_eq!(probe.streamed_text(), answer);

        let system = provider.requests()[0].messages[0].text().into_owned();
        assert!(system.contains(
            "Information gathered from tools:\n- [web_search] Rust 1.88 released\n- [set_reminder] Reminder set"
        ));
        assert!(!system.contains("stale"));
        assert!(provider.requests()[0].tools.is_empty());

        let (_, sources) = probe.completion().unwrap();
        assert_eq!(sources, Some(vec!["https://blog.rust-lang.org".to_string()]));
    }
}
