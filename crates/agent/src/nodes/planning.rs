//! Planning: decide whether this round needs capabilities, and which.
//!
//! Order of decisions per round:
//! 1. Fix the persona (first round only).
//! 2. Scan recent user messages for a video link (first round only).
//! 3. Ask the model with tool calling enabled, merging its calls behind the
//!    heuristic one.
//! 4. If the model is unavailable, fall back to keyword rules.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parley_core::{
    ConversationState, Error, Message, ProgressUpdate, PromptError, ProviderRequest, Role, Stage,
    StatePatch, ToolCall, ToolDefinition,
};
use regex::Regex;
use tracing::{debug, info, warn};

use super::{Node, NodeContext};

/// YouTube watch, shorts and youtu.be links.
static VIDEO_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)https?://(?:(?:www\.|m\.)?youtube\.com/(?:watch\?(?:[^\s&]*&)*v=[\w-]+|shorts/[\w-]+)|youtu\.be/[\w-]+)[^\s<>()"']*"#,
    )
    .expect("video link pattern must compile")
});

const TRAILING_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

const DEFAULT_PLANNING_PROMPT: &str = "Decide whether answering the latest user message needs any of \
     the available tools. Call them if so; otherwise reply without tool calls.";

/// Most recent video link among the last `depth` messages, user messages only.
pub fn find_video_link(messages: &[Message], depth: usize) -> Option<String> {
    messages
        .iter()
        .rev()
        .take(depth)
        .filter(|m| m.role == Role::User)
        .find_map(|m| {
            let text = m.text();
            VIDEO_LINK
                .find(&text)
                .map(|found| found.as_str().trim_end_matches(TRAILING_PUNCTUATION).to_string())
        })
}

pub struct PlanningNode {
    ctx: Arc<NodeContext>,
}

impl PlanningNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    fn resolve_persona(&self, state: &ConversationState) -> String {
        state
            .latest_user_message()
            .and_then(|m| m.metadata.get("persona"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .unwrap_or_else(|| self.ctx.settings.default_persona.clone())
    }

    fn heuristic_call(&self, state: &ConversationState) -> Option<ToolCall> {
        let settings = &self.ctx.settings;
        let capability = &settings.video_capability;
        if state.round > 0
            || !settings.is_enabled(capability)
            || !self.ctx.capabilities.contains(capability)
        {
            return None;
        }
        let url = find_video_link(&state.messages, settings.heuristic_scan_depth)?;
        debug!(capability = %capability, url = %url, "Video link found, injecting call");
        Some(ToolCall::new(
            capability.clone(),
            serde_json::json!({ "url": url }),
        ))
    }

    fn planning_context(&self, round: u32, tools: &[ToolDefinition]) -> Result<String, PromptError> {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let args = HashMap::from([
            ("capabilities".to_string(), names.join(", ")),
            ("round".to_string(), round.to_string()),
        ]);
        match self.ctx.prompts.tool_prompt("planning", &args) {
            Err(PromptError::UnknownTemplate(_)) => Ok(DEFAULT_PLANNING_PROMPT.to_string()),
            other => other,
        }
    }

    /// Ask the model. Returns its text and proposed calls.
    async fn ask_model(
        &self,
        state: &ConversationState,
        persona: &str,
        round: u32,
        tools: Vec<ToolDefinition>,
    ) -> parley_core::Result<(String, Vec<ToolCall>)> {
        let settings = &self.ctx.settings;
        let context = self.planning_context(round, &tools)?;
        let system = self.ctx.prompts.system_instructions(persona, &context)?;

        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        messages.push(Message::system(system));
        messages.extend(state.messages.iter().cloned());

        let request = ProviderRequest {
            model: settings.model.clone(),
            messages,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            tools,
            stream: false,
        };

        let response = self.ctx.provider.complete(request).await?;
        let mut seen = HashSet::new();
        let calls = response
            .message
            .tool_calls
            .iter()
            .map(|raw| {
                let mut call = ToolCall::from_message_call(raw);
                if call.id.is_empty() || !seen.insert(call.id.clone()) {
                    call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    seen.insert(call.id.clone());
                }
                call
            })
            .collect();
        Ok((response.message.text().into_owned(), calls))
    }

    /// First enabled, registered capability whose keyword appears in the
    /// latest user message.
    fn keyword_fallback(&self, state: &ConversationState) -> Option<ToolCall> {
        let text = state.latest_user_message()?.text().into_owned();
        let lowered = text.to_lowercase();
        let settings = &self.ctx.settings;
        settings
            .fallback_keywords
            .iter()
            .filter(|(capability, _)| {
                settings.is_enabled(capability) && self.ctx.capabilities.contains(capability)
            })
            .find(|(_, keywords)| {
                keywords
                    .iter()
                    .any(|k| lowered.contains(k.to_lowercase().as_str()))
            })
            .map(|(capability, _)| {
                ToolCall::new(capability.clone(), serde_json::json!({ "query": text }))
            })
    }
}

/// Heuristic call first; model calls duplicating it (same name and url) are dropped.
fn merge_calls(heuristic: Option<ToolCall>, model: Vec<ToolCall>) -> Vec<ToolCall> {
    let Some(injected) = heuristic else {
        return model;
    };
    let name = injected.name.clone();
    let url = injected.arguments.get("url").cloned();
    let mut merged = vec![injected];
    merged.extend(
        model
            .into_iter()
            .filter(|c| !(c.name == name && c.arguments.get("url") == url.as_ref())),
    );
    merged
}

#[async_trait]
impl Node for PlanningNode {
    fn name(&self) -> &'static str {
        "planning"
    }

    async fn run(&self, state: &ConversationState) -> StatePatch {
        let settings = &self.ctx.settings;
        let mut patch = StatePatch::new();

        let persona = match &state.persona {
            Some(persona) => persona.clone(),
            None => {
                let persona = self.resolve_persona(state);
                debug!(persona = %persona, "Persona fixed for turn");
                patch = patch.persona(persona.clone());
                persona
            }
        };

        if settings.max_rounds == 0 {
            return patch
                .plan(false, "conversational mode")
                .pending_calls(Vec::new());
        }
        if state.round >= settings.max_rounds {
            return patch
                .plan(false, "round limit reached")
                .pending_calls(Vec::new());
        }

        let round = state.round + 1;
        self.ctx
            .notifier
            .update(
                ProgressUpdate::new(Stage::Planning, format!("Planning round {round}"))
                    .meta("round", serde_json::json!(round)),
            )
            .await;

        let heuristic = self.heuristic_call(state);
        let tools = self.ctx.capabilities.definitions(|name| settings.is_enabled(name));

        let (model_text, model_calls, fell_back) = if tools.is_empty() {
            debug!(round, "No capabilities offered, skipping planning model");
            (String::new(), Vec::new(), false)
        } else {
            match self.ask_model(state, &persona, round, tools).await {
                Ok((text, calls)) => (text, calls, false),
                Err(Error::Provider(e)) => {
                    warn!(round, error = %e, "Planning model unavailable, using keyword fallback");
                    let calls = self.keyword_fallback(state).into_iter().collect();
                    (String::new(), calls, true)
                }
                Err(e) => {
                    warn!(round, error = %e, "Planning failed, ending tool rounds");
                    return patch
                        .plan(false, format!("planning failed: {e}"))
                        .pending_calls(Vec::new())
                        .finished(true);
                }
            }
        };

        let calls = merge_calls(heuristic, model_calls);
        let patch = patch.round(round);

        if calls.is_empty() {
            debug!(round, "No tool calls planned");
            return patch
                .plan(false, model_text.trim().to_string())
                .pending_calls(Vec::new());
        }

        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        info!(round, calls = ?names, fallback = fell_back, "Planned tool calls");
        let reasoning = if model_text.trim().is_empty() {
            format!("calling {}", names.join(", "))
        } else {
            model_text.trim().to_string()
        };

        let mut replay = Message::assistant(model_text);
        replay.tool_calls = calls.iter().map(ToolCall::to_message_call).collect();

        patch
            .plan(true, reasoning)
            .message(replay)
            .pending_calls(calls)
    }

    fn fail_safe(&self, _state: &ConversationState) -> StatePatch {
        StatePatch::new()
            .plan(false, "planning panicked")
            .pending_calls(Vec::new())
            .finished(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;
    use crate::test_helpers::*;
    use parley_core::{ProviderError, TemplatePrompts};

    const VIDEO: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    fn video_and_search() -> Vec<Arc<dyn parley_core::Capability>> {
        vec![
            StaticCapability::ok("summarize_video", "summary"),
            StaticCapability::ok("web_search", "results"),
        ]
    }

    #[test]
    fn finds_video_links() {
        let messages = vec![
            Message::user(format!("watch {VIDEO}.")),
            Message::assistant("sure"),
        ];
        assert_eq!(find_video_link(&messages, 6).as_deref(), Some(VIDEO));

        let short = vec![Message::user("https://youtu.be/dQw4w9WgXcQ!")];
        assert_eq!(
            find_video_link(&short, 6).as_deref(),
            Some("https://youtu.be/dQw4w9WgXcQ")
        );

        let shorts = vec![Message::user("look https://youtube.com/shorts/abcDEF12345 lol")];
        assert_eq!(
            find_video_link(&shorts, 6).as_deref(),
            Some("https://youtube.com/shorts/abcDEF12345")
        );

        let none = vec![Message::user("https://example.com/watch?v=123")];
        assert!(find_video_link(&none, 6).is_none());
    }

    #[test]
    fn video_scan_respects_depth_and_role() {
        let mut messages = vec![Message::user(VIDEO)];
        messages.extend((0..3).map(|i| Message::user(format!("msg {i}"))));
        assert!(find_video_link(&messages, 3).is_none());
        assert!(find_video_link(&messages, 4).is_some());

        let assistant_only = vec![Message::assistant(VIDEO)];
        assert!(find_video_link(&assistant_only, 6).is_none());
    }

    #[test]
    fn merge_drops_duplicate_of_heuristic() {
        let injected = ToolCall::new("summarize_video", serde_json::json!({ "url": VIDEO }));
        let dup = ToolCall::new("summarize_video", serde_json::json!({ "url": VIDEO }));
        let other = ToolCall::new("web_search", serde_json::json!({ "query": "x" }));
        let merged = merge_calls(Some(injected.clone()), vec![dup, other.clone()]);
        assert_eq!(merged, vec![injected, other]);
    }

    #[tokio::test]
    async fn persona_from_metadata_then_default() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("hi")]));
        let (ctx, _probe) = node_context(provider, registry(vec![]), EngineSettings::default());
        let node = PlanningNode::new(ctx);

        let tagged = ConversationState::from_history(vec![
            Message::user("hello").with_metadata("persona", serde_json::json!("pirate")),
        ]);
        assert_eq!(node.run(&tagged).await.persona.as_deref(), Some("pirate"));

        let plain = ConversationState::from_history(vec![Message::user("hello")]);
        assert_eq!(node.run(&plain).await.persona.as_deref(), Some("default"));

        let mut fixed = plain.clone();
        fixed.persona = Some("tutor".into());
        assert!(node.run(&fixed).await.persona.is_none());
    }

    #[tokio::test]
    async fn model_calls_become_pending() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::Calls(vec![tool_call(
            "web_search",
            serde_json::json!({ "query": "rust 2024" }),
        )])]));
        let (ctx, probe) = node_context(
            provider.clone(),
            registry(video_and_search()),
            EngineSettings::default(),
        );
        let state = ConversationState::from_history(vec![Message::user("what's new in rust?")]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        assert_eq!(patch.round, Some(1));
        assert!(patch.plan.as_ref().unwrap().needs_tools);
        let calls = patch.pending_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_web_search");
        assert_eq!(patch.messages.len(), 1);
        assert_eq!(patch.messages[0].tool_calls[0].name, "web_search");

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        let offered: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered, vec!["summarize_video", "web_search"]);
        assert_eq!(probe.progress_for(Stage::Planning).len(), 1);
    }

    #[tokio::test]
    async fn video_link_injects_single_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::Calls(vec![tool_call(
            "summarize_video",
            serde_json::json!({ "url": VIDEO }),
        )])]));
        let (ctx, _) = node_context(provider, registry(video_and_search()), EngineSettings::default());
        let state = ConversationState::from_history(vec![Message::user(format!("tl;dr {VIDEO}"))]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        let calls = patch.pending_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "summarize_video");
        assert_eq!(calls[0].arguments["url"], VIDEO);
    }

    #[tokio::test]
    async fn video_heuristic_needs_enabled_capability() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("no tools")]));
        let settings = EngineSettings::default().with_capabilities(["web_search"]);
        let (ctx, _) = node_context(provider, registry(video_and_search()), settings);
        let state = ConversationState::from_history(vec![Message::user(VIDEO)]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        assert!(!patch.plan.unwrap().needs_tools);
        assert!(patch.pending_calls.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_uses_keyword_fallback() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::Fail(
            ProviderError::Network("down".into()),
        )]));
        let (ctx, _) = node_context(provider, registry(video_and_search()), EngineSettings::default());
        let state =
            ConversationState::from_history(vec![Message::user("Search for the latest Rust release")]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        assert_eq!(patch.round, Some(1));
        assert!(patch.finished.is_none());
        let calls = patch.pending_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments["query"], "Search for the latest Rust release");
    }

    #[tokio::test]
    async fn provider_failure_without_keyword_plans_nothing() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::Fail(
            ProviderError::Timeout("slow".into()),
        )]));
        let (ctx, _) = node_context(provider, registry(video_and_search()), EngineSettings::default());
        let state = ConversationState::from_history(vec![Message::user("tell me a joke")]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        assert!(!patch.plan.unwrap().needs_tools);
    }

    #[tokio::test]
    async fn zero_rounds_skips_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let settings = EngineSettings::default().with_max_rounds(0);
        let (ctx, _) = node_context(provider.clone(), registry(video_and_search()), settings);
        let state = ConversationState::from_history(vec![Message::user(VIDEO)]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        assert!(patch.round.is_none());
        assert!(!patch.plan.unwrap().needs_tools);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn template_missing_placeholder_finishes() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("unused")]));
        let prompts =
            TemplatePrompts::default().with_template("planning", "Round {round}, mood {mood}");
        let (ctx, _) = node_context_with_prompts(
            provider.clone(),
            registry(video_and_search()),
            EngineSettings::default(),
            Arc::new(prompts),
        );
        let state = ConversationState::from_history(vec![Message::user("search news")]);

        let patch = PlanningNode::new(ctx).run(&state).await;
        assert_eq!(patch.finished, Some(true));
        assert!(!patch.plan.unwrap().needs_tools);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn planning_template_is_rendered() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("none needed")]));
        let prompts = TemplatePrompts::new("Be brief.")
            .with_template("planning", "Round {round}. Tools: {capabilities}.");
        let (ctx, _) = node_context_with_prompts(
            provider.clone(),
            registry(video_and_search()),
            EngineSettings::default(),
            Arc::new(prompts),
        );
        let state = ConversationState::from_history(vec![Message::user("hi")]);

        PlanningNode::new(ctx).run(&state).await;
        let system = provider.requests()[0].messages[0].text().into_owned();
        assert_eq!(
            system,
            "Be brief.\n\nRound 1. Tools: summarize_video, web_search."
        );
    }
}
