//! `TurnEngine`: the public entry point that runs one conversational turn.

use std::sync::Arc;

use parley_core::{
    CapabilityRegistry, ConversationState, Message, ProgressNotifier, PromptProvider, Provider,
    Role, SideEffect, TemplatePrompts, ToolOutcome,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::graph::{RouteStage, TurnGraph};
use crate::nodes::{AlwaysSufficient, NodeContext, SufficiencyEvaluator};
use crate::settings::EngineSettings;

/// Everything a caller needs back from one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// Never empty.
    pub final_answer: String,
    /// Messages appended during this turn, for the caller to persist.
    pub messages: Vec<Message>,
    /// Deferred actions for an external scheduler.
    pub side_effects: Vec<SideEffect>,
    /// Router stages in the order they ran, `Done` last.
    pub stages: Vec<RouteStage>,
    pub rounds: u32,
    pub sufficient: bool,
    pub persona: Option<String>,
    /// Deduplicated tool results the answer was built from.
    pub results: Vec<ToolOutcome>,
    pub finished: bool,
}

impl TurnOutcome {
    fn from_state(state: ConversationState, stages: Vec<RouteStage>) -> Self {
        let messages = state.turn_messages().to_vec();
        let results = if state.aggregated_results.is_empty() {
            state.round_results
        } else {
            state.aggregated_results
        };
        Self {
            final_answer: state.final_answer.unwrap_or_default(),
            messages,
            side_effects: state.side_effects,
            stages,
            rounds: state.round,
            sufficient: state.sufficient,
            persona: state.persona,
            results,
            finished: state.finished,
        }
    }

    /// Whether any dispatch round ran.
    pub fn used_tools(&self) -> bool {
        self.stages.contains(&RouteStage::Dispatch)
    }
}

/// Runs turns against a fixed set of collaborators.
///
/// The engine holds no per-turn state, so one instance can serve many
/// concurrent turns. Observers registered on its notifier see every turn.
pub struct TurnEngine {
    ctx: Arc<NodeContext>,
    graph: TurnGraph,
}

impl TurnEngine {
    pub fn builder(provider: Arc<dyn Provider>) -> TurnEngineBuilder {
        TurnEngineBuilder {
            provider,
            capabilities: None,
            prompts: None,
            notifier: None,
            evaluator: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn notifier(&self) -> &Arc<ProgressNotifier> {
        &self.ctx.notifier
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    /// Run one turn over `history`. System messages are dropped; instructions
    /// come from the prompt provider.
    pub async fn run_turn(&self, history: Vec<Message>) -> TurnOutcome {
        let history: Vec<Message> = history
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        info!(
            history = history.len(),
            max_rounds = self.ctx.settings.max_rounds,
            "Turn started"
        );

        let mut state = ConversationState::from_history(history);
        let stages = self.graph.run(&mut state).await;
        debug!(stages = ?stages, "Turn route");

        let outcome = TurnOutcome::from_state(state, stages);
        info!(
            rounds = outcome.rounds,
            tools_used = outcome.used_tools(),
            side_effects = outcome.side_effects.len(),
            answer_len = outcome.final_answer.len(),
            "Turn finished"
        );
        outcome
    }
}

pub struct TurnEngineBuilder {
    provider: Arc<dyn Provider>,
    capabilities: Option<Arc<CapabilityRegistry>>,
    prompts: Option<Arc<dyn PromptProvider>>,
    notifier: Option<Arc<ProgressNotifier>>,
    evaluator: Option<Arc<dyn SufficiencyEvaluator>>,
    settings: EngineSettings,
}

impl TurnEngineBuilder {
    pub fn capabilities(mut self, capabilities: Arc<CapabilityRegistry>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn prompts(mut self, prompts: Arc<dyn PromptProvider>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Share a caller-owned notifier. Defaults to an inline one.
    pub fn notifier(mut self, notifier: Arc<ProgressNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn SufficiencyEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> TurnEngine {
        let notifier = self.notifier.unwrap_or_else(|| {
            Arc::new(ProgressNotifier::inline_with_timeout(
                self.settings.observer_timeout,
            ))
        });
        let ctx = Arc::new(NodeContext {
            provider: self.provider,
            capabilities: self
                .capabilities
                .unwrap_or_else(|| Arc::new(CapabilityRegistry::new())),
            prompts: self
                .prompts
                .unwrap_or_else(|| Arc::new(TemplatePrompts::default())),
            notifier,
            settings: self.settings,
        });
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(AlwaysSufficient));
        let graph = TurnGraph::new(ctx.clone(), evaluator);
        TurnEngine { ctx, graph }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    #[tokio::test]
    async fn direct_answer_without_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Scripted::text("no tools needed"),
            Scripted::chunks(&["Hi ", "there"]),
        ]));
        let engine = TurnEngine::builder(provider)
            .capabilities(registry(vec![StaticCapability::ok("web_search", "x")]))
            .build();

        let outcome = engine
            .run_turn(vec![Message::system("ignored"), Message::user("hello")])
            .await;

        assert_eq!(outcome.final_answer, "Hi there");
        assert_eq!(
            outcome.stages,
            vec![RouteStage::Planning, RouteStage::Synthesize, RouteStage::Done]
        );
        assert!(!outcome.used_tools());
        assert!(outcome.finished);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.persona.as_deref(), Some("default"));
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn one_tool_round_then_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Scripted::Calls(vec![tool_call(
                "web_search",
                serde_json::json!({ "query": "rust release" }),
            )]),
            Scripted::text("Rust 1.88 is out."),
        ]));
        let engine = TurnEngine::builder(provider.clone())
            .capabilities(registry(vec![StaticCapability::ok("web_search", "1.88 released")]))
            .settings(EngineSettings::default().with_streaming(false))
            .build();

        let outcome = engine.run_turn(vec![Message::user("latest rust?")]).await;

        assert_eq!(outcome.final_answer, "Rust 1.88 is out.");
        assert_eq!(
            outcome.stages,
            vec![
                RouteStage::Planning,
                RouteStage::Dispatch,
                RouteStage::Reflect,
                RouteStage::Synthesize,
                RouteStage::Done,
            ]
        );
        assert_eq!(outcome.results.len(), 1);
        // assistant replay, tool response, final answer
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(outcome.messages[1].role, Role::Tool);

        let synthesis = &provider.requests()[1];
        assert!(synthesis.tools.is_empty());
        assert!(
            synthesis
                .messages
                .iter()
                .any(|m| m.text().contains("[web_search] 1.88 released"))
        );
    }
}
