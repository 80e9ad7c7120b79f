//! The graph router: a finite-state pipeline over the four nodes.
//!
//! ```text
//! Planning ──needs tools──▶ Dispatch ──▶ Reflect ──insufficient, rounds left──▶ Planning
//!    │                                      │
//!    └──────────────▶ Synthesize ◀──────────┘
//!                         │
//!                         ▼
//!                        Done
//! ```
//!
//! Transitions are decided by the pure [`next_stage`] function. Every node
//! runs behind a panic boundary; a panicking node contributes its fail-safe
//! patch instead, so no failure escapes [`TurnGraph::run`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parley_core::{ConversationState, Message, ProgressNotifier, StatePatch};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::nodes::{
    APOLOGY_TEXT, DispatchNode, Node, NodeContext, PlanningNode, ReflectionNode,
    SufficiencyEvaluator, SynthesisNode, panic_message,
};

/// A router state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStage {
    Planning,
    Dispatch,
    Reflect,
    Synthesize,
    Done,
}

impl RouteStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Dispatch => "dispatch",
            Self::Reflect => "reflect",
            Self::Synthesize => "synthesize",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RouteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition taken after `stage` has run against `state`.
pub fn next_stage(stage: RouteStage, state: &ConversationState, max_rounds: u32) -> RouteStage {
    match stage {
        RouteStage::Planning => {
            if max_rounds > 0 && state.plan.needs_tools && !state.pending_calls.is_empty() {
                RouteStage::Dispatch
            } else {
                RouteStage::Synthesize
            }
        }
        RouteStage::Dispatch => RouteStage::Reflect,
        RouteStage::Reflect => {
            if !state.sufficient && state.round < max_rounds {
                RouteStage::Planning
            } else {
                RouteStage::Synthesize
            }
        }
        RouteStage::Synthesize | RouteStage::Done => RouteStage::Done,
    }
}

/// Wires the nodes together and drives one turn to `Done`.
pub struct TurnGraph {
    planning: Box<dyn Node>,
    dispatch: Box<dyn Node>,
    reflection: Box<dyn Node>,
    synthesis: Box<dyn Node>,
    notifier: Arc<ProgressNotifier>,
    max_rounds: u32,
    step_ceiling: u32,
}

impl TurnGraph {
    pub fn new(ctx: Arc<NodeContext>, evaluator: Arc<dyn SufficiencyEvaluator>) -> Self {
        Self::from_nodes(
            Box::new(PlanningNode::new(ctx.clone())),
            Box::new(DispatchNode::new(ctx.clone())),
            Box::new(ReflectionNode::new(ctx.clone(), evaluator)),
            Box::new(SynthesisNode::new(ctx.clone())),
            &ctx,
        )
    }

    /// Build a graph from arbitrary nodes sharing `ctx`'s notifier and limits.
    pub fn from_nodes(
        planning: Box<dyn Node>,
        dispatch: Box<dyn Node>,
        reflection: Box<dyn Node>,
        synthesis: Box<dyn Node>,
        ctx: &NodeContext,
    ) -> Self {
        Self {
            planning,
            dispatch,
            reflection,
            synthesis,
            notifier: ctx.notifier.clone(),
            max_rounds: ctx.settings.max_rounds,
            step_ceiling: ctx.settings.step_ceiling(),
        }
    }

    fn node(&self, stage: RouteStage) -> Option<&dyn Node> {
        match stage {
            RouteStage::Planning => Some(self.planning.as_ref()),
            RouteStage::Dispatch => Some(self.dispatch.as_ref()),
            RouteStage::Reflect => Some(self.reflection.as_ref()),
            RouteStage::Synthesize => Some(self.synthesis.as_ref()),
            RouteStage::Done => None,
        }
    }

    /// Run the turn to completion. Returns the visited stages, `Done` included.
    pub async fn run(&self, state: &mut ConversationState) -> Vec<RouteStage> {
        let mut stages = Vec::new();
        let mut stage = RouteStage::Planning;
        let mut steps = 0u32;

        while let Some(node) = self.node(stage) {
            stages.push(stage);
            let patch = self.run_node(node, state).await;
            state.apply(patch);
            steps += 1;

            let mut next = next_stage(stage, state, self.max_rounds);
            if steps >= self.step_ceiling
                && !matches!(next, RouteStage::Synthesize | RouteStage::Done)
            {
                warn!(steps, ceiling = self.step_ceiling, from = %stage, "Step ceiling reached, forcing synthesis");
                next = RouteStage::Synthesize;
            }
            debug!(from = %stage, to = %next, round = state.round, "Route");
            stage = next;
        }
        stages.push(RouteStage::Done);

        let mut done = StatePatch::new().finished(true);
        if state.final_answer.is_none() {
            warn!("Turn reached done without an answer, using apology");
            done = done
                .message(Message::assistant(APOLOGY_TEXT))
                .final_answer(APOLOGY_TEXT);
        }
        state.apply(done);
        stages
    }

    async fn run_node(&self, node: &dyn Node, state: &ConversationState) -> StatePatch {
        match AssertUnwindSafe(node.run(state)).catch_unwind().await {
            Ok(patch) => patch,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(node = node.name(), round = state.round, %reason, "Node panicked, applying fail-safe");
                self.notifier
                    .error(format!("{} step failed: {reason}", node.name()))
                    .await;
                node.fail_safe(state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;
    use crate::test_helpers::*;
    use async_trait::async_trait;
    use parley_core::ToolCall;

    fn state_after_planning(needs_tools: bool, calls: usize) -> ConversationState {
        let mut state = ConversationState::from_history(vec![Message::user("hi")]);
        state.plan.needs_tools = needs_tools;
        state.pending_calls = (0..calls)
            .map(|i| ToolCall::new(format!("tool_{i}"), serde_json::json!({})))
            .collect();
        state.round = 1;
        state
    }

    #[test]
    fn planning_routes_to_dispatch_only_with_calls() {
        let s = state_after_planning(true, 2);
        assert_eq!(next_stage(RouteStage::Planning, &s, 3), RouteStage::Dispatch);

        let s = state_after_planning(true, 0);
        assert_eq!(next_stage(RouteStage::Planning, &s, 3), RouteStage::Synthesize);

        let s = state_after_planning(false, 1);
        assert_eq!(next_stage(RouteStage::Planning, &s, 3), RouteStage::Synthesize);
    }

    #[test]
    fn zero_rounds_never_dispatches() {
        let s = state_after_planning(true, 1);
        assert_eq!(next_stage(RouteStage::Planning, &s, 0), RouteStage::Synthesize);
    }

    #[test]
    fn reflect_loops_only_while_insufficient_and_under_cap() {
        let mut s = state_after_planning(true, 0);
        s.sufficient = false;
        s.round = 1;
        assert_eq!(next_stage(RouteStage::Reflect, &s, 3), RouteStage::Planning);

        s.round = 3;
        assert_eq!(next_stage(RouteStage::Reflect, &s, 3), RouteStage::Synthesize);

        s.round = 1;
        s.sufficient = true;
        assert_eq!(next_stage(RouteStage::Reflect, &s, 3), RouteStage::Synthesize);
    }

    #[test]
    fn fixed_transitions() {
        let s = ConversationState::default();
        assert_eq!(next_stage(RouteStage::Dispatch, &s, 3), RouteStage::Reflect);
        assert_eq!(next_stage(RouteStage::Synthesize, &s, 3), RouteStage::Done);
        assert_eq!(next_stage(RouteStage::Done, &s, 3), RouteStage::Done);
    }

    struct ExplodingPlanner;

    #[async_trait]
    impl Node for ExplodingPlanner {
        fn name(&self) -> &'static str {
            "planning"
        }

        async fn run(&self, _state: &ConversationState) -> StatePatch {
            panic!("planner bug")
        }

        fn fail_safe(&self, _state: &ConversationState) -> StatePatch {
            StatePatch::new().plan(false, "planning failed").finished(true)
        }
    }

    /// Always proposes another call, to exercise the step ceiling.
    struct EndlessPlanner;

    #[async_trait]
    impl Node for EndlessPlanner {
        fn name(&self) -> &'static str {
            "planning"
        }

        async fn run(&self, state: &ConversationState) -> StatePatch {
            StatePatch::new()
                .plan(true, "again")
                .pending_calls(vec![ToolCall::new("web_search", serde_json::json!({}))])
                .round(state.round)
        }

        fn fail_safe(&self, _state: &ConversationState) -> StatePatch {
            StatePatch::new()
        }
    }

    struct NeverSufficient;

    #[async_trait]
    impl Node for NeverSufficient {
        fn name(&self) -> &'static str {
            "reflection"
        }

        async fn run(&self, _state: &ConversationState) -> StatePatch {
            StatePatch::new().sufficient(false)
        }

        fn fail_safe(&self, _state: &ConversationState) -> StatePatch {
            StatePatch::new().sufficient(true)
        }
    }

    #[tokio::test]
    async fn panicking_node_falls_back_and_turn_completes() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("Hello there")]));
        let (ctx, probe) = node_context(
            provider,
            registry(vec![]),
            EngineSettings::default().with_streaming(false),
        );
        let graph = TurnGraph::from_nodes(
            Box::new(ExplodingPlanner),
            Box::new(DispatchNode::new(ctx.clone())),
            Box::new(ReflectionNode::new(ctx.clone(), Arc::new(crate::AlwaysSufficient))),
            Box::new(SynthesisNode::new(ctx.clone())),
            &ctx,
        );

        let mut state = ConversationState::from_history(vec![Message::user("hi")]);
        let stages = graph.run(&mut state).await;

        assert_eq!(
            stages,
            vec![RouteStage::Planning, RouteStage::Synthesize, RouteStage::Done]
        );
        assert!(state.finished);
        assert_eq!(state.final_answer.as_deref(), Some("Hello there"));
        assert_eq!(probe.errors().len(), 1);
    }

    #[tokio::test]
    async fn step_ceiling_forces_synthesis() {
        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("Stopped")]));
        let settings = EngineSettings::default()
            .with_streaming(false)
            .with_max_rounds(1);
        let (ctx, _) = node_context(
            provider,
            registry(vec![StaticCapability::ok("web_search", "hit")]),
            settings,
        );
        let ceiling = ctx.settings.step_ceiling() as usize;
        let graph = TurnGraph::from_nodes(
            Box::new(EndlessPlanner),
            Box::new(DispatchNode::new(ctx.clone())),
            Box::new(NeverSufficient),
            Box::new(SynthesisNode::new(ctx.clone())),
            &ctx,
        );

        let mut state = ConversationState::from_history(vec![Message::user("loop")]);
        let stages = graph.run(&mut state).await;

        assert_eq!(stages.len(), ceiling + 2);
        assert_eq!(stages[ceiling], RouteStage::Synthesize);
        assert_eq!(state.final_answer.as_deref(), Some("Stopped"));
    }

    #[tokio::test]
    async fn missing_answer_becomes_apology() {
        struct SilentSynthesis;

        #[async_trait]
        impl Node for SilentSynthesis {
            fn name(&self) -> &'static str {
                "synthesis"
            }

            async fn run(&self, _state: &ConversationState) -> StatePatch {
                StatePatch::new()
            }

            fn fail_safe(&self, _state: &ConversationState) -> StatePatch {
                StatePatch::new()
            }
        }

        let provider = Arc::new(ScriptedProvider::new(vec![Scripted::text("")]));
        let (ctx, _) = node_context(provider, registry(vec![]), EngineSettings::default());
        let graph = TurnGraph::from_nodes(
            Box::new(PlanningNode::new(ctx.clone())),
            Box::new(DispatchNode::new(ctx.clone())),
            Box::new(ReflectionNode::new(ctx.clone(), Arc::new(crate::AlwaysSufficient))),
            Box::new(SilentSynthesis),
            &ctx,
        );

        let mut state = ConversationState::from_history(vec![Message::user("hi")]);
        graph.run(&mut state).await;
        assert_eq!(state.final_answer.as_deref(), Some(APOLOGY_TEXT));
        let last = state.turn_messages().last().map(|m| m.text().into_owned());
        assert_eq!(last.as_deref(), Some(APOLOGY_TEXT));
    }
}
