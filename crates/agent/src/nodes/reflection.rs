//! Reflection: merge this round's results and decide whether they suffice.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parley_core::{ConversationState, Stage, StatePatch, ToolOutcome};
use tracing::{debug, warn};

use super::{Node, NodeContext, panic_message};

/// Decides whether the gathered results answer the user.
///
/// Stopping is ultimately bounded by the router's round cap, so an evaluator
/// only needs to say "enough" early; it never has to guarantee termination.
#[async_trait]
pub trait SufficiencyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        state: &ConversationState,
        aggregated: &[ToolOutcome],
    ) -> parley_core::Result<bool>;
}

/// Default policy: one round is always enough.
pub struct AlwaysSufficient;

#[async_trait]
impl SufficiencyEvaluator for AlwaysSufficient {
    async fn evaluate(
        &self,
        _state: &ConversationState,
        _aggregated: &[ToolOutcome],
    ) -> parley_core::Result<bool> {
        Ok(true)
    }
}

pub struct ReflectionNode {
    ctx: Arc<NodeContext>,
    evaluator: Arc<dyn SufficiencyEvaluator>,
}

impl ReflectionNode {
    pub fn new(ctx: Arc<NodeContext>, evaluator: Arc<dyn SufficiencyEvaluator>) -> Self {
        Self { ctx, evaluator }
    }

    async fn evaluate(&self, state: &ConversationState, aggregated: &[ToolOutcome]) -> bool {
        let guarded = AssertUnwindSafe(self.evaluator.evaluate(state, aggregated)).catch_unwind();
        match guarded.await {
            Ok(Ok(sufficient)) => sufficient,
            Ok(Err(e)) => {
                warn!(round = state.round, error = %e, "Sufficiency evaluation failed, stopping");
                true
            }
            Err(panic) => {
                warn!(
                    round = state.round,
                    reason = %panic_message(panic.as_ref()),
                    "Sufficiency evaluator panicked, stopping"
                );
                true
            }
        }
    }
}

/// `previous ++ current`, first occurrence wins. Key: capability + trimmed message.
pub fn dedup_results(previous: &[ToolOutcome], current: &[ToolOutcome]) -> Vec<ToolOutcome> {
    let mut seen = HashSet::new();
    previous
        .iter()
        .chain(current)
        .filter(|o| seen.insert((o.capability.clone(), o.message.trim().to_string())))
        .cloned()
        .collect()
}

#[async_trait]
impl Node for ReflectionNode {
    fn name(&self) -> &'static str {
        "reflection"
    }

    async fn run(&self, state: &ConversationState) -> StatePatch {
        let aggregated = dedup_results(&state.aggregated_results, &state.round_results);

        let sufficient = if self.ctx.settings.reflection_enabled {
            self.evaluate(state, &aggregated).await
        } else {
            true
        };

        debug!(
            round = state.round,
            aggregated = aggregated.len(),
            sufficient,
            "Reflection done"
        );
        self.ctx
            .notifier
            .progress(
                Stage::Reflection,
                if sufficient {
                    "Results are sufficient"
                } else {
                    "Gathering more information"
                },
            )
            .await;

        let mut patch = StatePatch::new().sufficient(sufficient);
        patch.aggregated_results = Some(aggregated);
        patch
    }

    fn fail_safe(&self, state: &ConversationState) -> StatePatch {
        let mut patch = StatePatch::new().sufficient(true);
        patch.aggregated_results = Some(dedup_results(
            &state.aggregated_results,
            &state.round_results,
        ));
        patch
    }
}
