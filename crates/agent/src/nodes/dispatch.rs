//! Tool dispatch: run every pending call concurrently, each in isolation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use parley_core::{
    ConversationState, Message, ProgressUpdate, SideEffect, Stage, StatePatch, ToolCall,
    ToolError, ToolOutcome, ToolStatus,
};
use tracing::{debug, info, warn};

use super::{Node, NodeContext, panic_message};

/// Scratch key holding the ids of the last dispatched batch.
pub const BATCH_SCRATCH_KEY: &str = "dispatch.batch";

pub struct DispatchNode {
    ctx: Arc<NodeContext>,
}

impl DispatchNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// One call behind its own failure boundary. Always yields an outcome.
    async fn run_call(&self, call: &ToolCall) -> ToolOutcome {
        let notifier = &self.ctx.notifier;
        notifier
            .update(ProgressUpdate::tool_status(&call.id, &call.name, ToolStatus::Running))
            .await;

        let started = Instant::now();
        let result = self.invoke_isolated(call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(call_id = %call.id, capability = %call.name, error = %e, "Tool call failed");
                ToolOutcome::from_error(call, &e)
            }
        };

        let status = if outcome.success {
            ToolStatus::Completed
        } else {
            ToolStatus::Error
        };
        let mut update = ProgressUpdate::tool_status(&call.id, &call.name, status)
            .meta("duration_ms", serde_json::json!(duration_ms));
        if !outcome.success {
            update = update.meta("detail", serde_json::json!(outcome.message));
        }
        notifier.update(update).await;

        debug!(
            call_id = %call.id,
            capability = %call.name,
            success = outcome.success,
            duration_ms,
            "Tool call settled"
        );
        outcome
    }

    async fn invoke_isolated(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        if !self.ctx.settings.is_enabled(&call.name) {
            return Err(ToolError::NotFound(format!("{} (not enabled)", call.name)));
        }

        let timeout = self.ctx.settings.tool_timeout;
        let guarded = AssertUnwindSafe(self.ctx.capabilities.execute(call)).catch_unwind();
        match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ToolError::Panicked {
                tool_name: call.name.clone(),
                reason: panic_message(panic.as_ref()),
            }),
            Err(_elapsed) => Err(ToolError::Timeout {
                tool_name: call.name.clone(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

/// One correlated tool message per outcome, in batch order.
fn response_messages(outcomes: &[ToolOutcome]) -> Vec<Message> {
    outcomes
        .iter()
        .map(|o| {
            Message::tool_result(&o.call_id, o.render())
                .with_metadata("capability", serde_json::json!(o.capability))
                .with_metadata("success", serde_json::json!(o.success))
        })
        .collect()
}

/// Deferred actions carried by successful results.
fn extract_side_effects(outcomes: &[ToolOutcome]) -> Vec<SideEffect> {
    outcomes
        .iter()
        .filter(|o| o.success)
        .filter_map(|o| o.payload.as_ref().and_then(SideEffect::from_payload))
        .collect()
}

#[async_trait]
impl Node for DispatchNode {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn run(&self, state: &ConversationState) -> StatePatch {
        let calls = &state.pending_calls;
        self.ctx
            .notifier
            .update(
                ProgressUpdate::new(Stage::Dispatch, format!("Running {} tool call(s)", calls.len()))
                    .meta("round", serde_json::json!(state.round)),
            )
            .await;

        let outcomes: Vec<ToolOutcome> = join_all(calls.iter().map(|call| self.run_call(call))).await;

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(
            round = state.round,
            calls = outcomes.len(),
            failed,
            "Dispatch batch settled"
        );

        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        let mut patch = StatePatch::new()
            .pending_calls(Vec::new())
            .scratch(
                BATCH_SCRATCH_KEY,
                serde_json::json!({ "round": state.round, "call_ids": ids }),
            );
        patch.messages = response_messages(&outcomes);
        patch.side_effects = extract_side_effects(&outcomes);
        patch.round_results = Some(outcomes);
        patch
    }

    fn fail_safe(&self, state: &ConversationState) -> StatePatch {
        let error = ToolError::ExecutionFailed {
            tool_name: "dispatch".into(),
            reason: "batch aborted".into(),
        };
        let outcomes: Vec<ToolOutcome> = state
            .pending_calls
            .iter()
            .map(|call| ToolOutcome::from_error(call, &error))
            .collect();
        let mut patch = StatePatch::new().pending_calls(Vec::new());
        patch.messages = response_messages(&outcomes);
        patch.round_results = Some(outcomes);
        patch
    }
}
