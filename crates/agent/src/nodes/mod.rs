//! The four pipeline nodes.
//!
//! A node reads the [`ConversationState`] and returns a [`StatePatch`]; it
//! never mutates state itself. Every node also defines a fail-safe patch the
//! router applies when the node panics, so no failure escapes a turn.

pub mod dispatch;
pub mod planning;
pub mod reflection;
pub mod synthesis;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{
    CapabilityRegistry, ConversationState, ProgressNotifier, PromptProvider, Provider, StatePatch,
};

use crate::settings::EngineSettings;

pub use dispatch::DispatchNode;
pub use planning::PlanningNode;
pub use reflection::{AlwaysSufficient, ReflectionNode, SufficiencyEvaluator};
pub use synthesis::{APOLOGY_TEXT, NO_OUTPUT_TEXT, SynthesisNode};

/// Collaborators shared by every node of one engine.
pub struct NodeContext {
    pub provider: Arc<dyn Provider>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub prompts: Arc<dyn PromptProvider>,
    pub notifier: Arc<ProgressNotifier>,
    pub settings: EngineSettings,
}

impl NodeContext {
    /// Persona fixed for this turn, or the configured default.
    pub(crate) fn persona<'a>(&'a self, state: &'a ConversationState) -> &'a str {
        state
            .persona
            .as_deref()
            .unwrap_or(&self.settings.default_persona)
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &ConversationState) -> StatePatch;

    /// Patch applied in place of `run`'s when the node panics.
    fn fail_safe(&self, state: &ConversationState) -> StatePatch;
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
