//! The turn pipeline, the heart of Parley.
//!
//! One turn follows a **Plan → Act → Reflect → Answer** cycle:
//!
//! 1. **Plan**: decide whether the latest message needs capabilities
//! 2. **Dispatch**: run every proposed call concurrently, each isolated
//! 3. **Reflect**: merge results and decide whether another round is needed
//! 4. **Synthesize**: produce the final answer, optionally streamed
//!
//! The loop is bounded by `max_rounds`. Progress is reported through a
//! [`parley_core::ProgressNotifier`] and never depends on who is listening.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn demo(provider: Arc<dyn parley_core::Provider>) {
//! use parley_agent::TurnEngine;
//! use parley_core::Message;
//!
//! let engine = TurnEngine::builder(provider).build();
//! let outcome = engine.run_turn(vec![Message::user("hello")]).await;
//! println!("{}", outcome.final_answer);
//! # }
//! ```

pub mod engine;
pub mod graph;
pub mod nodes;
pub mod settings;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use engine::{TurnEngine, TurnEngineBuilder, TurnOutcome};
pub use graph::{RouteStage, TurnGraph, next_stage};
pub use nodes::{
    APOLOGY_TEXT, AlwaysSufficient, DispatchNode, NO_OUTPUT_TEXT, Node, NodeContext, PlanningNode,
    ReflectionNode, SufficiencyEvaluator, SynthesisNode,
};
pub use settings::{EngineSettings, prompts_from_config};
