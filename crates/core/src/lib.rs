//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley conversation
//! engine. This crate defines the model that every other crate builds on:
//! messages, the per-turn state and its merge rules, the capability and
//! provider contracts, the progress notification hub, and the prompt
//! provider boundary.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here. Implementations live
//! elsewhere (or outside the workspace entirely). This enables:
//! - Swapping LLM backends and capabilities without touching the engine
//! - Easy testing with scripted providers and probe observers
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod notify;
pub mod prompt;
pub mod provider;
pub mod side_effect;
pub mod state;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ObserverError, PromptError, ProviderError, Result, ToolError};
pub use message::{ContentPart, Message, MessageContent, MessageToolCall, Role};
pub use notify::{
    DeliveryMode, ObserverId, ProgressEvent, ProgressNotifier, ProgressObserver, ProgressUpdate,
    Stage, ToolStatus,
};
pub use prompt::{PromptProvider, TemplatePrompts};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition};
pub use side_effect::{ReminderRequest, SideEffect};
pub use state::{ConversationState, Plan, StatePatch};
pub use tool::{
    Capability, CapabilityOutput, CapabilityRegistry, ToolCall, ToolOutcome, ToolResponse,
};
