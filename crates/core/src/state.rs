//! Per-turn conversation state and the patch/merge model.
//!
//! Nodes never mutate [`ConversationState`] directly. They return a
//! [`StatePatch`] and the router applies it with [`ConversationState::apply`].
//!
//! Merge rules per field:
//!
//! | field                                                 | merge                       |
//! |-------------------------------------------------------|-----------------------------|
//! | `messages`, `side_effects`                            | append                      |
//! | `round`                                               | overwrite, never decreasing |
//! | `plan`, `sufficient`, `persona`, `finished`           | overwrite when present      |
//! | `pending_calls`, `round_results`, `aggregated_results`| replace whole list          |
//! | `final_answer`                                        | write-once                  |
//! | `scratch`                                             | key-wise; `Null` removes    |

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::message::{Message, Role};
use crate::side_effect::SideEffect;
use crate::tool::{ToolCall, ToolOutcome};

/// The planner's decision for the current round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub needs_tools: bool,
    pub reasoning: String,
}

/// The single mutable record threaded through one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub round: u32,
    pub plan: Plan,
    pub pending_calls: Vec<ToolCall>,
    pub round_results: Vec<ToolOutcome>,
    pub aggregated_results: Vec<ToolOutcome>,
    pub sufficient: bool,
    pub final_answer: Option<String>,
    pub side_effects: Vec<SideEffect>,
    pub scratch: serde_json::Map<String, serde_json::Value>,
    pub persona: Option<String>,
    pub finished: bool,
    /// Number of caller-supplied messages; everything after is this turn's output.
    pub history_len: usize,
}

impl ConversationState {
    /// Fresh state for one inbound turn.
    pub fn from_history(history: Vec<Message>) -> Self {
        let history_len = history.len();
        Self {
            messages: history,
            history_len,
            ..Self::default()
        }
    }

    /// Messages appended during this turn.
    pub fn turn_messages(&self) -> &[Message] {
        &self.messages[self.history_len.min(self.messages.len())..]
    }

    /// Most recent user message, if any.
    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// Apply a node's patch using the per-field merge rules.
    pub fn apply(&mut self, patch: StatePatch) {
        self.messages.extend(patch.messages);
        self.side_effects.extend(patch.side_effects);

        if let Some(round) = patch.round {
            if round < self.round {
                warn!(current = self.round, proposed = round, "Ignoring round decrease");
            } else {
                self.round = round;
            }
        }
        if let Some(plan) = patch.plan {
            self.plan = plan;
        }
        if let Some(calls) = patch.pending_calls {
            self.pending_calls = calls;
        }
        if let Some(results) = patch.round_results {
            self.round_results = results;
        }
        if let Some(results) = patch.aggregated_results {
            self.aggregated_results = results;
        }
        if let Some(sufficient) = patch.sufficient {
            self.sufficient = sufficient;
        }
        if let Some(persona) = patch.persona {
            self.persona = Some(persona);
        }
        if let Some(finished) = patch.finished {
            self.finished = finished;
        }
        if let Some(answer) = patch.final_answer {
            if self.final_answer.is_some() {
                warn!("final_answer already set for this turn, ignoring second write");
            } else {
                self.final_answer = Some(answer);
            }
        }
        for (key, value) in patch.scratch {
            if value.is_null() {
                self.scratch.remove(&key);
            } else {
                self.scratch.insert(key, value);
            }
        }
    }
}

/// A partial update returned by a node. `None` means "leave as is".
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub messages: Vec<Message>,
    pub side_effects: Vec<SideEffect>,
    pub round: Option<u32>,
    pub plan: Option<Plan>,
    pub pending_calls: Option<Vec<ToolCall>>,
    pub round_results: Option<Vec<ToolOutcome>>,
    pub aggregated_results: Option<Vec<ToolOutcome>>,
    pub sufficient: Option<bool>,
    pub final_answer: Option<String>,
    pub persona: Option<String>,
    pub finished: Option<bool>,
    pub scratch: serde_json::Map<String, serde_json::Value>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn plan(mut self, needs_tools: bool, reasoning: impl Into<String>) -> Self {
        self.plan = Some(Plan {
            needs_tools,
            reasoning: reasoning.into(),
        });
        self
    }

    pub fn pending_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.pending_calls = Some(calls);
        self
    }

    pub fn sufficient(mut self, sufficient: bool) -> Self {
        self.sufficient = Some(sufficient);
        self
    }

    pub fn final_answer(mut self, answer: impl Into<String>) -> Self {
        self.final_answer = Some(answer.into());
        self
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = Some(finished);
        self
    }

    pub fn scratch(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.scratch.insert(key.into(), value);
        self
    }
}
