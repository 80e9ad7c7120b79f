//! Deferred-action requests produced during a turn.
//!
//! The engine never schedules or persists these. It collects them from
//! successful capability payloads and returns them to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    /// Remind the user of something later.
    Reminder(ReminderRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRequest {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,

    /// Where the reminder should be delivered (chat id, user id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl SideEffect {
    /// Extract a deferred action from a capability payload.
    ///
    /// Accepted shapes: `{"deferred_action": {"type": "reminder", ...}}` or a
    /// payload that is itself a tagged side effect.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let candidate = payload.get("deferred_action").unwrap_or(payload);
        candidate.get("type")?;
        serde_json::from_value(candidate.clone()).ok()
    }

    /// Short human-readable label used in confirmations.
    pub fn describe(&self) -> String {
        match self {
            Self::Reminder(r) => match (&r.due_at, r.delay_secs) {
                (Some(at), _) => format!("reminder \"{}\" at {}", r.message, at.to_rfc3339()),
                (None, Some(secs)) => format!("reminder \"{}\" in {}s", r.message, secs),
                (None, None) => format!("reminder \"{}\"", r.message),
            },
        }
    }
}
