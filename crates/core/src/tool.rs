//! Capability trait and registry: the abstraction over invokable tools.
//!
//! A capability is a named external function with structured input and
//! output. Concrete capabilities (search, reminders, video summaries) live
//! outside this workspace; the engine only sees this contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ToolError;
use crate::message::MessageToolCall;
use crate::provider::ToolDefinition;

/// A request to execute a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id (matches the LLM's tool_call.id when the model proposed it)
    pub id: String,

    /// Name of the capability to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Create a call with a freshly minted correlation id.
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    /// Build from a model-proposed call. Unparseable arguments are kept
    /// verbatim under `"raw"` so the capability can report them.
    pub fn from_message_call(call: &MessageToolCall) -> Self {
        let arguments = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| serde_json::json!({ "raw": call.arguments }))
        };
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        }
    }

    /// Wire form for replay in an assistant message.
    pub fn to_message_call(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.to_string(),
        }
    }
}

/// The structured half of the invocation contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default = "default_success")]
    pub success: bool,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn default_success() -> bool {
    true
}

/// What a capability hands back: structured, or a raw string.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutput {
    Structured(ToolResponse),
    Raw(String),
}

impl CapabilityOutput {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Structured(ToolResponse {
            success: true,
            message: message.into(),
            payload: None,
        })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Structured(ToolResponse {
            success: false,
            message: message.into(),
            payload: None,
        })
    }

    pub fn with_payload(message: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Structured(ToolResponse {
            success: true,
            message: message.into(),
            payload: Some(payload),
        })
    }

    /// Normalize to `{success, message, payload?}`.
    ///
    /// Raw strings are parsed as a JSON `ToolResponse` first; anything else
    /// is wrapped as a successful message.
    pub fn normalize(self) -> ToolResponse {
        match self {
            Self::Structured(response) => response,
            Self::Raw(raw) => match serde_json::from_str::<ToolResponse>(raw.trim()) {
                Ok(parsed) => parsed,
                Err(_) => ToolResponse {
                    success: true,
                    message: raw,
                    payload: None,
                },
            },
        }
    }
}

/// A normalized, correlated result of one call in a dispatch batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub capability: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ToolOutcome {
    pub fn from_response(call: &ToolCall, response: ToolResponse) -> Self {
        Self {
            call_id: call.id.clone(),
            capability: call.name.clone(),
            success: response.success,
            message: response.message,
            payload: response.payload,
        }
    }

    pub fn from_error(call: &ToolCall, error: &ToolError) -> Self {
        Self {
            call_id: call.id.clone(),
            capability: call.name.clone(),
            success: false,
            message: error.to_string(),
            payload: None,
        }
    }

    /// Text placed in the correlated tool-response message.
    pub fn render(&self) -> String {
        if self.success {
            self.message.clone()
        } else {
            format!("Error: {}", self.message)
        }
    }
}

/// The core Capability trait.
#[async_trait]
pub trait Capability: Send + Sync {
    /// The unique name of this capability (e.g., "web_search").
    fn name(&self) -> &str;

    /// A description of what this capability does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this capability's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Invoke with the call's arguments. The call id is the correlation id.
    async fn invoke(&self, call: &ToolCall) -> Result<CapabilityOutput, ToolError>;

    /// Convert into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

struct RegistryEntry {
    capability: Arc<dyn Capability>,
    exposed: bool,
}

/// Name → capability lookup table.
///
/// Exposed entries are offered to the planning model; hidden entries can
/// still be invoked (e.g. by heuristics) but are never advertised.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exposed capability. Replaces any existing entry with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.insert(capability, true);
    }

    /// Register a capability the planning model never sees.
    pub fn register_hidden(&mut self, capability: Arc<dyn Capability>) {
        self.insert(capability, false);
    }

    fn insert(&mut self, capability: Arc<dyn Capability>, exposed: bool) {
        let name = capability.name().to_string();
        self.entries.insert(
            name,
            RegistryEntry {
                capability,
                exposed,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).map(|e| Arc::clone(&e.capability))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Definitions of exposed capabilities accepted by `filter`, sorted by name.
    pub fn definitions(&self, filter: impl Fn(&str) -> bool) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .entries
            .iter()
            .filter(|(name, entry)| entry.exposed && filter(name))
            .map(|(_, entry)| entry.capability.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Look up and invoke, normalizing the output.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        let capability = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let output = capability.invoke(call).await?;
        Ok(ToolOutcome::from_response(call, output.normalize()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
