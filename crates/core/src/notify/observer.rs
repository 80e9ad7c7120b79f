//! Progress events and the observer interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ObserverError;

/// Pipeline stage a progress update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Dispatch,
    /// Per-call status inside a dispatch batch
    Tool,
    Reflection,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Dispatch => "dispatch",
            Self::Tool => "tool",
            Self::Reflection => "reflection",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one call in a dispatch batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Arguments of `on_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ProgressUpdate {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            percent: None,
            eta_secs: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn percent(mut self, percent: f32) -> Self {
        self.percent = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn eta_secs(mut self, secs: u64) -> Self {
        self.eta_secs = Some(secs);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// A per-call status event as emitted by dispatch.
    pub fn tool_status(call_id: &str, capability: &str, status: ToolStatus) -> Self {
        Self::new(Stage::Tool, format!("{capability}: {}", status.as_str()))
            .meta("call_id", serde_json::json!(call_id))
            .meta("capability", serde_json::json!(capability))
            .meta("status", serde_json::json!(status.as_str()))
    }

    /// Read back the tool status carried in metadata, if any.
    pub fn status(&self) -> Option<ToolStatus> {
        serde_json::from_value(self.metadata.get("status")?.clone()).ok()
    }
}

/// Everything the notifier can fan out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    Completion {
        final_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<Vec<String>>,
    },
    Error {
        error: String,
    },
    StreamingChunk {
        text: String,
        is_final: bool,
    },
    StreamingComplete,
}

impl ProgressEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Completion { .. } => "completion",
            Self::Error { .. } => "error",
            Self::StreamingChunk { .. } => "streaming_chunk",
            Self::StreamingComplete => "streaming_complete",
        }
    }
}

/// A consumer of progress notifications (chat adapter, console, test probe).
///
/// Every method defaults to a no-op so observers implement only what they
/// render. Returning `Err` or panicking is logged and swallowed by the
/// notifier; it never reaches the pipeline or other observers.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "observer"
    }

    async fn on_progress(&self, _update: &ProgressUpdate) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_completion(
        &self,
        _final_text: &str,
        _sources: Option<&[String]>,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_error(&self, _error: &str) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_streaming_chunk(&self, _text: &str, _is_final: bool) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_streaming_complete(&self) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Route one event to the matching observer method.
pub(crate) async fn deliver(
    observer: &dyn ProgressObserver,
    event: &ProgressEvent,
) -> Result<(), ObserverError> {
    match event {
        ProgressEvent::Progress(update) => observer.on_progress(update).await,
        ProgressEvent::Completion {
            final_text,
            sources,
        } => observer.on_completion(final_text, sources.as_deref()).await,
        ProgressEvent::Error { error } => observer.on_error(error).await,
        ProgressEvent::StreamingChunk { text, is_final } => {
            observer.on_streaming_chunk(text, *is_final).await
        }
        ProgressEvent::StreamingComplete => observer.on_streaming_complete().await,
    }
}
