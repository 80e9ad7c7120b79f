//! Shared test helpers: scripted providers, probe observers and capabilities.
//!
//! Compiled for this crate's unit tests and, behind the `test-helpers`
//! feature, for downstream integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::error::{ObserverError, ProviderError, ToolError};
use parley_core::message::{Message, MessageToolCall};
use parley_core::provider::{ChunkReceiver, ProviderResponse, StreamChunk, Usage};
use parley_core::{
    Capability, CapabilityOutput, CapabilityRegistry, ProgressEvent, ProgressNotifier,
    ProgressObserver, ProgressUpdate, PromptProvider, Provider, ProviderRequest, Stage,
    TemplatePrompts, ToolCall, ToolStatus,
};

use crate::nodes::NodeContext;
use crate::settings::EngineSettings;

/// One scripted provider reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Plain assistant text.
    Text(String),
    /// Assistant message proposing tool calls.
    Calls(Vec<MessageToolCall>),
    /// The request fails.
    Fail(ProviderError),
    /// Streamed as separate chunks; concatenated for `complete`.
    Chunks(Vec<String>),
    /// Streams the chunks, then an interruption error.
    BrokenStream(Vec<String>),
}

impl Scripted {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Chunks(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub fn broken_stream(chunks: &[&str]) -> Self {
        Self::BrokenStream(chunks.iter().map(|c| c.to_string()).collect())
    }
}

/// A provider that replays a script, one entry per `complete` or `stream` call.
///
/// An exhausted script answers with `ProviderError::NotConfigured`.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: ProviderRequest) -> Result<Scripted, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next(request)? {
            Scripted::Text(text) => Ok(text_response(&text)),
            Scripted::Chunks(chunks) => Ok(text_response(&chunks.concat())),
            Scripted::Calls(calls) => Ok(tool_call_response(calls)),
            Scripted::Fail(e) => Err(e),
            Scripted::BrokenStream(_) => Err(ProviderError::StreamInterrupted("scripted".into())),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let (chunks, broken) = match self.next(request)? {
            Scripted::Text(text) => (vec![text], false),
            Scripted::Chunks(chunks) => (chunks, false),
            Scripted::BrokenStream(chunks) => (chunks, true),
            Scripted::Calls(_) => (Vec::new(), false),
            Scripted::Fail(e) => return Err(e),
        };

        let (tx, rx) = tokio::sync::mpsc::channel(chunks.len() + 2);
        for chunk in chunks {
            let _ = tx.try_send(Ok(StreamChunk {
                content: Some(chunk),
                ..StreamChunk::default()
            }));
        }
        let last = if broken {
            Err(ProviderError::StreamInterrupted("connection reset".into()))
        } else {
            Ok(StreamChunk {
                done: true,
                ..StreamChunk::default()
            })
        };
        let _ = tx.try_send(last);
        Ok(rx)
    }
}

/// Create a simple text response (no tool calls).
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Create a response proposing tool calls.
pub fn tool_call_response(tool_calls: Vec<MessageToolCall>) -> ProviderResponse {
    let mut response = text_response("");
    response.message.tool_calls = tool_calls;
    response
}

/// A model-proposed call with id `call_<name>`.
pub fn tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

/// Records every event it receives.
#[derive(Default)]
pub struct ProbeObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProbeObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: ProgressEvent) -> Result<(), ObserverError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<ProgressUpdate> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn progress_for(&self, stage: Stage) -> Vec<ProgressUpdate> {
        self.progress()
            .into_iter()
            .filter(|u| u.stage == stage)
            .collect()
    }

    pub fn running_statuses(&self) -> Vec<ProgressUpdate> {
        self.progress_for(Stage::Tool)
            .into_iter()
            .filter(|u| u.status() == Some(ToolStatus::Running))
            .collect()
    }

    pub fn terminal_statuses(&self) -> Vec<ProgressUpdate> {
        self.progress_for(Stage::Tool)
            .into_iter()
            .filter(|u| u.status().is_some_and(|s| s.is_terminal()))
            .collect()
    }

    pub fn chunks(&self) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StreamingChunk { text, is_final } => Some((text, is_final)),
                _ => None,
            })
            .collect()
    }

    /// All streamed chunks concatenated in order.
    pub fn streamed_text(&self) -> String {
        self.chunks().into_iter().map(|(text, _)| text).collect()
    }

    pub fn stream_completions(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::StreamingComplete))
            .count()
    }

    /// The last completion received.
    pub fn completion(&self) -> Option<(String, Option<Vec<String>>)> {
        self.events().into_iter().rev().find_map(|e| match e {
            ProgressEvent::Completion {
                final_text,
                sources,
            } => Some((final_text, sources)),
            _ => None,
        })
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Error { error } => Some(error),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ProgressObserver for ProbeObserver {
    fn name(&self) -> &str {
        "probe"
    }

    async fn on_progress(&self, update: &ProgressUpdate) -> Result<(), ObserverError> {
        self.record(ProgressEvent::Progress(update.clone()))
    }

    async fn on_completion(
        &self,
        final_text: &str,
        sources: Option<&[String]>,
    ) -> Result<(), ObserverError> {
        self.record(ProgressEvent::Completion {
            final_text: final_text.to_string(),
            sources: sources.map(<[String]>::to_vec),
        })
    }

    async fn on_error(&self, error: &str) -> Result<(), ObserverError> {
        self.record(ProgressEvent::Error {
            error: error.to_string(),
        })
    }

    async fn on_streaming_chunk(&self, text: &str, is_final: bool) -> Result<(), ObserverError> {
        self.record(ProgressEvent::StreamingChunk {
            text: text.to_string(),
            is_final,
        })
    }

    async fn on_streaming_complete(&self) -> Result<(), ObserverError> {
        self.record(ProgressEvent::StreamingComplete)
    }
}

/// Fails every delivery.
pub struct FailingObserver;

#[async_trait]
impl ProgressObserver for FailingObserver {
    fn name(&self) -> &str {
        "failing"
    }

    async fn on_progress(&self, _update: &ProgressUpdate) -> Result<(), ObserverError> {
        Err(ObserverError::Delivery("socket closed".into()))
    }

    async fn on_streaming_chunk(&self, _text: &str, _is_final: bool) -> Result<(), ObserverError> {
        Err(ObserverError::Closed)
    }

    async fn on_completion(
        &self,
        _final_text: &str,
        _sources: Option<&[String]>,
    ) -> Result<(), ObserverError> {
        Err(ObserverError::Closed)
    }
}

/// Panics on every delivery.
pub struct PanickingObserver;

#[async_trait]
impl ProgressObserver for PanickingObserver {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn on_progress(&self, _update: &ProgressUpdate) -> Result<(), ObserverError> {
        panic!("observer bug")
    }

    async fn on_streaming_chunk(&self, _text: &str, _is_final: bool) -> Result<(), ObserverError> {
        panic!("observer bug")
    }
}

/// Returns a fixed output and counts invocations.
pub struct StaticCapability {
    name: String,
    output: CapabilityOutput,
    invocations: AtomicUsize,
    last_arguments: Mutex<Option<serde_json::Value>>,
}

impl StaticCapability {
    pub fn new(name: &str, output: CapabilityOutput) -> Self {
        Self {
            name: name.to_string(),
            output,
            invocations: AtomicUsize::new(0),
            last_arguments: Mutex::new(None),
        }
    }

    pub fn ok(name: &str, message: &str) -> Arc<dyn Capability> {
        Arc::new(Self::new(name, CapabilityOutput::ok(message)))
    }

    pub fn with_output(name: &str, output: CapabilityOutput) -> Arc<dyn Capability> {
        Arc::new(Self::new(name, output))
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn last_arguments(&self) -> Option<serde_json::Value> {
        self.last_arguments.lock().unwrap().clone()
    }
}

#[async_trait]
impl Capability for StaticCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed result"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn invoke(&self, call: &ToolCall) -> Result<CapabilityOutput, ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        *self.last_arguments.lock().unwrap() = Some(call.arguments.clone());
        Ok(self.output.clone())
    }
}

/// Always returns `ToolError::ExecutionFailed`.
pub struct FailingCapability {
    name: String,
}

impl FailingCapability {
    pub fn named(name: &str) -> Arc<dyn Capability> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Capability for FailingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn invoke(&self, _call: &ToolCall) -> Result<CapabilityOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: self.name.clone(),
            reason: "upstream returned 503".into(),
        })
    }
}

/// Panics when invoked.
pub struct PanickingCapability {
    name: String,
}

impl PanickingCapability {
    pub fn named(name: &str) -> Arc<dyn Capability> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Capability for PanickingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Panics"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn invoke(&self, _call: &ToolCall) -> Result<CapabilityOutput, ToolError> {
        panic!("capability bug")
    }
}

/// Sleeps before answering.
pub struct SlowCapability {
    name: String,
    delay: Duration,
}

impl SlowCapability {
    pub fn named(name: &str, delay: Duration) -> Arc<dyn Capability> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
        })
    }
}

#[async_trait]
impl Capability for SlowCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Answers slowly"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn invoke(&self, _call: &ToolCall) -> Result<CapabilityOutput, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(CapabilityOutput::ok("eventually"))
    }
}

/// Registry with every capability exposed.
pub fn registry(capabilities: Vec<Arc<dyn Capability>>) -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(capability);
    }
    Arc::new(registry)
}

/// Node context on an inline notifier with a probe already registered.
pub fn node_context(
    provider: Arc<dyn Provider>,
    capabilities: Arc<CapabilityRegistry>,
    settings: EngineSettings,
) -> (Arc<NodeContext>, Arc<ProbeObserver>) {
    node_context_with_prompts(
        provider,
        capabilities,
        settings,
        Arc::new(TemplatePrompts::default()),
    )
}

pub fn node_context_with_prompts(
    provider: Arc<dyn Provider>,
    capabilities: Arc<CapabilityRegistry>,
    settings: EngineSettings,
    prompts: Arc<dyn PromptProvider>,
) -> (Arc<NodeContext>, Arc<ProbeObserver>) {
    let notifier = Arc::new(ProgressNotifier::inline());
    let probe = ProbeObserver::new();
    notifier.register(probe.clone());
    let ctx = NodeContext {
        provider,
        capabilities,
        prompts,
        notifier,
        settings,
    };
    (Arc::new(ctx), probe)
}
