//! The fan-out hub.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::observer::{ProgressEvent, ProgressObserver, ProgressUpdate, Stage, deliver};
use crate::error::NotifyError;

const DEFAULT_OBSERVER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Handle returned by [`ProgressNotifier::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// How events reach observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// `emit` awaits delivery to every observer before returning.
    Inline,
    /// `emit` enqueues, waiting while the queue is full; one task on the
    /// active runtime delivers in order.
    Background,
}

type ObserverList = RwLock<Vec<(ObserverId, Arc<dyn ProgressObserver>)>>;

struct Shared {
    observers: ObserverList,
    timeout: Duration,
}

impl Shared {
    fn snapshot(&self) -> Vec<(ObserverId, Arc<dyn ProgressObserver>)> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver one event to every observer concurrently, each behind its own
    /// panic/timeout/error guard.
    async fn fan_out(&self, event: &ProgressEvent) {
        let observers = self.snapshot();
        if observers.is_empty() {
            return;
        }
        let timeout = self.timeout;
        let deliveries = observers.iter().map(|(id, observer)| async move {
            let guarded = AssertUnwindSafe(deliver(observer.as_ref(), event)).catch_unwind();
            match tokio::time::timeout(timeout, guarded).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(
                    observer = observer.name(),
                    observer_id = id.0,
                    event = event.event_type(),
                    error = %e,
                    "Observer failed, continuing"
                ),
                Ok(Err(_panic)) => warn!(
                    observer = observer.name(),
                    observer_id = id.0,
                    event = event.event_type(),
                    "Observer panicked, continuing"
                ),
                Err(_elapsed) => warn!(
                    observer = observer.name(),
                    observer_id = id.0,
                    event = event.event_type(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Observer timed out, continuing"
                ),
            }
        });
        join_all(deliveries).await;
    }
}

enum Delivery {
    Inline,
    Background {
        tx: Mutex<Option<mpsc::Sender<ProgressEvent>>>,
        task: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Fan-out hub from the pipeline to 0..N observers.
///
/// Owned by the caller and handed to the engine; nothing is global. Observer
/// failures are logged and never propagate.
pub struct ProgressNotifier {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    delivery: Delivery,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::inline()
    }
}

impl ProgressNotifier {
    /// A notifier whose `emit` awaits delivery.
    pub fn inline() -> Self {
        Self::inline_with_timeout(DEFAULT_OBSERVER_TIMEOUT)
    }

    pub fn inline_with_timeout(observer_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                observers: RwLock::new(Vec::new()),
                timeout: observer_timeout,
            }),
            next_id: AtomicU64::new(1),
            delivery: Delivery::Inline,
        }
    }

    /// A notifier that delivers from a task spawned on the current runtime.
    ///
    /// Fails with [`NotifyError::NoRuntime`] outside a tokio runtime. Call
    /// [`shutdown`](Self::shutdown) to drain and join the delivery task.
    pub fn spawn_background() -> Result<Self, NotifyError> {
        Self::spawn_background_with_timeout(DEFAULT_OBSERVER_TIMEOUT)
    }

    pub fn spawn_background_with_timeout(observer_timeout: Duration) -> Result<Self, NotifyError> {
        Self::spawn_background_with_capacity(observer_timeout, DEFAULT_QUEUE_CAPACITY)
    }

    /// Background notifier holding at most `capacity` undelivered events.
    pub fn spawn_background_with_capacity(
        observer_timeout: Duration,
        capacity: usize,
    ) -> Result<Self, NotifyError> {
        let handle = Handle::try_current().map_err(|_| NotifyError::NoRuntime)?;
        let shared = Arc::new(Shared {
            observers: RwLock::new(Vec::new()),
            timeout: observer_timeout,
        });
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(capacity.max(1));
        let worker = Arc::clone(&shared);
        let task = handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                worker.fan_out(&event).await;
            }
            debug!("Progress delivery task drained");
        });
        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            delivery: Delivery::Background {
                tx: Mutex::new(Some(tx)),
                task: Mutex::new(Some(task)),
            },
        })
    }

    pub fn mode(&self) -> DeliveryMode {
        match self.delivery {
            Delivery::Inline => DeliveryMode::Inline,
            Delivery::Background { .. } => DeliveryMode::Background,
        }
    }

    /// Register an observer. It receives every event emitted afterwards.
    pub fn register(&self, observer: Arc<dyn ProgressObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(observer = observer.name(), observer_id = id.0, "Registered observer");
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self
            .shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    pub fn clear(&self) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn observer_count(&self) -> usize {
        self.shared
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Emit one event. Never fails.
    pub async fn emit(&self, event: ProgressEvent) {
        match &self.delivery {
            Delivery::Inline => self.shared.fan_out(&event).await,
            Delivery::Background { tx, .. } => {
                let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
                let queued = match sender {
                    Some(sender) => sender.send(event).await.is_ok(),
                    None => false,
                };
                if !queued {
                    warn!("Progress event dropped: notifier shut down");
                }
            }
        }
    }

    pub async fn progress(&self, stage: Stage, message: impl Into<String>) {
        self.emit(ProgressEvent::Progress(ProgressUpdate::new(stage, message)))
            .await;
    }

    pub async fn update(&self, update: ProgressUpdate) {
        self.emit(ProgressEvent::Progress(update)).await;
    }

    pub async fn completion(&self, final_text: impl Into<String>, sources: Option<Vec<String>>) {
        self.emit(ProgressEvent::Completion {
            final_text: final_text.into(),
            sources,
        })
        .await;
    }

    pub async fn error(&self, error: impl Into<String>) {
        self.emit(ProgressEvent::Error {
            error: error.into(),
        })
        .await;
    }

    pub async fn streaming_chunk(&self, text: impl Into<String>, is_final: bool) {
        self.emit(ProgressEvent::StreamingChunk {
            text: text.into(),
            is_final,
        })
        .await;
    }

    pub async fn streaming_complete(&self) {
        self.emit(ProgressEvent::StreamingComplete).await;
    }

    /// Stop accepting events, drain the queue and join the delivery task.
    /// A no-op for inline notifiers.
    pub async fn shutdown(&self) -> Result<(), NotifyError> {
        let Delivery::Background { tx, task } = &self.delivery else {
            return Ok(());
        };
        drop(tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handle = task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Progress delivery task ended abnormally");
                }
                Ok(())
            }
            None => Err(NotifyError::ShutDown),
        }
    }
}
