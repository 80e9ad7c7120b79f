//! Progress notification channel.
//!
//! Nodes report status through a [`ProgressNotifier`]; presentation layers
//! implement [`ProgressObserver`] and register on it. The hub fans every
//! event out to all observers concurrently, each behind its own failure
//! guard, so a broken observer affects neither its peers nor the pipeline.
//!
//! Two delivery modes are chosen explicitly by the caller:
//! - [`DeliveryMode::Inline`]: `emit` awaits the fan-out.
//! - [`DeliveryMode::Background`]: `emit` enqueues and a single task on the
//!   active runtime delivers in FIFO order.

pub mod hub;
pub mod observer;

pub use hub::{DeliveryMode, ObserverId, ProgressNotifier};
pub use observer::{ProgressEvent, ProgressObserver, ProgressUpdate, Stage, ToolStatus};
