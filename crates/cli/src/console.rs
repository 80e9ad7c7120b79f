//! Terminal observer: progress to stderr, streamed answer to stdout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parley_core::{ObserverError, ProgressObserver, ProgressUpdate};

fn write_stdout(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

#[derive(Default)]
pub struct ConsoleObserver {
    streamed: AtomicBool,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any answer text reached stdout through streaming.
    pub fn streamed(&self) -> bool {
        self.streamed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressObserver for ConsoleObserver {
    fn name(&self) -> &str {
        "console"
    }

    async fn on_progress(&self, update: &ProgressUpdate) -> Result<(), ObserverError> {
        match update.percent {
            Some(percent) => eprintln!("  [{}] {} ({percent:.0}%)", update.stage.as_str(), update.message),
            None => eprintln!("  [{}] {}", update.stage.as_str(), update.message),
        }
        Ok(())
    }

    async fn on_completion(
        &self,
        _final_text: &str,
        sources: Option<&[String]>,
    ) -> Result<(), ObserverError> {
        for source in sources.unwrap_or_default() {
            eprintln!("  source: {source}");
        }
        Ok(())
    }

    async fn on_error(&self, error: &str) -> Result<(), ObserverError> {
        eprintln!("  [error] {error}");
        Ok(())
    }

    async fn on_streaming_chunk(&self, text: &str, _is_final: bool) -> Result<(), ObserverError> {
        if text.is_empty() {
            return Ok(());
        }
        self.streamed.store(true, Ordering::SeqCst);
        write_stdout(text).map_err(|e| ObserverError::Delivery(e.to_string()))
    }

    async fn on_streaming_complete(&self) -> Result<(), ObserverError> {
        if self.streamed() {
            println!();
        }
        Ok(())
    }
}
