use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative stop flag shared by the pipeline, its workers and the CLI.
///
/// Raising it never aborts a request already on the wire; it only prevents
/// new batches and new retry attempts from starting.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only errors if it was dropped.
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}
