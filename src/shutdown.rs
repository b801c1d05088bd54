//! Shutdown coordination for conduit workers.
//!
//! A [`ShutdownSignal`] is a cloneable termination flag. OS signals (SIGTERM,
//! SIGINT) set it through [`ShutdownSignal::listen_for_signals`]; workers
//! observe it cooperatively and decide for themselves whether to stop at once
//! or after the current batch.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     let listener = shutdown.clone();
//!     tokio::spawn(async move { listener.listen_for_signals().await });
//!
//!     loop {
//!         tokio::select! {
//!             _ = shutdown.triggered() => break,
//!             // ... poll for work
//!         }
//!     }
//! }
//! ```

use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A termination flag shared across tasks.
///
/// Once triggered it stays triggered.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Wait for SIGTERM or SIGINT, then trigger.
    ///
    /// Returns an error only if the signal handlers cannot be installed.
    pub async fn listen_for_signals(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            let mut interrupt = signal(SignalKind::interrupt())?;

            tokio::select! {
                _ = terminate.recv() => info!("Received SIGTERM"),
                _ = interrupt.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C");
        }

        self.trigger();
        Ok(())
    }

    /// Request termination (for programmatic shutdown and tests).
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns once triggered.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_starts_untriggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        let waited = tokio::time::timeout(Duration::from_millis(20), signal.triggered()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), signal.triggered()).await;
        assert!(result.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_clone_observes_trigger() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();

        signal.trigger();
        signal.trigger();

        assert!(clone.is_triggered());
        clone.triggered().await;
    }

    #[tokio::test]
    async fn test_triggered_resolves_after_the_fact() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), signal.triggered()).await;
        assert!(result.is_ok());
    }
}
