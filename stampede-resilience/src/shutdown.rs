//! Graceful shutdown coordination
//!
//! Node runtimes subscribe to a shutdown broadcast. The first initiation
//! signals a graceful stop (drain work, terminate children with grace); a
//! repeated initiation escalates to a forced stop.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown signal types with escalating urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Graceful shutdown - allow current work to complete
    Graceful,
    /// Forced shutdown - terminate immediately
    Forced,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Forced => write!(f, "forced"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("no shutdown subscribers registered")]
    NoSubscribers,
}

/// Shutdown signal coordinator
pub struct ShutdownCoordinator {
    sender: broadcast::Sender<ShutdownSignal>,
    shutting_down: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.sender.subscribe()
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. The first call broadcasts a graceful signal;
    /// subsequent calls escalate to forced. Returns the signal sent.
    pub fn initiate(&self) -> Result<ShutdownSignal, ShutdownError> {
        let signal = if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress, escalating to forced");
            ShutdownSignal::Forced
        } else {
            info!("initiating graceful shutdown");
            ShutdownSignal::Graceful
        };
        self.sender
            .send(signal)
            .map_err(|_| ShutdownError::NoSubscribers)?;
        Ok(signal)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
