//! Runtime errors.

use pd_core::PortId;
use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the port engine.
    #[error("Protocol error: {0}")]
    Core(#[from] pd_core::Error),

    /// Port task has stopped and no longer accepts events.
    #[error("Port {0} task stopped")]
    ChannelClosed(PortId),

    /// Port queue is full; the event was not delivered.
    #[error("Port {0} event queue full")]
    QueueFull(PortId),

    /// Port task panicked or was cancelled.
    #[error("Port task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
