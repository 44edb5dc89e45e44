//! Error types for port operations.

use thiserror::Error;

use crate::ams::AmsOwner;
use crate::port::PortId;

/// Result type alias for port operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Port operation errors.
///
/// These are API-level failures. Protocol faults observed on the link are
/// modelled by [`crate::recovery::Fault`] and recovered inside the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Port index outside the configured range. Indicates a wiring defect.
    #[error("Invalid port {port} (configured ports: {port_count})")]
    InvalidPort {
        /// Offending port.
        port: PortId,
        /// Number of configured ports.
        port_count: usize,
    },

    /// Configuration rejected at initialization.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Atomic message sequence already owned.
    #[error("AMS already owned by {0:?}")]
    AmsBusy(AmsOwner),

    /// Release attempted by a side that does not own the sequence.
    #[error("AMS not owned by {0:?}")]
    AmsNotOwned(AmsOwner),

    /// Port gave up after repeated hard reset failures.
    #[error("Port {0} is unusable")]
    PortUnusable(PortId),
}
