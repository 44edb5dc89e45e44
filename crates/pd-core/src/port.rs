//! Per-port mutable context.

use core::fmt;

use crate::ams::{AmsOwner, AmsTracker};
use crate::event::{EventLatches, PolicyRequest};
use crate::message::{
    Capabilities, Contract, Message, MessageIdCounter, ReceivedIds, RequestObject, TransmitType,
};
use crate::recovery::ErrorRecord;
use crate::reset::PendingReset;
use crate::state::PortState;

/// Index of a configured port (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub usize);

impl PortId {
    /// Raw index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl From<usize> for PortId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

/// Message handed to the transport and not yet acknowledged or answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Message as transmitted (same id on every retry).
    pub message: Message,
    /// Packet class.
    pub transmit_type: TransmitType,
    /// Whether the transport confirmed delivery.
    pub sent: bool,
}

/// Mutable state of one port. Owned by that port's machine.
#[derive(Debug, Clone)]
pub struct PortContext {
    pub(crate) state: PortState,
    pub(crate) ams: AmsTracker,
    pub(crate) pending_reset: PendingReset,
    pub(crate) last_error: Option<ErrorRecord>,
    pub(crate) retry_count: u8,
    pub(crate) message_ids: MessageIdCounter,
    pub(crate) received_ids: ReceivedIds,
    pub(crate) latches: EventLatches,
    pub(crate) outbound: Option<Outbound>,
    pub(crate) contract: Option<Contract>,
    /// Capabilities offered in the exchange currently in progress.
    pub(crate) offered: Option<Capabilities>,
    /// Request made against `offered`.
    pub(crate) request: Option<RequestObject>,
    /// Packet class the next Soft_Reset targets.
    pub(crate) soft_reset_target: TransmitType,
    /// Policy request waiting for the port to become idle.
    pub(crate) deferred_request: Option<PolicyRequest>,
    /// Consecutive hard resets whose signalling was never confirmed.
    pub(crate) hard_reset_attempts: u8,
}

impl Default for PortContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PortContext {
    /// Context in its startup configuration.
    pub fn new() -> Self {
        Self {
            state: PortState::startup(),
            ams: AmsTracker::new(),
            pending_reset: PendingReset::None,
            last_error: None,
            retry_count: 0,
            message_ids: MessageIdCounter::new(),
            received_ids: ReceivedIds::default(),
            latches: EventLatches::new(),
            outbound: None,
            contract: None,
            offered: None,
            request: None,
            soft_reset_target: TransmitType::Sop,
            deferred_request: None,
            hard_reset_attempts: 0,
        }
    }

    /// Return every field to its startup default.
    pub fn reset_to_startup(&mut self) {
        *self = Self::new();
    }

    /// Current state.
    pub fn current_state(&self) -> PortState {
        self.state
    }

    /// AMS owner.
    pub fn ams_owner(&self) -> AmsOwner {
        self.ams.owner()
    }

    /// True when no atomic message sequence is in progress.
    pub fn is_ams_free(&self) -> bool {
        self.ams.is_free()
    }

    /// True while this port owns the atomic message sequence.
    pub fn is_in_local_ams(&self) -> bool {
        self.ams.owner() == AmsOwner::Local
    }

    /// Pending reset bookkeeping.
    pub fn pending_reset(&self) -> PendingReset {
        self.pending_reset
    }

    /// Last classified fault, cleared when an exchange succeeds.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error
    }

    /// Failures absorbed for the current message attempt.
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Negotiated contract, if any.
    pub fn contract(&self) -> Option<&Contract> {
        self.contract.as_ref()
    }

    /// Message awaiting acknowledgment or answer.
    pub fn outbound(&self) -> Option<&Outbound> {
        self.outbound.as_ref()
    }

    /// Consecutive hard resets whose signalling was never confirmed.
    pub fn hard_reset_attempts(&self) -> u8 {
        self.hard_reset_attempts
    }
}
