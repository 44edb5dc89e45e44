//! Fault classification and retry/escalation policy.

use crate::message::TransmitType;
use crate::reset::{PendingReset, ResetKind};

/// Transmit failure reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmitFailure {
    /// Partner did not acknowledge or answer in time.
    NoResponse,
    /// Partner sent a message that does not fit the current exchange.
    UnexpectedMessage,
    /// Message failed CRC or format checks.
    Malformed,
}

/// Protocol fault recovered inside the port machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Failure on the link.
    Transmit(TransmitFailure),
    /// AMS ownership conflict.
    SequenceViolation,
    /// A reset episode did not complete in time.
    ResetTimeout(ResetKind),
}

/// Last fault seen by a port together with the packet class it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorRecord {
    /// Classified fault.
    pub fault: Fault,
    /// SOP* class the fault was observed on.
    pub transmit_type: TransmitType,
}

/// Decision taken for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recovery {
    /// Resend the same outbound message; carries the new retry count.
    Retry(u8),
    /// Escalate to Soft Reset.
    SoftReset,
    /// Escalate to Hard Reset.
    HardReset,
}

/// Retry bounds shared by every port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of consecutive retryable failures that forces a Soft Reset.
    pub max_retries: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Create a policy with the given bound.
    pub fn new(max_retries: u8) -> Self {
        Self { max_retries }
    }

    /// Decide how to recover from `fault`.
    ///
    /// `retry_count` is the number of failures already absorbed for the
    /// current message attempt.
    pub fn classify(&self, fault: Fault, pending: PendingReset, retry_count: u8) -> Recovery {
        // No nested soft retries inside a reset episode.
        if pending.is_active() {
            return Recovery::HardReset;
        }

        match fault {
            Fault::Transmit(TransmitFailure::NoResponse)
            | Fault::Transmit(TransmitFailure::Malformed) => {
                let attempts = retry_count.saturating_add(1);
                if attempts >= self.max_retries {
                    Recovery::SoftReset
                } else {
                    Recovery::Retry(attempts)
                }
            }
            Fault::Transmit(TransmitFailure::UnexpectedMessage) | Fault::SequenceViolation => {
                Recovery::SoftReset
            }
            Fault::ResetTimeout(_) => Recovery::HardReset,
        }
    }
}
