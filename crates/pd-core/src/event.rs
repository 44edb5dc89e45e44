//! Inbound events and one-shot latches.
//!
//! Ingestion only records events here; the port machine consumes them during
//! its next evaluation pass.

use crate::message::{Message, TransmitType};
use crate::recovery::TransmitFailure;

/// Request issued by the device-policy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyRequest {
    /// Sink: ask the source for its capabilities.
    GetSourceCapabilities,
    /// Source: resend capabilities. Sink: request again from the last offer.
    Renegotiate,
    /// Send a Ping.
    Ping,
    /// Resynchronize message sequencing.
    SoftReset,
    /// Reset the link.
    HardReset,
}

/// Event delivered to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// The last outbound message was acknowledged by the partner.
    MessageSent,
    /// A message arrived from the partner.
    MessageReceived {
        /// Received message.
        message: Message,
        /// Packet class it arrived on.
        transmit_type: TransmitType,
    },
    /// Hard Reset signalling finished.
    HardResetSent,
    /// Partner signalled Hard Reset.
    HardResetReceived,
    /// Partner sent Soft_Reset.
    SoftResetReceived,
    /// Transport reported a failure.
    ProtocolError {
        /// Failure kind.
        kind: TransmitFailure,
        /// Packet class it applies to.
        transmit_type: TransmitType,
    },
    /// Device policy request.
    Request(PolicyRequest),
}

/// Evaluation priority of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventCategory {
    /// Hard and soft reset signalling.
    Reset,
    /// Transport failures.
    Error,
    /// Steady-state traffic and policy requests.
    Message,
}

impl PortEvent {
    /// Priority class used when several latches are set.
    pub fn category(&self) -> EventCategory {
        match self {
            PortEvent::HardResetReceived
            | PortEvent::HardResetSent
            | PortEvent::SoftResetReceived => EventCategory::Reset,
            PortEvent::ProtocolError { .. } => EventCategory::Error,
            PortEvent::MessageSent
            | PortEvent::MessageReceived { .. }
            | PortEvent::Request(_) => EventCategory::Message,
        }
    }
}

/// One-shot latches for a port, one slot per event type.
#[derive(Debug, Clone, Default)]
pub struct EventLatches {
    hard_reset_received: bool,
    hard_reset_sent: bool,
    soft_reset_received: bool,
    protocol_error: Option<(TransmitFailure, TransmitType)>,
    message_sent: bool,
    message_received: Option<(Message, TransmitType)>,
    request: Option<PolicyRequest>,
}

impl EventLatches {
    /// Create cleared latches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `event`.
    ///
    /// Returns `false` and leaves the latch untouched when its slot is
    /// already set; the earlier event is kept.
    pub fn set(&mut self, event: PortEvent) -> bool {
        fn flag(slot: &mut bool) -> bool {
            !std::mem::replace(slot, true)
        }
        fn value<T>(slot: &mut Option<T>, value: T) -> bool {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        }

        match event {
            PortEvent::HardResetReceived => flag(&mut self.hard_reset_received),
            PortEvent::HardResetSent => flag(&mut self.hard_reset_sent),
            PortEvent::SoftResetReceived => flag(&mut self.soft_reset_received),
            PortEvent::ProtocolError {
                kind,
                transmit_type,
            } => value(&mut self.protocol_error, (kind, transmit_type)),
            PortEvent::MessageSent => flag(&mut self.message_sent),
            PortEvent::MessageReceived {
                message,
                transmit_type,
            } => value(&mut self.message_received, (message, transmit_type)),
            PortEvent::Request(request) => value(&mut self.request, request),
        }
    }

    /// True when the slot `event` would use is occupied.
    pub fn is_set(&self, event: &PortEvent) -> bool {
        match event {
            PortEvent::HardResetReceived => self.hard_reset_received,
            PortEvent::HardResetSent => self.hard_reset_sent,
            PortEvent::SoftResetReceived => self.soft_reset_received,
            PortEvent::ProtocolError { .. } => self.protocol_error.is_some(),
            PortEvent::MessageSent => self.message_sent,
            PortEvent::MessageReceived { .. } => self.message_received.is_some(),
            PortEvent::Request(_) => self.request.is_some(),
        }
    }

    /// True when no latch is set.
    pub fn is_empty(&self) -> bool {
        !self.hard_reset_received
            && !self.hard_reset_sent
            && !self.soft_reset_received
            && self.protocol_error.is_none()
            && !self.message_sent
            && self.message_received.is_none()
            && self.request.is_none()
    }

    /// Consume the highest-priority latched event.
    ///
    /// Order: reset, then error, then steady-state events.
    pub fn take_next(&mut self) -> Option<PortEvent> {
        if std::mem::take(&mut self.hard_reset_received) {
            return Some(PortEvent::HardResetReceived);
        }
        if std::mem::take(&mut self.hard_reset_sent) {
            return Some(PortEvent::HardResetSent);
        }
        if std::mem::take(&mut self.soft_reset_received) {
            return Some(PortEvent::SoftResetReceived);
        }
        if let Some((kind, transmit_type)) = self.protocol_error.take() {
            return Some(PortEvent::ProtocolError {
                kind,
                transmit_type,
            });
        }
        if std::mem::take(&mut self.message_sent) {
            return Some(PortEvent::MessageSent);
        }
        if let Some((message, transmit_type)) = self.message_received.take() {
            return Some(PortEvent::MessageReceived {
                message,
                transmit_type,
            });
        }
        self.request.take().map(PortEvent::Request)
    }

    /// Drop latched transport events of a lower priority than `category`.
    ///
    /// Pending policy requests are kept. A completed Hard Reset still clears
    /// them with the rest of the port context.
    pub fn discard_below(&mut self, category: EventCategory) {
        if category < EventCategory::Error {
            self.protocol_error = None;
        }
        if category < EventCategory::Message {
            self.message_sent = false;
            self.message_received = None;
        }
    }

    /// Clear every latch.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
