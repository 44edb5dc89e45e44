//! In-process wire connecting ports back to back.
//!
//! A transmit on one end is confirmed to the sender with `MessageSent` and
//! delivered to the peer as `MessageReceived` (or `SoftResetReceived` for a
//! Soft_Reset message). Only SOP traffic crosses the wire; there is no cable
//! marker, so SOP' and SOP'' transmits fail with `NoResponse`, as does any
//! transmit from an unconnected port. Hard Reset signalling completes whether
//! or not a peer is connected, unless stalled with
//! [`LoopbackWire::stall_hard_reset`].

use std::sync::{Arc, Mutex};

use pd_core::{
    ControlMessage, Message, PortEvent, PortId, ProtocolLink, TransmitFailure, TransmitType,
};

use crate::ingress::Ingress;

#[derive(Debug, Clone, Copy, Default)]
struct Impairment {
    drops: u32,
    stall_hard_reset: bool,
}

/// Back-to-back wire between ports of one runtime.
#[derive(Debug, Clone)]
pub struct LoopbackWire {
    ingress: Ingress,
    peers: Arc<Vec<Option<PortId>>>,
    impairments: Arc<Mutex<Vec<Impairment>>>,
}

impl LoopbackWire {
    /// Wire with no connections.
    pub fn new(ingress: Ingress) -> Self {
        let port_count = ingress.port_count();
        Self {
            ingress,
            peers: Arc::new(vec![None; port_count]),
            impairments: Arc::new(Mutex::new(vec![Impairment::default(); port_count])),
        }
    }

    /// Wire connecting `a` and `b`.
    pub fn pair(ingress: Ingress, a: PortId, b: PortId) -> Self {
        let wire = Self::new(ingress);
        let mut peers = (*wire.peers).clone();
        if let Some(slot) = peers.get_mut(a.index()) {
            *slot = Some(b);
        }
        if let Some(slot) = peers.get_mut(b.index()) {
            *slot = Some(a);
        }
        Self {
            peers: Arc::new(peers),
            ..wire
        }
    }

    /// Peer of `port`, if connected.
    pub fn peer(&self, port: PortId) -> Option<PortId> {
        self.peers.get(port.index()).copied().flatten()
    }

    /// Lose the next `count` transmits from `port`; each fails with
    /// `NoResponse`.
    pub fn drop_next(&self, port: PortId, count: u32) {
        if let Some(slot) = self.lock_impairments().get_mut(port.index()) {
            slot.drops = count;
        }
    }

    /// Never confirm Hard Reset signalling from `port`.
    pub fn stall_hard_reset(&self, port: PortId) {
        if let Some(slot) = self.lock_impairments().get_mut(port.index()) {
            slot.stall_hard_reset = true;
        }
    }

    fn lock_impairments(&self) -> std::sync::MutexGuard<'_, Vec<Impairment>> {
        self.impairments.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_drop(&self, port: PortId) -> bool {
        match self.lock_impairments().get_mut(port.index()) {
            Some(slot) if slot.drops > 0 => {
                slot.drops -= 1;
                true
            }
            _ => false,
        }
    }

    fn hard_reset_stalled(&self, port: PortId) -> bool {
        self.lock_impairments()
            .get(port.index())
            .is_some_and(|slot| slot.stall_hard_reset)
    }

    fn deliver(&self, port: PortId, event: PortEvent) {
        if let Err(e) = self.ingress.notify(port, event) {
            tracing::warn!("{}: loopback delivery failed: {}", port, e);
        }
    }
}

impl ProtocolLink for LoopbackWire {
    fn request_transmit(&mut self, port: PortId, message: &Message, transmit_type: TransmitType) {
        let peer = match self.peer(port) {
            Some(peer) if transmit_type == TransmitType::Sop && !self.take_drop(port) => peer,
            _ => {
                tracing::debug!("{}: {} lost on {:?}", port, message, transmit_type);
                self.deliver(
                    port,
                    PortEvent::ProtocolError {
                        kind: TransmitFailure::NoResponse,
                        transmit_type,
                    },
                );
                return;
            }
        };

        tracing::trace!("{} -> {}: {}", port, peer, message);
        self.deliver(port, PortEvent::MessageSent);
        if message.kind.is_control(ControlMessage::SoftReset) {
            self.deliver(peer, PortEvent::SoftResetReceived);
        } else {
            self.deliver(
                peer,
                PortEvent::MessageReceived {
                    message: message.clone(),
                    transmit_type,
                },
            );
        }
    }

    fn request_hard_reset(&mut self, port: PortId) {
        if self.hard_reset_stalled(port) {
            tracing::debug!("{}: hard reset signalling stalled", port);
            return;
        }
        self.deliver(port, PortEvent::HardResetSent);
        if let Some(peer) = self.peer(port) {
            self.deliver(peer, PortEvent::HardResetReceived);
        }
    }
}
