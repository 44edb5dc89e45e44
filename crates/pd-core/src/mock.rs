//! Mock link and policy implementations for testing.
//!
//! Both record every call so tests can assert on what the machine asked of
//! its collaborators. Clones share the same record.

use std::sync::{Arc, Mutex};

use crate::message::{
    Capabilities, Contract, Message, PowerDataObject, RequestObject, TransmitType,
    MAX_OBJECT_POSITION,
};
use crate::port::PortId;
use crate::traits::{DevicePolicy, ProtocolLink};

/// Call observed by [`MockLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRecord {
    /// `request_transmit`.
    Transmit {
        /// Port.
        port: PortId,
        /// Message.
        message: Message,
        /// Packet class.
        transmit_type: TransmitType,
    },
    /// `request_hard_reset`.
    HardReset {
        /// Port.
        port: PortId,
    },
}

/// Recording transport.
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    records: Arc<Mutex<Vec<LinkRecord>>>,
}

impl MockLink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded calls.
    pub fn take(&self) -> Vec<LinkRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Messages transmitted so far, without draining.
    pub fn transmitted(&self) -> Vec<Message> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                LinkRecord::Transmit { message, .. } => Some(message.clone()),
                LinkRecord::HardReset { .. } => None,
            })
            .collect()
    }

    /// Most recent transmitted message.
    pub fn last_transmitted(&self) -> Option<Message> {
        self.transmitted().pop()
    }

    /// Number of hard resets requested so far.
    pub fn hard_resets(&self) -> usize {
        self.lock()
            .iter()
            .filter(|r| matches!(r, LinkRecord::HardReset { .. }))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LinkRecord>> {
        // A panicking test thread must not hide the record from others.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProtocolLink for MockLink {
    fn request_transmit(&mut self, port: PortId, message: &Message, transmit_type: TransmitType) {
        self.lock().push(LinkRecord::Transmit {
            port,
            message: message.clone(),
            transmit_type,
        });
    }

    fn request_hard_reset(&mut self, port: PortId) {
        self.lock().push(LinkRecord::HardReset { port });
    }
}

/// Coarse signal observed by [`MockPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySignal {
    /// `capabilities_ready`.
    CapabilitiesReady(PortId, Contract),
    /// `port_reset`.
    PortReset(PortId),
    /// `port_unusable`.
    PortUnusable(PortId),
}

/// Device policy with fixed capabilities and a highest-voltage selection.
#[derive(Debug, Clone)]
pub struct MockPolicy {
    capabilities: Capabilities,
    max_voltage_mv: u32,
    accept_requests: bool,
    signals: Arc<Mutex<Vec<PolicySignal>>>,
}

impl Default for MockPolicy {
    fn default() -> Self {
        Self::new(Capabilities::new(vec![
            PowerDataObject::fixed(5000, 3000),
            PowerDataObject::fixed(9000, 3000),
            PowerDataObject::fixed(15_000, 3000),
        ]))
    }
}

impl MockPolicy {
    /// Policy offering `capabilities` when acting as source.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            max_voltage_mv: u32::MAX,
            accept_requests: true,
            signals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sink: never request more than `max_voltage_mv`.
    pub fn with_max_voltage(mut self, max_voltage_mv: u32) -> Self {
        self.max_voltage_mv = max_voltage_mv;
        self
    }

    /// Source: reject every request.
    pub fn rejecting(mut self) -> Self {
        self.accept_requests = false;
        self
    }

    /// Drain the recorded signals.
    pub fn take_signals(&self) -> Vec<PolicySignal> {
        std::mem::take(&mut *self.lock())
    }

    /// Recorded signals, without draining.
    pub fn signals(&self) -> Vec<PolicySignal> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PolicySignal>> {
        self.signals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DevicePolicy for MockPolicy {
    fn source_capabilities(&mut self, _port: PortId) -> Capabilities {
        self.capabilities.clone()
    }

    fn select_capability(&mut self, _port: PortId, offered: &Capabilities) -> RequestObject {
        let choice = offered
            .0
            .iter()
            .enumerate()
            .filter_map(|(index, pdo)| {
                let position = u8::try_from(index + 1).ok()?;
                (position <= MAX_OBJECT_POSITION).then_some((position, pdo))
            })
            .filter(|(_, pdo)| pdo.voltage_mv() <= self.max_voltage_mv)
            .max_by_key(|(_, pdo)| pdo.voltage_mv());
        match choice {
            Some((position, pdo)) => {
                RequestObject::fixed(position, pdo.max_current_ma(), pdo.max_current_ma())
            }
            // vSafe5V is always the first PDO
            None => RequestObject::fixed(1, 0, 0),
        }
    }

    fn evaluate_request(
        &mut self,
        _port: PortId,
        request: RequestObject,
        offered: &Capabilities,
    ) -> bool {
        self.accept_requests
            && offered
                .at_position(request.object_position())
                .is_some_and(|pdo| request.operating_current_ma() <= pdo.max_current_ma())
    }

    fn capabilities_ready(&mut self, port: PortId, contract: &Contract) {
        self.lock()
            .push(PolicySignal::CapabilitiesReady(port, contract.clone()));
    }

    fn port_reset(&mut self, port: PortId) {
        self.lock().push(PolicySignal::PortReset(port));
    }

    fn port_unusable(&mut self, port: PortId) {
        self.lock().push(PolicySignal::PortUnusable(port));
    }
}
