//! Arena of port machines addressed by bounds-checked `PortId`.
//!
//! The registry is the synchronous driver: inbound callbacks latch events,
//! and the owner calls [`PortRegistry::evaluate`] (or
//! [`PortRegistry::settle`]) to run passes. No transition logic runs during
//! ingestion.

use std::time::Instant;

use crate::config::SystemConfig;
use crate::event::{PolicyRequest, PortEvent};
use crate::machine::{PortMachine, PortSnapshot};
use crate::message::{Message, TransmitType};
use crate::port::PortId;
use crate::recovery::TransmitFailure;
use crate::state::PortState;
use crate::traits::{DevicePolicy, ProtocolLink};
use crate::{Error, Result};

/// Passes [`PortRegistry::settle`] runs before giving up on a port.
const MAX_SETTLE_PASSES: usize = 64;

/// Every configured port, created at initialization and never destroyed.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    machines: Vec<PortMachine>,
}

impl PortRegistry {
    /// Validate `config` and create one machine per port.
    pub fn new(config: SystemConfig) -> Result<Self> {
        config.validate()?;
        let machines = config
            .ports
            .into_iter()
            .enumerate()
            .map(|(index, port)| PortMachine::new(PortId(index), port))
            .collect::<Vec<_>>();
        tracing::debug!("Port registry initialized with {} ports", machines.len());
        Ok(Self { machines })
    }

    /// Number of configured ports.
    pub fn port_count(&self) -> usize {
        self.machines.len()
    }

    /// Machine for `port`.
    pub fn machine(&self, port: PortId) -> Result<&PortMachine> {
        let port_count = self.machines.len();
        self.machines
            .get(port.index())
            .ok_or(Error::InvalidPort { port, port_count })
    }

    fn machine_mut(&mut self, port: PortId) -> Result<&mut PortMachine> {
        let port_count = self.machines.len();
        self.machines
            .get_mut(port.index())
            .ok_or(Error::InvalidPort { port, port_count })
    }

    /// Latch `event` on `port`.
    ///
    /// Returns `Ok(false)` when the latch was already set.
    pub fn notify(&mut self, port: PortId, event: PortEvent) -> Result<bool> {
        Ok(self.machine_mut(port)?.latch(event))
    }

    /// The last outbound message was acknowledged.
    pub fn message_sent(&mut self, port: PortId) -> Result<bool> {
        self.notify(port, PortEvent::MessageSent)
    }

    /// A message arrived from the partner.
    pub fn message_received(
        &mut self,
        port: PortId,
        message: Message,
        transmit_type: TransmitType,
    ) -> Result<bool> {
        self.notify(
            port,
            PortEvent::MessageReceived {
                message,
                transmit_type,
            },
        )
    }

    /// Hard Reset signalling finished.
    pub fn hard_reset_sent(&mut self, port: PortId) -> Result<bool> {
        self.notify(port, PortEvent::HardResetSent)
    }

    /// Partner signalled Hard Reset.
    pub fn hard_reset_received(&mut self, port: PortId) -> Result<bool> {
        self.notify(port, PortEvent::HardResetReceived)
    }

    /// Partner sent Soft_Reset.
    pub fn soft_reset_received(&mut self, port: PortId) -> Result<bool> {
        self.notify(port, PortEvent::SoftResetReceived)
    }

    /// Transport reported a failure.
    pub fn protocol_error(
        &mut self,
        port: PortId,
        kind: TransmitFailure,
        transmit_type: TransmitType,
    ) -> Result<bool> {
        self.notify(
            port,
            PortEvent::ProtocolError {
                kind,
                transmit_type,
            },
        )
    }

    /// Device-policy request.
    ///
    /// An unusable port only accepts `HardReset`.
    pub fn request(&mut self, port: PortId, request: PolicyRequest) -> Result<bool> {
        let machine = self.machine_mut(port)?;
        if machine.current_state() == PortState::Unusable && request != PolicyRequest::HardReset {
            return Err(Error::PortUnusable(port));
        }
        Ok(machine.request(request))
    }

    /// Run one evaluation pass on `port`.
    pub fn evaluate(
        &mut self,
        port: PortId,
        now: Instant,
        link: &mut dyn ProtocolLink,
        policy: &mut dyn DevicePolicy,
    ) -> Result<bool> {
        Ok(self.machine_mut(port)?.evaluate(now, link, policy))
    }

    /// Evaluate `port` until it has no pending work at `now`.
    ///
    /// Returns the number of passes run.
    pub fn settle(
        &mut self,
        port: PortId,
        now: Instant,
        link: &mut dyn ProtocolLink,
        policy: &mut dyn DevicePolicy,
    ) -> Result<usize> {
        let machine = self.machine_mut(port)?;
        let mut passes = 0;
        while passes < MAX_SETTLE_PASSES && machine.has_pending_work(now) {
            machine.evaluate(now, link, policy);
            passes += 1;
        }
        if passes == MAX_SETTLE_PASSES {
            tracing::warn!("{}: still busy after {} passes", port, passes);
        }
        Ok(passes)
    }

    /// True while `port` owns the atomic message sequence.
    pub fn is_in_local_ams(&self, port: PortId) -> Result<bool> {
        Ok(self.machine(port)?.is_in_local_ams())
    }

    /// Snapshot of `port`.
    pub fn snapshot(&self, port: PortId) -> Result<PortSnapshot> {
        Ok(self.machine(port)?.snapshot())
    }

    /// Earliest armed deadline across all ports.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.machines.iter().filter_map(PortMachine::deadline).min()
    }

    /// Iterate over every machine.
    pub fn iter(&self) -> impl Iterator<Item = &PortMachine> {
        self.machines.iter()
    }
}
