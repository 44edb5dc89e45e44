//! Port and system configuration.
//!
//! Retry bounds and timer values are policy constants; they are exposed here
//! instead of being fixed in the state machine.

use std::time::Duration;

use crate::recovery::RetryPolicy;
use crate::{Error, Result};

/// Power role a port negotiates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerRole {
    /// Offers capabilities and supplies power.
    Source,
    /// Requests a capability and consumes power.
    #[default]
    Sink,
}

/// Per-port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Role negotiated after startup.
    pub power_role: PowerRole,
    /// Consecutive retryable failures before a Soft Reset.
    pub max_retries: u8,
    /// Wait for a response to a request (tSenderResponse).
    pub sender_response_timeout_ms: u64,
    /// Sink wait for Source_Capabilities (tTypeCSinkWaitCap).
    pub sink_wait_cap_timeout_ms: u64,
    /// Sink wait for PS_RDY after Accept (tPSTransition).
    pub ps_transition_timeout_ms: u64,
    /// Wait for Accept after Soft_Reset.
    pub soft_reset_timeout_ms: u64,
    /// Wait for the transport to confirm Hard Reset signalling (tHardResetComplete).
    pub hard_reset_complete_timeout_ms: u64,
    /// Local hard reset attempts before the port is declared unusable.
    pub max_hard_reset_attempts: u8,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            power_role: PowerRole::Sink,
            max_retries: 3,
            sender_response_timeout_ms: 30,
            sink_wait_cap_timeout_ms: 620,
            ps_transition_timeout_ms: 550,
            soft_reset_timeout_ms: 30,
            hard_reset_complete_timeout_ms: 5,
            max_hard_reset_attempts: 2,
        }
    }
}

impl PortConfig {
    /// Default configuration for the given role.
    pub fn with_role(power_role: PowerRole) -> Self {
        Self {
            power_role,
            ..Self::default()
        }
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    /// Sender response timeout.
    pub fn sender_response(&self) -> Duration {
        Duration::from_millis(self.sender_response_timeout_ms)
    }

    /// Sink wait-for-capabilities timeout.
    pub fn sink_wait_cap(&self) -> Duration {
        Duration::from_millis(self.sink_wait_cap_timeout_ms)
    }

    /// Power supply transition timeout.
    pub fn ps_transition(&self) -> Duration {
        Duration::from_millis(self.ps_transition_timeout_ms)
    }

    /// Soft reset accept timeout.
    pub fn soft_reset(&self) -> Duration {
        Duration::from_millis(self.soft_reset_timeout_ms)
    }

    /// Hard reset completion timeout.
    pub fn hard_reset_complete(&self) -> Duration {
        Duration::from_millis(self.hard_reset_complete_timeout_ms)
    }

    /// Validate bounds. Called before any port is created.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries must be at least 1".into()));
        }
        if self.max_hard_reset_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_hard_reset_attempts must be at least 1".into(),
            ));
        }
        let timers = [
            ("sender_response_timeout_ms", self.sender_response_timeout_ms),
            ("sink_wait_cap_timeout_ms", self.sink_wait_cap_timeout_ms),
            ("ps_transition_timeout_ms", self.ps_transition_timeout_ms),
            ("soft_reset_timeout_ms", self.soft_reset_timeout_ms),
            ("hard_reset_complete_timeout_ms", self.hard_reset_complete_timeout_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

/// Configuration for every port, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// One entry per physical port, indexed by `PortId`.
    pub ports: Vec<PortConfig>,
}

impl SystemConfig {
    /// Create a configuration from per-port entries.
    pub fn new(ports: Vec<PortConfig>) -> Self {
        Self { ports }
    }

    /// `count` ports sharing the same configuration.
    pub fn uniform(count: usize, port: PortConfig) -> Self {
        Self {
            ports: vec![port; count],
        }
    }

    /// Number of configured ports.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Validate every port. Initialization must stop on error.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::InvalidConfig("at least one port is required".into()));
        }
        for (index, port) in self.ports.iter().enumerate() {
            port.validate().map_err(|e| match e {
                Error::InvalidConfig(msg) => Error::InvalidConfig(format!("port {}: {}", index, msg)),
                other => other,
            })?;
        }
        Ok(())
    }
}
