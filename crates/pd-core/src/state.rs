//! Port state graph.
//!
//! The outer state is tagged by category. Reset handling and error recovery
//! are categories of their own, so their guards run before any
//! state-specific transition instead of being repeated in every state.

use crate::reset::{HardResetPhase, ResetEpisode, SoftResetPhase};

/// Startup and discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartupState {
    /// Entry after configuration or Hard Reset.
    Init,
    /// Choose the capability exchange entry for the power role.
    Discovery,
}

/// Capability exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityState {
    /// Source: Source_Capabilities in flight.
    SendCapabilities,
    /// Source: waiting for Request.
    AwaitRequest,
    /// Source: Accept / PS_RDY in flight.
    TransitionSupply,
    /// Source: Reject in flight.
    RejectRequest,
    /// Sink: waiting for Source_Capabilities.
    AwaitCapabilities,
    /// Sink: capabilities received; device policy selects on the next pass.
    EvaluateCapability,
    /// Sink: Request in flight or waiting for Accept.
    SelectCapability,
    /// Sink: waiting for PS_RDY.
    TransitionSink,
}

/// Steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Nothing in progress.
    Idle,
    /// Sequence started by this port.
    LocalAms,
    /// Answering a sequence started by the partner.
    RemoteAms,
}

/// State an error recovery pass returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resume {
    /// Resume capability exchange.
    CapabilityExchange(CapabilityState),
    /// Resume steady state.
    Ready(ReadyState),
}

impl From<Resume> for PortState {
    fn from(resume: Resume) -> Self {
        match resume {
            Resume::CapabilityExchange(s) => PortState::CapabilityExchange(s),
            Resume::Ready(s) => PortState::Ready(s),
        }
    }
}

/// Port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    /// Startup and discovery.
    Startup(StartupState),
    /// Capability exchange.
    CapabilityExchange(CapabilityState),
    /// Steady state.
    Ready(ReadyState),
    /// Hard or soft reset in progress.
    Reset(ResetEpisode),
    /// Retry scheduled; resumes the inner state after resending.
    ErrorRecovery(Resume),
    /// Hard reset could not complete.
    Unusable,
}

/// Coarse category of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateCategory {
    /// Startup and discovery.
    Startup,
    /// Capability exchange.
    CapabilityExchange,
    /// Steady state.
    Ready,
    /// Reset handling.
    Reset,
    /// Error recovery.
    ErrorRecovery,
    /// Port given up.
    Unusable,
}

impl PortState {
    /// Entry state.
    pub fn startup() -> Self {
        PortState::Startup(StartupState::Init)
    }

    /// Category of this state.
    pub fn category(self) -> StateCategory {
        match self {
            PortState::Startup(_) => StateCategory::Startup,
            PortState::CapabilityExchange(_) => StateCategory::CapabilityExchange,
            PortState::Ready(_) => StateCategory::Ready,
            PortState::Reset(_) => StateCategory::Reset,
            PortState::ErrorRecovery(_) => StateCategory::ErrorRecovery,
            PortState::Unusable => StateCategory::Unusable,
        }
    }

    /// True for states whose run step acts without waiting for an event.
    pub fn has_run_step(self) -> bool {
        matches!(
            self,
            PortState::Startup(_)
                | PortState::CapabilityExchange(CapabilityState::EvaluateCapability)
                | PortState::ErrorRecovery(_)
                | PortState::Reset(ResetEpisode::Hard(HardResetPhase::Requested))
                | PortState::Reset(ResetEpisode::Soft(SoftResetPhase::Requested))
        )
    }

    /// Where a retry in this state resumes, if retrying makes sense here.
    pub fn resume_point(self) -> Option<Resume> {
        match self {
            PortState::CapabilityExchange(s) => Some(Resume::CapabilityExchange(s)),
            PortState::Ready(s) => Some(Resume::Ready(s)),
            PortState::ErrorRecovery(resume) => Some(resume),
            _ => None,
        }
    }
}
