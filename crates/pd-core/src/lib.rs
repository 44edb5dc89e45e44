//! USB Power Delivery protocol engine.
//!
//! One [`PortMachine`] per physical port tracks:
//! - startup, capability exchange and the ready state for either power role
//! - atomic message sequence (AMS) ownership
//! - hard and soft reset episodes, with hard reset taking precedence
//! - bounded retries of a failed message before escalating to a reset
//!
//! The machine never touches hardware. Outbound requests go through
//! [`ProtocolLink`]; decisions about what to negotiate are delegated to
//! [`DevicePolicy`]. Async drivers live in `pd-runtime`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ams;
pub mod config;
pub mod error;
pub mod event;
pub mod machine;
pub mod message;
pub mod mock;
pub mod port;
pub mod recovery;
pub mod registry;
pub mod reset;
pub mod state;
pub mod traits;

pub use ams::{AmsOwner, AmsTracker};
pub use config::{PortConfig, PowerRole, SystemConfig};
pub use error::{Error, Result};
pub use event::{EventCategory, PolicyRequest, PortEvent};
pub use machine::{PortMachine, PortSnapshot};
pub use message::{
    Capabilities, Contract, ControlMessage, DataMessage, Message, MessageId, MessageKind,
    PowerDataObject, RequestObject, TransmitType, MAX_OBJECT_POSITION,
};
pub use port::{PortContext, PortId};
pub use recovery::{ErrorRecord, Fault, Recovery, RetryPolicy, TransmitFailure};
pub use registry::PortRegistry;
pub use reset::{HardResetPhase, PendingReset, ResetEpisode, ResetKind, SoftResetPhase};
pub use state::{CapabilityState, PortState, ReadyState, Resume, StartupState};
pub use traits::{DevicePolicy, ProtocolLink};
