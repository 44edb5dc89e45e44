//! Async runtime for the pd-core port machines.
//!
//! One tokio task per port owns that port's machine. Transport callbacks go
//! through [`Ingress`], which only queues events; each task latches them,
//! evaluates until settled and sleeps until the next event or deadline.
//! Port state is published through `tokio::sync::watch` snapshots.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod ingress;
pub mod loopback;
pub mod runtime;
mod task;

pub use error::{Error, Result};
pub use ingress::Ingress;
pub use loopback::LoopbackWire;
pub use runtime::{PortParts, PortRuntime, RuntimeConfig};
