//! Atomic Message Sequence ownership.
//!
//! Either side may start a sequence of related messages; while one side owns
//! the sequence the other must not start an unrelated exchange.

use crate::{Error, Result};

/// Current holder of the atomic message sequence lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AmsOwner {
    /// No sequence in progress.
    #[default]
    None,
    /// Sequence started by this port.
    Local,
    /// Sequence started by the port partner.
    Remote,
}

/// Tracks AMS ownership for one port.
#[derive(Debug, Clone, Default)]
pub struct AmsTracker {
    owner: AmsOwner,
}

impl AmsTracker {
    /// Create a tracker with no owner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner.
    pub fn owner(&self) -> AmsOwner {
        self.owner
    }

    /// True when no sequence is in progress.
    pub fn is_free(&self) -> bool {
        self.owner == AmsOwner::None
    }

    /// Start a locally initiated sequence.
    pub fn acquire_local(&mut self) -> Result<()> {
        self.acquire(AmsOwner::Local)
    }

    /// Record that the partner started a sequence.
    pub fn acquire_remote(&mut self) -> Result<()> {
        self.acquire(AmsOwner::Remote)
    }

    fn acquire(&mut self, side: AmsOwner) -> Result<()> {
        if self.owner != AmsOwner::None {
            return Err(Error::AmsBusy(self.owner));
        }
        self.owner = side;
        Ok(())
    }

    /// End the sequence owned by `side`.
    pub fn release(&mut self, side: AmsOwner) -> Result<()> {
        if side == AmsOwner::None || self.owner != side {
            return Err(Error::AmsNotOwned(side));
        }
        self.owner = AmsOwner::None;
        Ok(())
    }

    /// Drop ownership unconditionally. Only resets may do this.
    pub fn force_clear(&mut self) {
        self.owner = AmsOwner::None;
    }
}
