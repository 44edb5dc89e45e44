//! Hard and Soft Reset sub-machines.
//!
//! A reset episode moves `PendingReset` forward only:
//! `Requested -> InProgress -> None`. The one backward step allowed is a hard
//! reset restarting itself after its completion timer expires.

/// Which reset an episode or timeout refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetKind {
    /// Soft Reset (message sequencing resync).
    Soft,
    /// Hard Reset (full link reset).
    Hard,
}

/// Reset bookkeeping held in the port context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PendingReset {
    /// No reset episode active.
    #[default]
    None,
    /// Hard reset decided, not yet signalled.
    HardRequested,
    /// Hard reset signalled, awaiting completion.
    HardInProgress,
    /// Soft reset decided, message not yet sent.
    SoftRequested,
    /// Soft reset message exchange in progress.
    SoftInProgress,
}

impl PendingReset {
    /// True while any reset episode is active.
    pub fn is_active(self) -> bool {
        self != PendingReset::None
    }

    /// True while a hard reset episode is active.
    pub fn is_hard(self) -> bool {
        matches!(self, PendingReset::HardRequested | PendingReset::HardInProgress)
    }

    /// True while a soft reset episode is active.
    pub fn is_soft(self) -> bool {
        matches!(self, PendingReset::SoftRequested | PendingReset::SoftInProgress)
    }

    /// Request a soft reset. A pending hard reset takes precedence.
    ///
    /// Returns `false` when the request was subsumed.
    pub fn request_soft(&mut self) -> bool {
        if self.is_hard() {
            return false;
        }
        *self = PendingReset::SoftRequested;
        true
    }

    /// Request a hard reset. Supersedes any soft reset.
    pub fn request_hard(&mut self) {
        *self = PendingReset::HardRequested;
    }

    /// Advance `Requested` to `InProgress` for the active kind.
    pub fn begin(&mut self) {
        *self = match *self {
            PendingReset::HardRequested => PendingReset::HardInProgress,
            PendingReset::SoftRequested => PendingReset::SoftInProgress,
            other => other,
        };
    }

    /// End the episode.
    pub fn complete(&mut self) {
        *self = PendingReset::None;
    }
}

/// Phases of a hard reset episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardResetPhase {
    /// Waiting for the next pass to signal Hard Reset.
    Requested,
    /// Hard Reset signalled; waiting for the transport to confirm.
    Sending,
    /// Partner signalled Hard Reset.
    Receiving,
}

/// Phases of a soft reset episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftResetPhase {
    /// Waiting for the next pass to send Soft_Reset.
    Requested,
    /// Soft_Reset handed to the transport.
    Sending,
    /// Soft_Reset delivered; waiting for Accept.
    AwaitAccept,
    /// Partner sent Soft_Reset; our Accept is in flight.
    Accepting,
}

/// Active reset episode, nested in the outer port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetEpisode {
    /// Hard reset.
    Hard(HardResetPhase),
    /// Soft reset.
    Soft(SoftResetPhase),
}

impl ResetEpisode {
    /// Kind of reset.
    pub fn kind(self) -> ResetKind {
        match self {
            ResetEpisode::Hard(_) => ResetKind::Hard,
            ResetEpisode::Soft(_) => ResetKind::Soft,
        }
    }
}
