use thiserror::Error;

/// A rejected configuration request. Nothing is committed when one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("pipe and flow set numbers must be non-zero")]
    InvalidId,
    #[error("flow set {0} needs a parent pipe")]
    MissingParent(u32),
    #[error("flow set {nr} belongs to pipe {current}, delete it before moving it to pipe {requested}")]
    ParentChange { nr: u32, current: u32, requested: u32 },
    #[error("no such pipe: {0}")]
    NoSuchPipe(u32),
    #[error("no such flow set: {0}")]
    NoSuchFlowSet(u32),
    #[error("invalid RED parameters: {0}")]
    InvalidRed(&'static str),
    #[error("queue size out of range: {0}")]
    QueueSize(&'static str),
    #[error("weight must be <= {max}, got {weight}")]
    Weight { weight: u32, max: u32 },
    #[error("packet loss rate must be within 0..=1, got {0}")]
    LossRate(f64),
    #[error("tick rate must be > 0")]
    InvalidHz,
}

/// Why a packet was not admitted. Drops are the normal function of the shaper and never
/// propagate further than the verdict and the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DropReason {
    #[error("no such pipe or queue")]
    NoSuchTarget,
    #[error("queue has no parent pipe")]
    NoPipe,
    #[error("queue full")]
    QueueFull,
    #[error("RED drop")]
    Red,
    #[error("random loss")]
    RandomLoss,
    #[error("allocation failure")]
    Allocation,
}

/// The outcome of admitting a packet.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Dropped {
        reason: DropReason,
        /// The flow set asked for drops not to be reported as errors.
        silent: bool,
    },
}

impl Verdict {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Returns `true` if the caller should surface the drop as an error (`ENOBUFS` in a
    /// network stack).
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Dropped { silent: false, .. })
    }

    #[inline]
    pub fn reason(&self) -> Option<DropReason> {
        match self {
            Self::Accepted => None,
            Self::Dropped { reason, .. } => Some(*reason),
        }
    }
}
