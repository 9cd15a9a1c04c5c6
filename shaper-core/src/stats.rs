use crate::{error::DropReason, Tick};

/// Engine-wide counters. Per-queue counters live in the flow queues themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaperStats {
    /// Hashed flow queue lookups.
    pub searches: u64,
    /// Bucket entries inspected by those lookups.
    pub search_steps: u64,
    /// Packets admitted into a queue.
    pub accepted: u64,
    /// Packets handed to the egress.
    pub delivered: u64,
    pub drops: DropCounters,
}

impl ShaperStats {
    #[inline]
    pub(crate) fn record_drop(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::NoSuchTarget => &mut self.drops.no_such_target,
            DropReason::NoPipe => &mut self.drops.no_pipe,
            DropReason::QueueFull => &mut self.drops.queue_full,
            DropReason::Red => &mut self.drops.red,
            DropReason::RandomLoss => &mut self.drops.random_loss,
            DropReason::Allocation => &mut self.drops.allocation,
        };

        *counter += 1;
    }
}

/// Admission drops by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub no_such_target: u64,
    pub no_pipe: u64,
    pub queue_full: u64,
    pub red: u64,
    pub random_loss: u64,
    pub allocation: u64,
}

impl DropCounters {
    pub fn total(&self) -> u64 {
        self.no_such_target +
            self.no_pipe +
            self.queue_full +
            self.red +
            self.random_loss +
            self.allocation
    }
}

/// Lets through one log line per simulated second and counts the rest.
#[derive(Debug, Default)]
pub(crate) struct LogLimiter {
    last: Option<Tick>,
    suppressed: u64,
}

impl LogLimiter {
    /// Returns the number of suppressed events since the last emitted line if a line may be
    /// emitted now.
    pub(crate) fn check(&mut self, now: Tick, hz: u32) -> Option<u64> {
        if let Some(last) = self.last {
            if now.wrapping_sub(last) < u64::from(hz) {
                self.suppressed += 1;
                return None;
            }
        }

        self.last = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}
