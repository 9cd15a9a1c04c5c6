use std::collections::VecDeque;

use crate::{
    flow::QueueKey,
    flowset::FlowSet,
    heap::{Heap, Key},
    packet::Packet,
    Tick,
};

/// A bandwidth and delay limited link.
///
/// Packets sent to the pipe directly are queued in its own flow set and served at the fixed
/// rate. Flow sets that name the pipe as their parent share the bandwidth through WF2Q+, using
/// the virtual time and heaps below.
#[derive(Debug)]
pub(crate) struct Pipe {
    pub(crate) nr: u32,
    /// Bits per second, 0 for unlimited.
    pub(crate) bandwidth: u64,
    pub(crate) delay_ms: u64,
    /// Delay in ticks at the current tick rate.
    pub(crate) delay: Tick,
    pub(crate) fs: FlowSet,

    /// WF2Q+ credit, in `bytes * 8 * hz`. Negative while the pipe waits in the wfq_ready heap.
    pub(crate) numbytes: i64,
    pub(crate) sched_time: Tick,
    /// Virtual time.
    pub(crate) v: Key,
    /// Sum of the weights of the flows with valid timestamps.
    pub(crate) sum: u64,
    /// Eligible flows, by finish time.
    pub(crate) scheduler_heap: Heap<QueueKey>,
    /// Flows whose start time is ahead of `v`, by start time.
    pub(crate) not_eligible_heap: Heap<QueueKey>,
    /// Empty flows that still hold valid timestamps, by finish time.
    pub(crate) idle_heap: Heap<QueueKey>,

    /// Packets waiting out the propagation delay, in output order.
    pub(crate) delay_line: VecDeque<Packet>,
}

impl Pipe {
    pub(crate) fn new(nr: u32, bandwidth: u64, delay_ms: u64, delay: Tick, fs: FlowSet, now: Tick) -> Self {
        Self {
            nr,
            bandwidth,
            delay_ms,
            delay,
            fs,
            numbytes: 0,
            sched_time: now,
            v: 0,
            sum: 0,
            scheduler_heap: Heap::new(),
            not_eligible_heap: Heap::new(),
            idle_heap: Heap::with_positions(),
            delay_line: VecDeque::new(),
        }
    }

    /// Cost of `len` bytes in credit units. Free on an unlimited pipe.
    #[inline]
    pub(crate) fn len_scaled(&self, len: u64, hz: u32) -> i64 {
        if self.bandwidth == 0 {
            return 0;
        }

        let cost = u128::from(len) * 8 * u128::from(hz);
        i64::try_from(cost).unwrap_or(i64::MAX)
    }

    /// Ticks to wait until `numbytes` covers `len` bytes.
    pub(crate) fn ticks_to_wait(&self, len: u64, numbytes: i64, hz: u32) -> Tick {
        if self.bandwidth == 0 {
            return 0;
        }

        let missing = i128::from(self.len_scaled(len, hz)) - i128::from(numbytes);
        if missing <= 0 {
            return 0;
        }

        let bw = i128::from(self.bandwidth);
        u64::try_from((missing + bw - 1) / bw).unwrap_or(u64::MAX)
    }

    /// Adds the credit earned since `since`.
    #[inline]
    pub(crate) fn credit(&self, numbytes: i64, since: Tick, now: Tick) -> i64 {
        let elapsed = now.wrapping_sub(since);
        let earned = i128::from(elapsed) * i128::from(self.bandwidth);
        i64::try_from(i128::from(numbytes) + earned).unwrap_or(i64::MAX)
    }

    /// Appends `packet` to the delay line, due at `now + delay`.
    pub(crate) fn move_to_delay_line(&mut self, mut packet: Packet, now: Tick) {
        packet.set_output_time(now.wrapping_add(self.delay));
        self.delay_line.push_back(packet);
    }

    /// Forgets all WF2Q+ state. Flows referenced by the heaps must be freed by the caller.
    pub(crate) fn reset_scheduler(&mut self) {
        self.scheduler_heap.clear();
        self.not_eligible_heap.clear();
        self.idle_heap.clear();
        self.numbytes = 0;
        self.v = 0;
        self.sum = 0;
    }

    /// Packets on the delay line.
    pub(crate) fn backlog(&self) -> usize {
        self.delay_line.len()
    }
}
