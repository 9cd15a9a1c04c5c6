//! Flow queues and the arena that owns them.

use std::collections::VecDeque;

use slab::Slab;

use crate::{
    heap::{key_gt, Key},
    packet::{FlowId, Packet, Target},
    red::RedState,
    Tick,
};

/// Generation-checked handle to a [`FlowQueue`] in a [`QueueArena`]. A handle to a freed queue
/// never resolves, even once its slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct QueueKey {
    index: usize,
    generation: u32,
}

/// A per-flow packet queue with its scheduling and RED state.
#[derive(Debug)]
pub(crate) struct FlowQueue {
    generation: u32,
    pub(crate) owner: Target,
    /// Masked flow id this queue serves.
    pub(crate) id: FlowId,
    /// Bucket this queue hangs off.
    pub(crate) hash_slot: usize,
    packets: VecDeque<Packet>,
    len_bytes: u64,

    /// Fixed-rate credit, in `bytes * 8 * hz`.
    pub(crate) numbytes: i64,
    /// Tick the credit was last brought up to date.
    pub(crate) sched_time: Tick,

    /// WF2Q+ start and finish times. `start == finish + 1` marks them invalid.
    pub(crate) start: Key,
    pub(crate) finish: Key,
    /// Weight charged to the pipe while the timestamps are valid.
    pub(crate) weight: u64,

    pub(crate) red: RedState,

    pub(crate) tot_pkts: u64,
    pub(crate) tot_bytes: u64,
    pub(crate) drops: u64,
}

impl FlowQueue {
    fn new(owner: Target, id: FlowId, hash_slot: usize, weight: u64, now: Tick) -> Self {
        Self {
            generation: 0,
            owner,
            id,
            hash_slot,
            packets: VecDeque::new(),
            len_bytes: 0,
            numbytes: 0,
            sched_time: now,
            start: 1,
            finish: 0,
            weight,
            red: RedState::new(now),
            tot_pkts: 0,
            tot_bytes: 0,
            drops: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub(crate) fn len_bytes(&self) -> u64 {
        self.len_bytes
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Length of the head packet.
    #[inline]
    pub(crate) fn head_len(&self) -> Option<u64> {
        self.packets.front().map(|p| p.len() as u64)
    }

    pub(crate) fn enqueue(&mut self, packet: Packet) {
        self.len_bytes += packet.len() as u64;
        self.packets.push_back(packet);
    }

    pub(crate) fn dequeue(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.len_bytes -= packet.len() as u64;
        Some(packet)
    }

    /// Drops every queued packet, returning how many there were.
    pub(crate) fn purge(&mut self) -> usize {
        let n = self.packets.len();
        self.packets.clear();
        self.len_bytes = 0;
        n
    }

    #[inline]
    pub(crate) fn has_timestamps(&self) -> bool {
        !key_gt(self.start, self.finish)
    }

    #[inline]
    pub(crate) fn invalidate_timestamps(&mut self) {
        self.start = self.finish.wrapping_add(1);
    }

    /// Empty and not holding a weight in its pipe's virtual time: safe to free.
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.is_empty() && !self.has_timestamps()
    }
}

/// Owner of every [`FlowQueue`], bounded to a fixed number of live queues.
#[derive(Debug)]
pub(crate) struct QueueArena {
    slab: Slab<FlowQueue>,
    generation: u32,
    capacity: usize,
}

impl QueueArena {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { slab: Slab::new(), generation: 0, capacity }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    /// Allocates a new queue. Returns `None` once the arena is full.
    pub(crate) fn insert(
        &mut self,
        owner: Target,
        id: FlowId,
        hash_slot: usize,
        weight: u64,
        now: Tick,
    ) -> Option<QueueKey> {
        if self.slab.len() >= self.capacity {
            return None;
        }

        self.generation = self.generation.wrapping_add(1);
        let mut queue = FlowQueue::new(owner, id, hash_slot, weight, now);
        queue.generation = self.generation;

        let index = self.slab.insert(queue);
        Some(QueueKey { index, generation: self.generation })
    }

    #[inline]
    pub(crate) fn get(&self, key: QueueKey) -> Option<&FlowQueue> {
        self.slab.get(key.index).filter(|q| q.generation == key.generation)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, key: QueueKey) -> Option<&mut FlowQueue> {
        self.slab.get_mut(key.index).filter(|q| q.generation == key.generation)
    }

    #[inline]
    pub(crate) fn contains(&self, key: QueueKey) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn remove(&mut self, key: QueueKey) -> Option<FlowQueue> {
        if !self.contains(key) {
            return None;
        }

        Some(self.slab.remove(key.index))
    }

    pub(crate) fn clear(&mut self) {
        self.slab.clear();
    }
}
