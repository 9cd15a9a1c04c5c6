//! Flow sets: a queueing policy plus the hash table of flow queues it applies to.

use std::{
    collections::VecDeque,
    hash::{Hash, Hasher},
};

use rustc_hash::FxHasher;

use crate::{
    config::{FlowSetParams, QueueParams},
    flow::{QueueArena, QueueKey},
    packet::{FlowId, Target},
    stats::ShaperStats,
    Tick,
};

/// Lookup tunables taken from the engine options.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lookup {
    pub(crate) now: Tick,
    pub(crate) hz: u32,
    pub(crate) expire: bool,
    pub(crate) max_chain_ratio: usize,
}

#[derive(Debug)]
pub(crate) struct FlowSet {
    /// What packets address this flow set as: the pipe itself or a standalone queue.
    pub(crate) ident: Target,
    /// Pipe whose bandwidth this flow set uses.
    pub(crate) parent: u32,
    /// The policy as configured, kept to re-derive `params` when the tick rate changes.
    pub(crate) config: QueueParams,
    pub(crate) params: FlowSetParams,
    /// `params.buckets` hash buckets followed by the overflow bucket.
    buckets: Vec<VecDeque<QueueKey>>,
    elements: usize,
    last_expired: Option<Tick>,
    /// Flow queues currently holding packets under WF2Q+.
    pub(crate) backlogged: usize,
}

impl FlowSet {
    pub(crate) fn new(ident: Target, parent: u32, config: QueueParams, params: FlowSetParams) -> Self {
        let buckets = (0..=params.buckets).map(|_| VecDeque::new()).collect();

        Self {
            ident,
            parent,
            config,
            params,
            buckets,
            elements: 0,
            last_expired: None,
            backlogged: 0,
        }
    }

    /// Number of flow queues.
    #[cfg(test)]
    #[inline]
    pub(crate) fn elements(&self) -> usize {
        self.elements
    }

    /// Number of hash buckets, not counting the overflow bucket.
    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len() - 1
    }

    pub(crate) fn queue_keys(&self) -> impl Iterator<Item = QueueKey> + '_ {
        self.buckets.iter().flatten().copied()
    }

    /// Replaces the policy, keeping every queue and its packets. Queues are redistributed if
    /// the table size or the mask changed. Dropping the mask merges every queue into the single
    /// bucket, where the ones that are already idle are freed at once and the rest once they
    /// drain.
    pub(crate) fn reconfigure(&mut self, config: QueueParams, params: FlowSetParams, arena: &mut QueueArena) {
        let rehash = params.buckets != self.params.buckets || params.mask != self.params.mask;
        self.config = config;
        self.params = params;

        if !rehash {
            return;
        }

        let overflow = self.bucket_count();
        let keys: Vec<QueueKey> = self.queue_keys().collect();
        self.buckets = (0..=self.params.buckets).map(|_| VecDeque::new()).collect();

        for key in keys {
            let Some(queue) = arena.get_mut(key) else {
                self.elements -= 1;
                continue;
            };

            let slot = if queue.hash_slot == overflow && self.params.is_masked() {
                self.params.buckets
            } else {
                self.slot(&queue.id)
            };

            queue.hash_slot = slot;
            self.buckets[slot].push_back(key);
        }

        if !self.params.is_masked() {
            self.release_merged(arena);
        }
    }

    /// Frees the idle queues queued behind the one an unmasked flow set serves.
    fn release_merged(&mut self, arena: &mut QueueArena) {
        let mut freed = 0;
        let mut head = true;
        self.buckets[0].retain(|&key| {
            if std::mem::take(&mut head) {
                return true;
            }
            let idle = arena.get(key).map_or(true, |q| q.is_idle());
            if idle {
                arena.remove(key);
                freed += 1;
            }
            !idle
        });

        self.elements -= freed;
    }

    fn slot(&self, masked: &FlowId) -> usize {
        if !self.params.is_masked() {
            return 0;
        }

        let mut hasher = FxHasher::default();
        masked.hash(&mut hasher);
        (hasher.finish() % self.params.buckets as u64) as usize
    }

    /// Finds the flow queue for `id`, creating it if needed. Returns `None` if no queue can be
    /// allocated.
    pub(crate) fn find_queue(
        &mut self,
        arena: &mut QueueArena,
        id: &FlowId,
        lookup: &Lookup,
        stats: &mut ShaperStats,
    ) -> Option<QueueKey> {
        if !self.params.is_masked() {
            if self.buckets[0].len() > 1 {
                self.release_merged(arena);
            }
            if let Some(&key) = self.buckets[0].front() {
                if arena.contains(key) {
                    return Some(key);
                }
                self.buckets[0].pop_front();
                self.elements -= 1;
            }

            return self.create_queue(arena, 0, FlowId::default(), lookup);
        }

        let masked = id.masked(&self.params.mask);
        let slot = self.slot(&masked);
        stats.searches += 1;

        let bucket = &mut self.buckets[slot];
        let mut i = 0;
        while i < bucket.len() {
            stats.search_steps += 1;

            let key = bucket[i];
            let (matches, idle) = match arena.get(key) {
                Some(queue) => (queue.id == masked, queue.is_idle()),
                None => (false, true),
            };

            if matches {
                if i != 0 {
                    bucket.remove(i);
                    bucket.push_front(key);
                }
                return Some(key);
            }

            if idle && lookup.expire {
                bucket.remove(i);
                arena.remove(key);
                self.elements -= 1;
                continue;
            }

            i += 1;
        }

        self.create_queue(arena, slot, masked, lookup)
    }

    fn create_queue(
        &mut self,
        arena: &mut QueueArena,
        mut slot: usize,
        id: FlowId,
        lookup: &Lookup,
    ) -> Option<QueueKey> {
        let limit = self.params.buckets.saturating_mul(lookup.max_chain_ratio);
        if self.elements > limit && self.expire_queues(arena, lookup) == 0 {
            // Too many flows: share the overflow queue.
            slot = self.params.buckets;
            if let Some(&key) = self.buckets[slot].front() {
                return Some(key);
            }
        }

        let key = arena.insert(self.ident, id, slot, self.params.weight, lookup.now)?;
        self.buckets[slot].push_front(key);
        self.elements += 1;

        Some(key)
    }

    /// Frees every idle flow queue. Runs at most once per simulated second.
    pub(crate) fn expire_queues(&mut self, arena: &mut QueueArena, lookup: &Lookup) -> usize {
        if let Some(last) = self.last_expired {
            if lookup.now.wrapping_sub(last) < u64::from(lookup.hz) {
                return 0;
            }
        }
        self.last_expired = Some(lookup.now);

        let mut freed = 0;
        for bucket in self.buckets.iter_mut() {
            bucket.retain(|&key| {
                let idle = arena.get(key).map_or(true, |q| q.is_idle());
                if idle {
                    arena.remove(key);
                    freed += 1;
                }
                !idle
            });
        }

        self.elements -= freed;
        if freed > 0 {
            tracing::debug!(flowset = %self.ident, freed, "expired idle queues");
        }

        freed
    }

    /// Frees every flow queue and drops their packets. Returns the number of dropped packets.
    pub(crate) fn purge(&mut self, arena: &mut QueueArena) -> usize {
        let mut dropped = 0;
        for key in self.buckets.iter_mut().flat_map(|b| b.drain(..)) {
            if let Some(mut queue) = arena.remove(key) {
                dropped += queue.purge();
            }
        }

        self.elements = 0;
        self.backlogged = 0;

        dropped
    }

    /// Zeroes the fixed-rate credit of every queue.
    pub(crate) fn reset_credit(&self, arena: &mut QueueArena) {
        for key in self.queue_keys() {
            if let Some(queue) = arena.get_mut(key) {
                queue.numbytes = 0;
            }
        }
    }
}
