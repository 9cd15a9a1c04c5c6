use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error};

use crate::{
    config::{
        clamp_hz, ms_to_ticks, FlowSetConfig, PipeConfig, QueueLimit, ShaperOptions, PLR_MAX,
    },
    error::{ConfigError, DropReason, Verdict},
    flow::{QueueArena, QueueKey},
    flowset::{FlowSet, Lookup},
    heap::{Heap, HeapEntry},
    packet::{Egress, Packet, Target},
    pipe::Pipe,
    red::RedParams,
    stats::{LogLimiter, ShaperStats},
    Tick,
};

/// The traffic shaping engine.
///
/// One instance owns every pipe, flow set, flow queue and queued packet. Nothing in here
/// blocks: [`Shaper::admit`] and [`Shaper::on_tick`] run to completion, so the whole engine
/// can sit behind a single lock.
#[derive(Debug)]
pub struct Shaper<E = Vec<Packet>> {
    pub(crate) options: ShaperOptions,
    pub(crate) now: Tick,
    pub(crate) pipes: BTreeMap<u32, Pipe>,
    pub(crate) flowsets: BTreeMap<u32, FlowSet>,
    pub(crate) queues: QueueArena,
    /// Fixed-rate flow queues waiting for credit.
    pub(crate) ready_heap: Heap<QueueKey>,
    /// WF2Q+ pipes waiting for credit.
    pub(crate) wfq_ready_heap: Heap<u32>,
    /// Pipes with packets on their delay line, by head output time.
    pub(crate) extract_heap: Heap<u32>,
    pub(crate) rng: StdRng,
    pub(crate) stats: ShaperStats,
    alloc_log: LogLimiter,
    pub(crate) egress: E,
}

impl<E: Egress> Shaper<E> {
    /// Creates an engine delivering packets to `egress`.
    pub fn new(options: ShaperOptions, egress: E) -> Result<Self, ConfigError> {
        let options = options.validate()?;
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            queues: QueueArena::new(options.max_queues),
            options,
            now: 0,
            pipes: BTreeMap::new(),
            flowsets: BTreeMap::new(),
            ready_heap: Heap::new(),
            wfq_ready_heap: Heap::with_positions(),
            extract_heap: Heap::new(),
            rng,
            stats: ShaperStats::default(),
            alloc_log: LogLimiter::default(),
            egress,
        })
    }

    /// The current tick.
    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    #[inline]
    pub fn hz(&self) -> u32 {
        self.options.hz
    }

    #[inline]
    pub fn options(&self) -> &ShaperOptions {
        &self.options
    }

    #[inline]
    pub fn stats(&self) -> &ShaperStats {
        &self.stats
    }

    #[inline]
    pub fn egress(&self) -> &E {
        &self.egress
    }

    #[inline]
    pub fn egress_mut(&mut self) -> &mut E {
        &mut self.egress
    }

    /// Number of live flow queues across all pipes and flow sets.
    #[inline]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn lookup(&self) -> Lookup {
        Lookup {
            now: self.now,
            hz: self.options.hz,
            expire: self.options.expire,
            max_chain_ratio: self.options.max_chain_ratio,
        }
    }

    /// Admits `packet` into pipe or flow set `target`.
    ///
    /// On [`Verdict::Dropped`] the packet has been freed. An accepted packet is owned by the
    /// engine until the egress receives it.
    pub fn admit(&mut self, target: Target, mut packet: Packet) -> Verdict {
        let lookup = self.lookup();
        let len = packet.len() as u64;
        packet.set_target(target);

        let (fs, parent) = match target {
            Target::Pipe(nr) => match self.pipes.get_mut(&nr) {
                Some(pipe) => (&mut pipe.fs, nr),
                None => return drop_packet(&mut self.stats, DropReason::NoSuchTarget, false),
            },
            Target::Queue(nr) => match self.flowsets.get_mut(&nr) {
                Some(fs) if self.pipes.contains_key(&fs.parent) => {
                    let parent = fs.parent;
                    (fs, parent)
                }
                Some(fs) => {
                    let silent = fs.params.no_error;
                    return drop_packet(&mut self.stats, DropReason::NoPipe, silent);
                }
                None => return drop_packet(&mut self.stats, DropReason::NoSuchTarget, false),
            },
        };

        let silent = fs.params.no_error;
        let key = match enqueue(fs, &mut self.queues, &mut self.rng, &mut self.stats, &lookup, packet)
        {
            Ok(key) => key,
            Err(reason) => {
                if reason == DropReason::Allocation {
                    if let Some(suppressed) = self.alloc_log.check(lookup.now, lookup.hz) {
                        error!(%target, suppressed, "cannot allocate a flow queue, dropping packet");
                    }
                }
                return drop_packet(&mut self.stats, reason, silent);
            }
        };

        self.stats.accepted += 1;

        // A queue that already held packets is already scheduled.
        if self.queues.get(key).map_or(true, |q| q.len() != 1) {
            return Verdict::Accepted;
        }

        match target {
            Target::Pipe(_) => self.schedule_fixed(parent, key, len),
            Target::Queue(_) => self.schedule_wfq(parent, key, len),
        }

        Verdict::Accepted
    }

    /// Creates or updates a pipe. Queued packets are kept, accumulated credit is lost.
    pub fn configure_pipe(&mut self, config: PipeConfig) -> Result<(), ConfigError> {
        let nr = config.nr;
        if nr == 0 {
            return Err(ConfigError::InvalidId);
        }

        let params = config.queue.validate(1, config.bandwidth, &self.options)?;
        let delay = ms_to_ticks(config.delay_ms, self.options.hz);

        match self.pipes.get_mut(&nr) {
            Some(pipe) => {
                pipe.bandwidth = config.bandwidth;
                pipe.delay_ms = config.delay_ms;
                pipe.delay = delay;
                pipe.numbytes = 0;
                pipe.fs.reset_credit(&mut self.queues);
                pipe.fs.reconfigure(config.queue, params, &mut self.queues);
                debug!(pipe = nr, bandwidth = config.bandwidth, delay, "reconfigured pipe");
            }
            None => {
                let fs = FlowSet::new(Target::Pipe(nr), nr, config.queue, params);
                let pipe = Pipe::new(nr, config.bandwidth, config.delay_ms, delay, fs, self.now);
                self.pipes.insert(nr, pipe);
                debug!(pipe = nr, bandwidth = config.bandwidth, delay, "created pipe");
            }
        }

        Ok(())
    }

    /// Creates or updates a flow set. The parent pipe may be configured later; until then
    /// packets sent to the flow set are dropped.
    pub fn configure_flowset(&mut self, config: FlowSetConfig) -> Result<(), ConfigError> {
        let nr = config.nr;
        if nr == 0 {
            return Err(ConfigError::InvalidId);
        }
        if config.parent == 0 {
            return Err(ConfigError::MissingParent(nr));
        }

        if let Some(fs) = self.flowsets.get(&nr) {
            if fs.parent != config.parent {
                return Err(ConfigError::ParentChange {
                    nr,
                    current: fs.parent,
                    requested: config.parent,
                });
            }
        }

        let params = config.queue.validate(config.weight, 0, &self.options)?;

        match self.flowsets.get_mut(&nr) {
            Some(fs) => {
                fs.reconfigure(config.queue, params, &mut self.queues);
                debug!(flowset = nr, pipe = config.parent, "reconfigured flow set");
            }
            None => {
                let fs = FlowSet::new(Target::Queue(nr), config.parent, config.queue, params);
                self.flowsets.insert(nr, fs);
                debug!(flowset = nr, pipe = config.parent, "created flow set");
            }
        }

        Ok(())
    }

    /// Deletes a pipe, dropping its packets and those queued in the flow sets attached to it.
    /// The flow sets themselves are kept.
    pub fn delete_pipe(&mut self, nr: u32) -> Result<(), ConfigError> {
        let Some(mut pipe) = self.pipes.remove(&nr) else {
            return Err(ConfigError::NoSuchPipe(nr));
        };

        let target = Target::Pipe(nr);
        let queues = &self.queues;
        self.ready_heap
            .retain(|e| queues.get(e.object).map_or(false, |q| q.owner != target));
        self.wfq_ready_heap.retain(|e| e.object != nr);
        self.extract_heap.retain(|e| e.object != nr);

        let mut dropped = pipe.delay_line.len();
        for fs in self.flowsets.values_mut().filter(|fs| fs.parent == nr) {
            dropped += fs.purge(&mut self.queues);
        }
        dropped += pipe.fs.purge(&mut self.queues);

        debug_assert_eq!(self.heap_references(target), 0);
        debug!(pipe = nr, dropped, "deleted pipe");

        Ok(())
    }

    /// Deletes a flow set, dropping its packets.
    pub fn delete_flowset(&mut self, nr: u32) -> Result<(), ConfigError> {
        let Some(mut fs) = self.flowsets.remove(&nr) else {
            return Err(ConfigError::NoSuchFlowSet(nr));
        };

        let target = Target::Queue(nr);
        if let Some(pipe) = self.pipes.get_mut(&fs.parent) {
            for key in fs.queue_keys() {
                if let Some(queue) = self.queues.get(key) {
                    if queue.has_timestamps() {
                        pipe.sum = pipe.sum.saturating_sub(queue.weight);
                    }
                }
            }

            let queues = &self.queues;
            let foreign = |e: &HeapEntry<QueueKey>| {
                queues.get(e.object).map_or(false, |q| q.owner != target)
            };
            pipe.scheduler_heap.retain(foreign);
            pipe.not_eligible_heap.retain(foreign);
            pipe.idle_heap.retain(foreign);
        }

        let dropped = fs.purge(&mut self.queues);

        debug_assert_eq!(self.heap_references(target), 0);
        debug!(flowset = nr, dropped, "deleted flow set");

        Ok(())
    }

    /// Deletes every pipe and flow set and drops every packet.
    pub fn flush_all(&mut self) {
        self.ready_heap.clear();
        self.wfq_ready_heap.clear();
        self.extract_heap.clear();
        self.pipes.clear();
        self.flowsets.clear();
        self.queues.clear();

        debug!(tick = self.now, "flushed all pipes and flow sets");
    }

    /// Drops every queued packet and frees every flow queue, keeping the configuration.
    /// Returns the number of dropped packets.
    pub fn drain(&mut self) -> usize {
        self.ready_heap.clear();
        self.wfq_ready_heap.clear();
        self.extract_heap.clear();

        let mut dropped = 0;
        for fs in self.flowsets.values_mut() {
            dropped += fs.purge(&mut self.queues);
        }
        for pipe in self.pipes.values_mut() {
            dropped += pipe.fs.purge(&mut self.queues) + pipe.delay_line.len();
            pipe.delay_line.clear();
            pipe.reset_scheduler();
        }

        debug_assert_eq!(self.queues.len(), 0);
        debug!(dropped, "drained all queues");

        dropped
    }

    /// Changes the tick rate. Delays and RED tables follow the new rate.
    pub fn set_hz(&mut self, hz: u32) -> Result<(), ConfigError> {
        let hz = clamp_hz(hz)?;
        let options = ShaperOptions { hz, ..self.options.clone() };

        // Derive everything first so that nothing changes on error.
        let mut red = Vec::with_capacity(self.pipes.len());
        for pipe in self.pipes.values() {
            let params = match &pipe.fs.config.red {
                Some(config) => Some(RedParams::new(config, &options.red_env(pipe.bandwidth))?),
                None => None,
            };
            red.push(params);
        }

        for (pipe, params) in self.pipes.values_mut().zip(red) {
            pipe.delay = ms_to_ticks(pipe.delay_ms, hz);
            pipe.fs.params.red = params;
        }

        self.options = options;
        debug!(hz, "changed tick rate");

        Ok(())
    }

    /// Counts the heap entries referring to the pipe or flow set `target` or to one of its flow
    /// queues. Entries that do not resolve to a live flow queue are counted as well.
    pub fn heap_references(&self, target: Target) -> usize {
        let refers = |e: &HeapEntry<QueueKey>| {
            self.queues.get(e.object).map_or(true, |q| q.owner == target)
        };

        let mut count = self.ready_heap.iter().filter(|&e| refers(e)).count();

        if let Target::Pipe(nr) = target {
            count += self.wfq_ready_heap.iter().filter(|e| e.object == nr).count();
            count += self.extract_heap.iter().filter(|e| e.object == nr).count();
        }

        for pipe in self.pipes.values() {
            for heap in [&pipe.scheduler_heap, &pipe.not_eligible_heap, &pipe.idle_heap] {
                count += heap.iter().filter(|&e| refers(e)).count();
            }
        }

        count
    }
}

fn drop_packet(stats: &mut ShaperStats, reason: DropReason, silent: bool) -> Verdict {
    stats.record_drop(reason);
    Verdict::Dropped { reason, silent }
}

/// Runs the admission policy of `fs` and queues the packet. The packet is freed on error.
fn enqueue(
    fs: &mut FlowSet,
    queues: &mut QueueArena,
    rng: &mut StdRng,
    stats: &mut ShaperStats,
    lookup: &Lookup,
    packet: Packet,
) -> Result<QueueKey, DropReason> {
    let key = fs.find_queue(queues, packet.flow_id(), lookup, stats).ok_or(DropReason::Allocation)?;
    let queue = queues.get_mut(key).ok_or(DropReason::Allocation)?;
    let params = &fs.params;
    let len = packet.len() as u64;

    queue.tot_pkts += 1;
    queue.tot_bytes += len;

    let full = match params.limit {
        QueueLimit::Packets(limit) => queue.len() >= limit as usize,
        QueueLimit::Bytes(limit) => queue.len_bytes() > u64::from(limit),
    };

    let verdict = if params.plr != 0 && rng.gen_range(0..PLR_MAX) < params.plr {
        Err(DropReason::RandomLoss)
    } else if full {
        Err(DropReason::QueueFull)
    } else if let Some(red) = &params.red {
        let bytes = params.limit.is_bytes();
        let q_size = if bytes { queue.len_bytes() } else { queue.len() as u64 };
        if queue.red.should_drop(red, q_size, len, bytes, lookup.now, rng) {
            Err(DropReason::Red)
        } else {
            Ok(())
        }
    } else {
        Ok(())
    };

    if let Err(reason) = verdict {
        queue.drops += 1;
        return Err(reason);
    }

    queue.enqueue(packet);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{packet::FlowId, red::RedConfig};

    fn shaper() -> Shaper {
        Shaper::new(ShaperOptions::default().seed(7), Vec::new()).unwrap()
    }

    fn packet(len: usize) -> Packet {
        Packet::new(Bytes::from(vec![0u8; len]), FlowId::default())
    }

    #[test]
    fn unknown_targets_are_dropped() {
        let mut shaper = shaper();

        let verdict = shaper.admit(Target::Pipe(1), packet(10));
        assert_eq!(verdict.reason(), Some(DropReason::NoSuchTarget));
        assert!(verdict.is_error());

        shaper.configure_flowset(FlowSetConfig::new(5, 1).no_error()).unwrap();
        let verdict = shaper.admit(Target::Queue(5), packet(10));
        assert_eq!(verdict, Verdict::Dropped { reason: DropReason::NoPipe, silent: true });

        assert_eq!(shaper.stats().drops.no_such_target, 1);
        assert_eq!(shaper.stats().drops.no_pipe, 1);
    }

    #[test]
    fn configuration_is_validated_before_commit() {
        let mut shaper = shaper();

        assert_eq!(shaper.configure_pipe(PipeConfig::new(0)), Err(ConfigError::InvalidId));
        assert_eq!(
            shaper.configure_flowset(FlowSetConfig::new(1, 0)),
            Err(ConfigError::MissingParent(1))
        );

        let bad = PipeConfig::new(1).red(RedConfig::new(0.1, 10, 5, 0.1));
        assert!(matches!(shaper.configure_pipe(bad), Err(ConfigError::InvalidRed(_))));
        assert!(shaper.pipes.is_empty());

        shaper.configure_flowset(FlowSetConfig::new(1, 1)).unwrap();
        assert_eq!(
            shaper.configure_flowset(FlowSetConfig::new(1, 2)),
            Err(ConfigError::ParentChange { nr: 1, current: 1, requested: 2 })
        );
        assert_eq!(shaper.delete_pipe(9), Err(ConfigError::NoSuchPipe(9)));
        assert_eq!(shaper.delete_flowset(9), Err(ConfigError::NoSuchFlowSet(9)));
    }

    #[test]
    fn byte_limit_allows_one_packet_of_overshoot() {
        let mut shaper = shaper();
        let config = PipeConfig::new(1).bandwidth(8000).queue_limit(QueueLimit::Bytes(1000));
        shaper.configure_pipe(config).unwrap();

        // At 8 kbit/s nothing leaves the queue before the next tick.
        assert!(shaper.admit(Target::Pipe(1), packet(600)).is_accepted());
        assert!(shaper.admit(Target::Pipe(1), packet(600)).is_accepted());
        let verdict = shaper.admit(Target::Pipe(1), packet(600));
        assert_eq!(verdict.reason(), Some(DropReason::QueueFull));
    }

    #[test]
    fn random_loss_drops_everything_at_one() {
        let mut shaper = shaper();
        shaper.configure_pipe(PipeConfig::new(1).plr(1.0)).unwrap();

        for _ in 0..10 {
            let verdict = shaper.admit(Target::Pipe(1), packet(100));
            assert_eq!(verdict.reason(), Some(DropReason::RandomLoss));
        }
        assert_eq!(shaper.stats().drops.random_loss, 10);
        assert_eq!(shaper.stats().accepted, 0);
    }

    #[test]
    fn allocation_failure_drops() {
        let options = ShaperOptions::default().max_queues(1).seed(1);
        let mut shaper = Shaper::new(options, Vec::new()).unwrap();
        shaper.configure_pipe(PipeConfig::new(1).bandwidth(8000)).unwrap();
        shaper.configure_pipe(PipeConfig::new(2).bandwidth(8000)).unwrap();

        assert!(shaper.admit(Target::Pipe(1), packet(100)).is_accepted());
        let verdict = shaper.admit(Target::Pipe(2), packet(100));
        assert_eq!(verdict.reason(), Some(DropReason::Allocation));
        assert_eq!(shaper.stats().drops.allocation, 1);
    }

    #[test]
    fn set_hz_rescales_delay() {
        let mut shaper = shaper();
        shaper.configure_pipe(PipeConfig::new(1).delay(100)).unwrap();
        assert_eq!(shaper.pipes[&1].delay, 100);

        shaper.set_hz(100).unwrap();
        assert_eq!(shaper.pipes[&1].delay, 10);
        assert_eq!(shaper.hz(), 100);

        assert_eq!(shaper.set_hz(0), Err(ConfigError::InvalidHz));
        shaper.set_hz(1_000_000).unwrap();
        assert_eq!(shaper.hz(), 10_000);
    }

    #[test]
    fn drain_keeps_configuration() {
        let mut shaper = shaper();
        shaper.configure_pipe(PipeConfig::new(1).bandwidth(8000)).unwrap();
        for _ in 0..5 {
            assert!(shaper.admit(Target::Pipe(1), packet(1000)).is_accepted());
        }

        assert_eq!(shaper.drain(), 5);
        assert_eq!(shaper.queue_count(), 0);
        assert!(shaper.ready_heap.is_empty());
        assert!(shaper.admit(Target::Pipe(1), packet(1000)).is_accepted());

        shaper.flush_all();
        assert_eq!(shaper.queue_count(), 0);
        assert!(!shaper.admit(Target::Pipe(1), packet(1000)).is_accepted());
    }
}
