//! Scheduling: fixed-rate queues, WF2Q+ pipes, the delay line and the tick driver.

use tracing::{error, trace, warn};

use crate::{
    fixed::service,
    flow::QueueKey,
    heap::{key_gt, key_leq, key_lt, max_key, Heap},
    packet::{Egress, Target},
    pipe::Pipe,
    shaper::Shaper,
    stats::ShaperStats,
    Tick,
};

impl<E: Egress> Shaper<E> {
    /// Advances the clock by one tick and runs every event that is due.
    pub fn on_tick(&mut self) {
        self.now = self.now.wrapping_add(1);
        let now = self.now;

        while let Some(key) = self.ready_heap.peek().map(|e| e.key) {
            if !key_leq(key, now) {
                break;
            }
            let entry = self.ready_heap.pop();
            if key_lt(key, now) {
                warn!(tick = now, late = now.wrapping_sub(key), "ready heap is late");
            }
            self.ready_event(entry.object);
        }

        while let Some(key) = self.wfq_ready_heap.peek().map(|e| e.key) {
            if !key_leq(key, now) {
                break;
            }
            let entry = self.wfq_ready_heap.pop();
            if key_lt(key, now) {
                warn!(tick = now, late = now.wrapping_sub(key), "wfq_ready heap is late");
            }
            self.ready_event_wfq(entry.object);
        }

        while let Some(key) = self.extract_heap.peek().map(|e| e.key) {
            if !key_leq(key, now) {
                break;
            }
            let entry = self.extract_heap.pop();
            if key_lt(key, now) {
                warn!(tick = now, late = now.wrapping_sub(key), "extract heap is late");
            }
            if let Some(pipe) = self.pipes.get_mut(&entry.object) {
                transmit(pipe, &mut self.extract_heap, &mut self.egress, &mut self.stats, now);
            }
        }

        self.sweep_idle();
    }

    /// Runs `ticks` ticks.
    pub fn advance(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.on_tick();
        }
    }

    /// Starts serving a fixed-rate queue that just received its first packet.
    pub(crate) fn schedule_fixed(&mut self, nr: u32, key: QueueKey, len: u64) {
        let now = self.now;
        let (Some(pipe), Some(queue)) = (self.pipes.get(&nr), self.queues.get_mut(key)) else {
            return;
        };

        let t = pipe.ticks_to_wait(len, queue.numbytes, self.options.hz);
        queue.sched_time = now;

        if t == 0 {
            self.ready_event(key);
        } else if let Err(err) = self.ready_heap.insert(now.wrapping_add(t), key) {
            error!(pipe = nr, %err, "cannot schedule flow queue");
        }
    }

    /// Credits a fixed-rate queue, moves every packet it can pay for to the delay line and
    /// reschedules it if packets remain.
    pub(crate) fn ready_event(&mut self, key: QueueKey) {
        let now = self.now;
        let hz = self.options.hz;

        let Some(queue) = self.queues.get_mut(key) else {
            warn!(tick = now, "ready event for a freed flow queue");
            return;
        };
        let Target::Pipe(nr) = queue.owner else {
            warn!(tick = now, owner = %queue.owner, "ready event for a WF2Q+ flow queue");
            return;
        };
        let Some(pipe) = self.pipes.get_mut(&nr) else {
            return;
        };

        let was_empty = pipe.delay_line.is_empty();
        queue.numbytes = pipe.credit(queue.numbytes, queue.sched_time, now);

        while let Some(len) = queue.head_len() {
            let cost = pipe.len_scaled(len, hz);
            if cost > queue.numbytes {
                break;
            }
            queue.numbytes -= cost;
            if let Some(packet) = queue.dequeue() {
                pipe.move_to_delay_line(packet, now);
            }
        }

        match queue.head_len() {
            Some(len) => {
                let t = pipe.ticks_to_wait(len, queue.numbytes, hz);
                queue.sched_time = now;
                if let Err(err) = self.ready_heap.insert(now.wrapping_add(t), key) {
                    error!(pipe = nr, %err, "cannot reschedule flow queue");
                }
            }
            None => {
                queue.red.q_time = now;
                queue.numbytes = 0;
            }
        }

        if was_empty {
            transmit(pipe, &mut self.extract_heap, &mut self.egress, &mut self.stats, now);
        }
    }

    /// Starts serving a WF2Q+ flow that just received its first packet.
    pub(crate) fn schedule_wfq(&mut self, nr: u32, key: QueueKey, len: u64) {
        let now = self.now;
        let Some(pipe) = self.pipes.get_mut(&nr) else {
            return;
        };
        let Some(queue) = self.queues.get_mut(key) else {
            return;
        };
        let Target::Queue(fs_nr) = queue.owner else {
            return;
        };
        let Some(fs) = self.flowsets.get_mut(&fs_nr) else {
            return;
        };

        if !queue.has_timestamps() {
            queue.start = pipe.v;
            queue.weight = fs.params.weight;
            pipe.sum += queue.weight;
        } else {
            pipe.idle_heap.extract(Some(&key));
            queue.start = max_key(queue.finish, pipe.v);
        }
        queue.finish = queue.start.wrapping_add(service(len, queue.weight));

        if pipe.scheduler_heap.is_empty() && pipe.not_eligible_heap.is_empty() {
            pipe.v = max_key(queue.start, pipe.v);
        }
        fs.backlogged += 1;

        if key_gt(queue.start, pipe.v) {
            if let Err(err) = pipe.not_eligible_heap.insert(queue.start, key) {
                error!(pipe = nr, %err, "cannot schedule flow");
            }
            return;
        }

        if let Err(err) = pipe.scheduler_heap.insert(queue.finish, key) {
            error!(pipe = nr, %err, "cannot schedule flow");
            return;
        }

        if pipe.numbytes >= 0 && !self.wfq_ready_heap.contains(&nr) {
            if pipe.scheduler_heap.len() != 1 {
                warn!(pipe = nr, eligible = pipe.scheduler_heap.len(), "pipe should have been idle");
            }
            pipe.sched_time = now;
            self.ready_event_wfq(nr);
        }
    }

    /// Serves a WF2Q+ pipe for as long as it has credit and backlogged flows.
    pub(crate) fn ready_event_wfq(&mut self, nr: u32) {
        let now = self.now;
        let hz = self.options.hz;

        let Some(pipe) = self.pipes.get_mut(&nr) else {
            return;
        };

        let was_empty = pipe.delay_line.is_empty();
        pipe.numbytes = pipe.credit(pipe.numbytes, pipe.sched_time, now);

        while pipe.numbytes >= 0 &&
            !(pipe.scheduler_heap.is_empty() && pipe.not_eligible_heap.is_empty())
        {
            if !pipe.scheduler_heap.is_empty() {
                let key = pipe.scheduler_heap.pop().object;
                let Some(queue) = self.queues.get_mut(key) else {
                    warn!(pipe = nr, "freed flow queue in scheduler heap");
                    continue;
                };
                let Some(packet) = queue.dequeue() else {
                    warn!(pipe = nr, "empty flow queue in scheduler heap");
                    continue;
                };

                let len = packet.len() as u64;
                pipe.numbytes = pipe.numbytes.saturating_sub(pipe.len_scaled(len, hz));
                pipe.move_to_delay_line(packet, now);

                pipe.v = pipe.v.wrapping_add(service(len, pipe.sum));
                queue.start = queue.finish;

                match queue.head_len() {
                    None => {
                        queue.red.q_time = now;
                        if let Target::Queue(fs_nr) = queue.owner {
                            if let Some(fs) = self.flowsets.get_mut(&fs_nr) {
                                fs.backlogged = fs.backlogged.saturating_sub(1);
                            }
                        }
                        if let Err(err) = pipe.idle_heap.insert(queue.finish, key) {
                            error!(pipe = nr, %err, "cannot park idle flow, dropping its timestamps");
                            queue.invalidate_timestamps();
                            pipe.sum = pipe.sum.saturating_sub(queue.weight);
                        }
                    }
                    Some(next) => {
                        queue.finish = queue.finish.wrapping_add(service(next, queue.weight));
                        let inserted = if key_leq(queue.start, pipe.v) {
                            pipe.scheduler_heap.insert(queue.finish, key)
                        } else {
                            pipe.not_eligible_heap.insert(queue.start, key)
                        };
                        if let Err(err) = inserted {
                            error!(pipe = nr, %err, "cannot reschedule flow");
                        }
                    }
                }
            }

            // Everything in the scheduler heap is eligible, so V only needs to catch up with
            // the earliest start time once that heap is empty.
            if pipe.scheduler_heap.is_empty() {
                if let Some(entry) = pipe.not_eligible_heap.peek() {
                    pipe.v = max_key(pipe.v, entry.key);
                }
            }

            while let Some(start) = pipe.not_eligible_heap.peek().map(|e| e.key) {
                if !key_leq(start, pipe.v) {
                    break;
                }
                let key = pipe.not_eligible_heap.pop().object;
                let Some(queue) = self.queues.get(key) else {
                    continue;
                };
                if let Err(err) = pipe.scheduler_heap.insert(queue.finish, key) {
                    error!(pipe = nr, %err, "cannot promote flow");
                }
            }
        }

        if pipe.scheduler_heap.is_empty() &&
            pipe.not_eligible_heap.is_empty() &&
            pipe.numbytes >= 0 &&
            !pipe.idle_heap.is_empty()
        {
            // Quiescent: start virtual time over.
            for entry in pipe.idle_heap.iter() {
                if let Some(queue) = self.queues.get_mut(entry.object) {
                    queue.finish = 0;
                    queue.invalidate_timestamps();
                }
            }
            pipe.idle_heap.clear();
            pipe.sum = 0;
            pipe.v = 0;
            trace!(pipe = nr, tick = now, "reset virtual time");
        }

        if pipe.numbytes < 0 {
            // The last packet sent overdrew the credit: hold it back until the credit is
            // repaid and only serve the pipe again then.
            let bw = i128::from(pipe.bandwidth);
            let t = if bw > 0 {
                u64::try_from((bw - 1 - i128::from(pipe.numbytes)) / bw).unwrap_or(u64::MAX)
            } else {
                0
            };

            if let Some(tail) = pipe.delay_line.back_mut() {
                tail.delay_output(t);
            }
            pipe.sched_time = now;
            if !self.wfq_ready_heap.contains(&nr) {
                if let Err(err) = self.wfq_ready_heap.insert(now.wrapping_add(t), nr) {
                    error!(pipe = nr, %err, "cannot reschedule pipe");
                }
            }
        }

        if was_empty {
            transmit(pipe, &mut self.extract_heap, &mut self.egress, &mut self.stats, now);
        }
    }

    /// Invalidates idle flows whose finish time fell behind virtual time: they would restart
    /// at `V` anyway, so their weight no longer belongs in `sum`.
    fn sweep_idle(&mut self) {
        for pipe in self.pipes.values_mut() {
            while let Some(finish) = pipe.idle_heap.peek().map(|e| e.key) {
                if !key_lt(finish, pipe.v) {
                    break;
                }
                let key = pipe.idle_heap.pop().object;
                if let Some(queue) = self.queues.get_mut(key) {
                    queue.invalidate_timestamps();
                    pipe.sum = pipe.sum.saturating_sub(queue.weight);
                }
            }
        }
    }
}

/// Hands every due packet of the delay line to the egress and schedules the pipe for its
/// next one.
fn transmit<E: Egress>(
    pipe: &mut Pipe,
    extract_heap: &mut Heap<u32>,
    egress: &mut E,
    stats: &mut ShaperStats,
    now: Tick,
) {
    while pipe.delay_line.front().map_or(false, |p| key_leq(p.output_time(), now)) {
        let Some(packet) = pipe.delay_line.pop_front() else { break };
        stats.delivered += 1;
        egress.deliver(packet);
    }

    if let Some(head) = pipe.delay_line.front() {
        if let Err(err) = extract_heap.insert(head.output_time(), pipe.nr) {
            error!(pipe = pipe.nr, %err, "cannot schedule delay line");
        }
    }
}
