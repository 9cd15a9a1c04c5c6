//! Read-only listings of the engine state.

use std::fmt;

use crate::{
    config::QueueLimit,
    flow::QueueArena,
    flowset::FlowSet,
    heap::Key,
    packet::{Egress, FlowId, Target},
    pipe::Pipe,
    red::RedConfig,
    shaper::Shaper,
    stats::ShaperStats,
    Tick,
};

/// Everything configured in a [`Shaper`], with live counters.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub now: Tick,
    pub hz: u32,
    pub pipes: Vec<PipeSnapshot>,
    pub flowsets: Vec<FlowSetSnapshot>,
    pub stats: ShaperStats,
}

#[derive(Debug, Clone)]
pub struct PipeSnapshot {
    pub nr: u32,
    /// Bits per second, 0 for unlimited.
    pub bandwidth: u64,
    pub delay_ms: u64,
    /// Delay in ticks.
    pub delay: Tick,
    /// WF2Q+ virtual time. It is reset to zero whenever the pipe runs out of backlogged flows,
    /// so it does not grow monotonically across idle periods.
    pub v: Key,
    /// Sum of the weights of the flows holding valid timestamps.
    pub sum: u64,
    /// Packets on the delay line.
    pub backlog: usize,
    /// The pipe's own queueing policy and queues.
    pub flowset: FlowSetSnapshot,
}

#[derive(Debug, Clone)]
pub struct FlowSetSnapshot {
    pub target: Target,
    pub parent: u32,
    pub weight: u64,
    pub limit: QueueLimit,
    pub plr: f64,
    pub mask: FlowId,
    /// Hash buckets, not counting the overflow bucket.
    pub buckets: usize,
    pub red: Option<RedConfig>,
    pub no_error: bool,
    /// Flows with packets queued under WF2Q+.
    pub backlogged: usize,
    pub queues: Vec<FlowQueueSnapshot>,
}

#[derive(Debug, Clone)]
pub struct FlowQueueSnapshot {
    pub id: FlowId,
    pub hash_slot: usize,
    pub len: usize,
    pub len_bytes: u64,
    pub tot_pkts: u64,
    pub tot_bytes: u64,
    pub drops: u64,
    pub start: Key,
    pub finish: Key,
    /// RED average queue size, 0 without RED.
    pub red_avg: f64,
}

impl FlowSetSnapshot {
    fn capture(fs: &FlowSet, queues: &QueueArena) -> Self {
        let queues = fs
            .queue_keys()
            .filter_map(|key| queues.get(key))
            .map(|q| FlowQueueSnapshot {
                id: q.id,
                hash_slot: q.hash_slot,
                len: q.len(),
                len_bytes: q.len_bytes(),
                tot_pkts: q.tot_pkts,
                tot_bytes: q.tot_bytes,
                drops: q.drops,
                start: q.start,
                finish: q.finish,
                red_avg: q.red.avg.to_f64(),
            })
            .collect();

        Self {
            target: fs.ident,
            parent: fs.parent,
            weight: fs.params.weight,
            limit: fs.params.limit,
            plr: fs.config.plr,
            mask: fs.params.mask,
            buckets: fs.bucket_count(),
            red: fs.params.red.as_ref().map(|red| red.config),
            no_error: fs.params.no_error,
            backlogged: fs.backlogged,
            queues,
        }
    }

    /// Finds the queue serving the (already masked) flow `id`.
    pub fn queue(&self, id: &FlowId) -> Option<&FlowQueueSnapshot> {
        self.queues.iter().find(|q| q.id == *id)
    }
}

impl PipeSnapshot {
    fn capture(pipe: &Pipe, queues: &QueueArena) -> Self {
        Self {
            nr: pipe.nr,
            bandwidth: pipe.bandwidth,
            delay_ms: pipe.delay_ms,
            delay: pipe.delay,
            v: pipe.v,
            sum: pipe.sum,
            backlog: pipe.backlog(),
            flowset: FlowSetSnapshot::capture(&pipe.fs, queues),
        }
    }
}

impl Snapshot {
    pub fn pipe(&self, nr: u32) -> Option<&PipeSnapshot> {
        self.pipes.iter().find(|p| p.nr == nr)
    }

    pub fn flowset(&self, nr: u32) -> Option<&FlowSetSnapshot> {
        self.flowsets.iter().find(|fs| fs.target == Target::Queue(nr))
    }
}

impl<E: Egress> Shaper<E> {
    /// Lists every pipe, flow set and flow queue.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            now: self.now,
            hz: self.options.hz,
            pipes: self.pipes.values().map(|p| PipeSnapshot::capture(p, &self.queues)).collect(),
            flowsets: self
                .flowsets
                .values()
                .map(|fs| FlowSetSnapshot::capture(fs, &self.queues))
                .collect(),
            stats: self.stats.clone(),
        }
    }
}

struct Bandwidth(u64);

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0 as f64;
        match self.0 {
            0 => write!(f, "unlimited"),
            1_000_000.. => write!(f, "{:7.3} Mbit/s", b / 1_000_000.0),
            1_000.. => write!(f, "{:7.3} Kbit/s", b / 1_000.0),
            _ => write!(f, "{b:7.3} bit/s "),
        }
    }
}

impl FlowSetSnapshot {
    fn fmt_with_prefix(&self, f: &mut fmt::Formatter<'_>, prefix: &str) -> fmt::Result {
        write!(f, "{prefix} ")?;

        match self.limit {
            QueueLimit::Packets(n) => write!(f, "{n:3} sl.")?,
            QueueLimit::Bytes(n) if n >= 8192 => write!(f, "{} KB", n / 1024)?,
            QueueLimit::Bytes(n) => write!(f, "{n} B")?,
        }

        if self.plr > 0.0 {
            write!(f, "plr {:.6}", self.plr)?;
        }

        write!(f, " {} queues ({} buckets) ", self.queues.len(), self.buckets)?;

        match &self.red {
            Some(red) => writeln!(
                f,
                "\n\t {}RED w_q {:.6} min_th {} max_th {} max_p {:.6}",
                if red.gentle { 'G' } else { ' ' },
                red.w_q,
                red.min_th,
                red.max_th,
                red.max_p
            )?,
            None => writeln!(f, "droptail")?,
        }

        if self.queues.is_empty() {
            return Ok(());
        }

        writeln!(
            f,
            "    mask: 0x{:02x} 0x{:08x}/0x{:04x} -> 0x{:08x}/0x{:04x}",
            self.mask.proto, self.mask.src_ip, self.mask.src_port, self.mask.dst_ip, self.mask.dst_port
        )?;
        writeln!(f, "BKT Prot ___Source IP/port____ ____Dest. IP/port____ Tot_pkt/bytes Pkt/Byte Drp")?;

        for q in &self.queues {
            writeln!(
                f,
                "{:3} {} {:4} {:8} {:2} {:4} {:3}",
                q.hash_slot, q.id, q.tot_pkts, q.tot_bytes, q.len, q.len_bytes, q.drops
            )?;
        }

        Ok(())
    }
}

impl fmt::Display for PipeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = format!("{:05}: {} {:4} ms", self.nr, Bandwidth(self.bandwidth), self.delay_ms);
        self.flowset.fmt_with_prefix(f, &prefix)
    }
}

impl fmt::Display for FlowSetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nr = match self.target {
            Target::Pipe(nr) | Target::Queue(nr) => nr,
        };
        let prefix = format!("q{nr:05}: weight {} pipe {}", self.weight, self.parent);
        self.fmt_with_prefix(f, &prefix)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pipe in &self.pipes {
            write!(f, "{pipe}")?;
        }
        for fs in &self.flowsets {
            write!(f, "{fs}")?;
        }
        Ok(())
    }
}
