use crate::{
    error::ConfigError,
    packet::FlowId,
    red::{RedConfig, RedEnv, RedParams},
    Tick,
};

/// Highest accepted tick rate, higher values are clamped.
pub const MAX_HZ: u32 = 10_000;
/// Highest accepted flow set weight.
pub const MAX_WEIGHT: u32 = 100;
/// Queue limit used when none is given.
pub const DEFAULT_QUEUE_PACKETS: u32 = 50;
/// Highest accepted queue limit in packets.
pub const MAX_QUEUE_PACKETS: u32 = 100;
/// Highest accepted queue limit in bytes.
pub const MAX_QUEUE_BYTES: u32 = 1024 * 1024;
/// Bounds of the per flow set hash table size.
pub const MIN_BUCKETS: usize = 4;
pub const MAX_BUCKETS: usize = 65536;
/// Full scale of the random loss probability.
pub(crate) const PLR_MAX: u32 = 0x7fff_ffff;

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaperOptions {
    pub(crate) hz: u32,
    pub(crate) hash_size: usize,
    pub(crate) max_chain_ratio: usize,
    pub(crate) expire: bool,
    pub(crate) red_lookup_depth: usize,
    pub(crate) red_avg_pkt_size: u32,
    pub(crate) red_max_pkt_size: u32,
    pub(crate) max_queues: usize,
    pub(crate) seed: Option<u64>,
}

impl Default for ShaperOptions {
    fn default() -> Self {
        Self {
            hz: 1000,
            hash_size: 64,
            max_chain_ratio: 16,
            expire: true,
            red_lookup_depth: 256,
            red_avg_pkt_size: 512,
            red_max_pkt_size: 1500,
            max_queues: 65536,
            seed: None,
        }
    }
}

impl ShaperOptions {
    /// Sets the tick rate in Hz. Must be non-zero, values above [`MAX_HZ`] are clamped.
    pub fn hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    /// Sets the default number of hash buckets of a masked flow set.
    pub fn hash_size(mut self, hash_size: usize) -> Self {
        self.hash_size = hash_size;
        self
    }

    /// Sets the number of flow queues per bucket above which idle queues are expired and,
    /// failing that, new flows share the overflow queue.
    pub fn max_chain_ratio(mut self, ratio: usize) -> Self {
        self.max_chain_ratio = ratio;
        self
    }

    /// Enables or disables expiry of idle queues during lookups.
    pub fn expire(mut self, expire: bool) -> Self {
        self.expire = expire;
        self
    }

    pub fn red_lookup_depth(mut self, depth: usize) -> Self {
        self.red_lookup_depth = depth;
        self
    }

    pub fn red_avg_pkt_size(mut self, size: u32) -> Self {
        self.red_avg_pkt_size = size;
        self
    }

    pub fn red_max_pkt_size(mut self, size: u32) -> Self {
        self.red_max_pkt_size = size;
        self
    }

    /// Sets the total number of flow queues the engine may hold at once.
    pub fn max_queues(mut self, max_queues: usize) -> Self {
        self.max_queues = max_queues;
        self
    }

    /// Seeds the random number generator used by RED and random loss.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks and normalises the options.
    pub(crate) fn validate(mut self) -> Result<Self, ConfigError> {
        self.hz = clamp_hz(self.hz)?;
        self.hash_size = self.hash_size.clamp(MIN_BUCKETS, MAX_BUCKETS);
        self.max_chain_ratio = self.max_chain_ratio.max(1);
        self.red_avg_pkt_size = self.red_avg_pkt_size.max(1);
        self.red_max_pkt_size = self.red_max_pkt_size.max(1);

        if self.red_lookup_depth == 0 {
            return Err(ConfigError::InvalidRed("lookup depth must be > 0"));
        }

        Ok(self)
    }

    pub(crate) fn red_env(&self, bandwidth: u64) -> RedEnv {
        RedEnv {
            hz: self.hz,
            bandwidth,
            lookup_depth: self.red_lookup_depth,
            avg_pkt_size: self.red_avg_pkt_size,
            max_pkt_size: self.red_max_pkt_size,
        }
    }
}

pub(crate) fn clamp_hz(hz: u32) -> Result<u32, ConfigError> {
    if hz == 0 {
        return Err(ConfigError::InvalidHz);
    }

    Ok(hz.min(MAX_HZ))
}

/// Converts a delay in milliseconds to ticks, rounding down.
#[inline]
pub(crate) fn ms_to_ticks(ms: u64, hz: u32) -> Tick {
    ms.saturating_mul(u64::from(hz)) / 1000
}

/// Queue size limit of every flow queue of a flow set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLimit {
    /// Drop when the queue already holds this many packets.
    Packets(u32),
    /// Drop when the queue holds more than this many bytes.
    Bytes(u32),
}

impl Default for QueueLimit {
    fn default() -> Self {
        Self::Packets(DEFAULT_QUEUE_PACKETS)
    }
}

impl QueueLimit {
    #[inline]
    pub fn is_bytes(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }

    fn validate(self) -> Result<Self, ConfigError> {
        match self {
            Self::Packets(0) | Self::Bytes(0) => Ok(Self::default()),
            Self::Packets(n) if n > MAX_QUEUE_PACKETS => {
                Err(ConfigError::QueueSize("at most 100 packets"))
            }
            Self::Bytes(n) if n > MAX_QUEUE_BYTES => Err(ConfigError::QueueSize("at most 1 MiB")),
            limit => Ok(limit),
        }
    }
}

/// Queueing policy shared by pipes and flow sets.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueParams {
    pub limit: QueueLimit,
    /// Probability of dropping a packet at random, `0..=1`.
    pub plr: f64,
    /// Flow mask; an empty mask keeps a single queue.
    pub mask: FlowId,
    /// Hash buckets for masked flow sets, 0 for the engine default.
    pub buckets: usize,
    pub red: Option<RedConfig>,
    /// Do not report drops as errors to the caller.
    pub no_error: bool,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            limit: QueueLimit::default(),
            plr: 0.0,
            mask: FlowId::default(),
            buckets: 0,
            red: None,
            no_error: false,
        }
    }
}

impl QueueParams {
    /// Validates the policy against the engine options and the bandwidth RED sees.
    pub(crate) fn validate(
        &self,
        weight: u32,
        bandwidth: u64,
        options: &ShaperOptions,
    ) -> Result<FlowSetParams, ConfigError> {
        let weight = match weight {
            0 => 1,
            w if w > MAX_WEIGHT => return Err(ConfigError::Weight { weight: w, max: MAX_WEIGHT }),
            w => w,
        };

        if !(0.0..=1.0).contains(&self.plr) {
            return Err(ConfigError::LossRate(self.plr));
        }

        let buckets = if self.mask.is_empty() {
            1
        } else {
            let buckets = if self.buckets == 0 { options.hash_size } else { self.buckets };
            buckets.clamp(MIN_BUCKETS, MAX_BUCKETS)
        };

        let red = match &self.red {
            Some(config) => Some(RedParams::new(config, &options.red_env(bandwidth))?),
            None => None,
        };

        Ok(FlowSetParams {
            weight: u64::from(weight),
            limit: self.limit.validate()?,
            plr: (self.plr * f64::from(PLR_MAX)) as u32,
            mask: self.mask,
            buckets,
            red,
            no_error: self.no_error,
        })
    }
}

/// Validated queueing policy of a flow set.
#[derive(Debug, Clone)]
pub(crate) struct FlowSetParams {
    pub(crate) weight: u64,
    pub(crate) limit: QueueLimit,
    /// Loss probability scaled to [`PLR_MAX`].
    pub(crate) plr: u32,
    pub(crate) mask: FlowId,
    /// Hash buckets, not counting the overflow bucket.
    pub(crate) buckets: usize,
    pub(crate) red: Option<RedParams>,
    pub(crate) no_error: bool,
}

impl FlowSetParams {
    #[inline]
    pub(crate) fn is_masked(&self) -> bool {
        !self.mask.is_empty()
    }
}

macro_rules! queue_builders {
    () => {
        /// Sets the queue size limit of each flow queue.
        pub fn queue_limit(mut self, limit: QueueLimit) -> Self {
            self.queue.limit = limit;
            self
        }

        /// Sets the random packet loss probability, `0..=1`.
        pub fn plr(mut self, plr: f64) -> Self {
            self.queue.plr = plr;
            self
        }

        /// Separates traffic into one queue per distinct masked flow id.
        pub fn mask(mut self, mask: FlowId) -> Self {
            self.queue.mask = mask;
            self
        }

        /// Sets the number of hash buckets used to look up flow queues.
        pub fn buckets(mut self, buckets: usize) -> Self {
            self.queue.buckets = buckets;
            self
        }

        /// Enables RED instead of tail drop.
        pub fn red(mut self, red: RedConfig) -> Self {
            self.queue.red = Some(red);
            self
        }

        /// Reports drops as silent.
        pub fn no_error(mut self) -> Self {
            self.queue.no_error = true;
            self
        }
    };
}

/// Configuration of a pipe: a bandwidth and delay limited link with its own queueing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeConfig {
    pub nr: u32,
    /// Bandwidth in bits per second, 0 for unlimited.
    pub bandwidth: u64,
    /// Propagation delay in milliseconds.
    pub delay_ms: u64,
    pub queue: QueueParams,
}

impl PipeConfig {
    pub fn new(nr: u32) -> Self {
        Self { nr, bandwidth: 0, delay_ms: 0, queue: QueueParams::default() }
    }

    /// Sets the bandwidth in bits per second.
    pub fn bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Sets the propagation delay in milliseconds.
    pub fn delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    queue_builders!();
}

/// Configuration of a flow set sharing the bandwidth of its parent pipe through WF2Q+.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSetConfig {
    pub nr: u32,
    /// The parent pipe.
    pub parent: u32,
    /// Share of the parent's bandwidth given to each flow queue, `1..=100`.
    pub weight: u32,
    pub queue: QueueParams,
}

impl FlowSetConfig {
    pub fn new(nr: u32, parent: u32) -> Self {
        Self { nr, parent, weight: 1, queue: QueueParams::default() }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    queue_builders!();
}
