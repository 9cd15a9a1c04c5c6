//! Random Early Detection.
//!
//! The average queue size is a low-pass filter of the instantaneous size,
//! `avg <- (1 - w_q) * avg + w_q * q_size`. While the queue sits empty the average decays as
//! `(1 - w_q)^(idle / s)`, read from a table precomputed at configuration time, where `s` is
//! the time needed to send an average-sized packet.
//!
//! Below `min_th` every packet is accepted, from `max_th` on every packet is dropped (gentle
//! RED instead keeps ramping the probability linearly up to 1 at `2 * max_th`), and in between
//! the drop probability grows linearly from 0 to `max_p`. The final draw is biased by the
//! number of packets accepted since the last drop, which spreads drops out instead of letting
//! them come in bursts.

use rand::Rng;

use crate::{error::ConfigError, fixed::Scaled, Tick};

/// User-facing RED parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedConfig {
    /// Weight of the instantaneous queue size in the average, `0 < w_q <= 1`.
    pub w_q: f64,
    /// Lower threshold, in packets or bytes depending on the queue limit.
    pub min_th: u32,
    /// Upper threshold, in packets or bytes depending on the queue limit.
    pub max_th: u32,
    /// Drop probability reached at `max_th`, `0 < max_p <= 1`.
    pub max_p: f64,
    /// Gentle RED: ramp from `max_p` to 1 between `max_th` and `2 * max_th` instead of
    /// dropping everything above `max_th`.
    pub gentle: bool,
}

impl RedConfig {
    pub fn new(w_q: f64, min_th: u32, max_th: u32, max_p: f64) -> Self {
        Self {
            w_q,
            min_th,
            max_th,
            max_p,
            gentle: false,
        }
    }

    /// Enables gentle RED.
    pub fn gentle(mut self) -> Self {
        self.gentle = true;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.w_q > 0.0 && self.w_q <= 1.0) {
            return Err(ConfigError::InvalidRed("0 < w_q <= 1"));
        }
        if !(self.max_p > 0.0 && self.max_p <= 1.0) {
            return Err(ConfigError::InvalidRed("0 < max_p <= 1"));
        }
        if self.max_th == 0 {
            return Err(ConfigError::InvalidRed("max_th must be > 0"));
        }
        if self.min_th >= self.max_th {
            return Err(ConfigError::InvalidRed("min_th must be < max_th"));
        }
        Ok(())
    }
}

/// The environment RED constants are derived from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RedEnv {
    pub(crate) hz: u32,
    /// Bandwidth of the pipe in bits/s; 0 for flow sets scheduled by WF2Q+.
    pub(crate) bandwidth: u64,
    pub(crate) lookup_depth: usize,
    pub(crate) avg_pkt_size: u32,
    pub(crate) max_pkt_size: u32,
}

/// Outcome of comparing the average against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Accept,
    Drop,
    /// Drop with the given base probability.
    Random(Scaled),
}

/// Validated RED configuration with its derived constants.
#[derive(Debug, Clone)]
pub(crate) struct RedParams {
    pub(crate) config: RedConfig,
    w_q: Scaled,
    min_th: Scaled,
    max_th: Scaled,
    max_p: Scaled,
    /// Idle ticks per lookup table step.
    lookup_step: u64,
    /// `lookup[i] = (1 - w_q)^(1 + i * lookup_step)`.
    lookup: Vec<Scaled>,
    max_pkt_size: i64,
}

impl RedParams {
    pub(crate) fn new(config: &RedConfig, env: &RedEnv) -> Result<Self, ConfigError> {
        config.validate()?;

        if env.lookup_depth == 0 {
            return Err(ConfigError::InvalidRed("lookup depth must be > 0"));
        }

        let w_q = Scaled::from_f64(config.w_q);
        if w_q == Scaled::ZERO {
            return Err(ConfigError::InvalidRed("w_q is below the fixed-point resolution"));
        }

        // Ticks needed to send an average packet. Unknown for WF2Q+ flow sets, which share
        // the bandwidth of their parent.
        let s = if env.bandwidth == 0 {
            0.0
        } else {
            (u64::from(env.hz) * u64::from(env.avg_pkt_size) * 8 / env.bandwidth) as f64
        };

        // (1 - w_q)^x drops below 1e-3 at about x = 3 / w_q.
        let idle = s * 3.0 / config.w_q;
        let lookup_step = ((idle as u64) / env.lookup_depth as u64).max(1);
        let lookup_weight = Scaled::from_f64((1.0 - config.w_q).powf(lookup_step as f64));

        let mut lookup = Vec::with_capacity(env.lookup_depth);
        lookup.push(Scaled::ONE - w_q);
        for i in 1..env.lookup_depth {
            lookup.push(lookup[i - 1].mul(lookup_weight));
        }

        Ok(Self {
            config: *config,
            w_q,
            min_th: Scaled::from_int(config.min_th.into()),
            max_th: Scaled::from_int(config.max_th.into()),
            max_p: Scaled::from_f64(config.max_p),
            lookup_step,
            lookup,
            max_pkt_size: i64::from(env.max_pkt_size.max(1)),
        })
    }

    #[cfg(test)]
    #[inline]
    pub(crate) fn lookup_step(&self) -> u64 {
        self.lookup_step
    }

    #[cfg(test)]
    #[inline]
    pub(crate) fn lookup_depth(&self) -> usize {
        self.lookup.len()
    }

    /// Average after `idle` ticks with an empty queue.
    fn decay(&self, avg: Scaled, idle: Tick) -> Scaled {
        let t = idle / self.lookup_step;
        match usize::try_from(t).ok().and_then(|t| self.lookup.get(t)) {
            Some(factor) => avg.mul(*factor),
            None => Scaled::ZERO,
        }
    }

    pub(crate) fn classify(&self, avg: Scaled, len: u64, bytes_mode: bool) -> Decision {
        if avg < self.min_th {
            return Decision::Accept;
        }

        let p_b = if avg >= self.max_th {
            if !self.config.gentle {
                return Decision::Drop;
            }
            // max_p at max_th, rising linearly to 1 at 2 * max_th and staying there.
            let ramp = (Scaled::ONE - self.max_p)
                .mul_ratio((avg - self.max_th).raw(), self.max_th.raw());
            (self.max_p + ramp).clamp_unit()
        } else {
            // 0 at min_th, rising linearly to max_p at max_th.
            self.max_p
                .mul_ratio((avg - self.min_th).raw(), (self.max_th - self.min_th).raw())
        };

        let p_b = if bytes_mode {
            p_b.mul_ratio(len as i64, self.max_pkt_size)
        } else {
            p_b
        };

        Decision::Random(p_b.clamp_unit())
    }

    /// Base drop probability for a given average, before the inter-drop bias.
    #[cfg(test)]
    pub(crate) fn drop_probability(&self, avg: Scaled, len: u64, bytes_mode: bool) -> Scaled {
        match self.classify(avg, len, bytes_mode) {
            Decision::Accept => Scaled::ZERO,
            Decision::Drop => Scaled::ONE,
            Decision::Random(p) => p,
        }
    }
}

/// Per-queue RED state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RedState {
    pub(crate) avg: Scaled,
    /// Packets accepted since the last drop, -1 right after leaving the random region.
    count: i64,
    /// Uniform value in `[0, 1)` the biased probability is compared against.
    random: i64,
    /// Tick at which the queue last became empty.
    pub(crate) q_time: Tick,
}

impl Default for RedState {
    fn default() -> Self {
        Self {
            avg: Scaled::ZERO,
            count: -1,
            random: 0,
            q_time: 0,
        }
    }
}

impl RedState {
    pub(crate) fn new(q_time: Tick) -> Self {
        Self { q_time, ..Self::default() }
    }

    /// Updates the average with the current queue size and decides whether the arriving
    /// packet of `len` bytes must be dropped.
    pub(crate) fn should_drop<R: Rng>(
        &mut self,
        params: &RedParams,
        q_size: u64,
        len: u64,
        bytes_mode: bool,
        now: Tick,
        rng: &mut R,
    ) -> bool {
        if q_size != 0 {
            let diff = Scaled::from_int(q_size as i64) - self.avg;
            self.avg = self.avg + diff.mul(params.w_q);
        } else if self.avg != Scaled::ZERO {
            self.avg = params.decay(self.avg, now.wrapping_sub(self.q_time));
        }

        let p_b = match params.classify(self.avg, len, bytes_mode) {
            Decision::Accept => {
                self.count = -1;
                return false;
            }
            Decision::Drop => {
                self.count = -1;
                tracing::trace!(avg = %self.avg, "red: forced drop");
                return true;
            }
            Decision::Random(p_b) => p_b,
        };

        self.count += 1;
        if self.count > 0 && p_b.mul(Scaled::from_int(self.count)).raw() > self.random {
            self.count = 0;
            self.random = draw(rng);
            tracing::trace!(avg = %self.avg, p_b = %p_b, "red: early drop");
            return true;
        }

        self.random = draw(rng);
        false
    }
}

#[inline]
fn draw<R: Rng>(rng: &mut R) -> i64 {
    i64::from(rng.gen::<u16>())
}
