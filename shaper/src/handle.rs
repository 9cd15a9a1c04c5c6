use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use shaper_core::{
    ConfigError, FlowSetConfig, Packet, PipeConfig, Shaper, ShaperOptions, ShaperStats, Snapshot,
    Target, Tick, Verdict,
};

use crate::{
    driver::TickDriver, ChannelEgress, Command, EgressStream, Error, DEFAULT_BUFFER_SIZE,
    DEFAULT_EGRESS_BUFFER,
};

/// A shared handle to a [`Shaper`] driven by a tokio task. Cloning is cheap; the tick task stops
/// once every clone is dropped or [`ShaperHandle::shutdown`] is called.
///
/// Every method takes the engine lock and runs to completion, no method waits for ticks.
#[derive(Debug, Clone)]
pub struct ShaperHandle {
    /// The engine, shared with the tick driver.
    shaper: Arc<Mutex<Shaper<ChannelEgress>>>,
    /// Command channel to the tick driver.
    to_driver: mpsc::Sender<Command>,
    /// Packets the egress could not hand to the stream.
    egress_dropped: Arc<AtomicU64>,
}

impl ShaperHandle {
    /// Creates an engine and spawns its tick driver on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn(options: ShaperOptions) -> Result<(Self, EgressStream), ConfigError> {
        Self::spawn_with_buffer(options, DEFAULT_EGRESS_BUFFER)
    }

    /// Like [`ShaperHandle::spawn`], buffering up to `buffer` delivered packets for the stream.
    /// Packets delivered while the buffer is full are dropped.
    pub fn spawn_with_buffer(
        options: ShaperOptions,
        buffer: usize,
    ) -> Result<(Self, EgressStream), ConfigError> {
        let (egress, stream) = ChannelEgress::channel(buffer.max(1));
        let egress_dropped = egress.dropped_counter();
        let shaper = Arc::new(Mutex::new(Shaper::new(options, egress)?));

        let (to_driver, from_handle) = mpsc::channel(DEFAULT_BUFFER_SIZE);
        let driver = TickDriver::new(Arc::clone(&shaper), from_handle);

        debug!(hz = shaper.lock().hz(), "spawning tick driver");
        tokio::spawn(driver);

        Ok((Self { shaper, to_driver, egress_dropped }, stream))
    }

    /// Admits `packet` into pipe or flow set `target`.
    pub fn admit(&self, target: Target, packet: Packet) -> Verdict {
        self.shaper.lock().admit(target, packet)
    }

    pub fn configure_pipe(&self, config: PipeConfig) -> Result<(), ConfigError> {
        self.shaper.lock().configure_pipe(config)
    }

    pub fn configure_flowset(&self, config: FlowSetConfig) -> Result<(), ConfigError> {
        self.shaper.lock().configure_flowset(config)
    }

    pub fn delete_pipe(&self, nr: u32) -> Result<(), ConfigError> {
        self.shaper.lock().delete_pipe(nr)
    }

    pub fn delete_flowset(&self, nr: u32) -> Result<(), ConfigError> {
        self.shaper.lock().delete_flowset(nr)
    }

    /// Deletes every pipe and flow set.
    pub fn flush_all(&self) {
        self.shaper.lock().flush_all();
    }

    /// Drops every queued packet, keeping the configuration. Returns the number of dropped
    /// packets.
    pub fn drain(&self) -> usize {
        self.shaper.lock().drain()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shaper.lock().snapshot()
    }

    pub fn stats(&self) -> ShaperStats {
        self.shaper.lock().stats().clone()
    }

    /// The engine clock.
    pub fn now(&self) -> Tick {
        self.shaper.lock().now()
    }

    /// Packets delivered while the [`EgressStream`] was full or dropped.
    #[inline]
    pub fn egress_dropped(&self) -> u64 {
        self.egress_dropped.load(Ordering::Relaxed)
    }

    /// Changes the tick rate of the engine and of the driver.
    pub async fn set_hz(&self, hz: u32) -> Result<(), Error> {
        let hz = {
            let mut shaper = self.shaper.lock();
            shaper.set_hz(hz)?;
            shaper.hz()
        };

        self.to_driver.send(Command::SetHz(hz)).await.map_err(|_| Error::Closed)
    }

    /// Stops the tick driver. Queued packets stay where they are until the last handle is
    /// dropped.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.to_driver.send(Command::Shutdown).await.map_err(|_| Error::Closed)
    }

    /// Returns `true` once the tick driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.to_driver.is_closed()
    }
}
