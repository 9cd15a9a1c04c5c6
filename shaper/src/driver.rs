use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::debug;

use shaper_core::Shaper;

use crate::{ChannelEgress, Command};

/// The tick driver. Endless future that advances the engine clock once per tick period until
/// it is shut down or every handle is gone.
pub(crate) struct TickDriver {
    /// The engine, shared with the handles.
    pub(crate) shaper: Arc<Mutex<Shaper<ChannelEgress>>>,
    pub(crate) interval: Interval,
    /// Commands from the handles.
    pub(crate) from_handle: mpsc::Receiver<Command>,
}

impl TickDriver {
    pub(crate) fn new(
        shaper: Arc<Mutex<Shaper<ChannelEgress>>>,
        from_handle: mpsc::Receiver<Command>,
    ) -> Self {
        let hz = shaper.lock().hz();
        Self { shaper, interval: tick_interval(hz), from_handle }
    }
}

/// An interval firing `hz` times per second. Ticks that cannot be served in time are skipped,
/// so a slow tick never makes the next ones pile up.
pub(crate) fn tick_interval(hz: u32) -> Interval {
    let period = Duration::from_nanos(1_000_000_000 / u64::from(hz.max(1)));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl Future for TickDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.from_handle.poll_recv(cx) {
                Poll::Ready(Some(Command::SetHz(hz))) => {
                    debug!(hz, "restarting tick interval");
                    this.interval = tick_interval(hz);
                    continue;
                }
                Poll::Ready(Some(Command::Shutdown)) => {
                    debug!("shutdown requested, stopping tick driver");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    debug!("all handles dropped, stopping tick driver");
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            if this.interval.poll_tick(cx).is_ready() {
                this.shaper.lock().on_tick();
                continue;
            }

            return Poll::Pending;
        }
    }
}
