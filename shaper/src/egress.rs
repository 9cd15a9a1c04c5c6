use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use shaper_core::{Egress, Packet};

/// Hands delivered packets to an [`EgressStream`] without ever blocking the engine.
#[derive(Debug)]
pub struct ChannelEgress {
    to_stream: mpsc::Sender<Packet>,
    /// Packets lost because the stream was full or gone, shared with the handle.
    dropped: Arc<AtomicU64>,
}

impl ChannelEgress {
    /// Creates an egress buffering up to `buffer` packets for the returned stream.
    pub fn channel(buffer: usize) -> (Self, EgressStream) {
        let (to_stream, from_egress) = mpsc::channel(buffer);
        let egress = Self { to_stream, dropped: Arc::new(AtomicU64::new(0)) };

        (egress, EgressStream { from_egress })
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl Egress for ChannelEgress {
    fn deliver(&mut self, packet: Packet) {
        match self.to_stream.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(len = packet.len(), target = ?packet.target(), "egress stream full, dropping packet");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("egress stream closed, dropping packet");
            }
        }
    }
}

/// Packets leaving the delay lines, in delivery order. Ends once the engine is gone.
#[derive(Debug)]
pub struct EgressStream {
    from_egress: mpsc::Receiver<Packet>,
}

impl Stream for EgressStream {
    type Item = Packet;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().from_egress.poll_recv(cx)
    }
}
