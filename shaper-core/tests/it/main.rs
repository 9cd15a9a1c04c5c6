use std::net::Ipv4Addr;

use bytes::Bytes;
use shaper_core::{FlowId, Packet, Shaper, ShaperOptions};

mod fixed_rate;
mod lifecycle;
mod wfq;

fn shaper() -> Shaper {
    let _ = tracing_subscriber::fmt::try_init();

    Shaper::new(ShaperOptions::default().seed(42), Vec::new()).unwrap()
}

fn flow(host: u8, port: u16) -> FlowId {
    FlowId::new((Ipv4Addr::new(10, 0, 0, host), port), (Ipv4Addr::new(10, 0, 1, 1), 80), 17)
}

/// A packet of `len` bytes whose first byte is `tag`, to tell packets apart on egress.
fn packet(flow: FlowId, len: usize, tag: u8) -> Packet {
    let mut payload = vec![0u8; len];
    if let Some(first) = payload.first_mut() {
        *first = tag;
    }
    Packet::new(Bytes::from(payload), flow)
}
