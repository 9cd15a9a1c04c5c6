use bytes::Bytes;
use futures::StreamExt;
use std::{net::Ipv4Addr, time::Duration};
use tokio::time::{timeout, Instant};

use shaper::{FlowId, FlowSetConfig, Packet, PipeConfig, ShaperHandle, ShaperOptions, Target};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let (handle, mut egress) = ShaperHandle::spawn(ShaperOptions::default()).unwrap();

    // A 1 Mbit/s link with 40 ms of latency, shared 1:3 by two flow sets.
    handle.configure_pipe(PipeConfig::new(1).bandwidth(1_000_000).delay(40)).unwrap();
    handle.configure_flowset(FlowSetConfig::new(1, 1).weight(1)).unwrap();
    handle.configure_flowset(FlowSetConfig::new(2, 1).weight(3)).unwrap();

    let bulk = FlowId::new((Ipv4Addr::new(10, 0, 0, 1), 5001), (Ipv4Addr::new(10, 0, 1, 1), 80), 6);
    let interactive =
        FlowId::new((Ipv4Addr::new(10, 0, 0, 2), 5002), (Ipv4Addr::new(10, 0, 1, 1), 22), 6);

    let producer = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let payload = Bytes::from(vec![0u8; 1250]);
            for _ in 0..40 {
                let _ = handle.admit(Target::Queue(1), Packet::new(payload.clone(), bulk));
                let _ = handle.admit(Target::Queue(2), Packet::new(payload.clone(), interactive));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let start = Instant::now();
    let mut received = [0usize; 2];
    while let Ok(Some(packet)) = timeout(Duration::from_secs(1), egress.next()).await {
        match packet.target() {
            Some(Target::Queue(1)) => received[0] += 1,
            Some(Target::Queue(2)) => received[1] += 1,
            _ => {}
        }
    }

    producer.await.unwrap();
    tracing::info!(
        elapsed = ?start.elapsed(),
        bulk = received[0],
        interactive = received[1],
        "link drained"
    );
    println!("{}", handle.snapshot());
}
