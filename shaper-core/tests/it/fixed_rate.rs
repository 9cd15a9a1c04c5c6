use shaper_core::{DropReason, FlowId, PipeConfig, QueueLimit, RedConfig, Target};

use crate::{flow, packet, shaper};

#[test]
fn packet_waits_for_its_transmission_time() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(8_000)).unwrap();

    assert!(shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 1000, 0)).is_accepted());

    shaper.advance(999);
    assert!(shaper.egress().is_empty());

    shaper.on_tick();
    assert_eq!(shaper.egress().len(), 1);
    assert_eq!(shaper.egress()[0].output_time(), 1000);
    assert_eq!(shaper.egress()[0].target(), Some(Target::Pipe(1)));
}

#[test]
fn delay_line_keeps_arrival_order() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).delay(50)).unwrap();

    for tag in 1..=3 {
        assert!(shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 100, tag)).is_accepted());
    }

    shaper.advance(49);
    assert!(shaper.egress().is_empty());
    assert_eq!(shaper.snapshot().pipe(1).unwrap().backlog, 3);

    shaper.on_tick();
    let tags: Vec<u8> = shaper.egress().iter().map(|p| p.payload()[0]).collect();
    assert_eq!(tags, [1, 2, 3]);
    assert!(shaper.egress().iter().all(|p| p.output_time() == 50));
}

#[test]
fn full_queue_drops_the_excess() {
    let mut shaper = shaper();
    shaper
        .configure_pipe(PipeConfig::new(1).bandwidth(8_000).queue_limit(QueueLimit::Packets(5)))
        .unwrap();

    // The first packet is held for credit, so nothing leaves the queue meanwhile.
    let verdicts: Vec<_> =
        (0..6).map(|_| shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 100, 0))).collect();

    assert!(verdicts[..5].iter().all(|v| v.is_accepted()));
    assert_eq!(verdicts[5].reason(), Some(DropReason::QueueFull));

    let snapshot = shaper.snapshot();
    let queue = &snapshot.pipe(1).unwrap().flowset.queues[0];
    assert_eq!(queue.len, 5);
    assert_eq!(queue.drops, 1);
    assert_eq!(queue.tot_pkts, 6);
    assert_eq!(snapshot.stats.drops.queue_full, 1);
}

/// Packets queued back to back leave at `ceil(sum(len) * 8 * hz / bw)`, however they arrived.
#[test]
fn backlogged_queue_pays_exactly_for_its_bytes() {
    const SIZES: [usize; 5] = [100, 1500, 700, 40, 1000];
    // 3340 bytes at 64 kbit/s: 417.5 ms.
    const LAST: u64 = 418;

    for split in [SIZES.len(), 2] {
        let mut shaper = shaper();
        shaper.configure_pipe(PipeConfig::new(1).bandwidth(64_000)).unwrap();

        for (i, &len) in SIZES.iter().enumerate() {
            if i == split {
                // Still busy with the first packets.
                shaper.advance(5);
            }
            assert!(shaper.admit(Target::Pipe(1), packet(flow(1, 1000), len, i as u8)).is_accepted());
        }

        shaper.advance(LAST - 1 - shaper.now());
        assert_eq!(shaper.egress().len(), SIZES.len() - 1, "split at {split}");

        shaper.on_tick();
        let egress = shaper.egress();
        assert_eq!(egress.len(), SIZES.len());
        assert_eq!(egress.last().unwrap().output_time(), LAST);
        assert!(egress.windows(2).all(|w| w[0].output_time() <= w[1].output_time()));
    }
}

#[test]
fn masked_pipe_serves_every_flow_at_full_rate() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(8_000).mask(FlowId::mask_all())).unwrap();

    for host in 1..=3 {
        assert!(shaper.admit(Target::Pipe(1), packet(flow(host, 1000), 1000, host)).is_accepted());
    }
    assert_eq!(shaper.snapshot().pipe(1).unwrap().flowset.queues.len(), 3);

    shaper.advance(1000);
    assert_eq!(shaper.egress().len(), 3);
    assert!(shaper.egress().iter().all(|p| p.output_time() == 1000));
}

#[test]
fn red_drops_early_under_sustained_overload() {
    let mut shaper = shaper();
    shaper
        .configure_pipe(PipeConfig::new(1).bandwidth(80_000).red(RedConfig::new(0.2, 2, 8, 0.5)))
        .unwrap();

    // Ten times what the pipe can carry.
    let mut offered = 0;
    for _ in 0..500 {
        let _ = shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 1000, 0));
        offered += 1;
        shaper.advance(10);
    }

    let stats = shaper.stats();
    assert!(stats.drops.red > 0);
    assert_eq!(stats.drops.queue_full, 0);
    assert_eq!(stats.accepted + stats.drops.total(), offered);

    let snapshot = shaper.snapshot();
    let queue = &snapshot.pipe(1).unwrap().flowset.queues[0];
    assert!(queue.len < 20, "queue grew to {}", queue.len);
    assert!(queue.red_avg > 2.0);
}

#[test]
fn loss_rate_is_applied_per_packet() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).plr(0.5)).unwrap();

    for _ in 0..1000 {
        let _ = shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 64, 0));
    }

    let lost = shaper.stats().drops.random_loss;
    assert!((400..=600).contains(&lost), "lost {lost}");
    assert_eq!(shaper.egress().len() as u64, 1000 - lost);
}
