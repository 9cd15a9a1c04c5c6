use shaper_core::{
    ConfigError, DropReason, FlowId, FlowSetConfig, PipeConfig, QueueLimit, RedConfig, Shaper,
    Target,
};

use crate::{flow, packet, shaper};

fn trace(shaper: &mut Shaper) -> Vec<(u64, u8, Option<Target>)> {
    for round in 0..50u8 {
        for host in 1..=4 {
            let _ = shaper.admit(Target::Pipe(1), packet(flow(host, 1000), 200 + host as usize, round));
            let _ = shaper.admit(Target::Queue(2), packet(flow(host, 2000), 700, round));
        }
        shaper.advance(3);
    }
    shaper.advance(2000);

    shaper.egress().iter().map(|p| (p.output_time(), p.payload()[0], p.target())).collect()
}

fn configure(shaper: &mut Shaper) {
    let pipe = PipeConfig::new(1)
        .bandwidth(512_000)
        .delay(20)
        .mask(FlowId { src_ip: u32::MAX, ..Default::default() })
        .red(RedConfig::new(0.02, 5, 15, 0.1).gentle());
    shaper.configure_pipe(pipe).unwrap();
    shaper
        .configure_flowset(FlowSetConfig::new(2, 1).weight(2).queue_limit(QueueLimit::Bytes(20_000)))
        .unwrap();
}

#[test]
fn identical_reconfiguration_changes_nothing() {
    let mut once = shaper();
    configure(&mut once);

    let mut twice = shaper();
    configure(&mut twice);
    configure(&mut twice);
    assert_eq!(twice.queue_count(), 0);

    let expected = trace(&mut once);
    assert!(!expected.is_empty());
    assert_eq!(trace(&mut twice), expected);
    assert_eq!(once.stats(), twice.stats());

    // Queues that already exist are kept, not duplicated.
    let queues = twice.queue_count();
    configure(&mut twice);
    assert_eq!(twice.queue_count(), queues);
}

#[test]
fn deleting_leaves_no_dangling_references() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(100_000).mask(FlowId::mask_all())).unwrap();
    shaper.configure_pipe(PipeConfig::new(3).bandwidth(100_000)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(2, 1).mask(FlowId::mask_all())).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(4, 3)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(5, 1).weight(3)).unwrap();

    let load = |shaper: &mut Shaper| {
        for host in 1..=5 {
            let _ = shaper.admit(Target::Pipe(1), packet(flow(host, 1), 500, host));
            let _ = shaper.admit(Target::Queue(2), packet(flow(host, 2), 500, host));
            let _ = shaper.admit(Target::Queue(4), packet(flow(host, 4), 500, host));
            let _ = shaper.admit(Target::Queue(5), packet(flow(host, 5), 500, host));
        }
    };

    load(&mut shaper);
    shaper.advance(25);
    load(&mut shaper);
    assert!(shaper.heap_references(Target::Queue(2)) > 0);

    shaper.delete_flowset(2).unwrap();
    assert_eq!(shaper.heap_references(Target::Queue(2)), 0);
    assert!(shaper.snapshot().flowset(2).is_none());
    assert_eq!(
        shaper.admit(Target::Queue(2), packet(flow(1, 2), 10, 0)).reason(),
        Some(DropReason::NoSuchTarget)
    );

    shaper.advance(25);
    shaper.delete_pipe(1).unwrap();
    assert_eq!(shaper.heap_references(Target::Pipe(1)), 0);
    assert_eq!(shaper.heap_references(Target::Queue(5)), 0);

    // The flow set attached to the deleted pipe survives, emptied.
    let snapshot = shaper.snapshot();
    assert!(snapshot.pipe(1).is_none());
    assert!(snapshot.flowset(5).unwrap().queues.is_empty());
    assert_eq!(
        shaper.admit(Target::Queue(5), packet(flow(1, 5), 10, 0)).reason(),
        Some(DropReason::NoPipe)
    );

    // The other pipe is untouched.
    let delivered = shaper.egress().iter().filter(|p| p.target() == Some(Target::Queue(4))).count();
    shaper.advance(2000);
    let after = shaper.egress().iter().filter(|p| p.target() == Some(Target::Queue(4))).count();
    assert_eq!(after, 10);
    assert!(after > delivered);

    // Re-creating the pipe brings the flow set back into service.
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(100_000)).unwrap();
    assert!(shaper.admit(Target::Queue(5), packet(flow(1, 5), 10, 0)).is_accepted());
    shaper.advance(10);
    assert_eq!(shaper.egress().last().unwrap().target(), Some(Target::Queue(5)));

    assert_eq!(shaper.delete_pipe(9), Err(ConfigError::NoSuchPipe(9)));
    assert_eq!(shaper.delete_flowset(2), Err(ConfigError::NoSuchFlowSet(2)));
}

#[test]
fn flush_forgets_everything() {
    let mut shaper = shaper();
    configure(&mut shaper);
    for host in 1..=4 {
        let _ = shaper.admit(Target::Pipe(1), packet(flow(host, 1000), 1000, 0));
        let _ = shaper.admit(Target::Queue(2), packet(flow(host, 1000), 1000, 0));
    }

    let accepted = shaper.stats().accepted;
    assert!(accepted > 0);
    shaper.flush_all();

    let snapshot = shaper.snapshot();
    assert!(snapshot.pipes.is_empty() && snapshot.flowsets.is_empty());
    assert_eq!(shaper.queue_count(), 0);
    assert_eq!(shaper.stats().accepted, accepted);
    assert_eq!(
        shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 10, 0)).reason(),
        Some(DropReason::NoSuchTarget)
    );

    let delivered = shaper.egress().len();
    shaper.advance(5000);
    assert_eq!(shaper.egress().len(), delivered);
}

#[test]
fn snapshots_do_not_disturb_scheduling() {
    let mut plain = shaper();
    configure(&mut plain);
    let expected = trace(&mut plain);

    let mut observed = shaper();
    configure(&mut observed);
    for round in 0..50u8 {
        for host in 1..=4 {
            let _ = observed.admit(Target::Pipe(1), packet(flow(host, 1000), 200 + host as usize, round));
            let _ = observed.admit(Target::Queue(2), packet(flow(host, 2000), 700, round));
        }
        for _ in 0..3 {
            let first = observed.snapshot().to_string();
            assert_eq!(observed.snapshot().to_string(), first);
            observed.on_tick();
        }
    }
    observed.advance(2000);

    let got: Vec<_> =
        observed.egress().iter().map(|p| (p.output_time(), p.payload()[0], p.target())).collect();
    assert_eq!(got, expected);
}

#[test]
fn tick_rate_change_rescales_delays() {
    let mut shaper = shaper();
    configure(&mut shaper);
    assert_eq!(shaper.snapshot().pipe(1).unwrap().delay, 20);

    shaper.set_hz(100).unwrap();
    assert_eq!(shaper.hz(), 100);
    let snapshot = shaper.snapshot();
    assert_eq!(snapshot.pipe(1).unwrap().delay, 2);
    assert_eq!(snapshot.pipe(1).unwrap().delay_ms, 20);

    // One tick to send 100 bytes at 512 kbit/s, then two ticks of delay.
    assert!(shaper.admit(Target::Pipe(1), packet(flow(1, 1000), 100, 0)).is_accepted());
    shaper.advance(2);
    assert!(shaper.egress().is_empty());
    shaper.on_tick();
    assert_eq!(shaper.egress().len(), 1);
    assert_eq!(shaper.egress()[0].output_time(), 3);
}
