use shaper_core::{FlowId, FlowSetConfig, PipeConfig, Shaper, Target};

use crate::{flow, packet, shaper};

/// One 1000 byte packet per tick.
const BANDWIDTH: u64 = 8_000_000;

#[test]
fn weights_split_the_pipe() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(BANDWIDTH)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(1, 1).weight(1)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(2, 1).weight(3)).unwrap();

    let offer = |shaper: &mut Shaper| {
        let _ = shaper.admit(Target::Queue(1), packet(flow(1, 1000), 1000, 1));
        let _ = shaper.admit(Target::Queue(2), packet(flow(2, 1000), 1000, 2));
    };

    for _ in 0..20 {
        offer(&mut shaper);
    }
    while shaper.egress().len() < 400 {
        shaper.on_tick();
        offer(&mut shaper);
    }

    let served = &shaper.egress()[..400];
    let light = served.iter().filter(|p| p.target() == Some(Target::Queue(1))).count();
    let heavy = served.iter().filter(|p| p.target() == Some(Target::Queue(2))).count();

    assert_eq!(light + heavy, 400);
    assert!((99..=101).contains(&light), "light {light} heavy {heavy}");
}

/// A lone flow set gets the whole pipe, so its burst drains exactly when a fixed-rate queue
/// would, each packet leaving once the bytes before it have been paid for.
#[test]
fn flow_set_burst_pays_exactly_for_its_bytes() {
    const SIZES: [usize; 5] = [100, 1500, 700, 40, 1000];

    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(64_000)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(1, 1)).unwrap();

    for (i, &len) in SIZES.iter().enumerate() {
        assert!(shaper.admit(Target::Queue(1), packet(flow(1, 1000), len, i as u8)).is_accepted());
    }

    shaper.advance(417);
    assert_eq!(shaper.egress().len(), SIZES.len() - 1);

    shaper.on_tick();
    let times: Vec<_> = shaper.egress().iter().map(|p| p.output_time()).collect();
    assert_eq!(times, [13, 200, 288, 293, 418]);
    assert!(shaper.egress().iter().enumerate().all(|(i, p)| p.payload()[0] == i as u8));
}

#[test]
fn equal_weights_share_bytes_not_packets() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(BANDWIDTH)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(1, 1).mask(FlowId::mask_all())).unwrap();

    let (big, small) = (flow(1, 1000), flow(2, 1000));
    let offer = |shaper: &mut Shaper| {
        let _ = shaper.admit(Target::Queue(1), packet(big, 1500, 1));
        for _ in 0..3 {
            let _ = shaper.admit(Target::Queue(1), packet(small, 500, 2));
        }
    };

    for _ in 0..10 {
        offer(&mut shaper);
    }

    let (mut big_bytes, mut small_bytes, mut seen) = (0, 0, 0);
    for _ in 0..600 {
        shaper.on_tick();
        offer(&mut shaper);

        for p in &shaper.egress()[seen..] {
            if p.payload()[0] == 1 {
                big_bytes += p.len() as i64;
            } else {
                small_bytes += p.len() as i64;
            }
        }
        seen = shaper.egress().len();

        assert!((big_bytes - small_bytes).abs() <= 3000, "{big_bytes} vs {small_bytes}");
    }

    assert!(big_bytes > 250_000 && small_bytes > 250_000);
    assert_eq!(shaper.snapshot().flowset(1).unwrap().queues.len(), 2);
}

#[test]
fn virtual_time_restarts_once_idle() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(BANDWIDTH)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(2, 1).weight(4)).unwrap();

    for _ in 0..5 {
        assert!(shaper.admit(Target::Queue(2), packet(flow(1, 1000), 1000, 0)).is_accepted());
    }

    let busy = shaper.snapshot();
    assert_eq!(busy.pipe(1).unwrap().sum, 4);
    assert!(busy.pipe(1).unwrap().v > 0);
    assert_eq!(busy.flowset(2).unwrap().backlogged, 1);

    shaper.advance(10);
    assert_eq!(shaper.egress().len(), 5);

    let idle = shaper.snapshot();
    let pipe = idle.pipe(1).unwrap();
    assert_eq!(pipe.v, 0);
    assert_eq!(pipe.sum, 0);
    assert_eq!(idle.flowset(2).unwrap().backlogged, 0);
    assert_eq!(shaper.heap_references(Target::Queue(2)), 0);
}

#[test]
fn reconfiguring_a_busy_flow_set_keeps_its_packets() {
    let mut shaper = shaper();
    shaper.configure_pipe(PipeConfig::new(1).bandwidth(BANDWIDTH)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(2, 1).weight(1)).unwrap();
    shaper.configure_flowset(FlowSetConfig::new(3, 1).weight(1)).unwrap();

    for _ in 0..10 {
        let _ = shaper.admit(Target::Queue(2), packet(flow(1, 1000), 1000, 2));
        let _ = shaper.admit(Target::Queue(3), packet(flow(2, 1000), 1000, 3));
    }
    shaper.advance(4);

    let before = shaper.snapshot().flowset(2).unwrap().queues[0].len;
    shaper.configure_flowset(FlowSetConfig::new(2, 1).weight(9)).unwrap();
    assert_eq!(shaper.snapshot().flowset(2).unwrap().queues[0].len, before);

    shaper.advance(30);
    assert_eq!(shaper.egress().len(), 20);
}
