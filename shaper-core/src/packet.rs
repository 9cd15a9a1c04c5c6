use std::{fmt, net::Ipv4Addr};

use bytes::Bytes;

use crate::Tick;

/// The 5-tuple (plus flags) that identifies a flow. Also used as a flow mask, where every set
/// bit selects the corresponding bit of the identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub flags: u8,
}

impl FlowId {
    pub fn new(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), proto: u8) -> Self {
        Self {
            src_ip: src.0.into(),
            dst_ip: dst.0.into(),
            src_port: src.1,
            dst_port: dst.1,
            proto,
            flags: 0,
        }
    }

    /// A mask selecting every field.
    pub const fn mask_all() -> Self {
        Self {
            src_ip: u32::MAX,
            dst_ip: u32::MAX,
            src_port: u16::MAX,
            dst_port: u16::MAX,
            proto: u8::MAX,
            flags: 0,
        }
    }

    /// Returns `true` if no bit is set, i.e. used as a mask it selects nothing.
    pub const fn is_empty(&self) -> bool {
        self.src_ip == 0 &&
            self.dst_ip == 0 &&
            self.src_port == 0 &&
            self.dst_port == 0 &&
            self.proto == 0
    }

    /// Applies `mask` to this identifier. Flags never take part in flow separation.
    pub const fn masked(&self, mask: &Self) -> Self {
        Self {
            src_ip: self.src_ip & mask.src_ip,
            dst_ip: self.dst_ip & mask.dst_ip,
            src_port: self.src_port & mask.src_port,
            dst_port: self.dst_port & mask.dst_port,
            proto: self.proto & mask.proto,
            flags: 0,
        }
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            1 => "icmp",
            6 => "tcp",
            17 => "udp",
            _ => "",
        };

        if proto.is_empty() {
            write!(f, "{:4} ", self.proto)?;
        } else {
            write!(f, "{proto:<4} ")?;
        }

        write!(
            f,
            "{:>15}/{:<5} {:>15}/{:<5}",
            self.src().to_string(),
            self.src_port,
            self.dst().to_string(),
            self.dst_port
        )
    }
}

/// Where a packet is sent: straight to a pipe (fixed-rate, one queue per masked flow) or to a
/// flow set that shares its parent pipe through WF2Q+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Pipe(u32),
    Queue(u32),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe(nr) => write!(f, "pipe {nr}"),
            Self::Queue(nr) => write!(f, "queue {nr}"),
        }
    }
}

/// A packet owned by the shaper from admission until it is delivered or dropped.
///
/// The payload is opaque: only its length and the flow identifier are looked at.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Bytes,
    len: usize,
    flow_id: FlowId,
    target: Option<Target>,
    output_time: Tick,
}

impl Packet {
    pub fn new(payload: Bytes, flow_id: FlowId) -> Self {
        Self {
            len: payload.len(),
            payload,
            flow_id,
            target: None,
            output_time: 0,
        }
    }

    /// Overrides the length charged for this packet, e.g. when only headers were captured.
    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The length in bytes charged against bandwidth and queue limits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// The pipe or queue the packet was admitted to.
    #[inline]
    pub fn target(&self) -> Option<Target> {
        self.target
    }

    /// The tick at which the packet leaves (or left) the delay line.
    #[inline]
    pub fn output_time(&self) -> Tick {
        self.output_time
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub(crate) fn set_output_time(&mut self, tick: Tick) {
        self.output_time = tick;
    }

    pub(crate) fn delay_output(&mut self, ticks: Tick) {
        self.output_time = self.output_time.wrapping_add(ticks);
    }
}

/// Receives packets leaving a pipe's delay line. Delivery is fire-and-forget.
pub trait Egress {
    fn deliver(&mut self, packet: Packet);
}

impl Egress for Vec<Packet> {
    fn deliver(&mut self, packet: Packet) {
        self.push(packet);
    }
}

impl<E: Egress + ?Sized> Egress for Box<E> {
    fn deliver(&mut self, packet: Packet) {
        (**self).deliver(packet);
    }
}
