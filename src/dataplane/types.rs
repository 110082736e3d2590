//! Flow summaries and protocol tags shared by every pipeline stage.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Network protocol of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Proto {
    Ipv4,
    Ipv6,
}

/// Transport protocol of a flow.
///
/// `None` tags non-initial fragments, whose transport header traveled in
/// fragment zero. Tuples always carry the real protocol; only individual
/// fragments use `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Udp,
    Tcp,
    Icmp,
    None,
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            L4Proto::Udp => "UDP",
            L4Proto::Tcp => "TCP",
            L4Proto::Icmp => "ICMP",
            L4Proto::None => "NONE",
        };
        write!(f, "{}", name)
    }
}

/// An IPv4 transport address. For ICMP, `l4_id` holds the ICMP identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportAddr4 {
    pub addr: Ipv4Addr,
    pub l4_id: u16,
}

impl TransportAddr4 {
    pub fn new(addr: Ipv4Addr, l4_id: u16) -> Self {
        Self { addr, l4_id }
    }
}

impl fmt::Display for TransportAddr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.l4_id)
    }
}

/// An IPv6 transport address. For ICMP, `l4_id` holds the ICMP identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportAddr6 {
    pub addr: Ipv6Addr,
    pub l4_id: u16,
}

impl TransportAddr6 {
    pub fn new(addr: Ipv6Addr, l4_id: u16) -> Self {
        Self { addr, l4_id }
    }
}

impl fmt::Display for TransportAddr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.l4_id)
    }
}

/// Summary of an IPv6 packet's flow.
///
/// For ICMP errors the addresses come from the *inner* packet with source and
/// destination swapped, so a reply to the offender looks like an inbound flow.
/// For ICMP queries `src.l4_id == dst.l4_id` (the tuple is a 3-tuple).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple6 {
    pub src: TransportAddr6,
    pub dst: TransportAddr6,
    pub l4: L4Proto,
}

/// Summary of an IPv4 packet's flow. Same conventions as [`Tuple6`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple4 {
    pub src: TransportAddr4,
    pub dst: TransportAddr4,
    pub l4: L4Proto,
}

/// A canonical flow summary in either family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tuple {
    V4(Tuple4),
    V6(Tuple6),
}

impl Tuple {
    pub fn l3(&self) -> L3Proto {
        match self {
            Tuple::V4(_) => L3Proto::Ipv4,
            Tuple::V6(_) => L3Proto::Ipv6,
        }
    }

    pub fn l4(&self) -> L4Proto {
        match self {
            Tuple::V4(t) => t.l4,
            Tuple::V6(t) => t.l4,
        }
    }

    /// A 3-tuple (address, address, ICMP id), as the RFC calls it.
    pub fn is_3_tuple(&self) -> bool {
        self.l4() == L4Proto::Icmp
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tuple::V4(t) => write!(f, "{} -> {} ({})", t.src, t.dst, t.l4),
            Tuple::V6(t) => write!(f, "{} -> {} ({})", t.src, t.dst, t.l4),
        }
    }
}

/// What the caller should do with the packet it handed to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Accepted and translated; the translated packets are in the outcome.
    Continue,
    /// Not for translation; hand it to the local stack untouched.
    Accept,
    /// Silently discarded (an ICMP error may have been queued).
    Drop,
    /// Retained by the pending-SYN queue; the caller must not free it.
    Stolen,
}

/// A packet produced by the pipeline, ready to be routed and emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPacket {
    pub family: L3Proto,
    pub bytes: Vec<u8>,
}

impl OutPacket {
    pub fn v4(bytes: Vec<u8>) -> Self {
        Self {
            family: L3Proto::Ipv4,
            bytes,
        }
    }

    pub fn v6(bytes: Vec<u8>) -> Self {
        Self {
            family: L3Proto::Ipv6,
            bytes,
        }
    }
}
