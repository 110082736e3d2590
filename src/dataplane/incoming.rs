//! Pipeline stage 1: summarize the incoming packet as a canonical tuple.
//!
//! For ICMP errors the tuple is taken from the *inner* packet with source
//! and destination swapped, so the error travels the same session as the
//! flow it talks about.

use super::types::{L3Proto, L4Proto, TransportAddr4, TransportAddr6, Tuple, Tuple4, Tuple6};
use crate::protocol::{icmp, icmpv6, ipv4, ipv6, tcp, udp};
use tracing::debug;

/// Why a packet could not be summarized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleError {
    /// Truncated headers, bogus fields, ICMP-in-ICMP and friends.
    Malformed,
    /// A transport protocol the translator does not handle.
    UnknownProto,
    /// A non-initial fragment; its transport header traveled in fragment
    /// zero and there is no reassembly here.
    Fragment,
}

/// Reads the two 16-bit identifiers at the start of a TCP or UDP header.
/// Embedded packets may carry as little as 8 bytes of transport header, so
/// this asks for no more than that.
fn ports_of(l4: &[u8]) -> Option<(u16, u16)> {
    if l4.len() < 8 {
        return None;
    }
    Some((
        u16::from_be_bytes([l4[0], l4[1]]),
        u16::from_be_bytes([l4[2], l4[3]]),
    ))
}

pub fn incoming_tuple(family: L3Proto, packet: &[u8]) -> Result<Tuple, TupleError> {
    match family {
        L3Proto::Ipv4 => tuple_from_v4(packet),
        L3Proto::Ipv6 => tuple_from_v6(packet),
    }
}

fn tuple_from_v4(packet: &[u8]) -> Result<Tuple, TupleError> {
    let hdr = ipv4::Ipv4Header::parse(packet).map_err(|error| {
        debug!(%error, "cannot summarize IPv4 packet");
        TupleError::Malformed
    })?;

    if hdr.fragment_offset() > 0 {
        return Err(TupleError::Fragment);
    }

    let src = hdr.src_addr();
    let dst = hdr.dst_addr();
    let l4_data = hdr.payload();

    match ipv4::Protocol::from_u8(hdr.protocol()) {
        Some(ipv4::Protocol::Udp) => {
            udp::UdpHeader::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(src, sport),
                dst: TransportAddr4::new(dst, dport),
                l4: L4Proto::Udp,
            }))
        }
        Some(ipv4::Protocol::Tcp) => {
            tcp::TcpHeader::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(src, sport),
                dst: TransportAddr4::new(dst, dport),
                l4: L4Proto::Tcp,
            }))
        }
        Some(ipv4::Protocol::Icmp) => {
            let header = icmp::IcmpHeader::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            if icmp::is_info(header.icmp_type()) {
                let id = header.identifier();
                Ok(Tuple::V4(Tuple4 {
                    src: TransportAddr4::new(src, id),
                    dst: TransportAddr4::new(dst, id),
                    l4: L4Proto::Icmp,
                }))
            } else if icmp::is_error(header.icmp_type()) {
                tuple_from_v4_error(header.payload())
            } else {
                debug!(icmp_type = header.icmp_type(), "unknown ICMPv4 type");
                Err(TupleError::Malformed)
            }
        }
        None => Err(TupleError::UnknownProto),
    }
}

/// Inner packet of an ICMPv4 error: addresses and identifiers swapped.
fn tuple_from_v4_error(inner: &[u8]) -> Result<Tuple, TupleError> {
    let hdr = ipv4::Ipv4Header::parse_embedded(inner).map_err(|_| TupleError::Malformed)?;
    let l4_data = hdr.trailing();

    let src = hdr.dst_addr();
    let dst = hdr.src_addr();

    match ipv4::Protocol::from_u8(hdr.protocol()) {
        Some(ipv4::Protocol::Udp) => {
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(src, dport),
                dst: TransportAddr4::new(dst, sport),
                l4: L4Proto::Udp,
            }))
        }
        Some(ipv4::Protocol::Tcp) => {
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(src, dport),
                dst: TransportAddr4::new(dst, sport),
                l4: L4Proto::Tcp,
            }))
        }
        Some(ipv4::Protocol::Icmp) => {
            let inner_icmp =
                icmp::IcmpHeader::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            if icmp::is_error(inner_icmp.icmp_type()) {
                debug!("packet is an ICMP error containing an ICMP error");
                return Err(TupleError::Malformed);
            }
            let id = inner_icmp.identifier();
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(src, id),
                dst: TransportAddr4::new(dst, id),
                l4: L4Proto::Icmp,
            }))
        }
        None => Err(TupleError::UnknownProto),
    }
}

fn tuple_from_v6(packet: &[u8]) -> Result<Tuple, TupleError> {
    let hdr = ipv6::Ipv6Header::parse(packet).map_err(|error| {
        debug!(%error, "cannot summarize IPv6 packet");
        TupleError::Malformed
    })?;
    let chain =
        ipv6::walk_header_chain(hdr.next_header(), hdr.payload()).map_err(|_| TupleError::Malformed)?;

    if let Some(fragment) = chain.fragment {
        if fragment.fragment_offset > 0 {
            return Err(TupleError::Fragment);
        }
    }

    let src = hdr.src_addr();
    let dst = hdr.dst_addr();
    let l4_data = &hdr.payload()[chain.l4_offset..];

    match chain.upper_proto {
        udp::PROTOCOL_NUMBER => {
            udp::UdpHeader::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            Ok(Tuple::V6(Tuple6 {
                src: TransportAddr6::new(src, sport),
                dst: TransportAddr6::new(dst, dport),
                l4: L4Proto::Udp,
            }))
        }
        tcp::PROTOCOL_NUMBER => {
            tcp::TcpHeader::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            Ok(Tuple::V6(Tuple6 {
                src: TransportAddr6::new(src, sport),
                dst: TransportAddr6::new(dst, dport),
                l4: L4Proto::Tcp,
            }))
        }
        icmpv6::PROTOCOL_NUMBER => {
            let header = icmpv6::Icmpv6Header::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            if icmpv6::is_info(header.icmp_type()) {
                let id = header.identifier();
                Ok(Tuple::V6(Tuple6 {
                    src: TransportAddr6::new(src, id),
                    dst: TransportAddr6::new(dst, id),
                    l4: L4Proto::Icmp,
                }))
            } else if icmpv6::is_error(header.icmp_type()) {
                tuple_from_v6_error(header.payload())
            } else {
                debug!(icmp_type = header.icmp_type(), "unknown ICMPv6 type");
                Err(TupleError::Malformed)
            }
        }
        _ => Err(TupleError::UnknownProto),
    }
}

/// Inner packet of an ICMPv6 error: addresses and identifiers swapped.
fn tuple_from_v6_error(inner: &[u8]) -> Result<Tuple, TupleError> {
    let hdr = ipv6::Ipv6Header::parse_embedded(inner).map_err(|_| TupleError::Malformed)?;
    let chain = ipv6::walk_header_chain(hdr.next_header(), hdr.trailing())
        .map_err(|_| TupleError::Malformed)?;
    let l4_data = &hdr.trailing()[chain.l4_offset..];

    let src = hdr.dst_addr();
    let dst = hdr.src_addr();

    match chain.upper_proto {
        udp::PROTOCOL_NUMBER | tcp::PROTOCOL_NUMBER => {
            let (sport, dport) = ports_of(l4_data).ok_or(TupleError::Malformed)?;
            let l4 = if chain.upper_proto == udp::PROTOCOL_NUMBER {
                L4Proto::Udp
            } else {
                L4Proto::Tcp
            };
            Ok(Tuple::V6(Tuple6 {
                src: TransportAddr6::new(src, dport),
                dst: TransportAddr6::new(dst, sport),
                l4,
            }))
        }
        icmpv6::PROTOCOL_NUMBER => {
            let inner_icmp =
                icmpv6::Icmpv6Header::parse(l4_data).map_err(|_| TupleError::Malformed)?;
            if icmpv6::is_error(inner_icmp.icmp_type()) {
                debug!("packet is an ICMPv6 error containing an ICMPv6 error");
                return Err(TupleError::Malformed);
            }
            let id = inner_icmp.identifier();
            Ok(Tuple::V6(Tuple6 {
                src: TransportAddr6::new(src, id),
                dst: TransportAddr6::new(dst, id),
                l4: L4Proto::Icmp,
            }))
        }
        _ => Err(TupleError::UnknownProto),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ipv4::Ipv4Builder;
    use crate::protocol::ipv6::Ipv6Builder;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v6(src: &str, dst: &str, nh: u8, payload: &[u8]) -> Vec<u8> {
        Ipv6Builder::new()
            .src_addr(src.parse().unwrap())
            .dst_addr(dst.parse().unwrap())
            .next_header(nh)
            .hop_limit(64)
            .payload(payload)
            .build()
    }

    #[test]
    fn test_v6_udp_tuple() {
        let datagram = udp::build_datagram(1000, 2000, b"hi");
        let packet = v6("2001:db8::1", "64:ff9b::c0a8:201", 17, &datagram);

        let tuple = incoming_tuple(L3Proto::Ipv6, &packet).unwrap();
        match tuple {
            Tuple::V6(t) => {
                assert_eq!(t.src.l4_id, 1000);
                assert_eq!(t.dst.l4_id, 2000);
                assert_eq!(t.l4, L4Proto::Udp);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn test_v4_tcp_tuple() {
        let segment = tcp::build_header(80, 4000, 0, 0, Default::default(), 512);
        let packet = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(192, 168, 2, 1))
            .dst_addr(Ipv4Addr::new(192, 0, 2, 1))
            .protocol(6)
            .payload(&segment)
            .build();

        let tuple = incoming_tuple(L3Proto::Ipv4, &packet).unwrap();
        match tuple {
            Tuple::V4(t) => {
                assert_eq!(t.src.l4_id, 80);
                assert_eq!(t.dst.l4_id, 4000);
                assert_eq!(t.l4, L4Proto::Tcp);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn test_v6_echo_is_3_tuple() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "64:ff9b::c0a8:201".parse().unwrap();
        let echo = icmpv6::build_echo(128, 0x1234, 1, b"ping", src, dst);
        let packet = v6("2001:db8::1", "64:ff9b::c0a8:201", 58, &echo);

        let tuple = incoming_tuple(L3Proto::Ipv6, &packet).unwrap();
        assert!(tuple.is_3_tuple());
        match tuple {
            Tuple::V6(t) => {
                assert_eq!(t.src.l4_id, 0x1234);
                assert_eq!(t.dst.l4_id, 0x1234);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn test_v4_icmp_error_swaps_inner() {
        // Offending packet: 192.0.2.1:5000 -> 192.168.2.1:2000 (UDP).
        let offender = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(192, 0, 2, 1))
            .dst_addr(Ipv4Addr::new(192, 168, 2, 1))
            .protocol(17)
            .payload(&udp::build_datagram(5000, 2000, b"x"))
            .build();
        let error =
            icmp::error_reply(&offender, icmp::IcmpType::DestinationUnreachable as u8, 1, 0)
                .unwrap();

        let tuple = incoming_tuple(L3Proto::Ipv4, &error).unwrap();
        match tuple {
            Tuple::V4(t) => {
                // Looks like an inbound reply flow toward the offender.
                assert_eq!(t.src.addr, Ipv4Addr::new(192, 168, 2, 1));
                assert_eq!(t.src.l4_id, 2000);
                assert_eq!(t.dst.addr, Ipv4Addr::new(192, 0, 2, 1));
                assert_eq!(t.dst.l4_id, 5000);
                assert_eq!(t.l4, L4Proto::Udp);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn test_icmp_in_icmp_is_malformed() {
        // The offending packet is itself an ICMP error.
        let offender = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(192, 0, 2, 1))
            .dst_addr(Ipv4Addr::new(192, 168, 2, 1))
            .protocol(1)
            .payload(&icmp::header_bytes(3, 1, 0))
            .build();
        let error = icmp::error_reply(&offender, 11, 0, 0).unwrap();

        assert_eq!(
            incoming_tuple(L3Proto::Ipv4, &error),
            Err(TupleError::Malformed)
        );
    }

    #[test]
    fn test_unknown_protocol() {
        let packet = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(192, 168, 2, 1))
            .dst_addr(Ipv4Addr::new(192, 0, 2, 1))
            .protocol(47) // GRE
            .payload(&[0u8; 8])
            .build();
        assert_eq!(
            incoming_tuple(L3Proto::Ipv4, &packet),
            Err(TupleError::UnknownProto)
        );
    }

    #[test]
    fn test_truncated_is_malformed() {
        assert_eq!(
            incoming_tuple(L3Proto::Ipv6, &[0x60, 0, 0]),
            Err(TupleError::Malformed)
        );
    }

    #[test]
    fn test_non_initial_fragment() {
        let frag = ipv6::FragmentHeader {
            next_header: 17,
            fragment_offset: 1232,
            more_fragments: true,
            identification: 7,
        };
        let mut payload = frag.to_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 16]);
        let packet = v6("2001:db8::1", "64:ff9b::c0a8:201", 44, &payload);

        assert_eq!(
            incoming_tuple(L3Proto::Ipv6, &packet),
            Err(TupleError::Fragment)
        );
    }

    #[test]
    fn test_ndp_is_dropped_as_malformed() {
        // Neighbor solicitation (135): neither info nor error.
        let mut message = vec![135u8, 0, 0, 0];
        message.extend_from_slice(&[0u8; 20]);
        let packet = v6("fe80::1", "ff02::1:ff00:1", 58, &message);

        assert_eq!(
            incoming_tuple(L3Proto::Ipv6, &packet),
            Err(TupleError::Malformed)
        );
    }
}
