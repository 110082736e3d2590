//! IPv6 to IPv4 header translation (RFC 6145 section 5).

use super::runtime::TranslateConfig;
use super::translate::TranslateOutcome;
use super::types::{OutPacket, Tuple4};
use crate::protocol::{checksum, icmp, icmpv6, ipv4, ipv6, tcp, udp};
use tracing::debug;

/// Largest IPv4 packet that still gets DF cleared when `df_always_on` is
/// off: anything that would need a 1280-byte IPv6 MTU on the way back.
const DF_THRESHOLD: u16 = 1260;

pub(super) fn translate(
    packet: &[u8],
    out: &Tuple4,
    config: &TranslateConfig,
) -> TranslateOutcome {
    let Ok(hdr) = ipv6::Ipv6Header::parse(packet) else {
        return TranslateOutcome::drop_silent();
    };
    let Ok(chain) = ipv6::walk_header_chain(hdr.next_header(), hdr.payload()) else {
        return TranslateOutcome::drop_silent();
    };

    if hdr.hop_limit() <= 1 {
        debug!("hop limit exhausted; answering with ICMPv6 Time Exceeded");
        let error = icmpv6::error_reply(
            packet,
            icmpv6::Icmpv6Type::TimeExceeded as u8,
            icmpv6::time_exceeded::HOP_LIMIT,
            0,
        )
        .ok()
        .map(OutPacket::v6);
        return TranslateOutcome::Drop { icmp_error: error };
    }

    let l4_slice = &hdr.payload()[chain.l4_offset..];

    // The treatment follows the packet's own transport protocol. The
    // tuple's l4 can differ: an ICMP error about a UDP flow is still an
    // ICMP packet on the wire.
    let (protocol, out_l4) = match chain.upper_proto {
        udp::PROTOCOL_NUMBER => {
            let mut segment = l4_slice.to_vec();
            udp::set_src_port(&mut segment, out.src.l4_id);
            udp::set_dst_port(&mut segment, out.dst.l4_id);
            udp::write_checksum_v4(&mut segment, out.src.addr, out.dst.addr);
            (udp::PROTOCOL_NUMBER, segment)
        }
        tcp::PROTOCOL_NUMBER => {
            let mut segment = l4_slice.to_vec();
            tcp::set_src_port(&mut segment, out.src.l4_id);
            tcp::set_dst_port(&mut segment, out.dst.l4_id);
            tcp::write_checksum_v4(&mut segment, out.src.addr, out.dst.addr);
            (tcp::PROTOCOL_NUMBER, segment)
        }
        icmpv6::PROTOCOL_NUMBER => match build_icmp4(l4_slice, out, config) {
            Some(message) => (icmp::PROTOCOL_NUMBER, message),
            None => return TranslateOutcome::drop_silent(),
        },
        _ => return TranslateOutcome::drop_silent(),
    };

    let total_len = (ipv4::MIN_HEADER_SIZE + out_l4.len()) as u16;

    let identification = match chain.fragment {
        Some(fragment) => fragment.identification as u16,
        None if config.build_ipv4_id => derive_identification(&hdr),
        None => 0,
    };

    let (df, mf, frag_offset) = match chain.fragment {
        Some(fragment) => (false, fragment.more_fragments, fragment.fragment_offset),
        None => (config.df_always_on || total_len > DF_THRESHOLD, false, 0),
    };

    let out_packet = ipv4::Ipv4Builder::new()
        .tos(if config.reset_tos {
            config.new_tos
        } else {
            hdr.traffic_class()
        })
        .identification(identification)
        .dont_fragment(df)
        .more_fragments(mf)
        .fragment_offset(frag_offset)
        .ttl(hdr.hop_limit() - 1)
        .protocol(protocol)
        .src_addr(out.src.addr)
        .dst_addr(out.dst.addr)
        .payload(&out_l4)
        .build();

    TranslateOutcome::Forward(vec![OutPacket::v4(out_packet)])
}

/// A stable Identification for atoms the source never fragmented. Derived
/// from the addresses and length so retransmissions agree.
fn derive_identification(hdr: &ipv6::Ipv6Header) -> u16 {
    let mut seed = Vec::with_capacity(34);
    seed.extend_from_slice(&hdr.src_addr().octets());
    seed.extend_from_slice(&hdr.dst_addr().octets());
    seed.extend_from_slice(&hdr.payload_length().to_be_bytes());
    checksum::internet_checksum(&seed)
}

/// ICMPv6 to ICMPv4, including recursive translation of the packet inside
/// an error message. Returns None for messages with no IPv4 equivalent.
fn build_icmp4(l4_slice: &[u8], out: &Tuple4, config: &TranslateConfig) -> Option<Vec<u8>> {
    let header = icmpv6::Icmpv6Header::parse(l4_slice).ok()?;

    if icmpv6::is_info(header.icmp_type()) {
        let out_type = match header.icmp_type() {
            128 => icmp::IcmpType::EchoRequest as u8,
            _ => icmp::IcmpType::EchoReply as u8,
        };
        let mut message =
            icmp::header_bytes(out_type, 0, ((out.src.l4_id as u32) << 16) | header.sequence() as u32)
                .to_vec();
        message.extend_from_slice(header.payload());
        icmp::write_checksum(&mut message);
        return Some(message);
    }

    let (out_type, out_code, rest) = match header.icmp_type() {
        1 => match header.code() {
            icmpv6::dest_unreachable::NO_ROUTE
            | icmpv6::dest_unreachable::BEYOND_SCOPE
            | icmpv6::dest_unreachable::ADDRESS_UNREACHABLE => (
                icmp::IcmpType::DestinationUnreachable as u8,
                icmp::dest_unreachable::HOST,
                0,
            ),
            icmpv6::dest_unreachable::ADMIN_PROHIBITED => (
                icmp::IcmpType::DestinationUnreachable as u8,
                icmp::dest_unreachable::ADMIN_PROHIBITED,
                0,
            ),
            icmpv6::dest_unreachable::PORT_UNREACHABLE => (
                icmp::IcmpType::DestinationUnreachable as u8,
                icmp::dest_unreachable::PORT,
                0,
            ),
            code => {
                debug!(code, "untranslatable ICMPv6 unreachable code");
                return None;
            }
        },
        2 => {
            // Packet Too Big: the IPv4 MTU is 20 bytes smaller.
            let mtu = header.mtu().min(u16::MAX as u32) as u16;
            let mtu4 = mtu.saturating_sub(20).max(68);
            (
                icmp::IcmpType::DestinationUnreachable as u8,
                icmp::dest_unreachable::FRAG_NEEDED,
                mtu4 as u32,
            )
        }
        3 => (icmp::IcmpType::TimeExceeded as u8, header.code(), 0),
        4 => match header.code() {
            icmpv6::parameter_problem::ERRONEOUS_HEADER => {
                let pointer = pointer_6to4(header.pointer())?;
                (
                    icmp::IcmpType::ParameterProblem as u8,
                    icmp::parameter_problem::POINTER,
                    (pointer as u32) << 24,
                )
            }
            icmpv6::parameter_problem::UNRECOGNIZED_NEXT_HEADER => (
                icmp::IcmpType::DestinationUnreachable as u8,
                icmp::dest_unreachable::PROTOCOL,
                0,
            ),
            code => {
                debug!(code, "untranslatable ICMPv6 parameter problem code");
                return None;
            }
        },
        other => {
            debug!(icmp_type = other, "untranslatable ICMPv6 type");
            return None;
        }
    };

    let inner = translate_inner(header.payload(), out, config)?;

    let mut message = icmp::header_bytes(out_type, out_code, rest).to_vec();
    let budget = 576 - ipv4::MIN_HEADER_SIZE - icmp::HEADER_SIZE;
    message.extend_from_slice(&inner[..inner.len().min(budget)]);
    icmp::write_checksum(&mut message);
    Some(message)
}

/// Offsets into an IPv6 header mapped to the field they land on in the
/// IPv4 header (RFC 6145 section 5.2).
fn pointer_6to4(pointer: u32) -> Option<u8> {
    Some(match pointer {
        0 => 0,
        1 => 1,
        4 | 5 => 2,
        6 => 9,
        7 => 8,
        8..=23 => 12,
        24..=39 => 16,
        _ => return None,
    })
}

/// Translates the packet embedded in an ICMPv6 error. The inner packet's
/// flow is the outer's with the endpoints swapped; it is never fragmented,
/// and checksums are adjusted rather than recomputed because the tail of
/// the packet may be missing.
fn translate_inner(inner: &[u8], out: &Tuple4, config: &TranslateConfig) -> Option<Vec<u8>> {
    let hdr = ipv6::Ipv6Header::parse_embedded(inner).ok()?;
    let chain = ipv6::walk_header_chain(hdr.next_header(), hdr.trailing()).ok()?;
    let l4_slice = &hdr.trailing()[chain.l4_offset..];
    if l4_slice.len() < 8 {
        return None;
    }

    // Swapped endpoints: the inner packet traveled the other way.
    let (inner_src, inner_dst) = (out.dst, out.src);

    // The embedded copy may be truncated, but the original checksums were
    // computed over the lengths the inner header claims.
    let claimed_l4_len = (hdr.payload_length() as usize).saturating_sub(chain.l4_offset);

    let old_pseudo = checksum::pseudo_header_v6(hdr.src_addr(), hdr.dst_addr(), 0, 0);
    let new_pseudo = checksum::pseudo_header_v4(inner_src.addr, inner_dst.addr, 0, 0);

    let mut segment = l4_slice.to_vec();
    let protocol = match chain.upper_proto {
        udp::PROTOCOL_NUMBER | tcp::PROTOCOL_NUMBER => {
            let old_ports = checksum::sum_words(&segment[0..4]);
            segment[0..2].copy_from_slice(&inner_src.l4_id.to_be_bytes());
            segment[2..4].copy_from_slice(&inner_dst.l4_id.to_be_bytes());
            let new_ports = checksum::sum_words(&segment[0..4]);

            let ck_at = if chain.upper_proto == udp::PROTOCOL_NUMBER { 6 } else { 16 };
            if segment.len() >= ck_at + 2 {
                let old_ck = u16::from_be_bytes([segment[ck_at], segment[ck_at + 1]]);
                if !(chain.upper_proto == udp::PROTOCOL_NUMBER && old_ck == 0) {
                    let new_ck = checksum::adjust(
                        old_ck,
                        old_pseudo.wrapping_add(old_ports),
                        new_pseudo.wrapping_add(new_ports),
                    );
                    segment[ck_at..ck_at + 2].copy_from_slice(&new_ck.to_be_bytes());
                }
            }
            chain.upper_proto
        }
        icmpv6::PROTOCOL_NUMBER => {
            // An echo inside the error. Retype it and rewrite the id; the
            // ICMPv4 checksum loses the whole pseudo-header.
            let old_head = checksum::sum_words(&segment[0..2])
                .wrapping_add(checksum::sum_words(&segment[4..6]))
                .wrapping_add(checksum::pseudo_header_v6(
                    hdr.src_addr(),
                    hdr.dst_addr(),
                    icmpv6::PROTOCOL_NUMBER,
                    claimed_l4_len as u32,
                ));
            segment[0] = match segment[0] {
                128 => icmp::IcmpType::EchoRequest as u8,
                _ => icmp::IcmpType::EchoReply as u8,
            };
            segment[4..6].copy_from_slice(&inner_src.l4_id.to_be_bytes());
            let new_head = checksum::sum_words(&segment[0..2])
                .wrapping_add(checksum::sum_words(&segment[4..6]));

            let old_ck = u16::from_be_bytes([segment[2], segment[3]]);
            let new_ck = checksum::adjust(old_ck, old_head, new_head);
            segment[2..4].copy_from_slice(&new_ck.to_be_bytes());
            icmp::PROTOCOL_NUMBER
        }
        _ => return None,
    };

    // The inner header claims the original length even when the embedded
    // copy is truncated.
    let claimed_total = (ipv4::MIN_HEADER_SIZE + claimed_l4_len).min(u16::MAX as usize) as u16;

    let mut packet = inner_v4_header(
        inner_src.addr,
        inner_dst.addr,
        protocol,
        claimed_total,
        if config.reset_tos {
            config.new_tos
        } else {
            hdr.traffic_class()
        },
        hdr.hop_limit(),
        chain.fragment,
    )
    .to_vec();
    packet.extend_from_slice(&segment);
    Some(packet)
}

/// Hand-assembled inner IPv4 header: the Total Length is the claimed one,
/// not the embedded buffer's.
fn inner_v4_header(
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    protocol: u8,
    total_len: u16,
    tos: u8,
    ttl: u8,
    fragment: Option<ipv6::FragmentHeader>,
) -> [u8; ipv4::MIN_HEADER_SIZE] {
    let mut header = [0u8; ipv4::MIN_HEADER_SIZE];
    header[0] = 0x45;
    header[1] = tos;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());

    if let Some(fragment) = fragment {
        header[4..6].copy_from_slice(&(fragment.identification as u16).to_be_bytes());
        let frag_word =
            (fragment.fragment_offset >> 3) | if fragment.more_fragments { 0x2000 } else { 0 };
        header[6..8].copy_from_slice(&frag_word.to_be_bytes());
    }

    header[8] = ttl;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let ck = ipv4::header_checksum(&header);
    header[10..12].copy_from_slice(&ck.to_be_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::types::{L4Proto, TransportAddr4};
    use crate::protocol::ipv6::Ipv6Builder;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn out_tuple(l4: L4Proto) -> Tuple4 {
        Tuple4 {
            src: TransportAddr4::new(Ipv4Addr::new(192, 0, 2, 1), 61001),
            dst: TransportAddr4::new(Ipv4Addr::new(192, 168, 2, 1), 2000),
            l4,
        }
    }

    fn v6_udp_packet(hop_limit: u8) -> Vec<u8> {
        Ipv6Builder::new()
            .src_addr("2001:db8::1".parse::<Ipv6Addr>().unwrap())
            .dst_addr("64:ff9b::c0a8:201".parse::<Ipv6Addr>().unwrap())
            .next_header(17)
            .hop_limit(hop_limit)
            .traffic_class(0x1C)
            .payload(&udp::build_datagram(1000, 2000, b"payload"))
            .build()
    }

    #[test]
    fn test_udp_translation() {
        let packet = v6_udp_packet(64);
        let outcome = translate(&packet, &out_tuple(L4Proto::Udp), &TranslateConfig::default());

        let TranslateOutcome::Forward(packets) = outcome else {
            panic!("expected forward");
        };
        assert_eq!(packets.len(), 1);

        let hdr = ipv4::Ipv4Header::parse(&packets[0].bytes).unwrap();
        assert_eq!(hdr.src_addr(), Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(hdr.dst_addr(), Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(hdr.ttl(), 63);
        assert_eq!(hdr.protocol(), 17);
        assert_eq!(hdr.tos(), 0x1C);
        assert!(hdr.dont_fragment()); // df_always_on default
        assert_eq!(hdr.identification(), 0); // build_ipv4_id off

        let udp_hdr = udp::UdpHeader::parse(hdr.payload()).unwrap();
        assert_eq!(udp_hdr.src_port(), 61001);
        assert_eq!(udp_hdr.dst_port(), 2000);

        // The transport checksum must validate against the new addresses.
        let sum = checksum::pseudo_header_v4(
            hdr.src_addr(),
            hdr.dst_addr(),
            17,
            hdr.payload().len() as u32,
        )
        .wrapping_add(checksum::sum_words(hdr.payload()));
        assert_eq!(checksum::fold(sum), 0xFFFF);
    }

    #[test]
    fn test_hop_limit_exhaustion_sends_time_exceeded() {
        let packet = v6_udp_packet(1);
        let outcome = translate(&packet, &out_tuple(L4Proto::Udp), &TranslateConfig::default());

        let TranslateOutcome::Drop { icmp_error: Some(error) } = outcome else {
            panic!("expected a drop with an error");
        };
        let hdr = ipv6::Ipv6Header::parse(&error.bytes).unwrap();
        assert_eq!(hdr.dst_addr(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        let icmp_hdr = icmpv6::Icmpv6Header::parse(hdr.payload()).unwrap();
        assert_eq!(icmp_hdr.icmp_type(), 3);
    }

    #[test]
    fn test_tos_reset_option() {
        let packet = v6_udp_packet(64);
        let config = TranslateConfig {
            reset_tos: true,
            new_tos: 0xB8,
            ..Default::default()
        };
        let TranslateOutcome::Forward(packets) =
            translate(&packet, &out_tuple(L4Proto::Udp), &config)
        else {
            panic!("expected forward");
        };
        assert_eq!(ipv4::Ipv4Header::parse(&packets[0].bytes).unwrap().tos(), 0xB8);
    }

    #[test]
    fn test_fragment_header_carries_over() {
        let frag = ipv6::FragmentHeader {
            next_header: 17,
            fragment_offset: 0,
            more_fragments: true,
            identification: 0x00015678,
        };
        let mut payload = frag.to_bytes().to_vec();
        payload.extend_from_slice(&udp::build_datagram(1000, 2000, b"first"));
        let packet = Ipv6Builder::new()
            .src_addr("2001:db8::1".parse::<Ipv6Addr>().unwrap())
            .dst_addr("64:ff9b::c0a8:201".parse::<Ipv6Addr>().unwrap())
            .next_header(44)
            .hop_limit(64)
            .payload(&payload)
            .build();

        let TranslateOutcome::Forward(packets) =
            translate(&packet, &out_tuple(L4Proto::Udp), &TranslateConfig::default())
        else {
            panic!("expected forward");
        };
        let hdr = ipv4::Ipv4Header::parse(&packets[0].bytes).unwrap();
        assert!(hdr.more_fragments());
        assert!(!hdr.dont_fragment());
        assert_eq!(hdr.fragment_offset(), 0);
        assert_eq!(hdr.identification(), 0x5678);
        assert_eq!(hdr.protocol(), 17); // fragment header elided
    }

    #[test]
    fn test_echo_request_translation() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "64:ff9b::c0a8:201".parse().unwrap();
        let echo = icmpv6::build_echo(128, 0x1234, 9, b"ping", src, dst);
        let packet = Ipv6Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .next_header(58)
            .hop_limit(64)
            .payload(&echo)
            .build();

        let mut tuple = out_tuple(L4Proto::Icmp);
        tuple.src.l4_id = 0x4321;
        tuple.dst.l4_id = 0x4321;

        let TranslateOutcome::Forward(packets) =
            translate(&packet, &tuple, &TranslateConfig::default())
        else {
            panic!("expected forward");
        };
        let hdr = ipv4::Ipv4Header::parse(&packets[0].bytes).unwrap();
        assert_eq!(hdr.protocol(), 1);

        let out_icmp = icmp::IcmpHeader::parse(hdr.payload()).unwrap();
        assert_eq!(out_icmp.icmp_type(), 8);
        assert_eq!(out_icmp.identifier(), 0x4321);
        assert_eq!(out_icmp.sequence(), 9);
        assert_eq!(out_icmp.payload(), b"ping");
        assert_eq!(checksum::internet_checksum(hdr.payload()), 0);
    }

    #[test]
    fn test_packet_too_big_becomes_frag_needed() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "64:ff9b::c0a8:201".parse().unwrap();

        // The offending packet: an outbound TCP segment dst -> src.
        let offender = Ipv6Builder::new()
            .src_addr(dst)
            .dst_addr(src)
            .next_header(6)
            .hop_limit(63)
            .payload(&tcp::build_header(2000, 1000, 7, 8, Default::default(), 512))
            .build();

        let mut message = icmpv6::header_bytes(2, 0, 1400).to_vec();
        message.extend_from_slice(&offender);
        icmpv6::write_checksum(&mut message, src, dst);

        let packet = Ipv6Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .next_header(58)
            .hop_limit(64)
            .payload(&message)
            .build();

        let tuple = out_tuple(L4Proto::Tcp);
        let TranslateOutcome::Forward(packets) =
            translate(&packet, &tuple, &TranslateConfig::default())
        else {
            panic!("expected forward");
        };

        let hdr = ipv4::Ipv4Header::parse(&packets[0].bytes).unwrap();
        assert_eq!(hdr.protocol(), 1);
        let out_icmp = icmp::IcmpHeader::parse(hdr.payload()).unwrap();
        assert_eq!(out_icmp.icmp_type(), 3);
        assert_eq!(out_icmp.code(), 4);
        assert_eq!(out_icmp.mtu(), 1380); // 1400 - 20

        // The embedded packet was translated too, with swapped endpoints.
        let inner = ipv4::Ipv4Header::parse_embedded(out_icmp.payload()).unwrap();
        assert_eq!(inner.src_addr(), Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(inner.dst_addr(), Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(inner.protocol(), 6);
        let inner_tcp = tcp::TcpHeader::parse(inner.trailing()).unwrap();
        assert_eq!(inner_tcp.src_port(), 2000);
        assert_eq!(inner_tcp.dst_port(), 61001);
    }

    #[test]
    fn test_untranslatable_icmpv6_type_drops() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "64:ff9b::c0a8:201".parse().unwrap();
        // Type 100: reserved.
        let mut message = icmpv6::header_bytes(100, 0, 0).to_vec();
        message.extend_from_slice(&[0u8; 40]);
        let packet = Ipv6Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .next_header(58)
            .hop_limit(64)
            .payload(&message)
            .build();

        let outcome = translate(&packet, &out_tuple(L4Proto::Icmp), &TranslateConfig::default());
        assert!(matches!(
            outcome,
            TranslateOutcome::Drop { icmp_error: None }
        ));
    }
}
