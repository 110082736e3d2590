//! IPv4 to IPv6 header translation (RFC 6145 section 4), including the
//! fragmentation of oversized packets.

use super::runtime::TranslateConfig;
use super::translate::TranslateOutcome;
use super::types::{OutPacket, Tuple6};
use crate::protocol::{checksum, icmp, icmpv6, ipv4, ipv6, tcp, udp};
use tracing::debug;

pub(super) fn translate(
    packet: &[u8],
    out: &Tuple6,
    config: &TranslateConfig,
) -> TranslateOutcome {
    let Ok(hdr) = ipv4::Ipv4Header::parse(packet) else {
        return TranslateOutcome::drop_silent();
    };

    if hdr.ttl() <= 1 {
        debug!("TTL exhausted; answering with ICMPv4 Time Exceeded");
        let error = icmp::error_reply(
            packet,
            icmp::IcmpType::TimeExceeded as u8,
            icmp::time_exceeded::TTL,
            0,
        )
        .ok()
        .map(OutPacket::v4);
        return TranslateOutcome::Drop { icmp_error: error };
    }

    let l4_slice = hdr.payload();

    // The treatment follows the packet's own transport protocol. The
    // tuple's l4 can differ: an ICMP error about a UDP flow is still an
    // ICMP packet on the wire.
    let (protocol, out_l4) = match hdr.protocol() {
        udp::PROTOCOL_NUMBER => {
            let mut segment = l4_slice.to_vec();
            udp::set_src_port(&mut segment, out.src.l4_id);
            udp::set_dst_port(&mut segment, out.dst.l4_id);
            udp::write_checksum_v6(&mut segment, out.src.addr, out.dst.addr);
            (udp::PROTOCOL_NUMBER, segment)
        }
        tcp::PROTOCOL_NUMBER => {
            let mut segment = l4_slice.to_vec();
            tcp::set_src_port(&mut segment, out.src.l4_id);
            tcp::set_dst_port(&mut segment, out.dst.l4_id);
            tcp::write_checksum_v6(&mut segment, out.src.addr, out.dst.addr);
            (tcp::PROTOCOL_NUMBER, segment)
        }
        icmp::PROTOCOL_NUMBER => match build_icmp6(l4_slice, out, config) {
            Some(message) => (icmpv6::PROTOCOL_NUMBER, message),
            None => return TranslateOutcome::drop_silent(),
        },
        _ => return TranslateOutcome::drop_silent(),
    };

    let traffic_class = if config.reset_traffic_class { 0 } else { hdr.tos() };
    let hop_limit = hdr.ttl() - 1;

    // A fragment header travels along when the packet already is a fragment
    // or when it may yet have to become one on the IPv6 side.
    let plain_size = ipv6::HEADER_SIZE + out_l4.len();
    let needs_frag_header = hdr.is_fragment()
        || (!hdr.dont_fragment() && plain_size > config.min_ipv6_mtu as usize);

    if !needs_frag_header {
        let out_packet = ipv6::Ipv6Builder::new()
            .traffic_class(traffic_class)
            .hop_limit(hop_limit)
            .next_header(protocol)
            .src_addr(out.src.addr)
            .dst_addr(out.dst.addr)
            .payload(&out_l4)
            .build();

        if out_packet.len() > config.min_ipv6_mtu as usize {
            // Oversized and DF was set: refuse.
            debug!(
                size = out_packet.len(),
                mtu = config.min_ipv6_mtu,
                "packet too big for the IPv6 side; dropping"
            );
            let error = icmp::error_reply(
                packet,
                icmp::IcmpType::DestinationUnreachable as u8,
                icmp::dest_unreachable::FRAG_NEEDED,
                (config.min_ipv6_mtu - 20) as u32,
            )
            .ok()
            .map(OutPacket::v4);
            return TranslateOutcome::Drop { icmp_error: error };
        }
        return TranslateOutcome::Forward(vec![OutPacket::v6(out_packet)]);
    }

    let fragment = ipv6::FragmentHeader {
        next_header: protocol,
        fragment_offset: hdr.fragment_offset(),
        more_fragments: hdr.more_fragments(),
        identification: hdr.identification() as u32,
    };

    let mut payload = fragment.to_bytes().to_vec();
    payload.extend_from_slice(&out_l4);
    let out_packet = ipv6::Ipv6Builder::new()
        .traffic_class(traffic_class)
        .hop_limit(hop_limit)
        .next_header(ipv6::NEXT_HEADER_FRAGMENT)
        .src_addr(out.src.addr)
        .dst_addr(out.dst.addr)
        .payload(&payload)
        .build();

    if out_packet.len() <= config.min_ipv6_mtu as usize {
        return TranslateOutcome::Forward(vec![OutPacket::v6(out_packet)]);
    }

    TranslateOutcome::Forward(divide(&out_packet, fragment, config.min_ipv6_mtu))
}

/// Splits an oversized IPv6 packet (which already carries a fragment
/// header) into a chain of fragments no bigger than "min_ipv6_mtu".
///
/// The fragmentable part starts right after the fragment header; the first
/// fragment keeps the transport header, the rest carry only payload bytes.
/// Offsets count from the original packet's own fragment offset, so
/// re-fragmenting a fragment works too.
fn divide(packet: &[u8], original: ipv6::FragmentHeader, min_ipv6_mtu: u16) -> Vec<OutPacket> {
    let mtu = (min_ipv6_mtu & !7) as usize;
    let headers_size = ipv6::HEADER_SIZE + ipv6::FRAGMENT_HEADER_SIZE;
    let payload_max = mtu - headers_size;

    let body = &packet[headers_size..];

    let mut fragments = Vec::new();
    let mut consumed = 0;
    while consumed < body.len() {
        let is_last = body.len() - consumed <= payload_max;
        let take = if is_last {
            body.len() - consumed
        } else {
            payload_max
        };

        let header = ipv6::FragmentHeader {
            next_header: original.next_header,
            fragment_offset: original.fragment_offset + consumed as u16,
            more_fragments: if is_last {
                original.more_fragments
            } else {
                true
            },
            identification: original.identification,
        };

        let mut chunk = vec![0u8; headers_size + take];
        chunk[..ipv6::HEADER_SIZE].copy_from_slice(&packet[..ipv6::HEADER_SIZE]);
        let payload_len = (ipv6::FRAGMENT_HEADER_SIZE + take) as u16;
        chunk[4..6].copy_from_slice(&payload_len.to_be_bytes());
        chunk[ipv6::HEADER_SIZE..headers_size].copy_from_slice(&header.to_bytes());
        chunk[headers_size..].copy_from_slice(&body[consumed..consumed + take]);

        fragments.push(OutPacket::v6(chunk));
        consumed += take;
    }

    fragments
}

/// ICMPv4 to ICMPv6, including recursive translation of the packet inside
/// an error message. Returns None for messages with no IPv6 equivalent.
fn build_icmp6(l4_slice: &[u8], out: &Tuple6, config: &TranslateConfig) -> Option<Vec<u8>> {
    let header = icmp::IcmpHeader::parse(l4_slice).ok()?;

    if icmp::is_info(header.icmp_type()) {
        let out_type = match header.icmp_type() {
            8 => icmpv6::Icmpv6Type::EchoRequest as u8,
            _ => icmpv6::Icmpv6Type::EchoReply as u8,
        };
        let mut message = icmpv6::header_bytes(
            out_type,
            0,
            ((out.src.l4_id as u32) << 16) | header.sequence() as u32,
        )
        .to_vec();
        message.extend_from_slice(header.payload());
        icmpv6::write_checksum(&mut message, out.src.addr, out.dst.addr);
        return Some(message);
    }

    let (out_type, out_code, rest) = match header.icmp_type() {
        3 => match header.code() {
            0 | 1 | 5 | 6 | 7 | 8 | 11 | 12 => (
                icmpv6::Icmpv6Type::DestinationUnreachable as u8,
                icmpv6::dest_unreachable::NO_ROUTE,
                0,
            ),
            9 | 10 | 13 | 15 => (
                icmpv6::Icmpv6Type::DestinationUnreachable as u8,
                icmpv6::dest_unreachable::ADMIN_PROHIBITED,
                0,
            ),
            icmp::dest_unreachable::PROTOCOL => (
                icmpv6::Icmpv6Type::ParameterProblem as u8,
                icmpv6::parameter_problem::UNRECOGNIZED_NEXT_HEADER,
                6, // pointer at the Next Header field
            ),
            icmp::dest_unreachable::PORT => (
                icmpv6::Icmpv6Type::DestinationUnreachable as u8,
                icmpv6::dest_unreachable::PORT_UNREACHABLE,
                0,
            ),
            icmp::dest_unreachable::FRAG_NEEDED => {
                let mtu = ptb_mtu(header.mtu(), header.payload(), config);
                (icmpv6::Icmpv6Type::PacketTooBig as u8, 0, mtu)
            }
            code => {
                debug!(code, "untranslatable ICMPv4 unreachable code");
                return None;
            }
        },
        11 => (icmpv6::Icmpv6Type::TimeExceeded as u8, header.code(), 0),
        12 => match header.code() {
            icmp::parameter_problem::POINTER | icmp::parameter_problem::BAD_LENGTH => {
                let pointer = pointer_4to6(header.pointer())?;
                (
                    icmpv6::Icmpv6Type::ParameterProblem as u8,
                    icmpv6::parameter_problem::ERRONEOUS_HEADER,
                    pointer as u32,
                )
            }
            code => {
                debug!(code, "untranslatable ICMPv4 parameter problem code");
                return None;
            }
        },
        other => {
            // Source quench, redirects and the rest are single-hop noise.
            debug!(icmp_type = other, "untranslatable ICMPv4 type");
            return None;
        }
    };

    let inner = translate_inner(header.payload(), out, config)?;

    let mut message = icmpv6::header_bytes(out_type, out_code, rest).to_vec();
    let budget = 1280 - ipv6::HEADER_SIZE - icmpv6::HEADER_SIZE;
    message.extend_from_slice(&inner[..inner.len().min(budget)]);
    icmpv6::write_checksum(&mut message, out.src.addr, out.dst.addr);
    Some(message)
}

/// Synthesizes the Packet Too Big MTU. A zero incoming MTU means the
/// originating router predates RFC 1191; guess from the plateaus list and
/// the length the embedded packet claims.
fn ptb_mtu(reported: u16, inner: &[u8], config: &TranslateConfig) -> u32 {
    let mtu4 = if reported != 0 {
        reported as u32
    } else {
        let inner_total = ipv4::Ipv4Header::parse_embedded(inner)
            .map(|hdr| hdr.total_length())
            .unwrap_or(0);
        config
            .mtu_plateaus
            .iter()
            .copied()
            .find(|&plateau| plateau < inner_total)
            .unwrap_or(68) as u32
    };

    let mtu6 = mtu4 + 20;
    if config.lower_mtu_fail && mtu6 < 1280 {
        1280
    } else {
        mtu6
    }
}

/// Offsets into an IPv4 header mapped to the field they land on in the
/// IPv6 header (RFC 6145 section 4.2).
fn pointer_4to6(pointer: u8) -> Option<u8> {
    Some(match pointer {
        0 => 0,
        1 => 1,
        2 | 3 => 4,
        8 => 7,
        9 => 6,
        12..=15 => 8,
        16..=19 => 24,
        _ => return None,
    })
}

/// Translates the packet embedded in an ICMPv4 error, with endpoints
/// swapped, checksums adjusted in place, and no fragmentation.
fn translate_inner(inner: &[u8], out: &Tuple6, config: &TranslateConfig) -> Option<Vec<u8>> {
    let hdr = ipv4::Ipv4Header::parse_embedded(inner).ok()?;
    let l4_slice = hdr.trailing();
    if l4_slice.len() < 8 {
        return None;
    }

    // Swapped endpoints: the inner packet traveled the other way.
    let (inner_src, inner_dst) = (out.dst, out.src);

    let claimed_l4_len = (hdr.total_length() as usize).saturating_sub(hdr.header_len());

    let old_pseudo = checksum::pseudo_header_v4(hdr.src_addr(), hdr.dst_addr(), 0, 0);
    let new_pseudo = checksum::pseudo_header_v6(inner_src.addr, inner_dst.addr, 0, 0);

    let mut segment = l4_slice.to_vec();
    let protocol = match ipv4::Protocol::from_u8(hdr.protocol())? {
        ipv4::Protocol::Udp | ipv4::Protocol::Tcp => {
            let old_ports = checksum::sum_words(&segment[0..4]);
            segment[0..2].copy_from_slice(&inner_src.l4_id.to_be_bytes());
            segment[2..4].copy_from_slice(&inner_dst.l4_id.to_be_bytes());
            let new_ports = checksum::sum_words(&segment[0..4]);

            let ck_at = if hdr.protocol() == udp::PROTOCOL_NUMBER { 6 } else { 16 };
            if segment.len() >= ck_at + 2 {
                let old_ck = u16::from_be_bytes([segment[ck_at], segment[ck_at + 1]]);
                if hdr.protocol() == udp::PROTOCOL_NUMBER && old_ck == 0 {
                    // An uncomputed UDP checksum cannot be adjusted, and the
                    // payload may be truncated; the error is untranslatable.
                    return None;
                }
                let new_ck = checksum::adjust(
                    old_ck,
                    old_pseudo.wrapping_add(old_ports),
                    new_pseudo.wrapping_add(new_ports),
                );
                segment[ck_at..ck_at + 2].copy_from_slice(&new_ck.to_be_bytes());
            }
            hdr.protocol()
        }
        ipv4::Protocol::Icmp => {
            // An echo inside the error. The ICMPv6 checksum gains a
            // pseudo-header the ICMPv4 one never had.
            let old_head = checksum::sum_words(&segment[0..2])
                .wrapping_add(checksum::sum_words(&segment[4..6]));
            segment[0] = match segment[0] {
                8 => icmpv6::Icmpv6Type::EchoRequest as u8,
                _ => icmpv6::Icmpv6Type::EchoReply as u8,
            };
            segment[4..6].copy_from_slice(&inner_src.l4_id.to_be_bytes());
            let new_head = checksum::sum_words(&segment[0..2])
                .wrapping_add(checksum::sum_words(&segment[4..6]))
                .wrapping_add(checksum::pseudo_header_v6(
                    inner_src.addr,
                    inner_dst.addr,
                    icmpv6::PROTOCOL_NUMBER,
                    claimed_l4_len as u32,
                ));

            let old_ck = u16::from_be_bytes([segment[2], segment[3]]);
            let new_ck = checksum::adjust(old_ck, old_head, new_head);
            segment[2..4].copy_from_slice(&new_ck.to_be_bytes());
            icmpv6::PROTOCOL_NUMBER
        }
    };

    // Rebuild the inner IPv6 header claiming the original length. A
    // fragmented inner packet keeps its fragment header.
    let mut claimed_payload = claimed_l4_len;
    let next_header = if hdr.is_fragment() {
        claimed_payload += ipv6::FRAGMENT_HEADER_SIZE;
        ipv6::NEXT_HEADER_FRAGMENT
    } else {
        protocol
    };

    let mut packet = Vec::with_capacity(ipv6::HEADER_SIZE + segment.len() + 8);
    let mut fixed = [0u8; ipv6::HEADER_SIZE];
    let traffic_class = if config.reset_traffic_class { 0 } else { hdr.tos() };
    fixed[0] = 0x60 | (traffic_class >> 4);
    fixed[1] = traffic_class << 4;
    fixed[4..6].copy_from_slice(&(claimed_payload.min(u16::MAX as usize) as u16).to_be_bytes());
    fixed[6] = next_header;
    fixed[7] = hdr.ttl();
    fixed[8..24].copy_from_slice(&inner_src.addr.octets());
    fixed[24..40].copy_from_slice(&inner_dst.addr.octets());
    packet.extend_from_slice(&fixed);

    if hdr.is_fragment() {
        let fragment = ipv6::FragmentHeader {
            next_header: protocol,
            fragment_offset: hdr.fragment_offset(),
            more_fragments: hdr.more_fragments(),
            identification: hdr.identification() as u32,
        };
        packet.extend_from_slice(&fragment.to_bytes());
    }

    packet.extend_from_slice(&segment);
    Some(packet)
}
