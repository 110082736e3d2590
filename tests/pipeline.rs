//! End-to-end pipeline tests: packets in, translated packets out.

use nat64d::dataplane::{
    L3Proto, L4Proto, Nat64, Prefix6, RuntimeConfig, TransportAddr4, TransportAddr6, Verdict,
};
use nat64d::protocol::{checksum, icmp, icmpv6, ipv4, ipv6, tcp, udp};
use nat64d::telemetry::MetricsRegistry;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT6: &str = "2001:db8::1";
const SERVER4: Ipv4Addr = Ipv4Addr::new(192, 168, 2, 1);
const POOL4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
/// 192.168.2.1 embedded in 64:ff9b::/96.
const SERVER_EMBEDDED: &str = "64:ff9b::c0a8:201";
/// 192.0.2.1 embedded in 64:ff9b::/96.
const POOL_EMBEDDED: &str = "64:ff9b::c000:201";

fn engine() -> Nat64 {
    let engine = Nat64::new(RuntimeConfig::default(), Arc::new(MetricsRegistry::new()));
    engine
        .pool6_add(Prefix6::new("64:ff9b::".parse().unwrap(), 96))
        .unwrap();
    engine.pool4_add(POOL4).unwrap();
    engine
}

fn v6_packet(src: &str, dst: &str, proto: u8, l4: &[u8]) -> Vec<u8> {
    ipv6::Ipv6Builder::new()
        .src_addr(src.parse().unwrap())
        .dst_addr(dst.parse().unwrap())
        .next_header(proto)
        .hop_limit(64)
        .payload(l4)
        .build()
}

fn v6_udp(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = udp::build_datagram(sport, dport, payload);
    udp::write_checksum_v6(&mut datagram, src.parse().unwrap(), dst.parse().unwrap());
    v6_packet(src, dst, 17, &datagram)
}

fn v4_udp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = udp::build_datagram(sport, dport, payload);
    udp::write_checksum_v4(&mut datagram, src, dst);
    ipv4::Ipv4Builder::new()
        .src_addr(src)
        .dst_addr(dst)
        .protocol(17)
        .ttl(64)
        .payload(&datagram)
        .build()
}

fn v6_tcp(src: &str, sport: u16, dst: &str, dport: u16, flags: tcp::TcpFlags) -> Vec<u8> {
    let mut segment = tcp::build_header(sport, dport, 100, 0, flags, 8192).to_vec();
    tcp::write_checksum_v6(&mut segment, src.parse().unwrap(), dst.parse().unwrap());
    v6_packet(src, dst, 6, &segment)
}

fn v4_tcp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, flags: tcp::TcpFlags) -> Vec<u8> {
    let mut segment = tcp::build_header(sport, dport, 200, 0, flags, 8192).to_vec();
    tcp::write_checksum_v4(&mut segment, src, dst);
    ipv4::Ipv4Builder::new()
        .src_addr(src)
        .dst_addr(dst)
        .protocol(6)
        .ttl(64)
        .payload(&segment)
        .build()
}

fn syn() -> tcp::TcpFlags {
    tcp::TcpFlags {
        syn: true,
        ..Default::default()
    }
}

// Scenario: first UDP packet from the IPv6 side creates a BIB entry and a
// session, and comes out as a well-formed IPv4 datagram.
#[test]
fn udp_v6_first_packet() {
    let engine = engine();
    let packet = v6_udp(CLIENT6, 1000, SERVER_EMBEDDED, 2000, b"hello");

    let outcome = engine.process(L3Proto::Ipv6, &packet);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].family, L3Proto::Ipv4);

    let hdr = ipv4::Ipv4Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.src_addr(), POOL4);
    assert_eq!(hdr.dst_addr(), SERVER4);
    let out_udp = udp::UdpHeader::parse(hdr.payload()).unwrap();
    // Port preservation: 1000 was free on the pool address.
    assert_eq!(out_udp.src_port(), 1000);
    assert_eq!(out_udp.dst_port(), 2000);

    assert_eq!(engine.bib_count(L4Proto::Udp), 1);
    assert_eq!(engine.session_count(L4Proto::Udp), 1);

    let (bibs, _) = engine.bib_display(L4Proto::Udp, None, 10);
    assert_eq!(bibs[0].addr6, TransportAddr6::new(CLIENT6.parse().unwrap(), 1000));
    assert_eq!(bibs[0].addr4, TransportAddr4::new(POOL4, 1000));
    assert!(!bibs[0].is_static);

    // Session record mirrors its BIB entry.
    let (sessions, _) = engine.session_display(L4Proto::Udp, None, 10);
    assert_eq!(sessions[0].local6, bibs[0].addr6);
    assert_eq!(sessions[0].local4, bibs[0].addr4);
    assert_eq!(sessions[0].remote4, TransportAddr4::new(SERVER4, 2000));
}

// Scenario: the IPv4 reply rides the same session back, creating nothing.
#[test]
fn udp_v4_reply_uses_same_session() {
    let engine = engine();
    let outbound = v6_udp(CLIENT6, 1000, SERVER_EMBEDDED, 2000, b"ping");
    assert_eq!(engine.process(L3Proto::Ipv6, &outbound).verdict, Verdict::Continue);

    let reply = v4_udp(SERVER4, 2000, POOL4, 1000, b"pong");
    let outcome = engine.process(L3Proto::Ipv4, &reply);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].family, L3Proto::Ipv6);

    let hdr = ipv6::Ipv6Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.src_addr(), SERVER_EMBEDDED.parse::<Ipv6Addr>().unwrap());
    assert_eq!(hdr.dst_addr(), CLIENT6.parse::<Ipv6Addr>().unwrap());
    let out_udp = udp::UdpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(out_udp.src_port(), 2000);
    assert_eq!(out_udp.dst_port(), 1000);

    // Same BIB, same session.
    assert_eq!(engine.bib_count(L4Proto::Udp), 1);
    assert_eq!(engine.session_count(L4Proto::Udp), 1);
}

// A stray IPv4 packet with no mapping is answered with an administratively
// prohibited error.
#[test]
fn udp_v4_without_mapping_is_prohibited() {
    let engine = engine();
    let packet = v4_udp(SERVER4, 2000, POOL4, 1234, b"knock");

    let outcome = engine.process(L3Proto::Ipv4, &packet);
    assert_eq!(outcome.verdict, Verdict::Drop);
    assert_eq!(outcome.packets.len(), 1);

    let hdr = ipv4::Ipv4Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.dst_addr(), SERVER4);
    let err = icmp::IcmpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(err.icmp_type(), 3);
    assert_eq!(err.code(), 13);
}

// Packets not addressed to the translator pass through untouched.
#[test]
fn unrelated_traffic_is_accepted() {
    let engine = engine();
    let packet = v6_udp(CLIENT6, 1000, "2001:db8::2", 2000, b"local");
    assert_eq!(engine.process(L3Proto::Ipv6, &packet).verdict, Verdict::Accept);

    let packet = v4_udp(SERVER4, 1, Ipv4Addr::new(8, 8, 8, 8), 2, b"elsewhere");
    assert_eq!(engine.process(L3Proto::Ipv4, &packet).verdict, Verdict::Accept);
}

// Scenario: simultaneous open. The unsolicited IPv4 SYN is parked; the
// matching IPv6 SYN establishes the session and discards it.
#[test]
fn tcp_simultaneous_open_establishes() {
    let engine = engine();
    engine
        .bib_add_static(
            TransportAddr6::new(CLIENT6.parse().unwrap(), 8080),
            TransportAddr4::new(POOL4, 8080),
            L4Proto::Tcp,
        )
        .unwrap();

    let v4_syn = v4_tcp(SERVER4, 80, POOL4, 8080, syn());
    let outcome = engine.process(L3Proto::Ipv4, &v4_syn);
    assert_eq!(outcome.verdict, Verdict::Stolen);
    assert!(outcome.packets.is_empty());
    assert_eq!(engine.session_count(L4Proto::Tcp), 1);

    // The IPv6 endpoint opens the same connection within the window.
    let v6_syn = v6_tcp(CLIENT6, 8080, SERVER_EMBEDDED, 80, syn());
    let outcome = engine.process(L3Proto::Ipv6, &v6_syn);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.packets.len(), 1);

    let hdr = ipv4::Ipv4Header::parse(&outcome.packets[0].bytes).unwrap();
    let out_tcp = tcp::TcpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(out_tcp.src_port(), 8080);
    assert_eq!(out_tcp.dst_port(), 80);

    // Long after the SYN window, the established session is still there
    // and no unreachable error goes out for the discarded SYN.
    let outputs = engine.expire_sessions_at(Instant::now() + Duration::from_secs(10));
    assert!(outputs.is_empty());
    assert_eq!(engine.session_count(L4Proto::Tcp), 1);
}

// Scenario: nobody opens the IPv6 side; the parked SYN comes back inside
// an ICMP error when the session's short lifetime runs out.
#[test]
fn tcp_unanswered_syn_times_out_with_icmp() {
    let engine = engine();
    engine
        .bib_add_static(
            TransportAddr6::new(CLIENT6.parse().unwrap(), 8080),
            TransportAddr4::new(POOL4, 8080),
            L4Proto::Tcp,
        )
        .unwrap();

    let v4_syn = v4_tcp(SERVER4, 80, POOL4, 8080, syn());
    assert_eq!(engine.process(L3Proto::Ipv4, &v4_syn).verdict, Verdict::Stolen);

    // Not yet: the window is six seconds.
    assert!(engine
        .expire_sessions_at(Instant::now() + Duration::from_secs(5))
        .is_empty());

    let outputs = engine.expire_sessions_at(Instant::now() + Duration::from_secs(7));
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].family, L3Proto::Ipv4);

    let hdr = ipv4::Ipv4Header::parse(&outputs[0].bytes).unwrap();
    assert_eq!(hdr.dst_addr(), SERVER4);
    let err = icmp::IcmpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(err.icmp_type(), 3);
    // The stored SYN rides in the error payload.
    let inner = ipv4::Ipv4Header::parse_embedded(err.payload()).unwrap();
    assert_eq!(inner.protocol(), 6);
    assert_eq!(inner.src_addr(), SERVER4);

    assert_eq!(engine.session_count(L4Proto::Tcp), 0);
    // The static BIB entry survives its sessions.
    assert_eq!(engine.bib_count(L4Proto::Tcp), 1);
}

// Scenario: an ICMP echo crosses as a 3-tuple flow, and the reply finds
// its way back by identifier.
#[test]
fn icmp_echo_roundtrip() {
    let engine = engine();

    let request = {
        let message = icmpv6::build_echo(
            128,
            0x1234,
            1,
            b"ping",
            CLIENT6.parse().unwrap(),
            SERVER_EMBEDDED.parse().unwrap(),
        );
        v6_packet(CLIENT6, SERVER_EMBEDDED, 58, &message)
    };
    let outcome = engine.process(L3Proto::Ipv6, &request);
    assert_eq!(outcome.verdict, Verdict::Continue);

    let hdr = ipv4::Ipv4Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.protocol(), 1);
    let out_icmp = icmp::IcmpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(out_icmp.icmp_type(), 8);
    // The identifier was free on the pool address, so it survives.
    assert_eq!(out_icmp.identifier(), 0x1234);
    assert_eq!(engine.session_count(L4Proto::Icmp), 1);

    // The reply comes back with the translated identifier.
    let reply = {
        let message = icmp::build_echo(0, 0x1234, 1, b"ping");
        ipv4::Ipv4Builder::new()
            .src_addr(SERVER4)
            .dst_addr(POOL4)
            .protocol(1)
            .ttl(64)
            .payload(&message)
            .build()
    };
    let outcome = engine.process(L3Proto::Ipv4, &reply);
    assert_eq!(outcome.verdict, Verdict::Continue);

    let hdr = ipv6::Ipv6Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.dst_addr(), CLIENT6.parse::<Ipv6Addr>().unwrap());
    let out_echo = icmpv6::Icmpv6Header::parse(hdr.payload()).unwrap();
    assert_eq!(out_echo.icmp_type(), 129);
    assert_eq!(out_echo.identifier(), 0x1234);
    assert_eq!(engine.session_count(L4Proto::Icmp), 1);
}

// Scenario: an oversized IPv4 datagram with DF clear crosses as a chain of
// IPv6 fragments whose payloads reassemble exactly.
#[test]
fn oversized_v4_datagram_fragments() {
    let engine = engine();

    // Outbound packet establishes the session.
    let outbound = v6_udp(CLIENT6, 1000, SERVER_EMBEDDED, 2000, b"go");
    assert_eq!(engine.process(L3Proto::Ipv6, &outbound).verdict, Verdict::Continue);

    let payload = vec![0x5A; 2000];
    let reply = v4_udp(SERVER4, 2000, POOL4, 1000, &payload);
    let outcome = engine.process(L3Proto::Ipv4, &reply);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.packets.len(), 2);

    let mut reassembled = Vec::new();
    let mut mf_flags = Vec::new();
    for packet in &outcome.packets {
        assert_eq!(packet.family, L3Proto::Ipv6);
        assert!(packet.bytes.len() <= 1280);
        let hdr = ipv6::Ipv6Header::parse(&packet.bytes).unwrap();
        assert_eq!(hdr.next_header(), 44);
        let frag = ipv6::FragmentHeader::parse(hdr.payload()).unwrap();
        mf_flags.push(frag.more_fragments);
        reassembled.extend_from_slice(&hdr.payload()[8..]);
    }
    assert_eq!(mf_flags, vec![true, false]);

    // First fragment carries the UDP header; the rest is pure data.
    let out_udp = udp::UdpHeader::parse(&reassembled).unwrap();
    assert_eq!(out_udp.src_port(), 2000);
    assert_eq!(out_udp.dst_port(), 1000);
    assert_eq!(&reassembled[8..], &payload[..]);
}

// Scenario: a Packet Too Big report about an established TCP flow becomes
// a Fragmentation Needed with the 20-byte allowance applied.
#[test]
fn packet_too_big_becomes_frag_needed() {
    let engine = engine();

    // Establish: v6 SYN out, v4 SYN back.
    let v6_syn = v6_tcp(CLIENT6, 8080, SERVER_EMBEDDED, 80, syn());
    assert_eq!(engine.process(L3Proto::Ipv6, &v6_syn).verdict, Verdict::Continue);
    let v4_syn = v4_tcp(SERVER4, 80, POOL4, 8080, syn());
    assert_eq!(engine.process(L3Proto::Ipv4, &v4_syn).verdict, Verdict::Continue);

    // A router on the IPv6 side cannot forward our 4-to-6 output.
    let offender = {
        let mut segment = tcp::build_header(80, 8080, 1, 1, Default::default(), 512).to_vec();
        tcp::write_checksum_v6(
            &mut segment,
            SERVER_EMBEDDED.parse().unwrap(),
            CLIENT6.parse().unwrap(),
        );
        v6_packet(SERVER_EMBEDDED, CLIENT6, 6, &segment)
    };
    let ptb = {
        let mut message = icmpv6::header_bytes(2, 0, 1400).to_vec();
        message.extend_from_slice(&offender);
        let src: Ipv6Addr = "2001:db8:9999::1".parse().unwrap();
        let dst: Ipv6Addr = SERVER_EMBEDDED.parse().unwrap();
        icmpv6::write_checksum(&mut message, src, dst);
        ipv6::Ipv6Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .next_header(58)
            .hop_limit(64)
            .payload(&message)
            .build()
    };

    let outcome = engine.process(L3Proto::Ipv6, &ptb);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.packets.len(), 1);

    let hdr = ipv4::Ipv4Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.protocol(), 1);
    assert_eq!(hdr.dst_addr(), SERVER4);
    let err = icmp::IcmpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(err.icmp_type(), 3);
    assert_eq!(err.code(), 4);
    assert_eq!(err.mtu(), 1380);

    // The inner packet was translated along the session.
    let inner = ipv4::Ipv4Header::parse_embedded(err.payload()).unwrap();
    assert_eq!(inner.src_addr(), SERVER4);
    assert_eq!(inner.dst_addr(), POOL4);
}

// Hairpinning: a flow aimed at another endpoint behind the same translator
// loops back and comes out on the IPv6 side again.
#[test]
fn hairpin_reaches_the_other_client() {
    let engine = engine();
    engine
        .bib_add_static(
            TransportAddr6::new("2001:db8::b".parse().unwrap(), 7000),
            TransportAddr4::new(POOL4, 7000),
            L4Proto::Udp,
        )
        .unwrap();

    // Client A talks to client B's mapped address.
    let packet = v6_udp("2001:db8::a", 5000, POOL_EMBEDDED, 7000, b"hi b");
    let outcome = engine.process(L3Proto::Ipv6, &packet);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].family, L3Proto::Ipv6);

    let hdr = ipv6::Ipv6Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(hdr.dst_addr(), "2001:db8::b".parse::<Ipv6Addr>().unwrap());
    assert_eq!(hdr.src_addr(), POOL_EMBEDDED.parse::<Ipv6Addr>().unwrap());
    let out_udp = udp::UdpHeader::parse(hdr.payload()).unwrap();
    assert_eq!(out_udp.dst_port(), 7000);

    // Both directions of the hairpin left their sessions behind.
    assert_eq!(engine.session_count(L4Proto::Udp), 2);
}

// Address-dependent filtering: with the policy on, only remotes the
// IPv6 endpoint already contacted may send inbound packets.
#[test]
fn address_dependent_filtering() {
    let engine = engine();
    engine
        .config()
        .update(|config| {
            config.filtering.drop_by_addr = true;
            Ok(())
        })
        .unwrap();

    let outbound = v6_udp(CLIENT6, 1000, SERVER_EMBEDDED, 2000, b"out");
    assert_eq!(engine.process(L3Proto::Ipv6, &outbound).verdict, Verdict::Continue);

    // The contacted server may answer, from any port.
    let reply = v4_udp(SERVER4, 5353, POOL4, 1000, b"back");
    assert_eq!(engine.process(L3Proto::Ipv4, &reply).verdict, Verdict::Continue);

    // A stranger hitting the same mapping is rejected.
    let stranger = v4_udp(Ipv4Addr::new(203, 0, 113, 9), 2000, POOL4, 1000, b"??");
    let outcome = engine.process(L3Proto::Ipv4, &stranger);
    assert_eq!(outcome.verdict, Verdict::Drop);
    assert_eq!(outcome.packets.len(), 1);
}

// An idle established TCP session is probed rather than dropped, and the
// probe is a well-formed ACK toward the IPv6 endpoint.
#[test]
fn idle_established_session_is_probed() {
    let engine = engine();
    let v6_syn = v6_tcp(CLIENT6, 8080, SERVER_EMBEDDED, 80, syn());
    assert_eq!(engine.process(L3Proto::Ipv6, &v6_syn).verdict, Verdict::Continue);
    let v4_syn = v4_tcp(SERVER4, 80, POOL4, 8080, syn());
    assert_eq!(engine.process(L3Proto::Ipv4, &v4_syn).verdict, Verdict::Continue);

    let after_est = Instant::now() + Duration::from_secs(7201);
    let outputs = engine.expire_sessions_at(after_est);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].family, L3Proto::Ipv6);

    let hdr = ipv6::Ipv6Header::parse(&outputs[0].bytes).unwrap();
    assert_eq!(hdr.dst_addr(), CLIENT6.parse::<Ipv6Addr>().unwrap());
    assert_eq!(hdr.next_header(), 6);
    let probe = tcp::TcpHeader::parse(hdr.payload()).unwrap();
    assert!(probe.flags().ack);
    assert_eq!(probe.dst_port(), 8080);

    // The probe checksum validates.
    let sum = checksum::pseudo_header_v6(hdr.src_addr(), hdr.dst_addr(), 6, 20)
        .wrapping_add(checksum::sum_words(hdr.payload()));
    assert_eq!(checksum::fold(sum), 0xFFFF);

    // Still alive, now transitory; silence finishes it off.
    assert_eq!(engine.session_count(L4Proto::Tcp), 1);
    let outputs = engine.expire_sessions_at(after_est + Duration::from_secs(241));
    assert!(outputs.is_empty());
    assert_eq!(engine.session_count(L4Proto::Tcp), 0);
    // The dynamic BIB entry died with its last session.
    assert_eq!(engine.bib_count(L4Proto::Tcp), 0);
}

// UDP sessions vanish after their lifetime and release their mapping.
#[test]
fn udp_session_expires_and_releases_mapping() {
    let engine = engine();
    let packet = v6_udp(CLIENT6, 1000, SERVER_EMBEDDED, 2000, b"x");
    assert_eq!(engine.process(L3Proto::Ipv6, &packet).verdict, Verdict::Continue);
    assert_eq!(engine.bib_count(L4Proto::Udp), 1);

    let outputs = engine.expire_sessions_at(Instant::now() + Duration::from_secs(301));
    assert!(outputs.is_empty());
    assert_eq!(engine.session_count(L4Proto::Udp), 0);
    assert_eq!(engine.bib_count(L4Proto::Udp), 0);

    // The port is free again: a different client gets it.
    let packet = v6_udp("2001:db8::9", 1000, SERVER_EMBEDDED, 2000, b"y");
    let outcome = engine.process(L3Proto::Ipv6, &packet);
    let hdr = ipv4::Ipv4Header::parse(&outcome.packets[0].bytes).unwrap();
    assert_eq!(udp::UdpHeader::parse(hdr.payload()).unwrap().src_port(), 1000);
}

// Hop limit exhaustion answers with Time Exceeded instead of translating.
#[test]
fn hop_limit_exhaustion() {
    let engine = engine();
    let mut packet = v6_udp(CLIENT6, 1000, SERVER_EMBEDDED, 2000, b"late");
    packet[7] = 1; // hop limit

    let outcome = engine.process(L3Proto::Ipv6, &packet);
    assert_eq!(outcome.verdict, Verdict::Drop);
    assert_eq!(outcome.packets.len(), 1);
    assert_eq!(outcome.packets[0].family, L3Proto::Ipv6);

    let hdr = ipv6::Ipv6Header::parse(&outcome.packets[0].bytes).unwrap();
    let err = icmpv6::Icmpv6Header::parse(hdr.payload()).unwrap();
    assert_eq!(err.icmp_type(), 3);
    assert_eq!(err.code(), 0);
}
