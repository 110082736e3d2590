//! Pipeline stage 2: decide whether the packet may pass, and update the
//! BIB, the session tables and the TCP state machine accordingly
//! (RFC 6146 section 3.5).

use super::bib::BibEntry;
use super::engine::CoreState;
use super::rfc6052::{addr_4to6, addr_6to4};
use super::runtime::RuntimeConfig;
use super::session::{Key4, SessionEntry, TcpState};
use super::types::{L4Proto, OutPacket, Tuple, Tuple4, Tuple6};
use crate::protocol::tcp::TcpFlags;
use crate::protocol::{icmp, icmpv6};
use std::time::Instant;
use tracing::debug;

/// Facts about the packet the tuple alone does not carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMeta {
    /// TCP flags, when the packet is TCP.
    pub tcp_flags: Option<TcpFlags>,
    /// True when the packet is an ICMP error (the tuple then describes the
    /// inner packet).
    pub icmp_error: bool,
}

/// The stage's decision.
#[derive(Debug)]
pub enum FilterDecision {
    /// Translation may proceed along this session.
    Continue(SessionEntry),
    /// Discard; an error packet for the sender may ride along.
    Drop(Option<OutPacket>),
    /// The packet was stored in the pending-SYN queue. The caller must not
    /// free it.
    Stolen,
}

pub fn filter_and_update(
    state: &mut CoreState,
    config: &RuntimeConfig,
    tuple: &Tuple,
    meta: &PacketMeta,
    packet: &[u8],
    now: Instant,
) -> FilterDecision {
    // ICMP errors are never subject to filtering and never create state;
    // they ride the session of the flow they complain about.
    if meta.icmp_error {
        let session = match tuple {
            Tuple::V6(t) => state.sessions.get_6(t),
            Tuple::V4(t) => state.sessions.get_4(t),
        };
        return match session {
            Some(session) => FilterDecision::Continue(*session),
            None => {
                debug!("ICMP error does not match any session");
                FilterDecision::Drop(None)
            }
        };
    }

    match tuple {
        Tuple::V6(t) => match t.l4 {
            L4Proto::Udp | L4Proto::Icmp => ipv6_simple(state, config, t, packet, now),
            L4Proto::Tcp => tcp_v6(state, t, meta.tcp_flags.unwrap_or_default(), packet, now),
            L4Proto::None => FilterDecision::Drop(None),
        },
        Tuple::V4(t) => match t.l4 {
            L4Proto::Udp | L4Proto::Icmp => ipv4_simple(state, config, t, packet, now),
            L4Proto::Tcp => tcp_v4(state, config, t, meta.tcp_flags.unwrap_or_default(), packet, now),
            L4Proto::None => FilterDecision::Drop(None),
        },
    }
}

/// Finds the BIB entry for an IPv6 source, allocating a transport address
/// and a dynamic entry on first contact.
fn bib_for_v6(
    state: &mut CoreState,
    tuple: &Tuple6,
    packet: &[u8],
) -> Result<BibEntry, FilterDecision> {
    if let Some(entry) = state.bib.get_by_6(tuple.src, tuple.l4) {
        return Ok(entry);
    }

    let addr4 = match state.pool4.get_any_port(tuple.l4, tuple.src.l4_id) {
        Ok(addr4) => addr4,
        Err(error) => {
            debug!(%error, "cannot allocate an IPv4 transport address");
            let reply = icmpv6::error_reply(
                packet,
                icmpv6::Icmpv6Type::DestinationUnreachable as u8,
                icmpv6::dest_unreachable::ADDRESS_UNREACHABLE,
                0,
            )
            .ok()
            .map(OutPacket::v6);
            return Err(FilterDecision::Drop(reply));
        }
    };

    let entry = BibEntry::new(tuple.src, addr4, tuple.l4, false);
    if let Err(error) = state.bib.add(entry) {
        debug!(%error, "could not index the new BIB entry");
        state.pool4.release(addr4.addr, addr4.l4_id, tuple.l4);
        return Err(FilterDecision::Drop(None));
    }
    Ok(entry)
}

fn ipv6_simple(
    state: &mut CoreState,
    config: &RuntimeConfig,
    tuple: &Tuple6,
    packet: &[u8],
    now: Instant,
) -> FilterDecision {
    if tuple.l4 == L4Proto::Icmp && config.filtering.drop_icmp6_info {
        debug!("dropping ICMPv6 informational packet by policy");
        return FilterDecision::Drop(None);
    }

    let bib = match bib_for_v6(state, tuple, packet) {
        Ok(bib) => bib,
        Err(decision) => return decision,
    };

    let Some(remote4_addr) = state
        .pool6
        .get(&tuple.dst.addr)
        .and_then(|prefix| addr_6to4(&tuple.dst.addr, &prefix).ok())
    else {
        return FilterDecision::Drop(None);
    };

    let (key, created) = state
        .sessions
        .get_or_create_6(tuple, bib.addr4, remote4_addr, now);
    if created {
        state.bib.grab(bib.addr4, tuple.l4);
    }

    if tuple.l4 == L4Proto::Udp {
        state.sessions.set_udp_timer(key, now);
    } else {
        state.sessions.set_icmp_timer(key, now);
    }

    match state.sessions.get_by_key(tuple.l4, key) {
        Some(session) => FilterDecision::Continue(*session),
        None => FilterDecision::Drop(None),
    }
}

fn ipv4_simple(
    state: &mut CoreState,
    config: &RuntimeConfig,
    tuple: &Tuple4,
    packet: &[u8],
    now: Instant,
) -> FilterDecision {
    let Some(bib) = state.bib.get_by_4(tuple.dst, tuple.l4) else {
        debug!("no BIB entry for {}; packet unanswerable", tuple.dst);
        return FilterDecision::Drop(prohibited_reply(packet));
    };

    if config.filtering.drop_by_addr && !state.sessions.allow(tuple) {
        debug!("address-dependent filtering rejects {}", tuple.src);
        return FilterDecision::Drop(prohibited_reply(packet));
    }

    let Some(remote6_addr) = state
        .pool6
        .peek()
        .and_then(|prefix| addr_4to6(&tuple.src.addr, &prefix).ok())
    else {
        return FilterDecision::Drop(None);
    };

    let (key, created) = state
        .sessions
        .get_or_create_4(tuple, bib.addr6, remote6_addr, now);
    if created {
        state.bib.grab(bib.addr4, tuple.l4);
    }

    if tuple.l4 == L4Proto::Udp {
        state.sessions.set_udp_timer(key, now);
    } else {
        state.sessions.set_icmp_timer(key, now);
    }

    match state.sessions.get_by_key(tuple.l4, key) {
        Some(session) => FilterDecision::Continue(*session),
        None => FilterDecision::Drop(None),
    }
}

fn prohibited_reply(packet: &[u8]) -> Option<OutPacket> {
    icmp::error_reply(
        packet,
        icmp::IcmpType::DestinationUnreachable as u8,
        icmp::dest_unreachable::ADMIN_PROHIBITED,
        0,
    )
    .ok()
    .map(OutPacket::v4)
}

fn tcp_v6(
    state: &mut CoreState,
    tuple: &Tuple6,
    flags: TcpFlags,
    packet: &[u8],
    now: Instant,
) -> FilterDecision {
    if let Some(session) = state.sessions.get_6(tuple).copied() {
        return tcp_state_machine(state, session, PacketSide::V6, flags, now);
    }

    // No session: only a SYN may open one (RFC 6146 section 3.5.2.1).
    if !flags.syn {
        debug!("stray IPv6 TCP packet without a session");
        return FilterDecision::Drop(None);
    }

    // The SYN gets a BIB entry and a V6Init session, like a UDP first
    // packet but on the transitory lifetime.
    let bib = match bib_for_v6(state, tuple, packet) {
        Ok(bib) => bib,
        Err(decision) => return decision,
    };

    let Some(remote4_addr) = state
        .pool6
        .get(&tuple.dst.addr)
        .and_then(|prefix| addr_6to4(&tuple.dst.addr, &prefix).ok())
    else {
        return FilterDecision::Drop(None);
    };

    let (key, created) = state
        .sessions
        .get_or_create_6(tuple, bib.addr4, remote4_addr, now);
    if created {
        state.bib.grab(bib.addr4, tuple.l4);
    }
    if let Some(session) = state.sessions.get_mut_by_key(L4Proto::Tcp, key) {
        session.state = TcpState::V6Init;
    }
    state.sessions.set_tcp_trans_timer(key, now);

    match state.sessions.get_by_key(L4Proto::Tcp, key) {
        Some(session) => FilterDecision::Continue(*session),
        None => FilterDecision::Drop(None),
    }
}

fn tcp_v4(
    state: &mut CoreState,
    config: &RuntimeConfig,
    tuple: &Tuple4,
    flags: TcpFlags,
    packet: &[u8],
    now: Instant,
) -> FilterDecision {
    if let Some(session) = state.sessions.get_4(tuple).copied() {
        return tcp_state_machine(state, session, PacketSide::V4, flags, now);
    }

    if !flags.syn {
        debug!("stray IPv4 TCP packet without a session");
        return FilterDecision::Drop(None);
    }

    if config.filtering.drop_external_tcp {
        debug!("dropping externally-initiated TCP connection by policy");
        return FilterDecision::Drop(None);
    }

    let Some(bib) = state.bib.get_by_4(tuple.dst, tuple.l4) else {
        debug!("IPv4 SYN for {} has no mapping", tuple.dst);
        return FilterDecision::Drop(prohibited_reply(packet));
    };

    // Possible simultaneous open: park the SYN and wait for the IPv6 one.
    let Some(remote6_addr) = state
        .pool6
        .peek()
        .and_then(|prefix| addr_4to6(&tuple.src.addr, &prefix).ok())
    else {
        return FilterDecision::Drop(None);
    };

    let (key, created) = state
        .sessions
        .get_or_create_4(tuple, bib.addr6, remote6_addr, now);
    if created {
        state.bib.grab(bib.addr4, tuple.l4);
    }
    if let Some(session) = state.sessions.get_mut_by_key(L4Proto::Tcp, key) {
        session.state = TcpState::V4Init;
    }
    state.sessions.set_syn_timer(key, now);
    state.pkt_queue.add(key, packet.to_vec());

    FilterDecision::Stolen
}

/// Which side of the translator the packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketSide {
    V4,
    V6,
}

/// The TCP state machine of RFC 6146 section 3.5.2. Transitions the table
/// does not list leave the session alone and let the packet through.
fn tcp_state_machine(
    state: &mut CoreState,
    session: SessionEntry,
    side: PacketSide,
    flags: TcpFlags,
    now: Instant,
) -> FilterDecision {
    let key = session.key4();

    match (session.state, side) {
        (TcpState::V6Init, PacketSide::V4) if flags.syn => {
            set_state(state, key, TcpState::Established);
            state.sessions.set_tcp_est_timer(key, now);
        }
        (TcpState::V6Init, PacketSide::V6) if flags.syn => {
            // SYN retransmission; give the handshake more time.
            state.sessions.set_tcp_trans_timer(key, now);
        }
        (TcpState::V4Init, PacketSide::V6) if flags.syn => {
            set_state(state, key, TcpState::Established);
            state.sessions.set_tcp_est_timer(key, now);
            // The parked IPv4 SYN did its job; the handshake will finish
            // on its own.
            state.pkt_queue.remove(&key);
        }
        (TcpState::Established, _) => {
            if flags.rst {
                set_state(state, key, TcpState::Trans);
                state.sessions.set_tcp_trans_timer(key, now);
            } else if flags.fin {
                let next = match side {
                    PacketSide::V4 => TcpState::V4FinRcv,
                    PacketSide::V6 => TcpState::V6FinRcv,
                };
                set_state(state, key, next);
                state.sessions.set_tcp_est_timer(key, now);
            } else {
                state.sessions.set_tcp_est_timer(key, now);
            }
        }
        (TcpState::V4FinRcv, PacketSide::V6) if flags.fin => {
            set_state(state, key, TcpState::V4FinV6FinRcv);
            state.sessions.set_tcp_trans_timer(key, now);
        }
        (TcpState::V6FinRcv, PacketSide::V4) if flags.fin => {
            set_state(state, key, TcpState::V4FinV6FinRcv);
            state.sessions.set_tcp_trans_timer(key, now);
        }
        (TcpState::V4FinRcv, _) | (TcpState::V6FinRcv, _) => {
            // Data keeps half-closed connections alive.
            state.sessions.set_tcp_est_timer(key, now);
        }
        (TcpState::Trans, _) if !flags.rst => {
            // The endpoint spoke again; the connection is not dead.
            set_state(state, key, TcpState::Established);
            state.sessions.set_tcp_est_timer(key, now);
        }
        _ => {}
    }

    match state.sessions.get_by_key(L4Proto::Tcp, key) {
        Some(session) => FilterDecision::Continue(*session),
        None => FilterDecision::Drop(None),
    }
}

fn set_state(state: &mut CoreState, key: Key4, next: TcpState) {
    if let Some(session) = state.sessions.get_mut_by_key(L4Proto::Tcp, key) {
        debug!(from = ?session.state, to = ?next, "TCP transition");
        session.state = next;
    }
}
