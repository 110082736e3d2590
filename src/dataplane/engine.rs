//! The translator core: owns the databases, runs the pipeline stages in
//! order, loops hairpinned packets back, and reaps expired sessions.

use super::bib::{Bib, BibEntry};
use super::filtering::{self, FilterDecision, PacketMeta};
use super::incoming::{self, TupleError};
use super::outgoing;
use super::pkt_queue::PktQueue;
use super::pool4::Pool4;
use super::pool6::Pool6;
use super::rfc6052::Prefix6;
use super::runtime::{ConfigHandle, RuntimeConfig};
use super::session::{ExpirerKind, SessionEntry, TcpState};
use super::session_db::{ExpireEvent, SessionDb};
use super::translate::{self, TranslateOutcome};
use super::types::{L3Proto, L4Proto, OutPacket, TransportAddr4, TransportAddr6, Tuple, Verdict};
use crate::protocol::{icmp, icmpv6, ipv4, ipv6, tcp};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// The databases the pipeline consults and mutates. Filtering touches the
/// pools, the BIB, the sessions and the packet queue as one decision, so
/// they live behind one lock.
pub struct CoreState {
    pub pool6: Pool6,
    pub pool4: Pool4,
    pub bib: Bib,
    pub sessions: SessionDb,
    pub pkt_queue: PktQueue,
}

/// What the pipeline did with a packet, plus everything it wants emitted:
/// translated packets, fragments, and ICMP errors alike.
#[derive(Debug)]
pub struct Outcome {
    pub verdict: Verdict,
    pub packets: Vec<OutPacket>,
}

/// A session as reported to the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub local6: TransportAddr6,
    pub remote6: TransportAddr6,
    pub local4: TransportAddr4,
    pub remote4: TransportAddr4,
    pub state: TcpState,
    /// Milliseconds until the expirer would reap the session.
    pub dying_time_ms: u64,
}

pub struct Nat64 {
    state: Mutex<CoreState>,
    config: ConfigHandle,
    metrics: Arc<MetricsRegistry>,
}

impl Nat64 {
    pub fn new(config: RuntimeConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: Mutex::new(CoreState {
                pool6: Pool6::new(),
                pool4: Pool4::new(),
                bib: Bib::new(),
                sessions: SessionDb::new(),
                pkt_queue: PktQueue::new(config.pktqueue.max_pkts as usize),
            }),
            config: ConfigHandle::new(config),
            metrics,
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Runs the whole pipeline on one packet.
    pub fn process(&self, family: L3Proto, packet: &[u8]) -> Outcome {
        let config = self.config.snapshot();
        let mut state = self.state.lock().unwrap();
        let mut packets = Vec::new();
        let verdict = self.pipeline(
            &mut state,
            &config,
            family,
            packet,
            Instant::now(),
            &mut packets,
            0,
        );

        self.metrics.set_session_count(state.sessions.total());
        self.metrics.set_bib_count(
            state.bib.count(L4Proto::Udp)
                + state.bib.count(L4Proto::Tcp)
                + state.bib.count(L4Proto::Icmp),
        );

        Outcome { verdict, packets }
    }

    #[allow(clippy::too_many_arguments)]
    fn pipeline(
        &self,
        state: &mut CoreState,
        config: &RuntimeConfig,
        family: L3Proto,
        packet: &[u8],
        now: Instant,
        outputs: &mut Vec<OutPacket>,
        depth: u8,
    ) -> Verdict {
        // Stage 1: the incoming tuple.
        let tuple = match incoming::incoming_tuple(family, packet) {
            Ok(tuple) => tuple,
            Err(TupleError::Malformed) => {
                self.metrics.in_hdr_errors.inc();
                return Verdict::Drop;
            }
            Err(TupleError::UnknownProto) => {
                self.metrics.in_unknown_protos.inc();
                return Verdict::Drop;
            }
            Err(TupleError::Fragment) => {
                debug!("non-initial fragment; nothing to match it against");
                self.metrics.in_hdr_errors.inc();
                return Verdict::Drop;
            }
        };
        debug!(%tuple, "incoming tuple");

        // Not addressed to the translator: none of our business.
        let ours = match &tuple {
            Tuple::V6(t) => state.pool6.contains(&t.dst.addr),
            Tuple::V4(t) => state.pool4.contains(t.dst.addr),
        };
        if !ours {
            self.metrics.passed_through.inc();
            return Verdict::Accept;
        }

        // Stage 2: filtering and updating.
        let meta = packet_meta(family, packet);
        let session = match filtering::filter_and_update(state, config, &tuple, &meta, packet, now)
        {
            FilterDecision::Continue(session) => session,
            FilterDecision::Drop(reply) => {
                if let Some(reply) = reply {
                    self.metrics.icmp_errors_sent.inc();
                    outputs.push(reply);
                }
                self.metrics.filter_dropped.inc();
                return Verdict::Drop;
            }
            FilterDecision::Stolen => {
                self.metrics.syns_stored.inc();
                return Verdict::Stolen;
            }
        };

        // Stage 3: the outgoing tuple.
        let out_tuple = outgoing::outgoing_tuple(&tuple, &session);
        debug!(tuple = %out_tuple, "outgoing tuple");

        // Stage 4: translation.
        let translated = match translate::translate(packet, &out_tuple, &config.translate) {
            TranslateOutcome::Forward(packets) => packets,
            TranslateOutcome::Drop { icmp_error } => {
                if let Some(reply) = icmp_error {
                    self.metrics.icmp_errors_sent.inc();
                    outputs.push(reply);
                }
                return Verdict::Drop;
            }
        };

        // Stage 5: hairpin detection. A translated IPv4 packet aimed at the
        // pool is really for another IPv6 endpoint behind this translator.
        if depth == 0 && translated.len() == 1 && translated[0].family == L3Proto::Ipv4 {
            let hairpin = ipv4::Ipv4Header::parse(&translated[0].bytes)
                .map(|hdr| state.pool4.contains(hdr.dst_addr()))
                .unwrap_or(false);
            if hairpin {
                debug!("hairpin: translated packet re-enters the pipeline");
                self.metrics.hairpins.inc();
                let looped = translated[0].bytes.clone();
                let verdict =
                    self.pipeline(state, config, L3Proto::Ipv4, &looped, now, outputs, depth + 1);
                // The original packet was consumed either way; only a drop
                // of the looped packet is worth reporting upward.
                return match verdict {
                    Verdict::Drop | Verdict::Accept => Verdict::Drop,
                    other => other,
                };
            }
        }

        match family {
            L3Proto::Ipv6 => self.metrics.translated_6to4.inc(),
            L3Proto::Ipv4 => self.metrics.translated_4to6.inc(),
        }
        outputs.extend(translated);
        Verdict::Continue
    }

    /// Reaps expired sessions. Returns the packets this produced: TCP
    /// probes for idle established sessions and ICMP errors answering
    /// timed-out unsolicited SYNs.
    pub fn expire_sessions(&self) -> Vec<OutPacket> {
        self.expire_sessions_at(Instant::now())
    }

    /// Like [`Self::expire_sessions`], against a caller-supplied clock.
    /// Embedders driving their own timers pass the host's idea of "now".
    pub fn expire_sessions_at(&self, now: Instant) -> Vec<OutPacket> {
        let config = self.config.snapshot();
        let mut state = self.state.lock().unwrap();
        let mut outputs = Vec::new();

        let events = state.sessions.expire(now, &config.sessiondb.ttl);
        for event in events {
            match event {
                ExpireEvent::Removed(entry) => {
                    self.metrics.sessions_expired.inc();

                    let stored = state.pkt_queue.remove(&entry.key4());
                    if let Some(stored) = stored {
                        if entry.expirer == ExpirerKind::Syn {
                            // Nobody opened the IPv6 side in time; the
                            // parked SYN is returned inside an error.
                            if let Ok(reply) = icmp::error_reply(
                                &stored,
                                icmp::IcmpType::DestinationUnreachable as u8,
                                icmp::dest_unreachable::HOST,
                                0,
                            ) {
                                self.metrics.icmp_errors_sent.inc();
                                outputs.push(OutPacket::v4(reply));
                            }
                        }
                    }

                    release_session(state_parts(&mut state), &entry);
                }
                ExpireEvent::Probe(entry) => {
                    outputs.push(build_probe(&entry));
                }
            }
        }

        self.metrics.set_session_count(state.sessions.total());
        outputs
    }

    // ---- Control-channel operations ----

    pub fn pool6_add(&self, prefix: Prefix6) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pool6.add(prefix)?;
        info!("added pool6 prefix {}/{}", prefix.addr, prefix.len);
        Ok(())
    }

    /// Removes a prefix. Unless "quick", sessions built on it die with it.
    pub fn pool6_remove(&self, prefix: &Prefix6, quick: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pool6.remove(prefix)?;
        if !quick {
            let removed = state.sessions.delete_by_v6_prefix(prefix);
            for entry in removed {
                release_session(state_parts(&mut state), &entry);
            }
        }
        info!("removed pool6 prefix {}/{}", prefix.addr, prefix.len);
        Ok(())
    }

    pub fn pool6_list(&self) -> Vec<Prefix6> {
        let state = self.state.lock().unwrap();
        let mut prefixes = Vec::new();
        state.pool6.for_each(|prefix| prefixes.push(*prefix));
        prefixes
    }

    pub fn pool6_count(&self) -> usize {
        self.state.lock().unwrap().pool6.count()
    }

    pub fn pool6_flush(&self, quick: bool) {
        let mut state = self.state.lock().unwrap();
        state.pool6.flush();
        if !quick {
            let removed = state.sessions.flush();
            for entry in removed {
                release_session(state_parts(&mut state), &entry);
            }
        }
        info!("flushed the pool6 prefixes");
    }

    pub fn pool4_add(&self, addr: Ipv4Addr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pool4.add(addr)?;
        info!("added pool4 address {}", addr);
        Ok(())
    }

    /// Removes an address. Unless "quick", its BIB entries and sessions die
    /// with it.
    pub fn pool4_remove(&self, addr: Ipv4Addr, quick: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pool4.remove(addr)?;
        if !quick {
            let removed = state.sessions.delete_by_v4(addr);
            for entry in removed {
                state.pkt_queue.remove(&entry.key4());
            }
            for l4 in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
                let mut doomed = Vec::new();
                state.bib.for_each(l4, |entry| {
                    if entry.addr4.addr == addr {
                        doomed.push(entry.addr4);
                    }
                });
                for addr4 in doomed {
                    let _ = state.bib.remove(addr4, l4);
                }
            }
        }
        info!("removed pool4 address {}", addr);
        Ok(())
    }

    pub fn pool4_list(&self) -> Vec<Ipv4Addr> {
        let state = self.state.lock().unwrap();
        let mut addrs = Vec::new();
        state.pool4.for_each(|addr| addrs.push(addr));
        addrs
    }

    pub fn pool4_count(&self) -> usize {
        self.state.lock().unwrap().pool4.count()
    }

    pub fn pool4_flush(&self, quick: bool) {
        let mut state = self.state.lock().unwrap();
        state.pool4.flush();
        if !quick {
            let removed = state.sessions.flush();
            for entry in removed {
                state.pkt_queue.remove(&entry.key4());
            }
            for l4 in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
                let mut doomed = Vec::new();
                state.bib.for_each(l4, |entry| doomed.push(entry.addr4));
                for addr4 in doomed {
                    let _ = state.bib.remove(addr4, l4);
                }
            }
        }
        info!("flushed the pool4 addresses");
    }

    /// Installs a static mapping. The IPv4 side must name a pooled address;
    /// its port is reserved for as long as the entry lives.
    pub fn bib_add_static(
        &self,
        addr6: TransportAddr6,
        addr4: TransportAddr4,
        l4: L4Proto,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.pool4.contains(addr4.addr) {
            return Err(Error::NotFound(format!(
                "{} is not a pool4 address",
                addr4.addr
            )));
        }
        state.pool4.reserve(addr4.addr, addr4.l4_id, l4)?;
        let entry = BibEntry::new(addr6, addr4, l4, true);
        if let Err(error) = state.bib.add(entry) {
            state.pool4.release(addr4.addr, addr4.l4_id, l4);
            return Err(error);
        }
        info!("added static BIB entry {} <-> {} ({})", addr6, addr4, l4);
        Ok(())
    }

    /// Removes a mapping along with the sessions built on it.
    pub fn bib_remove(&self, addr4: TransportAddr4, l4: L4Proto) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let removed = state.sessions.delete_by_bib(l4, addr4);
        for entry in removed {
            state.pkt_queue.remove(&entry.key4());
        }
        let entry = state.bib.remove(addr4, l4)?;
        state.pool4.release(entry.addr4.addr, entry.addr4.l4_id, l4);
        info!("removed BIB entry {} <-> {}", entry.addr6, entry.addr4);
        Ok(())
    }

    /// Resolves an IPv6-side address to its IPv4 side, for removal by
    /// either key.
    pub fn bib_find_by_6(&self, addr6: TransportAddr6, l4: L4Proto) -> Option<TransportAddr4> {
        self.state
            .lock()
            .unwrap()
            .bib
            .get_by_6(addr6, l4)
            .map(|entry| entry.addr4)
    }

    /// One page of BIB entries, ordered by IPv4 transport address.
    /// Returns the page and whether more entries follow.
    pub fn bib_display(
        &self,
        l4: L4Proto,
        cursor: Option<TransportAddr4>,
        max: usize,
    ) -> (Vec<BibEntry>, bool) {
        let state = self.state.lock().unwrap();
        let mut page = Vec::new();
        let mut more = false;
        state.bib.iterate_from(l4, cursor, |entry| {
            if page.len() == max {
                more = true;
                return false;
            }
            page.push(*entry);
            true
        });
        (page, more)
    }

    pub fn bib_count(&self, l4: L4Proto) -> usize {
        self.state.lock().unwrap().bib.count(l4)
    }

    /// One page of sessions, ordered by IPv4 pair, resuming after the
    /// given local transport address.
    pub fn session_display(
        &self,
        l4: L4Proto,
        cursor: Option<TransportAddr4>,
        max: usize,
    ) -> (Vec<SessionView>, bool) {
        let config = self.config.snapshot();
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let mut page = Vec::new();
        let mut more = false;
        state.sessions.iterate_from(l4, cursor, |entry| {
            if page.len() == max {
                more = true;
                return false;
            }
            let ttl = match entry.expirer {
                ExpirerKind::Udp => config.sessiondb.ttl.udp,
                ExpirerKind::TcpEst => config.sessiondb.ttl.tcp_est,
                ExpirerKind::TcpTrans => config.sessiondb.ttl.tcp_trans,
                ExpirerKind::Syn => super::session_db::TCP_INCOMING_SYN,
                ExpirerKind::Icmp => config.sessiondb.ttl.icmp,
            };
            let dying = (entry.update_time + ttl).saturating_duration_since(now);
            page.push(SessionView {
                local6: entry.local6,
                remote6: entry.remote6,
                local4: entry.local4,
                remote4: entry.remote4,
                state: entry.state,
                dying_time_ms: dying.as_millis() as u64,
            });
            true
        });
        (page, more)
    }

    pub fn session_count(&self, l4: L4Proto) -> usize {
        self.state.lock().unwrap().sessions.count(l4)
    }

    /// Applies a new pending-SYN queue capacity from the configuration.
    pub fn apply_pktqueue_config(&self) {
        let max = self.config.snapshot().pktqueue.max_pkts as usize;
        self.state.lock().unwrap().pkt_queue.set_max_pkts(max);
    }
}

/// Narrow view used by the session teardown helper, so callers holding the
/// state lock can hand out disjoint borrows.
struct TeardownParts<'a> {
    pool4: &'a mut Pool4,
    bib: &'a mut Bib,
    pkt_queue: &'a mut PktQueue,
}

fn state_parts(state: &mut CoreState) -> TeardownParts<'_> {
    TeardownParts {
        pool4: &mut state.pool4,
        bib: &mut state.bib,
        pkt_queue: &mut state.pkt_queue,
    }
}

/// Releases everything a dead session was holding: its stored packet, its
/// BIB reference, and (when the BIB entry dies with it) the port.
fn release_session(parts: TeardownParts<'_>, entry: &SessionEntry) {
    parts.pkt_queue.remove(&entry.key4());
    if let Some(dead) = parts.bib.put_back(entry.local4, entry.l4) {
        parts
            .pool4
            .release(dead.addr4.addr, dead.addr4.l4_id, dead.l4);
        debug!("BIB entry {} <-> {} died", dead.addr6, dead.addr4);
    }
}

/// A minimal TCP ACK toward the IPv6 endpoint, nudging it to answer (or
/// RST) so an idle session either refreshes or finishes dying.
fn build_probe(session: &SessionEntry) -> OutPacket {
    let flags = tcp::TcpFlags {
        ack: true,
        ..Default::default()
    };
    let mut segment = tcp::build_header(
        session.remote6.l4_id,
        session.local6.l4_id,
        0,
        0,
        flags,
        8192,
    )
    .to_vec();
    tcp::write_checksum_v6(&mut segment, session.remote6.addr, session.local6.addr);

    OutPacket::v6(
        ipv6::Ipv6Builder::new()
            .src_addr(session.remote6.addr)
            .dst_addr(session.local6.addr)
            .next_header(tcp::PROTOCOL_NUMBER)
            .hop_limit(255)
            .payload(&segment)
            .build(),
    )
}

/// Collects the facts stage 2 needs beyond the tuple itself.
fn packet_meta(family: L3Proto, packet: &[u8]) -> PacketMeta {
    let mut meta = PacketMeta::default();

    match family {
        L3Proto::Ipv4 => {
            let Ok(hdr) = ipv4::Ipv4Header::parse(packet) else {
                return meta;
            };
            match hdr.protocol() {
                tcp::PROTOCOL_NUMBER => {
                    if let Ok(tcp_hdr) = tcp::TcpHeader::parse(hdr.payload()) {
                        meta.tcp_flags = Some(tcp_hdr.flags());
                    }
                }
                icmp::PROTOCOL_NUMBER => {
                    if let Ok(icmp_hdr) = icmp::IcmpHeader::parse(hdr.payload()) {
                        meta.icmp_error = icmp::is_error(icmp_hdr.icmp_type());
                    }
                }
                _ => {}
            }
        }
        L3Proto::Ipv6 => {
            let Ok(hdr) = ipv6::Ipv6Header::parse(packet) else {
                return meta;
            };
            let Ok(chain) = ipv6::walk_header_chain(hdr.next_header(), hdr.payload()) else {
                return meta;
            };
            let l4_slice = &hdr.payload()[chain.l4_offset..];
            match chain.upper_proto {
                tcp::PROTOCOL_NUMBER => {
                    if let Ok(tcp_hdr) = tcp::TcpHeader::parse(l4_slice) {
                        meta.tcp_flags = Some(tcp_hdr.flags());
                    }
                }
                icmpv6::PROTOCOL_NUMBER => {
                    if let Ok(icmp_hdr) = icmpv6::Icmpv6Header::parse(l4_slice) {
                        meta.icmp_error = icmpv6::is_error(icmp_hdr.icmp_type());
                    }
                }
                _ => {}
            }
        }
    }

    meta
}
