//! The session database: three tables of per-flow records, each indexed by
//! the full IPv6 pair and the full IPv4 pair, plus the five expirer queues.
//!
//! Each expirer queue is FIFO and ordered by `update_time`, because touching
//! a session always re-appends it at the tail with a fresh timestamp. The
//! expiry walk can therefore stop at the first unexpired session. Queue
//! slots are invalidated lazily: a slot whose stamp no longer matches the
//! session's was superseded by a later touch (or the session is gone) and is
//! skipped.

use super::rfc6052::Prefix6;
use super::session::{ExpirerKind, Key4, Key6, SessionEntry, TcpState};
use super::types::{L4Proto, Tuple4, Tuple6};
use crate::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::ops::Bound;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sessions born from an unsolicited IPv4 SYN live this long, waiting for
/// the matching IPv6 SYN. Deliberately short; not configurable.
pub const TCP_INCOMING_SYN: Duration = Duration::from_secs(6);

/// TTLs the expirer applies, taken from the live configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTtls {
    pub udp: Duration,
    pub icmp: Duration,
    pub tcp_est: Duration,
    pub tcp_trans: Duration,
}

/// What happened to a session during an expiry walk.
#[derive(Debug, Clone)]
pub enum ExpireEvent {
    /// The session was removed from the database. The caller drops the BIB
    /// reference and, for V4Init TCP sessions, answers the stored SYN.
    Removed(SessionEntry),
    /// An established TCP session went quiet: it was moved to the
    /// transitory queue and the caller should emit a probe packet.
    Probe(SessionEntry),
}

#[derive(Debug, Default)]
struct SessionTable {
    by6: BTreeMap<Key6, Key4>,
    by4: BTreeMap<Key4, SessionEntry>,
}

impl SessionTable {
    fn remove(&mut self, key4: Key4) -> Option<SessionEntry> {
        let entry = self.by4.remove(&key4)?;
        self.by6.remove(&entry.key6());
        Some(entry)
    }
}

/// The three session tables and five expirer queues.
#[derive(Debug, Default)]
pub struct SessionDb {
    udp: SessionTable,
    tcp: SessionTable,
    icmp: SessionTable,

    queue_udp: VecDeque<(Key4, u64)>,
    queue_tcp_est: VecDeque<(Key4, u64)>,
    queue_tcp_trans: VecDeque<(Key4, u64)>,
    queue_syn: VecDeque<(Key4, u64)>,
    queue_icmp: VecDeque<(Key4, u64)>,

    next_stamp: u64,
}

impl SessionDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, l4: L4Proto) -> &SessionTable {
        match l4 {
            L4Proto::Udp => &self.udp,
            L4Proto::Tcp => &self.tcp,
            _ => &self.icmp,
        }
    }

    fn table_mut(&mut self, l4: L4Proto) -> &mut SessionTable {
        match l4 {
            L4Proto::Udp => &mut self.udp,
            L4Proto::Tcp => &mut self.tcp,
            _ => &mut self.icmp,
        }
    }

    fn queue_mut(&mut self, kind: ExpirerKind) -> &mut VecDeque<(Key4, u64)> {
        match kind {
            ExpirerKind::Udp => &mut self.queue_udp,
            ExpirerKind::TcpEst => &mut self.queue_tcp_est,
            ExpirerKind::TcpTrans => &mut self.queue_tcp_trans,
            ExpirerKind::Syn => &mut self.queue_syn,
            ExpirerKind::Icmp => &mut self.queue_icmp,
        }
    }

    fn key6_of(tuple: &Tuple6) -> Key6 {
        Key6 {
            local: tuple.src,
            remote: tuple.dst,
        }
    }

    fn key4_of(tuple: &Tuple4) -> Key4 {
        Key4 {
            local: tuple.dst,
            remote: tuple.src,
        }
    }

    /// Canonical lookup for the datapath, in either direction.
    pub fn get_6(&self, tuple: &Tuple6) -> Option<&SessionEntry> {
        let table = self.table(tuple.l4);
        let key4 = table.by6.get(&Self::key6_of(tuple))?;
        table.by4.get(key4)
    }

    pub fn get_4(&self, tuple: &Tuple4) -> Option<&SessionEntry> {
        self.table(tuple.l4).by4.get(&Self::key4_of(tuple))
    }

    /// Address-dependent filtering check: does any session exist with this
    /// (local4, remote4 address) pair, whatever the remote port?
    pub fn allow(&self, tuple: &Tuple4) -> bool {
        let key = Self::key4_of(tuple);
        self.table(tuple.l4)
            .by4
            .range((
                Bound::Included(Key4 {
                    local: key.local,
                    remote: super::types::TransportAddr4::new(key.remote.addr, 0),
                }),
                Bound::Included(Key4 {
                    local: key.local,
                    remote: super::types::TransportAddr4::new(key.remote.addr, u16::MAX),
                }),
            ))
            .next()
            .is_some()
    }

    /// Looks up the session for an IPv6-sourced tuple, creating it on miss.
    /// "remote4" is the RFC 6052 extraction of the tuple's destination;
    /// "bib" is the (addr6, addr4) pair of the owning BIB entry.
    ///
    /// Returns the key and whether a session was created (a created session
    /// counts one new reference on the BIB entry, which the caller records).
    pub fn get_or_create_6(
        &mut self,
        tuple: &Tuple6,
        bib_addr4: super::types::TransportAddr4,
        remote4_addr: Ipv4Addr,
        now: Instant,
    ) -> (Key4, bool) {
        if let Some(session) = self.get_6(tuple) {
            return (session.key4(), false);
        }

        let remote4 = super::types::TransportAddr4::new(
            remote4_addr,
            if tuple.l4 == L4Proto::Icmp {
                bib_addr4.l4_id
            } else {
                tuple.dst.l4_id
            },
        );
        let entry = SessionEntry {
            local6: tuple.src,
            remote6: tuple.dst,
            local4: bib_addr4,
            remote4,
            l4: tuple.l4,
            state: TcpState::Closed,
            update_time: now,
            expirer: ExpirerKind::Udp,
            stamp: 0,
        };
        let key4 = entry.key4();
        self.insert(entry);
        (key4, true)
    }

    /// Looks up the session for an IPv4-sourced tuple, creating it on miss.
    /// "remote6_addr" is the RFC 6052 embedding of the tuple's source;
    /// "bib_addr6" is the IPv6 side of the owning BIB entry.
    pub fn get_or_create_4(
        &mut self,
        tuple: &Tuple4,
        bib_addr6: super::types::TransportAddr6,
        remote6_addr: std::net::Ipv6Addr,
        now: Instant,
    ) -> (Key4, bool) {
        if let Some(session) = self.get_4(tuple) {
            return (session.key4(), false);
        }

        let remote6 = super::types::TransportAddr6::new(
            remote6_addr,
            if tuple.l4 == L4Proto::Icmp {
                bib_addr6.l4_id
            } else {
                tuple.src.l4_id
            },
        );
        let entry = SessionEntry {
            local6: bib_addr6,
            remote6,
            local4: tuple.dst,
            remote4: tuple.src,
            l4: tuple.l4,
            state: TcpState::Closed,
            update_time: now,
            expirer: ExpirerKind::Udp,
            stamp: 0,
        };
        let key4 = entry.key4();
        self.insert(entry);
        (key4, true)
    }

    /// Inserts a fully-formed session. Both indices are updated together.
    pub fn add(&mut self, entry: SessionEntry) -> Result<()> {
        let table = self.table(entry.l4);
        if table.by4.contains_key(&entry.key4()) || table.by6.contains_key(&entry.key6()) {
            return Err(Error::Exists(format!(
                "{} <-> {}",
                entry.local6, entry.remote4
            )));
        }
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: SessionEntry) {
        let table = self.table_mut(entry.l4);
        table.by6.insert(entry.key6(), entry.key4());
        table.by4.insert(entry.key4(), entry);
    }

    pub fn get_by_key(&self, l4: L4Proto, key: Key4) -> Option<&SessionEntry> {
        self.table(l4).by4.get(&key)
    }

    pub fn get_mut_by_key(&mut self, l4: L4Proto, key: Key4) -> Option<&mut SessionEntry> {
        self.table_mut(l4).by4.get_mut(&key)
    }

    /// Refreshes a session's lifetime on the given expirer queue: stamp a new
    /// update time and re-append at the queue's tail.
    pub fn touch(&mut self, l4: L4Proto, key: Key4, kind: ExpirerKind, now: Instant) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;

        let Some(entry) = self.table_mut(l4).by4.get_mut(&key) else {
            return;
        };
        entry.update_time = now;
        entry.expirer = kind;
        entry.stamp = stamp;
        self.queue_mut(kind).push_back((key, stamp));
    }

    pub fn set_udp_timer(&mut self, key: Key4, now: Instant) {
        self.touch(L4Proto::Udp, key, ExpirerKind::Udp, now);
    }

    pub fn set_tcp_est_timer(&mut self, key: Key4, now: Instant) {
        self.touch(L4Proto::Tcp, key, ExpirerKind::TcpEst, now);
    }

    pub fn set_tcp_trans_timer(&mut self, key: Key4, now: Instant) {
        self.touch(L4Proto::Tcp, key, ExpirerKind::TcpTrans, now);
    }

    pub fn set_syn_timer(&mut self, key: Key4, now: Instant) {
        self.touch(L4Proto::Tcp, key, ExpirerKind::Syn, now);
    }

    pub fn set_icmp_timer(&mut self, key: Key4, now: Instant) {
        self.touch(L4Proto::Icmp, key, ExpirerKind::Icmp, now);
    }

    /// Removes a session outright. Used by teardown paths; the caller drops
    /// the BIB reference.
    pub fn remove(&mut self, l4: L4Proto, key: Key4) -> Option<SessionEntry> {
        self.table_mut(l4).remove(key)
    }

    pub fn count(&self, l4: L4Proto) -> usize {
        self.table(l4).by4.len()
    }

    pub fn total(&self) -> usize {
        self.udp.by4.len() + self.tcp.by4.len() + self.icmp.by4.len()
    }

    pub fn for_each<F: FnMut(&SessionEntry)>(&self, l4: L4Proto, mut func: F) {
        for entry in self.table(l4).by4.values() {
            func(entry);
        }
    }

    /// Walks sessions in IPv4-pair order, resuming after every session whose
    /// local transport address is at most "cursor". Stops when "func"
    /// returns false.
    pub fn iterate_from<F: FnMut(&SessionEntry) -> bool>(
        &self,
        l4: L4Proto,
        cursor: Option<super::types::TransportAddr4>,
        mut func: F,
    ) {
        let lower = match cursor {
            Some(local) => Bound::Excluded(Key4 {
                local,
                remote: super::types::TransportAddr4::new(Ipv4Addr::BROADCAST, u16::MAX),
            }),
            None => Bound::Unbounded,
        };
        for (_, entry) in self.table(l4).by4.range((lower, Bound::Unbounded)) {
            if !func(entry) {
                break;
            }
        }
    }

    /// Deletes every session referencing the BIB entry at "bib_addr4".
    pub fn delete_by_bib(&mut self, l4: L4Proto, bib_addr4: super::types::TransportAddr4) -> Vec<SessionEntry> {
        let keys: Vec<Key4> = self
            .table(l4)
            .by4
            .range((
                Bound::Included(Key4 {
                    local: bib_addr4,
                    remote: super::types::TransportAddr4::new(Ipv4Addr::UNSPECIFIED, 0),
                }),
                Bound::Included(Key4 {
                    local: bib_addr4,
                    remote: super::types::TransportAddr4::new(Ipv4Addr::BROADCAST, u16::MAX),
                }),
            ))
            .map(|(k, _)| *k)
            .collect();

        let table = self.table_mut(l4);
        let removed: Vec<SessionEntry> = keys.iter().filter_map(|k| table.remove(*k)).collect();
        debug!(count = removed.len(), "deleted sessions by BIB");
        removed
    }

    /// Deletes every session whose local IPv4 address is "addr", in all
    /// three tables. Used when a pool4 address is withdrawn.
    pub fn delete_by_v4(&mut self, addr: Ipv4Addr) -> Vec<SessionEntry> {
        let mut removed = Vec::new();
        for l4 in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
            let keys: Vec<Key4> = self
                .table(l4)
                .by4
                .keys()
                .filter(|k| k.local.addr == addr)
                .copied()
                .collect();
            let table = self.table_mut(l4);
            removed.extend(keys.iter().filter_map(|k| table.remove(*k)));
        }
        debug!(count = removed.len(), "deleted sessions by pool4 address");
        removed
    }

    /// Deletes every session whose remote IPv6 address (the embedded peer)
    /// falls under "prefix". Used when a pool6 prefix is withdrawn.
    pub fn delete_by_v6_prefix(&mut self, prefix: &Prefix6) -> Vec<SessionEntry> {
        let mut removed = Vec::new();
        for l4 in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
            let keys: Vec<Key4> = self
                .table(l4)
                .by4
                .values()
                .filter(|e| prefix.matches(&e.remote6.addr))
                .map(|e| e.key4())
                .collect();
            let table = self.table_mut(l4);
            removed.extend(keys.iter().filter_map(|k| table.remove(*k)));
        }
        debug!(count = removed.len(), "deleted sessions by pool6 prefix");
        removed
    }

    /// Empties all three tables. Queue slots go stale and get skipped later.
    pub fn flush(&mut self) -> Vec<SessionEntry> {
        let mut removed = Vec::new();
        for l4 in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
            let table = self.table_mut(l4);
            removed.extend(table.by4.values().copied());
            table.by4.clear();
            table.by6.clear();
        }
        removed
    }

    fn ttl_of(kind: ExpirerKind, ttls: &SessionTtls) -> Duration {
        match kind {
            ExpirerKind::Udp => ttls.udp,
            ExpirerKind::TcpEst => ttls.tcp_est,
            ExpirerKind::TcpTrans => ttls.tcp_trans,
            ExpirerKind::Syn => TCP_INCOMING_SYN,
            ExpirerKind::Icmp => ttls.icmp,
        }
    }

    fn l4_of(kind: ExpirerKind) -> L4Proto {
        match kind {
            ExpirerKind::Udp => L4Proto::Udp,
            ExpirerKind::Icmp => L4Proto::Icmp,
            _ => L4Proto::Tcp,
        }
    }

    /// Runs the expiry walk on every queue.
    pub fn expire(&mut self, now: Instant, ttls: &SessionTtls) -> Vec<ExpireEvent> {
        let mut events = Vec::new();
        for kind in [
            ExpirerKind::Udp,
            ExpirerKind::TcpEst,
            ExpirerKind::TcpTrans,
            ExpirerKind::Syn,
            ExpirerKind::Icmp,
        ] {
            self.expire_queue(kind, now, ttls, &mut events);
        }
        events
    }

    /// Walks one queue from its head (the oldest entry). Every live entry is
    /// ordered by update time, so the walk stops at the first session whose
    /// lifetime has not elapsed yet.
    fn expire_queue(
        &mut self,
        kind: ExpirerKind,
        now: Instant,
        ttls: &SessionTtls,
        events: &mut Vec<ExpireEvent>,
    ) {
        let ttl = Self::ttl_of(kind, ttls);
        let l4 = Self::l4_of(kind);

        loop {
            let Some(&(key, stamp)) = self.queue_mut(kind).front() else {
                return;
            };

            let entry = match self.table(l4).by4.get(&key) {
                Some(entry) if entry.stamp == stamp && entry.expirer == kind => *entry,
                // Superseded by a later touch, or already gone.
                _ => {
                    self.queue_mut(kind).pop_front();
                    continue;
                }
            };

            if now < entry.update_time + ttl {
                return;
            }
            self.queue_mut(kind).pop_front();

            if kind == ExpirerKind::TcpEst && entry.state == TcpState::Established {
                // Idle but maybe alive: probe it and give it the transitory
                // lifetime before giving up for real.
                let key4 = entry.key4();
                if let Some(live) = self.table_mut(l4).by4.get_mut(&key4) {
                    live.state = TcpState::Trans;
                }
                self.touch(l4, key4, ExpirerKind::TcpTrans, now);
                events.push(ExpireEvent::Probe(entry));
                continue;
            }

            if let Some(mut removed) = self.table_mut(l4).remove(key) {
                if removed.l4 == L4Proto::Tcp {
                    debug!(state = ?removed.state, "expiring TCP session");
                    removed.state = TcpState::Closed;
                }
                events.push(ExpireEvent::Removed(removed));
            }
        }
    }
}
