//! Session entries: per-flow connection records.

use super::types::{L4Proto, TransportAddr4, TransportAddr6};
use std::time::Instant;

/// TCP session states, RFC 6146 section 3.5.2. `Closed` is never stored in
/// the database; it only appears transiently while tearing a session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    V4Init,
    V6Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4FinV6FinRcv,
    Trans,
}

/// Which expirer queue a session currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirerKind {
    Udp,
    TcpEst,
    TcpTrans,
    Syn,
    Icmp,
}

/// Full IPv6-side key of a session: both transport addresses.
/// `local` is the IPv6 endpoint itself, `remote` the embedded IPv4 peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key6 {
    pub local: TransportAddr6,
    pub remote: TransportAddr6,
}

/// Full IPv4-side key of a session: both transport addresses.
/// `local` is the pool4 side owned by the translator, `remote` the IPv4
/// peer. `local` leads the ordering so by-local scans are contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key4 {
    pub local: TransportAddr4,
    pub remote: TransportAddr4,
}

/// A session entry.
///
/// `local6` and `local4` mirror the BIB entry the session references
/// (`local6 == bib.addr6`, `local4 == bib.addr4`); `remote6` is the RFC 6052
/// image of `remote4` under some pool prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    pub local6: TransportAddr6,
    pub remote6: TransportAddr6,
    pub local4: TransportAddr4,
    pub remote4: TransportAddr4,
    pub l4: L4Proto,
    pub state: TcpState,
    pub update_time: Instant,
    pub expirer: ExpirerKind,
    /// Tag of the session's live occurrence in its expirer queue. Queue
    /// slots carrying an older stamp are stale and skipped.
    pub(super) stamp: u64,
}

impl SessionEntry {
    pub fn key6(&self) -> Key6 {
        Key6 {
            local: self.local6,
            remote: self.remote6,
        }
    }

    pub fn key4(&self) -> Key4 {
        Key4 {
            local: self.local4,
            remote: self.remote4,
        }
    }
}
