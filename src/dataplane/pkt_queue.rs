//! Packet storage for TCP simultaneous open (RFC 6146 pages 28-30).
//!
//! An unsolicited IPv4 SYN cannot be answered immediately: the IPv6 endpoint
//! may be about to open the same connection. The SYN is kept here, tied to
//! its V4Init session. If the session establishes, the packet is dropped
//! silently; if the session's short lifetime runs out, the packet is
//! returned inside an ICMP Destination Unreachable.

use super::session::Key4;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Default bound on stored packets.
pub const DEFAULT_MAX_PKTS: usize = 16;

#[derive(Debug)]
pub struct PktQueue {
    packets: HashMap<Key4, Vec<u8>>,
    order: VecDeque<Key4>,
    max_pkts: usize,
}

impl PktQueue {
    pub fn new(max_pkts: usize) -> Self {
        Self {
            packets: HashMap::new(),
            order: VecDeque::new(),
            max_pkts,
        }
    }

    pub fn set_max_pkts(&mut self, max_pkts: usize) {
        self.max_pkts = max_pkts;
        self.evict_overflow();
    }

    /// Stores "packet" for the session at "key". A second add for the same
    /// session replaces the stored packet. When the queue is full, the
    /// oldest stored packet is lost; its session is left alone.
    pub fn add(&mut self, key: Key4, packet: Vec<u8>) {
        if self.packets.insert(key, packet).is_none() {
            self.order.push_back(key);
        }
        self.evict_overflow();
    }

    /// Takes the packet stored for "key", if any. Whether the caller
    /// answers it with an ICMP error or forgets it is its business.
    pub fn remove(&mut self, key: &Key4) -> Option<Vec<u8>> {
        self.packets.remove(key)
        // The slot in "order" goes stale and is skipped during eviction.
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn evict_overflow(&mut self) {
        while self.packets.len() > self.max_pkts {
            let Some(key) = self.order.pop_front() else {
                return;
            };
            if self.packets.remove(&key).is_some() {
                debug!("pending-SYN queue full; dropping the oldest stored packet");
            }
        }
        // Keep the order list from accumulating stale slots forever.
        while let Some(key) = self.order.front() {
            if self.packets.contains_key(key) {
                break;
            }
            self.order.pop_front();
        }
    }
}

impl Default for PktQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PKTS)
    }
}
