//! The live configuration snapshot.
//!
//! Readers grab the current `Arc` under a short lock and keep using it for
//! the rest of the packet; writers build a full replacement and swap it in.
//! A rejected update never touches the published snapshot.

use super::session_db::SessionTtls;
use crate::{Error, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Floors required by RFC 6146 section 4.
pub const UDP_TTL_MIN: Duration = Duration::from_secs(2 * 60);
pub const TCP_EST_TTL_MIN: Duration = Duration::from_secs(2 * 60 * 60);
pub const TCP_TRANS_TTL_MIN: Duration = Duration::from_secs(4 * 60);

/// Default MTU plateaus (RFC 1191 section 7.1), descending.
pub const DEFAULT_MTU_PLATEAUS: [u16; 11] = [
    65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68,
];

/// The minimum IPv6 MTU, RFC 8200 section 5.
pub const IPV6_MIN_MTU: u16 = 1280;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDbConfig {
    pub ttl: SessionTtls,
}

impl Default for SessionDbConfig {
    fn default() -> Self {
        Self {
            ttl: SessionTtls {
                udp: Duration::from_secs(5 * 60),
                icmp: Duration::from_secs(60),
                tcp_est: Duration::from_secs(2 * 60 * 60),
                tcp_trans: Duration::from_secs(4 * 60),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktQueueConfig {
    pub max_pkts: u64,
}

impl Default for PktQueueConfig {
    fn default() -> Self {
        Self {
            max_pkts: super::pkt_queue::DEFAULT_MAX_PKTS as u64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteringConfig {
    /// Address-dependent filtering (RFC 4787 REQ-8).
    pub drop_by_addr: bool,
    /// Filter ICMPv6 informational packets.
    pub drop_icmp6_info: bool,
    /// Drop externally-initiated (IPv4-initiated) TCP connections.
    pub drop_external_tcp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateConfig {
    /// Always zero the Traffic Class of translated IPv6 headers instead of
    /// copying the IPv4 TOS.
    pub reset_traffic_class: bool,
    /// Always write "new_tos" into translated IPv4 headers instead of
    /// copying the IPv6 Traffic Class.
    pub reset_tos: bool,
    pub new_tos: u8,
    /// Set DF on every translated IPv4 header, not just large ones.
    pub df_always_on: bool,
    /// Compute the IPv4 Identification field instead of zeroing it.
    pub build_ipv4_id: bool,
    /// Never report an MTU below 1280 in ICMPv6 Packet Too Big messages
    /// (RFC 6145 section 6, second approach).
    pub lower_mtu_fail: bool,
    /// Descending, deduplicated, nonempty. Used to guess a plausible path
    /// MTU when a Fragmentation Needed message arrives with MTU zero.
    pub mtu_plateaus: Vec<u16>,
    /// Translated IPv6 packets are never bigger than this.
    pub min_ipv6_mtu: u16,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            reset_traffic_class: false,
            reset_tos: false,
            new_tos: 0,
            df_always_on: true,
            build_ipv4_id: false,
            lower_mtu_fail: true,
            mtu_plateaus: DEFAULT_MTU_PLATEAUS.to_vec(),
            min_ipv6_mtu: IPV6_MIN_MTU,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentationConfig {
    /// How long fragments of one datagram may take to arrive.
    pub fragment_timeout: Duration,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            fragment_timeout: Duration::from_secs(2),
        }
    }
}

/// A full, immutable configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub sessiondb: SessionDbConfig,
    pub pktqueue: PktQueueConfig,
    pub filtering: FilteringConfig,
    pub translate: TranslateConfig,
    pub fragmentation: FragmentationConfig,
}

/// Sorts descending, removes zeroes and duplicates. An empty or all-zero
/// list is a configuration error.
pub fn normalize_plateaus(mut list: Vec<u16>) -> Result<Vec<u16>> {
    if list.is_empty() {
        return Err(Error::Config("the MTU plateaus list is empty".into()));
    }
    list.sort_unstable_by(|a, b| b.cmp(a));
    list.dedup();
    list.retain(|&mtu| mtu != 0);
    if list.is_empty() {
        return Err(Error::Config(
            "the MTU plateaus list contains nothing but zeroes".into(),
        ));
    }
    Ok(list)
}

/// Validates TTL floors. The ICMP timeout deliberately has no floor.
pub fn validate_ttls(ttl: &SessionTtls) -> Result<()> {
    if ttl.udp < UDP_TTL_MIN {
        return Err(Error::Config(format!(
            "the UDP timeout must be at least {} seconds",
            UDP_TTL_MIN.as_secs()
        )));
    }
    if ttl.tcp_est < TCP_EST_TTL_MIN {
        return Err(Error::Config(format!(
            "the TCP established timeout must be at least {} seconds",
            TCP_EST_TTL_MIN.as_secs()
        )));
    }
    if ttl.tcp_trans < TCP_TRANS_TTL_MIN {
        return Err(Error::Config(format!(
            "the TCP transitory timeout must be at least {} seconds",
            TCP_TRANS_TTL_MIN.as_secs()
        )));
    }
    Ok(())
}

/// Shared handle to the current snapshot.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: RwLock<Arc<RuntimeConfig>>,
}

impl ConfigHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Pins the current snapshot. Cheap; hold the Arc as long as needed.
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.current.read().unwrap().clone()
    }

    /// Builds a modified copy of the current snapshot and publishes it,
    /// unless the mutation reports an error.
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RuntimeConfig) -> Result<()>,
    {
        let mut guard = self.current.write().unwrap();
        let mut next = (**guard).clone();
        if let Err(error) = mutate(&mut next) {
            warn!(%error, "rejecting configuration update");
            return Err(error);
        }
        *guard = Arc::new(next);
        Ok(())
    }
}
