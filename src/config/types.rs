//! Configuration types

use serde::Deserialize;

/// User-defined configuration (nat64d.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub pool6: Pool6Config,
    #[serde(default)]
    pub pool4: Pool4Config,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pktqueue: PktQueueSection,
    #[serde(default)]
    pub filtering: FilteringSection,
    #[serde(default)]
    pub translate: TranslateSection,
    #[serde(default)]
    pub fragmentation: FragmentationSection,
    /// Static mappings installed at startup.
    #[serde(default, rename = "bib")]
    pub bib_entries: Vec<StaticBibConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Unix socket the control protocol is served on.
    #[serde(default = "default_control_socket")]
    pub socket: String,
}

fn default_control_socket() -> String {
    "/run/nat64d.sock".into()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_control_socket(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pool6Config {
    /// Translation prefixes in CIDR notation, e.g. "64:ff9b::/96".
    #[serde(default = "default_pool6_prefixes")]
    pub prefixes: Vec<String>,
}

fn default_pool6_prefixes() -> Vec<String> {
    vec!["64:ff9b::/96".into()]
}

impl Default for Pool6Config {
    fn default() -> Self {
        Self {
            prefixes: default_pool6_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pool4Config {
    /// Addresses the translator masquerades behind.
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_udp_ttl")]
    pub udp_ttl_secs: u64,
    #[serde(default = "default_icmp_ttl")]
    pub icmp_ttl_secs: u64,
    #[serde(default = "default_tcp_est_ttl")]
    pub tcp_est_ttl_secs: u64,
    #[serde(default = "default_tcp_trans_ttl")]
    pub tcp_trans_ttl_secs: u64,
}

fn default_udp_ttl() -> u64 {
    5 * 60
}

fn default_icmp_ttl() -> u64 {
    60
}

fn default_tcp_est_ttl() -> u64 {
    2 * 60 * 60
}

fn default_tcp_trans_ttl() -> u64 {
    4 * 60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            udp_ttl_secs: default_udp_ttl(),
            icmp_ttl_secs: default_icmp_ttl(),
            tcp_est_ttl_secs: default_tcp_est_ttl(),
            tcp_trans_ttl_secs: default_tcp_trans_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PktQueueSection {
    #[serde(default = "default_max_pkts")]
    pub max_pkts: u64,
}

fn default_max_pkts() -> u64 {
    16
}

impl Default for PktQueueSection {
    fn default() -> Self {
        Self {
            max_pkts: default_max_pkts(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilteringSection {
    #[serde(default)]
    pub drop_by_addr: bool,
    #[serde(default)]
    pub drop_icmp6_info: bool,
    #[serde(default)]
    pub drop_external_tcp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslateSection {
    #[serde(default)]
    pub reset_traffic_class: bool,
    #[serde(default)]
    pub reset_tos: bool,
    #[serde(default)]
    pub new_tos: u8,
    #[serde(default = "default_true")]
    pub df_always_on: bool,
    #[serde(default)]
    pub build_ipv4_id: bool,
    #[serde(default = "default_true")]
    pub lower_mtu_fail: bool,
    #[serde(default)]
    pub mtu_plateaus: Option<Vec<u16>>,
    #[serde(default = "default_min_ipv6_mtu")]
    pub min_ipv6_mtu: u16,
}

fn default_true() -> bool {
    true
}

fn default_min_ipv6_mtu() -> u16 {
    1280
}

impl Default for TranslateSection {
    fn default() -> Self {
        Self {
            reset_traffic_class: false,
            reset_tos: false,
            new_tos: 0,
            df_always_on: true,
            build_ipv4_id: false,
            lower_mtu_fail: true,
            mtu_plateaus: None,
            min_ipv6_mtu: default_min_ipv6_mtu(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FragmentationSection {
    #[serde(default = "default_fragment_timeout")]
    pub fragment_timeout_secs: u64,
}

fn default_fragment_timeout() -> u64 {
    2
}

impl Default for FragmentationSection {
    fn default() -> Self {
        Self {
            fragment_timeout_secs: default_fragment_timeout(),
        }
    }
}

/// A static BIB entry: `protocol`, `ipv6 = "addr#port"`, `ipv4 = "addr#port"`.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticBibConfig {
    pub protocol: String,
    pub ipv6: String,
    pub ipv4: String,
}
