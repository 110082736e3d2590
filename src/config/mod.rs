//! Configuration management
//!
//! Handles the startup nat64d.toml: parsing, validation, and conversion
//! into the immutable runtime snapshot.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::dataplane::{
    normalize_plateaus, Prefix6, RuntimeConfig, SessionTtls, TransportAddr4, TransportAddr6,
};
use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Parses "addr/len" into a translation prefix.
pub fn parse_prefix6(value: &str) -> Result<Prefix6> {
    let (addr, len) = value
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("'{}' is not in addr/len form", value)))?;
    let addr: Ipv6Addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not an IPv6 address", addr)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not a prefix length", len)))?;
    Ok(Prefix6::new(addr, len))
}

/// Parses "addr#port" into an IPv6 transport address.
pub fn parse_taddr6(value: &str) -> Result<TransportAddr6> {
    let (addr, port) = value
        .split_once('#')
        .ok_or_else(|| Error::Config(format!("'{}' is not in addr#port form", value)))?;
    let addr: Ipv6Addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not an IPv6 address", addr)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not a port", port)))?;
    Ok(TransportAddr6::new(addr, port))
}

/// Parses "addr#port" into an IPv4 transport address.
pub fn parse_taddr4(value: &str) -> Result<TransportAddr4> {
    let (addr, port) = value
        .split_once('#')
        .ok_or_else(|| Error::Config(format!("'{}' is not in addr#port form", value)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not an IPv4 address", addr)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("'{}' is not a port", port)))?;
    Ok(TransportAddr4::new(addr, port))
}

impl Config {
    /// Converts the startup file into the runtime snapshot the datapath
    /// reads. Fails on anything `validate` would flag as an error.
    pub fn to_runtime(&self) -> Result<RuntimeConfig> {
        let mut runtime = RuntimeConfig::default();

        runtime.sessiondb.ttl = SessionTtls {
            udp: Duration::from_secs(self.session.udp_ttl_secs),
            icmp: Duration::from_secs(self.session.icmp_ttl_secs),
            tcp_est: Duration::from_secs(self.session.tcp_est_ttl_secs),
            tcp_trans: Duration::from_secs(self.session.tcp_trans_ttl_secs),
        };
        crate::dataplane::validate_ttls(&runtime.sessiondb.ttl)?;

        runtime.pktqueue.max_pkts = self.pktqueue.max_pkts;

        runtime.filtering.drop_by_addr = self.filtering.drop_by_addr;
        runtime.filtering.drop_icmp6_info = self.filtering.drop_icmp6_info;
        runtime.filtering.drop_external_tcp = self.filtering.drop_external_tcp;

        runtime.translate.reset_traffic_class = self.translate.reset_traffic_class;
        runtime.translate.reset_tos = self.translate.reset_tos;
        runtime.translate.new_tos = self.translate.new_tos;
        runtime.translate.df_always_on = self.translate.df_always_on;
        runtime.translate.build_ipv4_id = self.translate.build_ipv4_id;
        runtime.translate.lower_mtu_fail = self.translate.lower_mtu_fail;
        runtime.translate.min_ipv6_mtu = self.translate.min_ipv6_mtu;
        if let Some(plateaus) = &self.translate.mtu_plateaus {
            runtime.translate.mtu_plateaus = normalize_plateaus(plateaus.clone())?;
        }

        runtime.fragmentation.fragment_timeout =
            Duration::from_secs(self.fragmentation.fragment_timeout_secs);

        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helpers() {
        let prefix = parse_prefix6("64:ff9b::/96").unwrap();
        assert_eq!(prefix.len, 96);

        let addr6 = parse_taddr6("2001:db8::1#8080").unwrap();
        assert_eq!(addr6.l4_id, 8080);

        let addr4 = parse_taddr4("192.0.2.1#80").unwrap();
        assert_eq!(addr4.addr, Ipv4Addr::new(192, 0, 2, 1));

        assert!(parse_prefix6("64:ff9b::").is_err());
        assert!(parse_taddr4("192.0.2.1").is_err());
        assert!(parse_taddr6("not-an-address#1").is_err());
    }

    #[test]
    fn test_defaults_to_runtime() {
        let config = Config::default();
        let runtime = config.to_runtime().unwrap();
        assert_eq!(runtime.sessiondb.ttl.udp, Duration::from_secs(300));
        assert_eq!(runtime.translate.min_ipv6_mtu, 1280);
        assert_eq!(runtime.translate.mtu_plateaus.len(), 11);
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_text = r#"
            [pool6]
            prefixes = ["64:ff9b::/96"]

            [pool4]
            addresses = ["192.0.2.1", "192.0.2.2"]

            [session]
            udp_ttl_secs = 600

            [[bib]]
            protocol = "tcp"
            ipv6 = "2001:db8::1#8080"
            ipv4 = "192.0.2.1#80"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.pool4.addresses.len(), 2);
        assert_eq!(config.session.udp_ttl_secs, 600);
        assert_eq!(config.session.icmp_ttl_secs, 60); // default survives
        assert_eq!(config.bib_entries.len(), 1);

        let runtime = config.to_runtime().unwrap();
        assert_eq!(runtime.sessiondb.ttl.udp, Duration::from_secs(600));
    }

    #[test]
    fn test_low_ttl_rejected() {
        let config: Config = toml::from_str(
            r#"
            [session]
            udp_ttl_secs = 10
        "#,
        )
        .unwrap();
        assert!(config.to_runtime().is_err());
    }
}
