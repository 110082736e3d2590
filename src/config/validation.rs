//! Configuration validation

use super::{parse_prefix6, parse_taddr4, parse_taddr6, Config};
use crate::dataplane::PREFIX_LENGTHS;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_pool6(config, &mut result);
    validate_pool4(config, &mut result);
    validate_session(config, &mut result);
    validate_translate(config, &mut result);
    validate_bib(config, &mut result);

    result
}

fn validate_pool6(config: &Config, result: &mut ValidationResult) {
    if config.pool6.prefixes.is_empty() {
        result.error("pool6: at least one translation prefix is required");
    }
    for prefix in &config.pool6.prefixes {
        match parse_prefix6(prefix) {
            Ok(parsed) => {
                if !PREFIX_LENGTHS.contains(&parsed.len) {
                    result.error(format!(
                        "pool6: prefix length {} not allowed; must be one of {:?}",
                        parsed.len, PREFIX_LENGTHS
                    ));
                }
            }
            Err(error) => result.error(format!("pool6: {}", error)),
        }
    }
}

fn validate_pool4(config: &Config, result: &mut ValidationResult) {
    if config.pool4.addresses.is_empty() {
        result.warn("pool4: no addresses configured; nothing can be translated");
    }
    let mut seen = HashSet::new();
    for addr in &config.pool4.addresses {
        if addr.parse::<std::net::Ipv4Addr>().is_err() {
            result.error(format!("pool4: '{}' is not an IPv4 address", addr));
        } else if !seen.insert(addr.clone()) {
            result.warn(format!("pool4: duplicate address {}", addr));
        }
    }
}

fn validate_session(config: &Config, result: &mut ValidationResult) {
    let session = &config.session;
    if session.udp_ttl_secs < 120 {
        result.error("session: udp_ttl_secs must be at least 120");
    }
    if session.tcp_est_ttl_secs < 7200 {
        result.error("session: tcp_est_ttl_secs must be at least 7200");
    }
    if session.tcp_trans_ttl_secs < 240 {
        result.error("session: tcp_trans_ttl_secs must be at least 240");
    }
    if session.icmp_ttl_secs < 60 {
        result.warn("session: icmp_ttl_secs below the RFC default of 60");
    }
}

fn validate_translate(config: &Config, result: &mut ValidationResult) {
    let translate = &config.translate;
    if let Some(plateaus) = &translate.mtu_plateaus {
        if plateaus.is_empty() || plateaus.iter().all(|&p| p == 0) {
            result.error("translate: mtu_plateaus must contain a nonzero value");
        }
    }
    if translate.min_ipv6_mtu < 1280 {
        result.error("translate: min_ipv6_mtu cannot be below 1280");
    }
}

fn validate_bib(config: &Config, result: &mut ValidationResult) {
    for (index, entry) in config.bib_entries.iter().enumerate() {
        if !matches!(entry.protocol.as_str(), "tcp" | "udp" | "icmp") {
            result.error(format!(
                "bib[{}]: protocol must be tcp, udp or icmp",
                index
            ));
        }
        if let Err(error) = parse_taddr6(&entry.ipv6) {
            result.error(format!("bib[{}]: {}", index, error));
        }
        match parse_taddr4(&entry.ipv4) {
            Ok(addr4) => {
                if !config
                    .pool4
                    .addresses
                    .iter()
                    .any(|a| a == &addr4.addr.to_string())
                {
                    result.error(format!(
                        "bib[{}]: {} is not a pool4 address",
                        index, addr4.addr
                    ));
                }
            }
            Err(error) => result.error(format!("bib[{}]: {}", index, error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        let result = validate(&config);
        assert!(!result.has_errors());
        // Empty pool4 is worth a warning.
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_bad_prefix_length() {
        let config: Config = toml::from_str(
            r#"
            [pool6]
            prefixes = ["2001:db8::/44"]
        "#,
        )
        .unwrap();
        assert!(validate(&config).has_errors());
    }

    #[test]
    fn test_bib_entry_must_point_into_pool4() {
        let config: Config = toml::from_str(
            r#"
            [pool4]
            addresses = ["192.0.2.1"]

            [[bib]]
            protocol = "tcp"
            ipv6 = "2001:db8::1#8080"
            ipv4 = "198.51.100.1#80"
        "#,
        )
        .unwrap();
        assert!(validate(&config).has_errors());
    }

    #[test]
    fn test_ttl_floor_checked() {
        let config: Config = toml::from_str(
            r#"
            [session]
            tcp_trans_ttl_secs = 30
        "#,
        )
        .unwrap();
        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("tcp_trans_ttl_secs")));
    }
}
