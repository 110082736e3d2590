//! The pool of IPv6 translation prefixes.

use super::rfc6052::{Prefix6, PREFIX_LENGTHS};
use crate::{Error, Result};
use std::net::Ipv6Addr;

/// Ordered set of translation prefixes. The order is insertion order; the
/// first prefix doubles as the default for IPv4-sourced address synthesis.
#[derive(Debug, Default)]
pub struct Pool6 {
    prefixes: Vec<Prefix6>,
}

impl Pool6 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool from (address, length) pairs, validating every length.
    pub fn with_prefixes(prefixes: &[(Ipv6Addr, u8)]) -> Result<Self> {
        let mut pool = Self::new();
        for &(addr, len) in prefixes {
            pool.add(Prefix6::new(addr, len))?;
        }
        Ok(pool)
    }

    /// Adds "prefix" to the pool. Lengths outside RFC 6052's set are
    /// rejected here so the embedding functions never see them.
    pub fn add(&mut self, prefix: Prefix6) -> Result<()> {
        if !PREFIX_LENGTHS.contains(&prefix.len) {
            return Err(Error::Config(format!(
                "prefix length {} not allowed; must be one of {:?}",
                prefix.len, PREFIX_LENGTHS
            )));
        }
        if self.prefixes.contains(&prefix) {
            return Err(Error::Exists(format!("{}/{}", prefix.addr, prefix.len)));
        }
        self.prefixes.push(prefix);
        Ok(())
    }

    pub fn remove(&mut self, prefix: &Prefix6) -> Result<()> {
        let before = self.prefixes.len();
        self.prefixes.retain(|p| p != prefix);
        if self.prefixes.len() == before {
            return Err(Error::NotFound(format!("{}/{}", prefix.addr, prefix.len)));
        }
        Ok(())
    }

    /// Returns the prefix "addr" falls under, i.e. infers the address's
    /// actual network prefix.
    pub fn get(&self, addr: &Ipv6Addr) -> Option<Prefix6> {
        self.prefixes.iter().find(|p| p.matches(addr)).copied()
    }

    /// Returns any prefix from the pool.
    pub fn peek(&self) -> Option<Prefix6> {
        self.prefixes.first().copied()
    }

    /// Whether "addr"'s network prefix belongs to the pool.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.get(addr).is_some()
    }

    pub fn count(&self) -> usize {
        self.prefixes.len()
    }

    pub fn for_each<F: FnMut(&Prefix6)>(&self, mut func: F) {
        for prefix in &self.prefixes {
            func(prefix);
        }
    }

    pub fn flush(&mut self) {
        self.prefixes.clear();
    }
}
