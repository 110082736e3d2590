//! IPv4-embedded IPv6 addresses - RFC 6052
//!
//! The translation prefix pool validates prefix lengths at load time, so
//! these functions assume one of the six permitted lengths.

use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Prefix lengths RFC 6052 permits.
pub const PREFIX_LENGTHS: [u8; 6] = [32, 40, 48, 56, 64, 96];

/// A translation prefix as stored in the IPv6 pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix6 {
    pub addr: Ipv6Addr,
    pub len: u8,
}

impl Prefix6 {
    pub fn new(addr: Ipv6Addr, len: u8) -> Self {
        Self { addr, len }
    }

    /// Whether "addr" falls under this prefix.
    pub fn matches(&self, addr: &Ipv6Addr) -> bool {
        let prefix = self.addr.octets();
        let candidate = addr.octets();
        let full_octets = (self.len / 8) as usize;

        if candidate[..full_octets] != prefix[..full_octets] {
            return false;
        }
        let leftover_bits = self.len % 8;
        if leftover_bits == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - leftover_bits);
        (candidate[full_octets] & mask) == (prefix[full_octets] & mask)
    }
}

/// Extracts the IPv4 address embedded in "addr" at the offset dictated by
/// "prefix". Octet 8 (the "u" octet) is skipped; a nonzero value there means
/// the address was not produced by a conforming embedder.
pub fn addr_6to4(addr: &Ipv6Addr, prefix: &Prefix6) -> Result<Ipv4Addr> {
    let octets = addr.octets();

    if prefix.len != 96 && octets[8] != 0 {
        return Err(Error::InvalidAddress(format!(
            "{} has a nonzero reserved octet",
            addr
        )));
    }

    let v4 = match prefix.len {
        32 => [octets[4], octets[5], octets[6], octets[7]],
        40 => [octets[5], octets[6], octets[7], octets[9]],
        48 => [octets[6], octets[7], octets[9], octets[10]],
        56 => [octets[7], octets[9], octets[10], octets[11]],
        64 => [octets[9], octets[10], octets[11], octets[12]],
        96 => [octets[12], octets[13], octets[14], octets[15]],
        other => {
            return Err(Error::InvalidAddress(format!(
                "unsupported prefix length {}",
                other
            )))
        }
    };

    Ok(Ipv4Addr::from(v4))
}

/// Embeds "addr" into "prefix", writing zero into the skipped octet.
pub fn addr_4to6(addr: &Ipv4Addr, prefix: &Prefix6) -> Result<Ipv6Addr> {
    let v4 = addr.octets();
    let mut octets = prefix.addr.octets();

    // Everything after the prefix starts out zero, including the u octet.
    let prefix_octets = (prefix.len / 8) as usize;
    for octet in octets.iter_mut().skip(prefix_octets) {
        *octet = 0;
    }

    match prefix.len {
        32 => octets[4..8].copy_from_slice(&v4),
        40 => {
            octets[5..8].copy_from_slice(&v4[..3]);
            octets[9] = v4[3];
        }
        48 => {
            octets[6..8].copy_from_slice(&v4[..2]);
            octets[9..11].copy_from_slice(&v4[2..]);
        }
        56 => {
            octets[7] = v4[0];
            octets[9..12].copy_from_slice(&v4[1..]);
        }
        64 => octets[9..13].copy_from_slice(&v4),
        96 => octets[12..16].copy_from_slice(&v4),
        other => {
            return Err(Error::InvalidAddress(format!(
                "unsupported prefix length {}",
                other
            )))
        }
    }

    Ok(Ipv6Addr::from(octets))
}
