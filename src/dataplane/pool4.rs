//! The pool of IPv4 transport addresses.
//!
//! Each pooled address owns three port bitmaps (one per transport protocol).
//! Port selection follows RFC 6146's preservation rules: keep the source
//! port's parity and range class when possible, and prefer the exact same
//! port when it is free anywhere in the pool.

use super::types::{L4Proto, TransportAddr4};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;

const PORT_WORDS: usize = 65536 / 64;

/// One bit per port; a set bit means "reserved".
struct PortBitmap {
    words: Box<[u64; PORT_WORDS]>,
    used: u32,
}

impl PortBitmap {
    fn new() -> Self {
        Self {
            words: Box::new([0u64; PORT_WORDS]),
            used: 0,
        }
    }

    fn is_set(&self, port: u16) -> bool {
        self.words[(port / 64) as usize] & (1u64 << (port % 64)) != 0
    }

    fn set(&mut self, port: u16) {
        let mask = 1u64 << (port % 64);
        let word = &mut self.words[(port / 64) as usize];
        if *word & mask == 0 {
            *word |= mask;
            self.used += 1;
        }
    }

    fn clear(&mut self, port: u16) {
        let mask = 1u64 << (port % 64);
        let word = &mut self.words[(port / 64) as usize];
        if *word & mask != 0 {
            *word &= !mask;
            self.used -= 1;
        }
    }

    /// First free port in [lo, hi] with the given parity.
    fn find_free(&self, lo: u16, hi: u16, parity: u16) -> Option<u16> {
        if self.used == 65536 {
            return None;
        }
        let mut port = if lo % 2 == parity { lo } else { lo + 1 };
        while port <= hi {
            if !self.is_set(port) {
                return Some(port);
            }
            port = port.checked_add(2)?;
        }
        None
    }
}

struct AddrPorts {
    udp: PortBitmap,
    tcp: PortBitmap,
    icmp: PortBitmap,
}

impl AddrPorts {
    fn new() -> Self {
        Self {
            udp: PortBitmap::new(),
            tcp: PortBitmap::new(),
            icmp: PortBitmap::new(),
        }
    }

    fn bitmap(&self, l4: L4Proto) -> &PortBitmap {
        match l4 {
            L4Proto::Udp => &self.udp,
            L4Proto::Tcp => &self.tcp,
            _ => &self.icmp,
        }
    }

    fn bitmap_mut(&mut self, l4: L4Proto) -> &mut PortBitmap {
        match l4 {
            L4Proto::Udp => &mut self.udp,
            L4Proto::Tcp => &mut self.tcp,
            _ => &mut self.icmp,
        }
    }
}

/// The IPv4 transport-address pool.
pub struct Pool4 {
    /// Insertion order drives the round-robin walk.
    addresses: Vec<Ipv4Addr>,
    ports: HashMap<Ipv4Addr, AddrPorts>,
    rr_cursor: usize,
}

impl Pool4 {
    pub fn new() -> Self {
        Self {
            addresses: Vec::new(),
            ports: HashMap::new(),
            rr_cursor: 0,
        }
    }

    pub fn with_addresses(addrs: &[Ipv4Addr]) -> Result<Self> {
        let mut pool = Self::new();
        for &addr in addrs {
            pool.add(addr)?;
        }
        Ok(pool)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.ports.contains_key(&addr)
    }

    pub fn add(&mut self, addr: Ipv4Addr) -> Result<()> {
        if self.contains(addr) {
            return Err(Error::Exists(addr.to_string()));
        }
        self.addresses.push(addr);
        self.ports.insert(addr, AddrPorts::new());
        Ok(())
    }

    /// Removes "addr" from the pool. The caller is responsible for the BIB
    /// entries and sessions that were using it.
    pub fn remove(&mut self, addr: Ipv4Addr) -> Result<()> {
        if self.ports.remove(&addr).is_none() {
            return Err(Error::NotFound(addr.to_string()));
        }
        self.addresses.retain(|a| *a != addr);
        if self.rr_cursor >= self.addresses.len() {
            self.rr_cursor = 0;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.addresses.len()
    }

    pub fn for_each<F: FnMut(Ipv4Addr)>(&self, mut func: F) {
        for &addr in &self.addresses {
            func(addr);
        }
    }

    pub fn flush(&mut self) {
        self.addresses.clear();
        self.ports.clear();
        self.rr_cursor = 0;
    }

    /// Reserves a specific transport address, for static BIB entries.
    pub fn reserve(&mut self, addr: Ipv4Addr, port: u16, l4: L4Proto) -> Result<()> {
        let ports = self
            .ports
            .get_mut(&addr)
            .ok_or_else(|| Error::NotFound(addr.to_string()))?;
        let bitmap = ports.bitmap_mut(l4);
        if bitmap.is_set(port) {
            return Err(Error::Exists(format!("{}#{}", addr, port)));
        }
        bitmap.set(port);
        Ok(())
    }

    pub fn release(&mut self, addr: Ipv4Addr, port: u16, l4: L4Proto) {
        if let Some(ports) = self.ports.get_mut(&addr) {
            ports.bitmap_mut(l4).clear(port);
        }
    }

    /// Allocates a transport address for a mapping whose IPv6 side uses
    /// "src_port6", honoring RFC 6146's preservation rules.
    pub fn get_any_port(&mut self, l4: L4Proto, src_port6: u16) -> Result<TransportAddr4> {
        if self.addresses.is_empty() {
            return Err(Error::PoolExhausted);
        }

        // Same port on any address beats everything else.
        for i in 0..self.addresses.len() {
            let addr = self.addresses[(self.rr_cursor + i) % self.addresses.len()];
            if let Some(ports) = self.ports.get_mut(&addr) {
                let bitmap = ports.bitmap_mut(l4);
                if !bitmap.is_set(src_port6) {
                    bitmap.set(src_port6);
                    return Ok(TransportAddr4::new(addr, src_port6));
                }
            }
        }

        let (lo, hi) = if src_port6 < 1024 { (0, 1023) } else { (1024, 65535) };
        let parity = src_port6 % 2;

        // Preferred class: same parity and range as the source port.
        if let Some(found) = self.scan(l4, lo, hi, parity) {
            return Ok(found);
        }

        // The preferred class is gone; take anything.
        let (other_lo, other_hi) = if lo == 0 { (1024, 65535) } else { (0, 1023) };
        if let Some(found) = self.scan(l4, lo, hi, 1 - parity) {
            return Ok(found);
        }
        if let Some(found) = self.scan(l4, other_lo, other_hi, parity) {
            return Ok(found);
        }
        if let Some(found) = self.scan(l4, other_lo, other_hi, 1 - parity) {
            return Ok(found);
        }

        Err(Error::PoolExhausted)
    }

    fn scan(&mut self, l4: L4Proto, lo: u16, hi: u16, parity: u16) -> Option<TransportAddr4> {
        for i in 0..self.addresses.len() {
            let idx = (self.rr_cursor + i) % self.addresses.len();
            let addr = self.addresses[idx];
            let Some(ports) = self.ports.get_mut(&addr) else {
                continue;
            };
            let bitmap = ports.bitmap_mut(l4);
            if let Some(port) = bitmap.find_free(lo, hi, parity) {
                bitmap.set(port);
                self.rr_cursor = (idx + 1) % self.addresses.len();
                return Some(TransportAddr4::new(addr, port));
            }
        }
        None
    }
}

impl Default for Pool4 {
    fn default() -> Self {
        Self::new()
    }
}
