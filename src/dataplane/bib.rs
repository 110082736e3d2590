//! The Binding Information Base: long-lived IPv6/IPv4 transport-address
//! mappings, one table per transport protocol.
//!
//! Each table is indexed both ways over a single entry set. Dynamic entries
//! are kept alive by their sessions through a reference count; static
//! entries survive with no references.

use super::types::{L4Proto, TransportAddr4, TransportAddr6};
use crate::{Error, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BibEntry {
    pub addr6: TransportAddr6,
    pub addr4: TransportAddr4,
    pub l4: L4Proto,
    pub is_static: bool,
    pub session_refs: usize,
}

impl BibEntry {
    pub fn new(addr6: TransportAddr6, addr4: TransportAddr4, l4: L4Proto, is_static: bool) -> Self {
        Self {
            addr6,
            addr4,
            l4,
            is_static,
            session_refs: 0,
        }
    }
}

/// One protocol's table: the IPv4 index owns the entries, the IPv6 index
/// points back at them. Both are ordered; DISPLAY pagination walks the IPv4
/// index.
#[derive(Debug, Default)]
struct BibTable {
    by4: BTreeMap<TransportAddr4, BibEntry>,
    by6: BTreeMap<TransportAddr6, TransportAddr4>,
}

/// The three BIB tables.
#[derive(Debug, Default)]
pub struct Bib {
    udp: BibTable,
    tcp: BibTable,
    icmp: BibTable,
}

impl Bib {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, l4: L4Proto) -> &BibTable {
        match l4 {
            L4Proto::Udp => &self.udp,
            L4Proto::Tcp => &self.tcp,
            _ => &self.icmp,
        }
    }

    fn table_mut(&mut self, l4: L4Proto) -> &mut BibTable {
        match l4 {
            L4Proto::Udp => &mut self.udp,
            L4Proto::Tcp => &mut self.tcp,
            _ => &mut self.icmp,
        }
    }

    pub fn get_by_6(&self, addr6: TransportAddr6, l4: L4Proto) -> Option<BibEntry> {
        let table = self.table(l4);
        let addr4 = table.by6.get(&addr6)?;
        table.by4.get(addr4).copied()
    }

    pub fn get_by_4(&self, addr4: TransportAddr4, l4: L4Proto) -> Option<BibEntry> {
        self.table(l4).by4.get(&addr4).copied()
    }

    /// Inserts "entry", rejecting duplicates on either index. Both indices
    /// are updated together so they never disagree.
    pub fn add(&mut self, entry: BibEntry) -> Result<()> {
        let table = self.table_mut(entry.l4);

        if table.by6.contains_key(&entry.addr6) {
            return Err(Error::Exists(entry.addr6.to_string()));
        }
        match table.by4.entry(entry.addr4) {
            Entry::Occupied(_) => Err(Error::Exists(entry.addr4.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                table.by6.insert(entry.addr6, entry.addr4);
                Ok(())
            }
        }
    }

    /// Removes the entry mapped to "addr4" from both indices and returns it.
    /// The caller owns the port release when the entry was dynamic.
    pub fn remove(&mut self, addr4: TransportAddr4, l4: L4Proto) -> Result<BibEntry> {
        let table = self.table_mut(l4);
        let entry = table
            .by4
            .remove(&addr4)
            .ok_or_else(|| Error::NotFound(addr4.to_string()))?;
        table.by6.remove(&entry.addr6);
        Ok(entry)
    }

    /// Records one more session referencing the entry.
    pub fn grab(&mut self, addr4: TransportAddr4, l4: L4Proto) {
        if let Some(entry) = self.table_mut(l4).by4.get_mut(&addr4) {
            entry.session_refs += 1;
        }
    }

    /// Drops one session reference. When the last reference leaves a dynamic
    /// entry, the entry is removed and returned so the caller can release
    /// its port reservation.
    pub fn put_back(&mut self, addr4: TransportAddr4, l4: L4Proto) -> Option<BibEntry> {
        let table = self.table_mut(l4);
        let entry = table.by4.get_mut(&addr4)?;
        entry.session_refs = entry.session_refs.saturating_sub(1);

        if entry.session_refs == 0 && !entry.is_static {
            let dead = *entry;
            table.by4.remove(&addr4);
            table.by6.remove(&dead.addr6);
            return Some(dead);
        }
        None
    }

    pub fn count(&self, l4: L4Proto) -> usize {
        self.table(l4).by4.len()
    }

    pub fn for_each<F: FnMut(&BibEntry)>(&self, l4: L4Proto, mut func: F) {
        for entry in self.table(l4).by4.values() {
            func(entry);
        }
    }

    /// Walks entries in IPv4-transport-address order, starting after
    /// "cursor" (or from the beginning when there is none). Stops when
    /// "func" returns false.
    pub fn iterate_from<F: FnMut(&BibEntry) -> bool>(
        &self,
        l4: L4Proto,
        cursor: Option<TransportAddr4>,
        mut func: F,
    ) {
        let lower = match cursor {
            Some(addr4) => Bound::Excluded(addr4),
            None => Bound::Unbounded,
        };
        for (_, entry) in self.table(l4).by4.range((lower, Bound::Unbounded)) {
            if !func(entry) {
                break;
            }
        }
    }
}
