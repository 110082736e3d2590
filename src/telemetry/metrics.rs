//! Metrics collection for translation statistics.
//!
//! Provides thread-safe counters for tracking datapath behavior: drops per
//! cause, translations per direction, and database sizes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Global metrics registry for the translator.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Packets dropped because a header could not be parsed or was bogus.
    pub in_hdr_errors: Counter,
    /// Packets dropped because their transport protocol is not translatable.
    pub in_unknown_protos: Counter,
    /// IPv6 packets successfully translated to IPv4.
    pub translated_6to4: Counter,
    /// IPv4 packets successfully translated to IPv6.
    pub translated_4to6: Counter,
    /// Packets dropped by filtering policy or missing state.
    pub filter_dropped: Counter,
    /// Packets accepted untranslated (not addressed to the translator).
    pub passed_through: Counter,
    /// IPv4 SYNs retained by the pending-SYN queue.
    pub syns_stored: Counter,
    /// Translated packets looped back into the pipeline.
    pub hairpins: Counter,
    /// Sessions removed by the expirer.
    pub sessions_expired: Counter,
    /// ICMP error messages generated by the translator.
    pub icmp_errors_sent: Counter,

    /// Current number of BIB entries across the three tables.
    pub bib_count: AtomicU64,
    /// Current number of sessions across the three tables.
    pub session_count: AtomicU64,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the BIB entry count gauge.
    pub fn set_bib_count(&self, count: usize) {
        self.bib_count.store(count as u64, Ordering::Relaxed);
    }

    /// Updates the session count gauge.
    pub fn set_session_count(&self, count: usize) {
        self.session_count.store(count as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("in_hdr_errors".into(), self.in_hdr_errors.get()),
            ("in_unknown_protos".into(), self.in_unknown_protos.get()),
            ("translated_6to4".into(), self.translated_6to4.get()),
            ("translated_4to6".into(), self.translated_4to6.get()),
            ("filter_dropped".into(), self.filter_dropped.get()),
            ("passed_through".into(), self.passed_through.get()),
            ("syns_stored".into(), self.syns_stored.get()),
            ("hairpins".into(), self.hairpins.get()),
            ("sessions_expired".into(), self.sessions_expired.get()),
            ("icmp_errors_sent".into(), self.icmp_errors_sent.get()),
            (
                "bib_count".into(),
                self.bib_count.load(Ordering::Relaxed),
            ),
            (
                "session_count".into(),
                self.session_count.load(Ordering::Relaxed),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        c.add(3);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_registry_export() {
        let registry = MetricsRegistry::new();
        registry.translated_6to4.inc();
        registry.set_session_count(7);

        let exported = registry.export();
        let get = |name: &str| {
            exported
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert_eq!(get("translated_6to4"), 1);
        assert_eq!(get("session_count"), 7);
        assert_eq!(get("in_hdr_errors"), 0);
    }
}
