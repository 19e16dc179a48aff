use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registry counters. Updated from `&self` so they can be bumped while only
/// a read lock on the pool is held.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    lookups_hit: AtomicU64,
    lookups_missed: AtomicU64,
    registrations: AtomicU64,
    duplicate_registrations: AtomicU64,
    releases: AtomicU64,
    bootstraps: AtomicU64,
    fallback_bootstraps: AtomicU64,
    self_tests_passed: AtomicU64,
    self_tests_failed: AtomicU64,
    last_bootstrap: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`RegistryMetrics`], suitable for health reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub accessors: usize,
    pub lookups_hit: u64,
    pub lookups_missed: u64,
    pub registrations: u64,
    pub duplicate_registrations: u64,
    pub releases: u64,
    pub bootstraps: u64,
    pub fallback_bootstraps: u64,
    pub self_tests_passed: u64,
    pub self_tests_failed: u64,
    pub last_bootstrap: Option<DateTime<Utc>>,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self, hit: bool) {
        if hit {
            self.lookups_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lookups_missed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_registration(&self, duplicate: bool) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.duplicate_registrations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bootstrap(&self, fallback: bool) {
        self.bootstraps.fetch_add(1, Ordering::Relaxed);
        if fallback {
            self.fallback_bootstraps.fetch_add(1, Ordering::Relaxed);
        }
        let mut last = self
            .last_bootstrap
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last = Some(Utc::now());
    }

    pub fn record_self_test(&self, passed: bool) {
        if passed {
            self.self_tests_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.self_tests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, accessors: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            accessors,
            lookups_hit: self.lookups_hit.load(Ordering::Relaxed),
            lookups_missed: self.lookups_missed.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            duplicate_registrations: self.duplicate_registrations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            bootstraps: self.bootstraps.load(Ordering::Relaxed),
            fallback_bootstraps: self.fallback_bootstraps.load(Ordering::Relaxed),
            self_tests_passed: self.self_tests_passed.load(Ordering::Relaxed),
            self_tests_failed: self.self_tests_failed.load(Ordering::Relaxed),
            last_bootstrap: *self
                .last_bootstrap
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }
}

impl MetricsSnapshot {
    /// Lookup hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.lookups_hit + self.lookups_missed;
        if total == 0 {
            return 100.0;
        }
        (self.lookups_hit as f64 / total as f64) * 100.0
    }
}
