//! Clocks used by the replicated sequence.
//!
//! - **Lamport Clock**: the per-site operation counter. Every local insert or
//!   delete ticks it once, so a site's operations carry clocks 1, 2, 3, ...
//! - **Version Vector**: the highest clock observed from each site; the single
//!   source of truth for "what has been seen".
//! - **Time Source**: the injected wall clock used for operation and message
//!   timestamps. Nothing in the crate reads the system time directly.

use crate::site::SiteId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A simple Lamport logical clock.
///
/// The clock value monotonically increases. It ticks on local events and is
/// pulled forward with [`LamportClock::sync`] when a replica learns about
/// operations it authored in an earlier life (e.g. after restoring a snapshot).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    /// Creates a new Lamport clock with initial value 0.
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Creates a Lamport clock with a specific initial value.
    pub fn with_value(value: u64) -> Self {
        Self { counter: value }
    }

    /// Returns the current clock value without incrementing.
    pub fn value(&self) -> u64 {
        self.counter
    }

    /// Increments the clock and returns the new value.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Moves the clock to at least the given value (without incrementing).
    pub fn sync(&mut self, received: u64) {
        self.counter = self.counter.max(received);
    }

    /// Resets the clock to zero.
    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

/// Version vector tracking the highest clock seen from every site.
///
/// Each entry maps a site id to the highest clock observed from that site.
/// Used for:
/// - Deciding which operations a peer has not seen yet (delta sync)
/// - Advertising local progress in join and sync-request messages
///
/// Entries are kept sorted so the serialized form is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    entries: BTreeMap<SiteId, u64>,
}

impl VersionVector {
    /// Create a new empty version vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the clock recorded for a site (0 if never seen).
    pub fn get(&self, site: &SiteId) -> u64 {
        self.entries.get(site).copied().unwrap_or(0)
    }

    /// Set the clock for a site.
    pub fn set(&mut self, site: SiteId, clock: u64) {
        self.entries.insert(site, clock);
    }

    /// Raise the entry for a site to `clock` if it is higher.
    ///
    /// Returns true if the entry changed.
    pub fn observe(&mut self, site: &SiteId, clock: u64) -> bool {
        if clock > self.get(site) {
            self.entries.insert(site.clone(), clock);
            true
        } else {
            false
        }
    }

    /// Check whether an operation `(site, clock)` is covered by this vector.
    pub fn covers(&self, site: &SiteId, clock: u64) -> bool {
        clock <= self.get(site)
    }

    /// Merge another vector into this one (taking max of each entry).
    pub fn merge(&mut self, other: &VersionVector) {
        for (site, &clock) in &other.entries {
            self.observe(site, clock);
        }
    }

    /// Check if this vector dominates another (all entries >= other's entries).
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(site, &clock)| self.get(site) >= clock)
    }

    /// Entry-wise minimum of two vectors.
    ///
    /// Sites missing from either side are treated as 0 and dropped.
    pub fn meet(&self, other: &VersionVector) -> VersionVector {
        let entries = self
            .entries
            .iter()
            .filter_map(|(site, &clock)| {
                let min = clock.min(other.get(site));
                (min > 0).then(|| (site.clone(), min))
            })
            .collect();
        VersionVector { entries }
    }

    /// Check if the vector contains any entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of sites tracked by this vector.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns an iterator over all (site, clock) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, u64)> + '_ {
        self.entries.iter().map(|(site, &clock)| (site, clock))
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(SiteId, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (SiteId, u64)>>(iter: I) -> Self {
        let mut vv = VersionVector::new();
        for (site, clock) in iter {
            vv.observe(&site, clock);
        }
        vv
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (site, clock)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", site, clock)?;
        }
        f.write_str("}")
    }
}

/// Source of wall-clock milliseconds.
///
/// Injected into the engine and the session so tests can control time and so
/// no module reads a process-wide clock.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Milliseconds since the UNIX epoch.
    fn now_ms(&self) -> u64;
}

/// Time source backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually advanced time source for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    /// Create a manual time source starting at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Move time forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }

    /// Set the current time.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}
