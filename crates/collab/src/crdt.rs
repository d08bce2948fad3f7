//! Logoot-style replicated text sequence.
//!
//! The engine provides:
//! - Index-based insert/delete for the local editing layer
//! - Idempotent application of remote operations
//! - Version-vector delta sync and full-state merge
//!
//! # Algorithm Overview
//!
//! Each character is stored as an entry keyed by its [`Identifier`]:
//! - A dense [`Position`] allocated between its neighbours at insert time
//! - The authoring site and the site's clock at that moment
//! - A visibility flag (false = tombstone for deleted characters)
//!
//! Entries live in a map ordered by identifier, so the visible text is an
//! in-order walk that skips tombstones. Concurrent inserts at the same spot get
//! distinct positions because every freshly minted digit is tagged with the
//! minting site, and every replica sorts positions the same way.
//!
//! Deletes that arrive before the insert they target are buffered and applied
//! as soon as the insert lands, so out-of-order delivery never loses a delete.

use crate::clock::{LamportClock, SystemTimeSource, TimeSource, VersionVector};
use crate::operation::{CharacterEntry, CrdtState, Identifier, OpStamp, Operation, OperationKind};
use crate::position::{generate_position_between, Position};
use crate::site::SiteId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Per-site record of which clocks have been applied.
///
/// `contiguous` is the highest clock with nothing missing below it; clocks
/// that arrived early wait in `ahead` until the gap closes.
#[derive(Clone, Debug, Default)]
struct SiteLedger {
    contiguous: u64,
    ahead: BTreeSet<u64>,
}

impl SiteLedger {
    fn contains(&self, clock: u64) -> bool {
        clock <= self.contiguous || self.ahead.contains(&clock)
    }

    /// Record a clock; returns false if it was already recorded.
    fn record(&mut self, clock: u64) -> bool {
        if self.contains(clock) {
            return false;
        }
        if clock == self.contiguous + 1 {
            self.contiguous = clock;
            while self.ahead.remove(&(self.contiguous + 1)) {
                self.contiguous += 1;
            }
        } else {
            self.ahead.insert(clock);
        }
        true
    }
}

/// Replicated text sequence for one site.
///
/// # Example
///
/// ```
/// use collab::crdt::TextCrdt;
///
/// let mut alice = TextCrdt::new("alice");
/// let mut bob = TextCrdt::new("bob");
///
/// for (i, ch) in "hi".chars().enumerate() {
///     alice.insert(i, ch);
/// }
///
/// // Ship alice's state to bob
/// let applied = bob.merge(&alice.state());
/// assert_eq!(applied.len(), 2);
/// assert_eq!(alice.text(), bob.text());
/// ```
#[derive(Clone, Debug)]
pub struct TextCrdt {
    /// This site's id
    site_id: SiteId,
    /// Counter for operations authored here
    clock: LamportClock,
    /// Highest clock observed per site
    version_vector: VersionVector,
    /// All entries (visible and tombstoned) in sequence order
    entries: BTreeMap<Identifier, CharacterEntry>,
    /// Number of visible entries
    visible: usize,
    /// Applied operations not yet compacted away
    history: Vec<Operation>,
    /// Operations covered by this vector may have been trimmed from history
    checkpoint: VersionVector,
    /// Applied clocks per site
    ledgers: HashMap<SiteId, SiteLedger>,
    /// Deletes waiting for their target insert
    pending_deletes: HashMap<Identifier, Vec<OpStamp>>,
    /// Wall clock for operation timestamps
    time: Arc<dyn TimeSource>,
}

impl TextCrdt {
    /// Create an empty sequence for a site, stamped with system time.
    pub fn new(site_id: impl Into<SiteId>) -> Self {
        Self::with_time_source(site_id, Arc::new(SystemTimeSource))
    }

    /// Create an empty sequence using an injected time source.
    pub fn with_time_source(site_id: impl Into<SiteId>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            site_id: site_id.into(),
            clock: LamportClock::new(),
            version_vector: VersionVector::new(),
            entries: BTreeMap::new(),
            visible: 0,
            history: Vec::new(),
            checkpoint: VersionVector::new(),
            ledgers: HashMap::new(),
            pending_deletes: HashMap::new(),
            time,
        }
    }

    /// Get the site id.
    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    /// Get the current local clock.
    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    /// Get the version vector (highest clock observed per site).
    pub fn version_vector(&self) -> &VersionVector {
        &self.version_vector
    }

    /// Per site, the highest clock below which no operation is missing.
    ///
    /// Equal to [`TextCrdt::version_vector`] unless operations from some site
    /// arrived out of order. Advertising this vector in sync requests makes
    /// peers resend whatever fills the gaps.
    pub fn contiguous_vector(&self) -> VersionVector {
        self.ledgers
            .iter()
            .filter(|(_, ledger)| ledger.contiguous > 0)
            .map(|(site, ledger)| (site.clone(), ledger.contiguous))
            .collect()
    }

    /// Insert `ch` so that it becomes the visible character at `index`.
    ///
    /// Indices past the end append.
    pub fn insert(&mut self, index: usize, ch: char) -> Operation {
        self.insert_with_attributes(index, ch, None)
    }

    /// Insert a character carrying an opaque attribute payload.
    pub fn insert_with_attributes(
        &mut self,
        index: usize,
        ch: char,
        attributes: Option<serde_json::Value>,
    ) -> Operation {
        let (prev, next) = self.boundary(index);
        let position = generate_position_between(&prev, &next, &self.site_id);
        let clock = self.clock.tick();
        let identifier = Identifier::new(position, self.site_id.clone(), clock);
        let op = Operation::insert(identifier, ch, attributes, self.time.now_ms());
        self.apply_operation(&op);
        op
    }

    /// Delete the visible character at `index`.
    ///
    /// Returns `None` without side effects if `index` is out of range.
    pub fn delete(&mut self, index: usize) -> Option<Operation> {
        if index >= self.visible {
            return None;
        }
        let target = self.identifier_at(index)?.clone();
        let clock = self.clock.tick();
        let op = Operation::delete(target, self.site_id.clone(), clock, self.time.now_ms());
        self.apply_operation(&op);
        Some(op)
    }

    /// Apply an operation from any site.
    ///
    /// This is idempotent: an operation whose `(site, clock)` was already
    /// applied is ignored. Malformed inserts (see
    /// [`Operation::is_well_formed`]) are rejected. Returns true if the
    /// operation was new.
    pub fn apply_operation(&mut self, op: &Operation) -> bool {
        if !op.is_well_formed() {
            return false;
        }

        let ledger = self.ledgers.entry(op.site_id.clone()).or_default();
        if !ledger.record(op.clock) {
            return false;
        }
        self.version_vector.observe(&op.site_id, op.clock);
        if op.site_id == self.site_id {
            self.clock.sync(op.clock);
        }

        match op.kind {
            OperationKind::Insert => self.apply_insert(op),
            OperationKind::Delete => self.apply_delete(op),
        }
        self.history.push(op.clone());
        true
    }

    fn apply_insert(&mut self, op: &Operation) {
        // A re-delivered insert must never resurrect a tombstone.
        if self.entries.contains_key(&op.identifier) {
            return;
        }
        let Some(mut entry) = CharacterEntry::from_insert(op) else {
            return;
        };

        if let Some(stamps) = self.pending_deletes.remove(&op.identifier) {
            entry.visible = false;
            entry.deleted_by = stamps;
        } else {
            self.visible += 1;
        }
        self.entries.insert(op.identifier.clone(), entry);
    }

    fn apply_delete(&mut self, op: &Operation) {
        match self.entries.get_mut(&op.identifier) {
            Some(entry) => {
                if entry.visible {
                    entry.visible = false;
                    self.visible -= 1;
                }
                entry.deleted_by.push(op.stamp());
            }
            None => {
                self.pending_deletes
                    .entry(op.identifier.clone())
                    .or_default()
                    .push(op.stamp());
            }
        }
    }

    /// Merge a remote snapshot.
    ///
    /// Returns the operations that were new to this replica, in the order
    /// they were applied.
    pub fn merge(&mut self, remote: &CrdtState) -> Vec<Operation> {
        if remote.site_id == self.site_id {
            self.clock.sync(remote.clock);
        }
        self.merge_operations(remote.operations.iter())
    }

    /// Apply a batch of operations, returning those that were new.
    pub fn merge_operations<'a, I>(&mut self, ops: I) -> Vec<Operation>
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        ops.into_iter()
            .filter(|op| self.apply_operation(op))
            .cloned()
            .collect()
    }

    /// Operations a peer with version vector `remote` has not seen.
    ///
    /// Returns exactly the operations with `clock > remote[site]`, including
    /// any that were compacted out of history (regenerated from entries).
    pub fn delta(&self, remote: &VersionVector) -> Vec<Operation> {
        let unseen = |op: &Operation| !remote.covers(&op.site_id, op.clock);
        let mut ops = Vec::new();

        if !remote.dominates(&self.checkpoint) {
            let retained: HashSet<(SiteId, u64)> = self
                .history
                .iter()
                .map(|op| (op.site_id.clone(), op.clock))
                .collect();
            let trimmed = |op: &Operation| {
                self.checkpoint.covers(&op.site_id, op.clock)
                    && !retained.contains(&(op.site_id.clone(), op.clock))
            };

            for entry in self.entries.values() {
                let insert = entry.insert_operation();
                if trimmed(&insert) && unseen(&insert) {
                    ops.push(insert);
                }
                ops.extend(
                    entry
                        .delete_operations()
                        .filter(|op| trimmed(op) && unseen(op)),
                );
            }
        }

        ops.extend(self.history.iter().filter(|op| unseen(op)).cloned());
        ops
    }

    /// Full snapshot of this replica.
    pub fn state(&self) -> CrdtState {
        CrdtState {
            site_id: self.site_id.clone(),
            clock: self.clock.value(),
            version_vector: self.version_vector.clone(),
            operations: self.delta(&VersionVector::new()),
        }
    }

    /// Trim history operations that every peer has acknowledged.
    ///
    /// `stable` is the vector all peers are known to have reached (typically
    /// the [`VersionVector::meet`] of their advertised vectors). Trimmed
    /// operations stay available to [`TextCrdt::delta`] through the entries.
    /// Deletes still waiting for their insert are kept. Returns the number of
    /// operations removed.
    pub fn compact(&mut self, stable: &VersionVector) -> usize {
        let stable = stable.meet(&self.version_vector);
        let before = self.history.len();
        let entries = &self.entries;

        self.history.retain(|op| {
            if !stable.covers(&op.site_id, op.clock) {
                return true;
            }
            op.is_delete() && !entries.contains_key(&op.identifier)
        });
        self.checkpoint.merge(&stable);

        before - self.history.len()
    }

    /// Reset the replica to empty, including clock and version vector.
    pub fn clear(&mut self) {
        self.clock.reset();
        self.version_vector.clear();
        self.entries.clear();
        self.visible = 0;
        self.history.clear();
        self.checkpoint.clear();
        self.ledgers.clear();
        self.pending_deletes.clear();
    }

    /// The visible text.
    pub fn text(&self) -> String {
        self.visible_entries().map(|entry| entry.ch).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    /// Check if no characters are visible.
    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Number of entries including tombstones.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// All entries in sequence order, including tombstones.
    pub fn entries(&self) -> impl Iterator<Item = &CharacterEntry> + '_ {
        self.entries.values()
    }

    /// Visible entries in sequence order.
    pub fn visible_entries(&self) -> impl Iterator<Item = &CharacterEntry> + '_ {
        self.entries.values().filter(|entry| entry.visible)
    }

    /// Look up an entry by identifier.
    pub fn get(&self, identifier: &Identifier) -> Option<&CharacterEntry> {
        self.entries.get(identifier)
    }

    /// Identifier of the visible character at `index`.
    pub fn identifier_at(&self, index: usize) -> Option<&Identifier> {
        self.visible_entries().nth(index).map(|entry| &entry.id)
    }

    /// Visible index of a character, or `None` if unknown or deleted.
    pub fn index_of(&self, identifier: &Identifier) -> Option<usize> {
        if !self.entries.get(identifier)?.visible {
            return None;
        }
        Some(self.entries.range(..identifier).filter(|(_, e)| e.visible).count())
    }

    /// Retained history (operations applied since the last compaction).
    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    /// Number of retained history operations.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Number of deletes waiting for their target insert.
    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.values().map(Vec::len).sum()
    }

    /// Resolve a visible index to the positions a new character must sit
    /// between.
    ///
    /// The lower bound is the entry immediately before the visible character
    /// at `index`, tombstones included, so a site never re-mints the position
    /// of one of its own deleted characters.
    fn boundary(&self, index: usize) -> (Position, Position) {
        let index = index.min(self.visible);
        let mut prev = Position::start();
        let mut next = Position::end();
        let mut seen = 0;

        for entry in self.entries.values() {
            if entry.visible {
                if seen == index {
                    next = entry.id.position.clone();
                    break;
                }
                seen += 1;
            }
            prev = entry.id.position.clone();
        }

        if prev >= next {
            // Only reachable when two entries share a position (a peer
            // re-minted one); step past the tie.
            next = self
                .entries
                .keys()
                .map(|id| &id.position)
                .find(|position| **position > prev)
                .cloned()
                .unwrap_or_else(Position::end);
        }
        (prev, next)
    }
}
