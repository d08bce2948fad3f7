//! Operation and state types for the replicated sequence.
//!
//! An [`Operation`] is the immutable unit of replication: either an insert of
//! one character at a freshly allocated [`Identifier`], or a delete that
//! tombstones an existing identifier. A [`CrdtState`] bundles a full operation
//! list with the author's clock and version vector and is the canonical
//! snapshot format.

use crate::clock::VersionVector;
use crate::position::Position;
use crate::site::SiteId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Globally unique key for one character instance.
///
/// `(site_id, clock)` never repeats, and the position carries the sort key.
/// Identifiers order by position first. Allocation never hands out a
/// position that is already in use, so site and clock only keep the order
/// total for identifiers that did not come from allocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
    /// Dense sort key
    pub position: Position,
    /// Site that created the character
    pub site_id: SiteId,
    /// Clock of the insert operation that created the character
    pub clock: u64,
}

impl Identifier {
    /// Create a new identifier.
    pub fn new(position: Position, site_id: SiteId, clock: u64) -> Self {
        Self {
            position,
            site_id,
            clock,
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.site_id.cmp(&other.site_id))
            .then_with(|| self.clock.cmp(&other.clock))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}:{}", self.position, self.site_id, self.clock)
    }
}

/// Kind of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Insert a character
    Insert,
    /// Tombstone a character
    Delete,
}

/// The unit of replication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Insert or delete
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// The character created (insert) or targeted (delete)
    pub identifier: Identifier,
    /// Inserted character; absent on deletes
    #[serde(rename = "char", default, skip_serializing_if = "Option::is_none")]
    pub ch: Option<char>,
    /// Opaque per-character payload (formatting marks); carried, never merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    /// Site that authored this operation
    pub site_id: SiteId,
    /// Author's clock when the operation was generated
    pub clock: u64,
    /// Wall-clock milliseconds at generation
    pub timestamp: u64,
}

impl Operation {
    /// Build an insert operation.
    pub fn insert(
        identifier: Identifier,
        ch: char,
        attributes: Option<serde_json::Value>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: OperationKind::Insert,
            site_id: identifier.site_id.clone(),
            clock: identifier.clock,
            identifier,
            ch: Some(ch),
            attributes,
            timestamp,
        }
    }

    /// Build a delete operation authored by `site_id` at `clock`.
    pub fn delete(identifier: Identifier, site_id: SiteId, clock: u64, timestamp: u64) -> Self {
        Self {
            kind: OperationKind::Delete,
            identifier,
            ch: None,
            attributes: None,
            site_id,
            clock,
            timestamp,
        }
    }

    /// Check if this is an insert operation.
    pub fn is_insert(&self) -> bool {
        self.kind == OperationKind::Insert
    }

    /// Check if this is a delete operation.
    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    /// Check that an insert carries a character and is stamped with the
    /// site and clock of the identifier it creates. Deletes always pass.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            OperationKind::Insert => {
                self.ch.is_some()
                    && self.site_id == self.identifier.site_id
                    && self.clock == self.identifier.clock
            }
            OperationKind::Delete => true,
        }
    }

    /// The `(site, clock)` stamp that uniquely names this operation.
    pub fn stamp(&self) -> OpStamp {
        OpStamp {
            site_id: self.site_id.clone(),
            clock: self.clock,
            timestamp: self.timestamp,
        }
    }
}

/// Author stamp of an operation.
///
/// Entries keep the stamps of the deletes that tombstoned them so trimmed
/// history can be regenerated exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpStamp {
    pub site_id: SiteId,
    pub clock: u64,
    pub timestamp: u64,
}

/// One character instance in the sequence, visible or tombstoned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterEntry {
    /// The character
    #[serde(rename = "char")]
    pub ch: char,
    /// Identity and sort key
    pub id: Identifier,
    /// False once deleted; never flips back
    pub visible: bool,
    /// Opaque payload carried from the insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    /// Timestamp of the insert that created the entry
    #[serde(default)]
    pub inserted_at: u64,
    /// Deletes applied to this entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_by: Vec<OpStamp>,
}

impl CharacterEntry {
    /// Build the entry an insert operation creates.
    ///
    /// Returns `None` for delete operations or inserts without a character.
    pub fn from_insert(op: &Operation) -> Option<Self> {
        if !op.is_insert() {
            return None;
        }
        Some(Self {
            ch: op.ch?,
            id: op.identifier.clone(),
            visible: true,
            attributes: op.attributes.clone(),
            inserted_at: op.timestamp,
            deleted_by: Vec::new(),
        })
    }

    /// Check if this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        !self.visible
    }

    /// Regenerate the insert operation that created this entry.
    pub fn insert_operation(&self) -> Operation {
        Operation::insert(
            self.id.clone(),
            self.ch,
            self.attributes.clone(),
            self.inserted_at,
        )
    }

    /// Regenerate the delete operations applied to this entry.
    pub fn delete_operations(&self) -> impl Iterator<Item = Operation> + '_ {
        self.deleted_by.iter().map(|stamp| {
            Operation::delete(
                self.id.clone(),
                stamp.site_id.clone(),
                stamp.clock,
                stamp.timestamp,
            )
        })
    }
}

/// Full serializable snapshot of a replica.
///
/// Replaying `operations` through `merge` on any replica reproduces the
/// author's visible text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtState {
    pub site_id: SiteId,
    pub clock: u64,
    pub version_vector: VersionVector,
    pub operations: Vec<Operation>,
}

impl CrdtState {
    /// Serialize the snapshot to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
