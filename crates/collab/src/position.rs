//! Dense position identifiers for the replicated sequence.
//!
//! Every character carries a [`Position`]: a path of `(digit, site)` pairs.
//! Positions are totally ordered level by level, and between any two distinct
//! positions a new one can always be generated, so inserts never need to
//! renumber existing characters.
//!
//! # Ordering
//!
//! Components compare by `digit` first and `site` second. A position that is
//! shorter than the other compares as if padded with `{digit: 0, site: ""}`;
//! if both are equal after padding, the shorter one orders first. This exact
//! rule is part of the wire contract: every replica must sort the same way.
//!
//! # Allocation
//!
//! [`generate_position_between`] walks both bounds level by level. At the
//! first level with room (`hi.digit - lo.digit > 1`) it mints the midpoint
//! digit tagged with the generating site. Otherwise it copies the lower
//! bound's component and descends. Tagging fresh digits with the local site
//! keeps concurrent splits of the same gap distinct.

use crate::site::SiteId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Largest digit a component may carry.
///
/// 2^53 - 1 keeps every digit exactly representable as a JSON number.
pub const MAX_DIGIT: u64 = (1 << 53) - 1;

/// One level of a position path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionComponent {
    /// Ordering digit at this level
    pub digit: u64,
    /// Site that minted (or first carried) this digit
    pub site_id: SiteId,
}

impl PositionComponent {
    /// Create a new component.
    pub fn new(digit: u64, site_id: SiteId) -> Self {
        Self { digit, site_id }
    }

    /// The implicit component used for levels a position does not have.
    fn padding() -> Self {
        Self::new(0, SiteId::none())
    }
}

impl PartialOrd for PositionComponent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PositionComponent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digit
            .cmp(&other.digit)
            .then_with(|| self.site_id.cmp(&other.site_id))
    }
}

/// An immutable, structurally shared position path.
///
/// Cloning a position only bumps a reference count, so positions taken as
/// generation bounds can never be mutated through an alias.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Arc<[PositionComponent]>);

impl Position {
    /// Build a position from its components.
    pub fn new(components: Vec<PositionComponent>) -> Self {
        Self(Arc::from(components))
    }

    /// The virtual lower bound `[{0, ""}]`.
    pub fn start() -> Self {
        Self::new(vec![PositionComponent::new(0, SiteId::none())])
    }

    /// The virtual upper bound `[{MAX_DIGIT, ""}]`.
    pub fn end() -> Self {
        Self::new(vec![PositionComponent::new(MAX_DIGIT, SiteId::none())])
    }

    /// Components of this position, outermost level first.
    pub fn components(&self) -> &[PositionComponent] {
        &self.0
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Component at `level`, if present.
    pub fn get(&self, level: usize) -> Option<&PositionComponent> {
        self.0.get(level)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", c.digit, c.site_id)?;
        }
        f.write_str("]")
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_positions(self, other)
    }
}

/// Compare two positions level by level, padding the shorter with
/// `{0, ""}` and falling back to length when every level ties.
pub fn compare_positions(a: &Position, b: &Position) -> Ordering {
    let padding = PositionComponent::padding();
    let depth = a.depth().max(b.depth());

    for level in 0..depth {
        let ca = a.get(level).unwrap_or(&padding);
        let cb = b.get(level).unwrap_or(&padding);
        match ca.cmp(cb) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }

    a.depth().cmp(&b.depth())
}

/// Generate a position strictly between `prev` and `next`, tagging any newly
/// minted digit with `site`.
///
/// Requires `prev < next`. Use [`Position::start`] and [`Position::end`] for
/// the open ends of the sequence.
pub fn generate_position_between(prev: &Position, next: &Position, site: &SiteId) -> Position {
    debug_assert!(prev < next, "bounds out of order: {:?} >= {:?}", prev, next);

    let padding = PositionComponent::padding();
    let ceiling = PositionComponent::new(MAX_DIGIT, SiteId::none());
    let mut path = Vec::with_capacity(prev.depth() + 1);
    // Once the path has dropped strictly below `next`, deeper levels are
    // bounded only by the ceiling.
    let mut bounded_by_next = true;
    let mut level = 0;

    loop {
        let lo = prev.get(level).unwrap_or(&padding);
        let hi = if bounded_by_next {
            next.get(level).unwrap_or(&padding)
        } else {
            &ceiling
        };

        if hi.digit > lo.digit && hi.digit - lo.digit > 1 {
            let digit = lo.digit + (hi.digit - lo.digit) / 2;
            path.push(PositionComponent::new(digit, site.clone()));
            return Position::new(path);
        }

        if lo.cmp(hi) != Ordering::Equal {
            // Gap of one, or same digit with a smaller site: everything that
            // extends `lo` sorts below `hi`.
            bounded_by_next = false;
        }

        path.push(lo.clone());
        level += 1;
    }
}
