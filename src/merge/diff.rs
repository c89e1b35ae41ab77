//! DIFF step of the reconciliation pipeline.
//!
//! Compares a base [`ParsedConfiguration`] against a candidate one and
//! classifies every id by set membership and structural equality:
//!
//! | base | candidate | records equal | result            |
//! |------|-----------|---------------|-------------------|
//! | –    | ✓         |               | added             |
//! | ✓    | –         |               | deleted           |
//! | ✓    | ✓         | no            | changed           |
//! | ✓    | ✓         | no, `z` differs | changed + moved |
//!
//! Ids are kept in sorted sets, so results never depend on snapshot order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::partition::ParsedConfiguration;
use crate::model::canonical::records_equal;
use crate::model::record::Record;
use crate::model::types::RecordId;

// ---------------------------------------------------------------------------
// ChangeKind
// ---------------------------------------------------------------------------

/// How one side changed one id relative to the base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Present only in the candidate.
    Added,
    /// Present only in the base.
    Deleted,
    /// Present in both, structurally different, same scope.
    Changed,
    /// Present in both, structurally different, scope changed.
    Moved,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Deleted => write!(f, "deleted"),
            Self::Changed => write!(f, "changed"),
            Self::Moved => write!(f, "moved"),
        }
    }
}

// ---------------------------------------------------------------------------
// DiffResult
// ---------------------------------------------------------------------------

/// Set difference between two configurations.
///
/// Holds shared handles to both sides so later phases can look records up.
#[derive(Clone, Debug)]
pub struct DiffResult {
    /// The configuration compared from.
    pub base: Arc<ParsedConfiguration>,
    /// The configuration compared to.
    pub candidate: Arc<ParsedConfiguration>,
    /// Ids only in the candidate.
    pub added: BTreeSet<RecordId>,
    /// Ids only in the base.
    pub deleted: BTreeSet<RecordId>,
    /// Ids in both whose records differ.
    pub changed: BTreeSet<RecordId>,
    /// Subset of `changed` whose `z` differs.
    pub moved: BTreeSet<RecordId>,
}

impl DiffResult {
    /// Returns `true` if nothing was added, deleted, or changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }

    /// Whether this side touched `id` at all.
    #[must_use]
    pub fn touches(&self, id: &str) -> bool {
        self.added.contains(id) || self.deleted.contains(id) || self.changed.contains(id)
    }

    /// Classify one id. `None` means untouched (or unknown to both sides).
    #[must_use]
    pub fn kind_of(&self, id: &str) -> Option<ChangeKind> {
        if self.added.contains(id) {
            Some(ChangeKind::Added)
        } else if self.deleted.contains(id) {
            Some(ChangeKind::Deleted)
        } else if self.moved.contains(id) {
            Some(ChangeKind::Moved)
        } else if self.changed.contains(id) {
            Some(ChangeKind::Changed)
        } else {
            None
        }
    }

    /// The candidate-side record for `id`, if it still exists.
    #[must_use]
    pub fn candidate_record(&self, id: &str) -> Option<&Record> {
        self.candidate.get(id)
    }

    /// The base-side record for `id`, if it existed.
    #[must_use]
    pub fn base_record(&self, id: &str) -> Option<&Record> {
        self.base.get(id)
    }

    /// Every id touched by this side, sorted.
    #[must_use]
    pub fn touched(&self) -> BTreeSet<RecordId> {
        self.added
            .iter()
            .chain(&self.deleted)
            .chain(&self.changed)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// diff
// ---------------------------------------------------------------------------

/// Compute the difference from `base` to `candidate`.
#[must_use]
pub fn diff(base: Arc<ParsedConfiguration>, candidate: Arc<ParsedConfiguration>) -> DiffResult {
    let mut added = BTreeSet::new();
    let mut deleted = BTreeSet::new();
    let mut changed = BTreeSet::new();
    let mut moved = BTreeSet::new();

    for (id, before) in &base.all {
        match candidate.all.get(id) {
            None => {
                deleted.insert(id.clone());
            }
            Some(after) if !records_equal(before, after) => {
                changed.insert(id.clone());
                if before.z != after.z {
                    moved.insert(id.clone());
                }
            }
            Some(_) => {}
        }
    }
    for id in candidate.all.keys() {
        if !base.all.contains_key(id) {
            added.insert(id.clone());
        }
    }

    debug!(
        added = added.len(),
        deleted = deleted.len(),
        changed = changed.len(),
        moved = moved.len(),
        "diffed configurations"
    );

    DiffResult {
        base,
        candidate,
        added,
        deleted,
        changed,
        moved,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
