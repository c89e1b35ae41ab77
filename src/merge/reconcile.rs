//! RECONCILE step of the reconciliation pipeline.
//!
//! Combines two [`DiffResult`]s computed against the same base (base → local
//! and base → remote) into per-id conflicts and default resolutions.
//!
//! Rules, for every id in the shared base:
//!
//! - changed locally, deleted remotely → conflict ([`ConflictKind::ChangeDelete`])
//! - deleted locally, changed remotely → conflict ([`ConflictKind::DeleteChange`])
//! - changed on both sides to different records → conflict
//!   ([`ConflictKind::MoveMove`] when both moved to different scopes,
//!   [`ConflictKind::ChangeChange`] otherwise)
//! - otherwise `remote` if the remote side touched it, else `local`
//!
//! For added ids:
//!
//! - added on one side into a scope the other side deleted → conflict
//!   ([`ConflictKind::AddedToDeletedScope`])
//! - added on both sides under the same id: equal records resolve `remote`,
//!   different records conflict ([`ConflictKind::IdCollision`])
//! - otherwise the adding side
//!
//! Every covered id ends up in exactly one of `conflicts` or `resolutions`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::diff::DiffResult;
use crate::error::FlowError;
use crate::model::canonical::records_equal;
use crate::model::record::Record;
use crate::model::types::{RecordId, Side};

// ---------------------------------------------------------------------------
// ConflictKind
// ---------------------------------------------------------------------------

/// Why an id needs an explicit choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Changed locally, deleted remotely.
    ChangeDelete,
    /// Deleted locally, changed remotely.
    DeleteChange,
    /// Changed on both sides to different records.
    ChangeChange,
    /// Moved on both sides into different containers.
    MoveMove,
    /// Added on one side into a container the other side deleted.
    AddedToDeletedScope,
    /// Added on both sides under the same id with different content.
    IdCollision,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChangeDelete => write!(f, "changed locally, deleted remotely"),
            Self::DeleteChange => write!(f, "deleted locally, changed remotely"),
            Self::ChangeChange => write!(f, "changed differently on both sides"),
            Self::MoveMove => write!(f, "moved to different containers on both sides"),
            Self::AddedToDeletedScope => write!(f, "added into a deleted container"),
            Self::IdCollision => write!(f, "added on both sides with different content"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconciliationResult
// ---------------------------------------------------------------------------

/// Conflicts and resolutions for one (base, local, remote) triple.
///
/// `resolutions` is pre-populated for every unconflicted id. Conflicted ids
/// gain an entry only through [`ReconciliationResult::resolve`].
#[derive(Clone, Debug)]
pub struct ReconciliationResult {
    /// Base → local.
    pub local: DiffResult,
    /// Base → remote.
    pub remote: DiffResult,
    /// Ids that need an explicit choice, with the reason.
    pub conflicts: BTreeMap<RecordId, ConflictKind>,
    /// Chosen side per id.
    pub resolutions: BTreeMap<RecordId, Side>,
}

impl ReconciliationResult {
    /// Whether `id` is conflicted.
    #[must_use]
    pub fn is_conflicted(&self, id: &str) -> bool {
        self.conflicts.contains_key(id)
    }

    /// The current resolution for `id`.
    #[must_use]
    pub fn resolution(&self, id: &str) -> Option<Side> {
        self.resolutions.get(id).copied()
    }

    /// Whether `id` is covered by this reconciliation.
    #[must_use]
    pub fn covers(&self, id: &str) -> bool {
        self.conflicts.contains_key(id) || self.resolutions.contains_key(id)
    }

    /// Choose a side for `id`.
    ///
    /// Conflicted ids take their first resolution this way; unconflicted ids
    /// may have their default overridden.
    ///
    /// # Errors
    /// Returns [`FlowError::UnknownRecord`] if `id` is not covered.
    pub fn resolve(&mut self, id: &RecordId, side: Side) -> Result<(), FlowError> {
        if !self.covers(id.as_str()) {
            return Err(FlowError::UnknownRecord { id: id.clone() });
        }
        self.resolutions.insert(id.clone(), side);
        Ok(())
    }

    /// Conflicted ids still lacking a resolution, sorted.
    #[must_use]
    pub fn unresolved(&self) -> Vec<RecordId> {
        self.conflicts
            .keys()
            .filter(|id| !self.resolutions.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Whether every conflict has a resolution (gates the merge action).
    #[must_use]
    pub fn all_resolved(&self) -> bool {
        self.conflicts
            .keys()
            .all(|id| self.resolutions.contains_key(id))
    }

    /// The record `side` holds for `id`, if that side still has one.
    #[must_use]
    pub fn record_on(&self, side: Side, id: &str) -> Option<&Record> {
        match side {
            Side::Local => self.local.candidate_record(id),
            Side::Remote => self.remote.candidate_record(id),
        }
    }
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

/// Reconcile a local and a remote diff against their shared base.
///
/// # Errors
/// Returns [`FlowError::MismatchedBase`] if the two diffs were not computed
/// against the same base configuration.
pub fn reconcile(local: DiffResult, remote: DiffResult) -> Result<ReconciliationResult, FlowError> {
    if !Arc::ptr_eq(&local.base, &remote.base) && *local.base != *remote.base {
        return Err(FlowError::MismatchedBase);
    }

    let mut conflicts = BTreeMap::new();
    let mut resolutions = BTreeMap::new();

    for id in local.base.all.keys() {
        match base_conflict(&local, &remote, id) {
            Some(kind) => {
                conflicts.insert(id.clone(), kind);
            }
            None => {
                let side = if remote.touches(id.as_str()) {
                    Side::Remote
                } else {
                    Side::Local
                };
                resolutions.insert(id.clone(), side);
            }
        }
    }

    for id in &local.added {
        if remote.added.contains(id) {
            let equal = match (local.candidate_record(id.as_str()), remote.candidate_record(id.as_str())) {
                (Some(l), Some(r)) => records_equal(l, r),
                _ => false,
            };
            if equal {
                resolutions.insert(id.clone(), Side::Remote);
            } else {
                conflicts.insert(id.clone(), ConflictKind::IdCollision);
            }
        } else if added_into_deleted_scope(&local, &remote, id) {
            conflicts.insert(id.clone(), ConflictKind::AddedToDeletedScope);
        } else {
            resolutions.insert(id.clone(), Side::Local);
        }
    }

    for id in remote.added.difference(&local.added) {
        if added_into_deleted_scope(&remote, &local, id) {
            conflicts.insert(id.clone(), ConflictKind::AddedToDeletedScope);
        } else {
            resolutions.insert(id.clone(), Side::Remote);
        }
    }

    info!(
        covered = conflicts.len() + resolutions.len(),
        conflicts = conflicts.len(),
        "reconciled local and remote changes"
    );

    Ok(ReconciliationResult {
        local,
        remote,
        conflicts,
        resolutions,
    })
}

/// The conflict, if any, for an id present in the shared base.
fn base_conflict(local: &DiffResult, remote: &DiffResult, id: &RecordId) -> Option<ConflictKind> {
    let local_changed = local.changed.contains(id);
    let remote_changed = remote.changed.contains(id);

    if local_changed && remote.deleted.contains(id) {
        return Some(ConflictKind::ChangeDelete);
    }
    if local.deleted.contains(id) && remote_changed {
        return Some(ConflictKind::DeleteChange);
    }
    if !(local_changed && remote_changed) {
        return None;
    }

    let (l, r) = (
        local.candidate_record(id.as_str())?,
        remote.candidate_record(id.as_str())?,
    );
    if records_equal(l, r) {
        None
    } else if local.moved.contains(id) && remote.moved.contains(id) && l.z != r.z {
        Some(ConflictKind::MoveMove)
    } else {
        Some(ConflictKind::ChangeChange)
    }
}

/// Whether `id`, added on `adder`'s side, lives in a scope `other` deleted.
fn added_into_deleted_scope(adder: &DiffResult, other: &DiffResult, id: &RecordId) -> bool {
    adder
        .candidate_record(id.as_str())
        .and_then(|r| r.z.as_ref())
        .is_some_and(|z| other.deleted.contains(z))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::diff::diff;
    use crate::merge::partition::{ParsedConfiguration, partition};
    use crate::model::record::Snapshot;

    fn parsed(json: &str) -> Arc<ParsedConfiguration> {
        Arc::new(partition(&Snapshot::from_json(json).unwrap()))
    }

    fn run(base: &str, local: &str, remote: &str) -> ReconciliationResult {
        let base = parsed(base);
        reconcile(
            diff(Arc::clone(&base), parsed(local)),
            diff(base, parsed(remote)),
        )
        .unwrap()
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    const BASE: &str = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
        {"id":"n","type":"inject","z":"t1","x":10}]"#;

    #[test]
    fn untouched_ids_resolve_local() {
        let r = run(BASE, BASE, BASE);
        assert!(r.conflicts.is_empty());
        assert_eq!(r.resolutions.len(), 3);
        assert!(r.resolutions.values().all(|s| *s == Side::Local));
        assert!(r.all_resolved());
    }

    #[test]
    fn remote_touch_defaults_to_remote() {
        let remote = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":99}]"#;
        let r = run(BASE, BASE, remote);
        assert_eq!(r.resolution("n"), Some(Side::Remote));
        assert_eq!(r.resolution("t1"), Some(Side::Local));
    }

    #[test]
    fn change_delete_and_delete_change_conflict() {
        let changed = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":11}]"#;
        let deleted = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"}]"#;
        let r = run(BASE, changed, deleted);
        assert_eq!(r.conflicts.get("n"), Some(&ConflictKind::ChangeDelete));
        let r = run(BASE, deleted, changed);
        assert_eq!(r.conflicts.get("n"), Some(&ConflictKind::DeleteChange));
        assert_eq!(r.resolution("n"), None);
    }

    #[test]
    fn both_deleted_is_not_a_conflict() {
        let deleted = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"}]"#;
        let r = run(BASE, deleted, deleted);
        assert!(r.conflicts.is_empty());
        assert_eq!(r.resolution("n"), Some(Side::Remote));
    }

    #[test]
    fn equal_changes_do_not_conflict() {
        let same = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":20}]"#;
        let r = run(BASE, same, same);
        assert!(r.conflicts.is_empty());
        assert_eq!(r.resolution("n"), Some(Side::Remote));
    }

    #[test]
    fn divergent_changes_and_moves_conflict() {
        let l = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":20}]"#;
        let r = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":30}]"#;
        assert_eq!(run(BASE, l, r).conflicts.get("n"), Some(&ConflictKind::ChangeChange));

        let l = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},{"id":"t3","type":"tab"},
            {"id":"n","type":"inject","z":"t2","x":10}]"#;
        let r = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},{"id":"t3","type":"tab"},
            {"id":"n","type":"inject","z":"t3","x":10}]"#;
        assert_eq!(run(BASE, l, r).conflicts.get("n"), Some(&ConflictKind::MoveMove));
    }

    #[test]
    fn added_into_remotely_deleted_container_conflicts() {
        let local = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":10},
            {"id":"new","type":"debug","z":"t2"}]"#;
        let remote = r#"[{"id":"t1","type":"tab"},{"id":"n","type":"inject","z":"t1","x":10}]"#;
        let r = run(BASE, local, remote);
        assert_eq!(r.conflicts.get("new"), Some(&ConflictKind::AddedToDeletedScope));
        assert_eq!(r.resolution("t2"), Some(Side::Remote));
    }

    #[test]
    fn same_id_added_on_both_sides() {
        let with = |v: u32| {
            format!(
                r#"[{{"id":"t1","type":"tab"}},{{"id":"t2","type":"tab"}},
                {{"id":"n","type":"inject","z":"t1","x":10}},{{"id":"dup","type":"debug","v":{v}}}]"#
            )
        };
        let r = run(BASE, &with(1), &with(1));
        assert_eq!(r.resolution("dup"), Some(Side::Remote));
        let r = run(BASE, &with(1), &with(2));
        assert_eq!(r.conflicts.get("dup"), Some(&ConflictKind::IdCollision));
    }

    #[test]
    fn every_covered_id_is_in_exactly_one_map() {
        let local = r#"[{"id":"t1","type":"tab"},{"id":"a","type":"debug","z":"t1"},
            {"id":"n","type":"inject","z":"t1","x":1}]"#;
        let remote = r#"[{"id":"t2","type":"tab"},{"id":"b","type":"debug","z":"t2"}]"#;
        let r = run(BASE, local, remote);
        for covered in ["t1", "t2", "n", "a", "b"] {
            assert!(
                r.conflicts.contains_key(covered) ^ r.resolutions.contains_key(covered),
                "{covered} must be in exactly one map"
            );
        }
    }

    #[test]
    fn resolve_rejects_unknown_ids_and_fills_conflicts() {
        let changed = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"},
            {"id":"n","type":"inject","z":"t1","x":11}]"#;
        let deleted = r#"[{"id":"t1","type":"tab"},{"id":"t2","type":"tab"}]"#;
        let mut r = run(BASE, changed, deleted);
        assert_eq!(r.unresolved(), vec![id("n")]);
        assert!(!r.all_resolved());
        assert!(matches!(
            r.resolve(&id("ghost"), Side::Local),
            Err(FlowError::UnknownRecord { .. })
        ));
        r.resolve(&id("n"), Side::Local).unwrap();
        assert!(r.all_resolved());
        assert!(r.unresolved().is_empty());
    }

    #[test]
    fn mismatched_bases_are_rejected() {
        let a = parsed(BASE);
        let b = parsed(r#"[{"id":"other","type":"tab"}]"#);
        let err = reconcile(diff(Arc::clone(&a), Arc::clone(&a)), diff(b, a)).unwrap_err();
        assert!(matches!(err, FlowError::MismatchedBase));
    }

    #[test]
    fn equal_but_distinct_bases_are_accepted() {
        let l = diff(parsed(BASE), parsed(BASE));
        let r = diff(parsed(BASE), parsed(BASE));
        assert!(reconcile(l, r).is_ok());
    }
}
