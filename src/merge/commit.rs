//! COMMIT step of the reconciliation pipeline.
//!
//! [`merge`] turns a fully resolved [`ReconciliationResult`] into the merged
//! [`Snapshot`] without touching anything. [`commit`] additionally applies
//! that snapshot to the working store in one step and records a reversible
//! [`ReplaceEvent`].
//!
//! # Selection
//!
//! - every id in the local candidate: the local record if resolved `local`;
//!   the remote record (when it still exists) if resolved `remote`
//! - every id deleted locally but resolved `remote`: the remote record
//! - every remote-only addition resolved `remote`: the remote record
//!
//! Ids taking the remote record are reported in [`MergeOutcome::changed`]:
//! they now diverge from what this client last deployed.
//!
//! # Output order
//!
//! Containers, templates, global records, then the members of each container
//! and each template, all in declaration order.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use super::partition::partition;
use super::reconcile::ReconciliationResult;
use crate::codec::DecodeReport;
use crate::error::FlowError;
use crate::history::{History, ReplaceEvent};
use crate::model::record::{Record, Snapshot};
use crate::model::types::{RecordId, RevisionToken, Side};
use crate::store::WorkingStore;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// The merged configuration, before it is applied anywhere.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome {
    /// Merged records.
    pub snapshot: Snapshot,
    /// Ids that took the remote record.
    pub changed: BTreeSet<RecordId>,
    /// The resolutions the merge was computed from (frozen at merge start).
    pub resolutions: BTreeMap<RecordId, Side>,
}

/// Result of [`commit`].
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    /// What was merged.
    pub merge: MergeOutcome,
    /// What decoding the merged snapshot into the store observed.
    pub report: DecodeReport,
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Compute the merged snapshot.
///
/// # Errors
/// Returns [`FlowError::UnresolvedConflicts`] if any conflict lacks a
/// resolution.
pub fn merge(result: &ReconciliationResult) -> Result<MergeOutcome, FlowError> {
    let unresolved = result.unresolved();
    if !unresolved.is_empty() {
        return Err(FlowError::UnresolvedConflicts { ids: unresolved });
    }
    let resolutions = result.resolutions.clone();
    let side_of = |id: &RecordId| resolutions.get(id).copied().unwrap_or(Side::Local);

    let local = &result.local.candidate;
    let remote = &result.remote.candidate;
    let mut picked: Vec<Record> = Vec::with_capacity(local.len().max(remote.len()));
    let mut changed = BTreeSet::new();

    for record in local.records() {
        match side_of(&record.id) {
            Side::Local => picked.push(record.clone()),
            Side::Remote => {
                if let Some(theirs) = remote.get(record.id.as_str()) {
                    picked.push(theirs.clone());
                    changed.insert(record.id.clone());
                }
            }
        }
    }

    for record in remote.records() {
        // Deleted locally or added remotely.
        if local.contains(record.id.as_str()) || side_of(&record.id) != Side::Remote {
            continue;
        }
        picked.push(record.clone());
        changed.insert(record.id.clone());
    }

    let snapshot = ordered(picked);
    info!(
        records = snapshot.len(),
        changed = changed.len(),
        "merged local and remote flows"
    );
    Ok(MergeOutcome {
        snapshot,
        changed,
        resolutions,
    })
}

/// Containers, templates, globals, then each group's members.
fn ordered(records: Vec<Record>) -> Snapshot {
    let parsed = partition(&Snapshot::new(records));
    let groups = parsed.container_order.iter().chain(&parsed.template_order);
    let members = parsed
        .container_order
        .iter()
        .chain(&parsed.template_order)
        .flat_map(|group| parsed.members(group.as_str()));

    groups
        .chain(&parsed.globals)
        .chain(members)
        .filter_map(|id| parsed.get(id.as_str()).cloned())
        .collect()
}

// ---------------------------------------------------------------------------
// commit
// ---------------------------------------------------------------------------

/// Merge and apply the result to `store`.
///
/// On success the store holds the merged records (remote-taken ids freshly
/// flagged, everything else keeping its flags), the merged snapshot is the
/// new baseline, `revision` (when given) is the new revision token, and one
/// [`ReplaceEvent`] capturing the prior state has been pushed to `history`.
///
/// # Errors
/// Returns [`FlowError::UnresolvedConflicts`] or the store's decode error.
/// Neither the store nor the history is touched on error.
pub fn commit<S, H>(
    result: &ReconciliationResult,
    store: &mut S,
    history: &mut H,
    revision: Option<RevisionToken>,
) -> Result<CommitOutcome, FlowError>
where
    S: WorkingStore + ?Sized,
    H: History + ?Sized,
{
    let outcome = merge(result)?;

    let previous = store.current_snapshot();
    let previous_flags = store.flags();
    let previous_baseline = store.baseline().clone();
    let previous_revision = store.revision_token().cloned();

    let report = store.replace(&outcome.snapshot, &outcome.changed)?;
    store.set_baseline(outcome.snapshot.clone());
    if revision.is_some() {
        store.set_revision_token(revision);
    }

    history.record(ReplaceEvent {
        previous,
        previous_flags,
        previous_baseline,
        previous_revision,
        revision: store.revision_token().cloned(),
        changed: outcome.changed.clone(),
    });

    info!(
        changed = outcome.changed.len(),
        dropped_refs = report.dropped_refs(),
        "committed merge to working store"
    );
    Ok(CommitOutcome {
        merge: outcome,
        report,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
