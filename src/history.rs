//! Undo history for merge commits.
//!
//! Every successful merge commit pushes exactly one [`ReplaceEvent`]. The
//! event carries everything needed to put the working store back the way it
//! was: the pre-merge snapshot, each record's flags, the previous baseline,
//! and the previous revision token.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::error::FlowError;
use crate::model::record::Snapshot;
use crate::model::types::{RecordId, RevisionToken};
use crate::store::{NodeFlags, WorkingStore};

/// One reversible "replace the whole configuration" edit.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplaceEvent {
    /// Store content before the merge.
    pub previous: Snapshot,
    /// Per-record flags before the merge.
    pub previous_flags: BTreeMap<RecordId, NodeFlags>,
    /// Reconciliation baseline before the merge.
    pub previous_baseline: Snapshot,
    /// Revision token before the merge.
    pub previous_revision: Option<RevisionToken>,
    /// Revision token after the merge.
    pub revision: Option<RevisionToken>,
    /// Ids the merge took from the remote side.
    pub changed: BTreeSet<RecordId>,
}

/// Sink for replace events.
pub trait History {
    /// Record one committed merge.
    fn record(&mut self, event: ReplaceEvent);
}

/// An in-memory undo stack of replace events.
#[derive(Clone, Debug, Default)]
pub struct HistoryLog {
    events: Vec<ReplaceEvent>,
}

impl HistoryLog {
    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The most recent event.
    #[must_use]
    pub fn last(&self) -> Option<&ReplaceEvent> {
        self.events.last()
    }

    /// Reverse the most recent merge.
    ///
    /// Returns the undone event, or `None` if the log is empty. The event is
    /// only popped once the store has been restored.
    ///
    /// # Errors
    /// Returns the store's decode error if the pre-merge snapshot cannot be
    /// reapplied; the log is left unchanged.
    pub fn undo<S>(&mut self, store: &mut S) -> Result<Option<ReplaceEvent>, FlowError>
    where
        S: WorkingStore + ?Sized,
    {
        let Some(event) = self.events.last() else {
            return Ok(None);
        };
        store.replace(&event.previous, &BTreeSet::new())?;
        store.restore_flags(&event.previous_flags);
        store.set_baseline(event.previous_baseline.clone());
        store.set_revision_token(event.previous_revision.clone());
        info!(records = event.previous.len(), "undid merge");
        Ok(self.events.pop())
    }
}

impl History for HistoryLog {
    fn record(&mut self, event: ReplaceEvent) {
        self.events.push(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::merge::{commit, diff, partition, reconcile};
    use crate::registry::TypeRegistry;
    use crate::store::FlowStore;

    #[test]
    fn undo_on_empty_log_is_a_no_op() {
        let mut store = FlowStore::new(Arc::new(TypeRegistry::new()));
        let mut log = HistoryLog::default();
        assert!(log.undo(&mut store).unwrap().is_none());
    }

    #[test]
    fn undo_restores_content_flags_baseline_and_revision() {
        let base = Snapshot::from_json(
            r#"[{"id":"t","type":"tab"},{"id":"n","type":"inject","z":"t","x":1}]"#,
        )
        .unwrap();
        let r1 = RevisionToken::new("r1").unwrap();
        let (mut store, _) =
            FlowStore::load(Arc::new(TypeRegistry::new()), &base, Some(r1.clone())).unwrap();
        store.set_prop("n", "name", json!("edited"));
        let before = store.current_snapshot();
        let flags_before = store.flags();

        let remote = Snapshot::from_json(
            r#"[{"id":"t","type":"tab","label":"R"},{"id":"n","type":"inject","z":"t","x":1}]"#,
        )
        .unwrap();
        let base_cfg = Arc::new(partition::partition(&base));
        let result = reconcile::reconcile(
            diff::diff(Arc::clone(&base_cfg), Arc::new(partition::partition(&before))),
            diff::diff(base_cfg, Arc::new(partition::partition(&remote))),
        )
        .unwrap();

        let mut log = HistoryLog::default();
        let r2 = RevisionToken::new("r2").unwrap();
        commit::commit(&result, &mut store, &mut log, Some(r2.clone())).unwrap();
        assert_eq!(log.last().unwrap().revision, Some(r2));
        assert_ne!(store.current_snapshot(), before);

        let undone = log.undo(&mut store).unwrap().unwrap();
        assert_eq!(undone.changed, BTreeSet::from([RecordId::new("t").unwrap()]));
        assert_eq!(store.current_snapshot(), before);
        assert_eq!(store.flags(), flags_before);
        assert_eq!(store.baseline(), &base);
        assert_eq!(store.revision_token(), Some(&r1));
        assert!(log.is_empty());
    }
}
