//! Reconciliation sessions: fetch, reconcile, resolve, post, commit.
//!
//! A [`SyncSession`] owns the transport and allows at most one open
//! reconciliation at a time. The (base, local, remote) triple is captured
//! once in [`SyncSession::begin`]; later edits to the working store do not
//! affect the open reconciliation.
//!
//! # Lifecycle
//!
//! ```text
//! begin → Reconciling ──commit (ack)──────→ Committed
//!              │      ──commit (conflict)─→ Stale
//!              └──────cancel─────────────→ Cancelled
//! ```
//!
//! Nothing is written to the working store before a commit is acknowledged
//! by the transport. A stale post closes the session; the caller starts a
//! fresh one against the new remote content.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FlowError;
use crate::history::History;
use crate::merge::commit::{self, CommitOutcome};
use crate::merge::diff::diff;
use crate::merge::partition::partition;
use crate::merge::reconcile::{ReconciliationResult, reconcile};
use crate::model::record::Snapshot;
use crate::model::types::{RecordId, RevisionToken, Side};
use crate::store::WorkingStore;
use crate::transport::{PostOutcome, Transport};

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

/// The phase of a reconciliation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Open; resolutions may be supplied.
    Reconciling,
    /// Merged, posted, and applied.
    Committed,
    /// Abandoned without side effects.
    Cancelled,
    /// The remote advanced before the post landed.
    Stale,
}

impl SessionPhase {
    /// Returns `true` for every phase except `Reconciling`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reconciling)
    }

    /// Phases reachable from this one.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Reconciling => &[Self::Committed, Self::Cancelled, Self::Stale],
            Self::Committed | Self::Cancelled | Self::Stale => &[],
        }
    }

    /// Check whether transitioning to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        self.valid_transitions().contains(next)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconciling => write!(f, "reconciling"),
            Self::Committed => write!(f, "committed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncSession
// ---------------------------------------------------------------------------

struct OpenSession {
    result: ReconciliationResult,
    remote_revision: RevisionToken,
}

/// Coordinates reconciliation sessions against one transport.
pub struct SyncSession<T> {
    transport: T,
    open: Option<OpenSession>,
    last: Option<SessionPhase>,
}

impl<T: Transport> SyncSession<T> {
    /// A coordinator with no open session.
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            open: None,
            last: None,
        }
    }

    /// The transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport.
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// `Reconciling` while a session is open, else the phase the last
    /// session ended in (`None` before the first session).
    pub const fn phase(&self) -> Option<SessionPhase> {
        if self.open.is_some() {
            Some(SessionPhase::Reconciling)
        } else {
            self.last
        }
    }

    /// Whether a session is open.
    pub const fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Whether the remote has moved past the store's revision.
    ///
    /// # Errors
    /// Propagates transport and parse failures.
    pub fn remote_changed<S>(&mut self, store: &S) -> Result<bool, FlowError>
    where
        S: WorkingStore + ?Sized,
    {
        let remote = self.transport.fetch_remote()?;
        Ok(store.revision_token() != Some(&remote.revision))
    }

    /// Open a session: snapshot the store, fetch the remote, reconcile.
    ///
    /// # Errors
    /// [`FlowError::SessionInProgress`] if a session is already open; any
    /// transport or parse failure (no session is opened then).
    pub fn begin<S>(&mut self, store: &S) -> Result<&ReconciliationResult, FlowError>
    where
        S: WorkingStore + ?Sized,
    {
        if self.open.is_some() {
            return Err(FlowError::SessionInProgress);
        }

        let local = store.current_snapshot();
        let remote = self.transport.fetch_remote()?;
        let result = reconcile_snapshots(store.baseline(), &local, &remote.snapshot)?;

        info!(
            remote_revision = %remote.revision,
            conflicts = result.conflicts.len(),
            "opened reconciliation session"
        );
        let open = self.open.insert(OpenSession {
            result,
            remote_revision: remote.revision,
        });
        Ok(&open.result)
    }

    /// The open reconciliation.
    pub fn result(&self) -> Option<&ReconciliationResult> {
        self.open.as_ref().map(|o| &o.result)
    }

    /// The remote revision the open session was reconciled against.
    pub fn remote_revision(&self) -> Option<&RevisionToken> {
        self.open.as_ref().map(|o| &o.remote_revision)
    }

    /// Choose a side for `id` in the open session.
    ///
    /// # Errors
    /// [`FlowError::NoSession`] or [`FlowError::UnknownRecord`].
    pub fn resolve(&mut self, id: &RecordId, side: Side) -> Result<(), FlowError> {
        let open = self.open.as_mut().ok_or(FlowError::NoSession)?;
        open.result.resolve(id, side)
    }

    /// Abandon the open session. Nothing is written anywhere.
    ///
    /// # Errors
    /// [`FlowError::NoSession`] if no session is open.
    pub fn cancel(&mut self) -> Result<(), FlowError> {
        if self.open.take().is_none() {
            return Err(FlowError::NoSession);
        }
        self.close(SessionPhase::Cancelled);
        Ok(())
    }

    /// Merge, post, and (once acknowledged) apply to `store`.
    ///
    /// # Errors
    /// - [`FlowError::NoSession`] if no session is open.
    /// - [`FlowError::UnresolvedConflicts`]: the session stays open.
    /// - [`FlowError::Parse`] if the store would not accept the merged
    ///   snapshot; checked before posting, and the session stays open.
    /// - [`FlowError::StaleRevision`]: the session closes as `Stale`.
    /// - Transport failures: the session stays open so the post can be retried.
    pub fn commit<S, H>(&mut self, store: &mut S, history: &mut H) -> Result<CommitOutcome, FlowError>
    where
        S: WorkingStore + ?Sized,
        H: History + ?Sized,
    {
        let open = self.open.as_ref().ok_or(FlowError::NoSession)?;
        let merged = commit::merge(&open.result)?;
        store.check(&merged.snapshot)?;

        match self
            .transport
            .post_merged(&merged.snapshot, &open.remote_revision)?
        {
            PostOutcome::Ack(token) => {
                debug!(revision = %token, "post acknowledged");
                let outcome = commit::commit(&open.result, store, history, Some(token))?;
                self.open = None;
                self.close(SessionPhase::Committed);
                Ok(outcome)
            }
            PostOutcome::Conflict(actual) => {
                let expected = open.remote_revision.clone();
                warn!(expected = %expected, actual = %actual, "remote advanced during reconciliation");
                self.open = None;
                self.close(SessionPhase::Stale);
                Err(FlowError::StaleRevision { expected, actual })
            }
        }
    }

    fn close(&mut self, phase: SessionPhase) {
        debug_assert!(SessionPhase::Reconciling.can_transition_to(&phase));
        info!(phase = %phase, "closed reconciliation session");
        self.last = Some(phase);
    }
}

/// Partition, diff and reconcile a (base, local, remote) triple.
///
/// Used by [`SyncSession::begin`] and by callers with no live store.
///
/// # Errors
/// Propagates reconciliation errors.
pub fn reconcile_snapshots(
    base: &Snapshot,
    local: &Snapshot,
    remote: &Snapshot,
) -> Result<ReconciliationResult, FlowError> {
    let base = Arc::new(partition(base));
    reconcile(
        diff(Arc::clone(&base), Arc::new(partition(local))),
        diff(base, Arc::new(partition(remote))),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::history::HistoryLog;
    use crate::registry::TypeRegistry;
    use crate::store::FlowStore;
    use crate::transport::MemoryTransport;

    fn snap(json: &str) -> Snapshot {
        Snapshot::from_json(json).unwrap()
    }

    fn setup() -> (FlowStore, SyncSession<MemoryTransport>) {
        let base = snap(r#"[{"id":"t","type":"tab"},{"id":"y","type":"debug","z":"t"}]"#);
        let remote = MemoryTransport::new(base.clone()).unwrap();
        let (store, _) = FlowStore::load(
            Arc::new(TypeRegistry::new()),
            &base,
            Some(remote.revision().clone()),
        )
        .unwrap();
        (store, SyncSession::new(remote))
    }

    #[test]
    fn phase_transitions() {
        assert!(SessionPhase::Reconciling.can_transition_to(&SessionPhase::Committed));
        assert!(SessionPhase::Reconciling.can_transition_to(&SessionPhase::Stale));
        assert!(!SessionPhase::Committed.can_transition_to(&SessionPhase::Reconciling));
        assert!(!SessionPhase::Stale.can_transition_to(&SessionPhase::Cancelled));
        assert!(SessionPhase::Cancelled.is_terminal());
        assert!(!SessionPhase::Reconciling.is_terminal());
        assert_eq!(SessionPhase::Stale.to_string(), "stale");
    }

    #[test]
    fn second_begin_is_refused() {
        let (store, mut session) = setup();
        session.begin(&store).unwrap();
        assert!(matches!(
            session.begin(&store),
            Err(FlowError::SessionInProgress)
        ));
    }

    #[test]
    fn cancel_has_no_side_effects() {
        let (mut store, mut session) = setup();
        store.set_prop("y", "name", json!("mine"));
        let before = store.current_snapshot();
        session.begin(&store).unwrap();
        session.cancel().unwrap();
        assert_eq!(session.phase(), Some(SessionPhase::Cancelled));
        assert_eq!(store.current_snapshot(), before);
        assert!(matches!(session.cancel(), Err(FlowError::NoSession)));
        assert_eq!(session.transport().accepted_posts(), 0);
    }

    #[test]
    fn commit_posts_then_applies() {
        let (mut store, mut session) = setup();
        store.set_prop("y", "name", json!("mine"));
        session
            .transport_mut()
            .publish(snap(
                r#"[{"id":"t","type":"tab","label":"theirs"},{"id":"y","type":"debug","z":"t"}]"#,
            ))
            .unwrap();
        assert!(session.remote_changed(&store).unwrap());

        session.begin(&store).unwrap();
        let mut history = HistoryLog::default();
        let outcome = session.commit(&mut store, &mut history).unwrap();

        assert_eq!(session.phase(), Some(SessionPhase::Committed));
        assert_eq!(session.transport().snapshot(), &outcome.merge.snapshot);
        assert_eq!(store.revision_token(), Some(session.transport().revision()));
        let now = store.current_snapshot();
        assert_eq!(now.get("t").unwrap().label(), "theirs");
        assert_eq!(now.get("y").unwrap().label(), "mine");
        assert_eq!(history.len(), 1);
        assert!(!session.remote_changed(&store).unwrap());
    }

    #[test]
    fn unresolved_commit_keeps_session_open() {
        let (mut store, mut session) = setup();
        store.remove("y");
        session
            .transport_mut()
            .publish(snap(
                r#"[{"id":"t","type":"tab"},{"id":"y","type":"debug","z":"t","name":"foo"}]"#,
            ))
            .unwrap();
        session.begin(&store).unwrap();
        let mut history = HistoryLog::default();
        assert!(matches!(
            session.commit(&mut store, &mut history),
            Err(FlowError::UnresolvedConflicts { .. })
        ));
        assert!(session.is_open());
        session
            .resolve(&RecordId::new("y").unwrap(), Side::Remote)
            .unwrap();
        session.commit(&mut store, &mut history).unwrap();
        assert_eq!(
            store.current_snapshot().get("y").unwrap().prop("name"),
            Some(&json!("foo"))
        );
    }

    #[test]
    fn stale_post_closes_session_without_touching_store() {
        let (mut store, mut session) = setup();
        store.set_prop("y", "name", json!("mine"));
        let before = store.current_snapshot();
        session.begin(&store).unwrap();
        session
            .transport_mut()
            .publish(snap(r#"[{"id":"t","type":"tab","label":"again"}]"#))
            .unwrap();

        let mut history = HistoryLog::default();
        let err = session.commit(&mut store, &mut history).unwrap_err();
        assert!(matches!(err, FlowError::StaleRevision { .. }));
        assert!(err.is_recoverable());
        assert_eq!(session.phase(), Some(SessionPhase::Stale));
        assert_eq!(store.current_snapshot(), before);
        assert!(history.is_empty());

        // Start over against the fresh remote.
        assert!(session.begin(&store).is_ok());
    }

    #[test]
    fn resolve_without_session_fails() {
        let (_, mut session) = setup();
        assert!(matches!(
            session.resolve(&RecordId::new("y").unwrap(), Side::Local),
            Err(FlowError::NoSession)
        ));
    }
}
