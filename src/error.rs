//! Error types for flowsync.
//!
//! Defines [`FlowError`], the unified error type for snapshot parsing,
//! reconciliation, merge commit, and transport. Messages say what went wrong
//! and, for the recoverable variants, what the caller should do next.
//!
//! Unknown record types are deliberately absent here: they are non-fatal and
//! surface as [`crate::codec::DecodeWarning::UnknownType`] entries instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::types::{RecordId, RevisionToken};

/// Unified error type for flowsync operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A snapshot could not be decoded into valid records.
    #[error("malformed flow snapshot: {detail}")]
    Parse {
        /// What was wrong with the input.
        detail: String,
    },

    /// `merge` was invoked while conflicts still lack a resolution.
    #[error(
        "{} conflict(s) have no resolution: {}\n  To fix: choose `local` or `remote` for each listed record, then retry the merge.",
        .ids.len(),
        join_ids(.ids)
    )]
    UnresolvedConflicts {
        /// Conflicted ids without a resolution, sorted.
        ids: Vec<RecordId>,
    },

    /// The remote revision advanced after this session fetched it.
    #[error(
        "remote flows changed since they were fetched (expected revision {expected}, server has {actual}).\n  To fix: discard this reconciliation and start a new session against the fresh remote flows."
    )]
    StaleRevision {
        /// Revision the commit was made against.
        expected: RevisionToken,
        /// Revision the server reports now.
        actual: RevisionToken,
    },

    /// The two diffs handed to `reconcile` were not computed against the same base.
    #[error("local and remote diffs do not share a base configuration")]
    MismatchedBase,

    /// A resolution names an id the reconciliation does not cover.
    #[error("record '{id}' is not part of this reconciliation")]
    UnknownRecord {
        /// The offending id.
        id: RecordId,
    },

    /// A reconciliation session is already open.
    #[error(
        "a reconciliation session is already in progress.\n  To fix: commit or cancel the open session before starting another."
    )]
    SessionInProgress,

    /// An operation needed an open session and there was none.
    #[error("no reconciliation session is open")]
    NoSession,

    /// The transport failed to fetch or post flows.
    #[error("transport failure: {detail}")]
    Transport {
        /// Transport-level description.
        detail: String,
    },

    /// A configuration file could not be loaded or parsed.
    #[error("config error in {}: {detail}", .path.display())]
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Whether the caller can recover within the same editing session.
    ///
    /// Structural failures (`Parse`, `Config`, `Io`, `Transport`,
    /// `MismatchedBase`) abort the session. The rest are expected
    /// flow-control outcomes with a dedicated retry path.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedConflicts { .. }
                | Self::StaleRevision { .. }
                | Self::UnknownRecord { .. }
                | Self::SessionInProgress
                | Self::NoSession
        )
    }
}

fn join_ids(ids: &[RecordId]) -> String {
    ids.iter()
        .map(RecordId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
