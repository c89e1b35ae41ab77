//! Transport: where the remote flows live.
//!
//! A [`Transport`] fetches the remote snapshot with its revision token and
//! posts a merged snapshot guarded by the token it was reconciled against.
//! A post against a stale token is refused with [`PostOutcome::Conflict`]
//! carrying the server's current token; nothing is written in that case.
//!
//! Two implementations:
//!
//! - [`MemoryTransport`]: an in-process server, used by tests and embedders.
//! - [`FileTransport`]: a flows JSON file on disk. Writes are atomic
//!   (temp file in the same directory, fsync, rename).
//!
//! Revision tokens are content hashes ([`RevisionToken::for_snapshot`]), so
//! any change to the stored flows advances the revision.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::FlowError;
use crate::model::record::Snapshot;
use crate::model::types::RevisionToken;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A fetched remote configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteFlows {
    /// The remote records.
    pub snapshot: Snapshot,
    /// The revision they correspond to.
    pub revision: RevisionToken,
}

/// Server answer to [`Transport::post_merged`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Accepted; the new revision.
    Ack(RevisionToken),
    /// Refused because the remote advanced; the current revision.
    Conflict(RevisionToken),
}

/// Fetches and posts flows.
pub trait Transport {
    /// Fetch the current remote flows.
    ///
    /// # Errors
    /// [`FlowError::Transport`] when the remote is unreachable,
    /// [`FlowError::Parse`] when its content is malformed.
    fn fetch_remote(&mut self) -> Result<RemoteFlows, FlowError>;

    /// Post merged flows, provided the remote is still at `expected`.
    ///
    /// # Errors
    /// [`FlowError::Transport`] when the remote is unreachable or the write
    /// fails. A stale `expected` is not an error: it yields
    /// [`PostOutcome::Conflict`].
    fn post_merged(
        &mut self,
        snapshot: &Snapshot,
        expected: &RevisionToken,
    ) -> Result<PostOutcome, FlowError>;
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// An in-memory remote.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    snapshot: Snapshot,
    revision: RevisionToken,
    posts: usize,
}

impl MemoryTransport {
    /// A remote currently holding `snapshot`.
    ///
    /// # Errors
    /// Only fails if the snapshot cannot be serialized for hashing.
    pub fn new(snapshot: Snapshot) -> Result<Self, FlowError> {
        let revision = RevisionToken::for_snapshot(&snapshot)?;
        Ok(Self {
            snapshot,
            revision,
            posts: 0,
        })
    }

    /// Replace the remote content out-of-band (another client deploying).
    ///
    /// # Errors
    /// Only fails if the snapshot cannot be serialized for hashing.
    pub fn publish(&mut self, snapshot: Snapshot) -> Result<RevisionToken, FlowError> {
        self.revision = RevisionToken::for_snapshot(&snapshot)?;
        self.snapshot = snapshot;
        Ok(self.revision.clone())
    }

    /// The content currently held.
    #[must_use]
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The current revision.
    #[must_use]
    pub const fn revision(&self) -> &RevisionToken {
        &self.revision
    }

    /// Number of accepted posts.
    #[must_use]
    pub const fn accepted_posts(&self) -> usize {
        self.posts
    }
}

impl Transport for MemoryTransport {
    fn fetch_remote(&mut self) -> Result<RemoteFlows, FlowError> {
        Ok(RemoteFlows {
            snapshot: self.snapshot.clone(),
            revision: self.revision.clone(),
        })
    }

    fn post_merged(
        &mut self,
        snapshot: &Snapshot,
        expected: &RevisionToken,
    ) -> Result<PostOutcome, FlowError> {
        if *expected != self.revision {
            warn!(expected = %expected, actual = %self.revision, "rejecting post against stale revision");
            return Ok(PostOutcome::Conflict(self.revision.clone()));
        }
        let revision = self.publish(snapshot.clone())?;
        self.posts += 1;
        Ok(PostOutcome::Ack(revision))
    }
}

// ---------------------------------------------------------------------------
// FileTransport
// ---------------------------------------------------------------------------

/// A flows JSON file acting as the remote.
///
/// A missing file reads as an empty configuration.
#[derive(Clone, Debug)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    /// A transport over the flows file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The flows file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Snapshot, FlowError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Snapshot::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "flows file missing; treating as empty");
                Ok(Snapshot::default())
            }
            Err(e) => Err(FlowError::Transport {
                detail: format!("read {}: {e}", self.path.display()),
            }),
        }
    }

    fn write_atomic(&self, snapshot: &Snapshot) -> Result<(), FlowError> {
        let json = snapshot.to_json_pretty()?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let io_err = |what: &str, e: std::io::Error| FlowError::Transport {
            detail: format!("{what} {}: {e}", self.path.display()),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err("create temp for", e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| io_err("write", e))?;
        tmp.as_file().sync_all().map_err(|e| io_err("fsync", e))?;
        tmp.persist(&self.path)
            .map_err(|e| io_err("rename over", e.error))?;
        Ok(())
    }
}

impl Transport for FileTransport {
    fn fetch_remote(&mut self) -> Result<RemoteFlows, FlowError> {
        let snapshot = self.read()?;
        let revision = RevisionToken::for_snapshot(&snapshot)?;
        debug!(path = %self.path.display(), records = snapshot.len(), revision = %revision, "fetched flows file");
        Ok(RemoteFlows { snapshot, revision })
    }

    fn post_merged(
        &mut self,
        snapshot: &Snapshot,
        expected: &RevisionToken,
    ) -> Result<PostOutcome, FlowError> {
        let current = RevisionToken::for_snapshot(&self.read()?)?;
        if current != *expected {
            warn!(expected = %expected, actual = %current, "flows file changed since fetch");
            return Ok(PostOutcome::Conflict(current));
        }
        self.write_atomic(snapshot)?;
        Ok(PostOutcome::Ack(RevisionToken::for_snapshot(snapshot)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(json: &str) -> Snapshot {
        Snapshot::from_json(json).unwrap()
    }

    #[test]
    fn memory_post_with_current_token_is_acked() {
        let mut remote = MemoryTransport::new(snap(r#"[{"id":"t","type":"tab"}]"#)).unwrap();
        let fetched = remote.fetch_remote().unwrap();
        let merged = snap(r#"[{"id":"t","type":"tab","label":"x"}]"#);
        let outcome = remote.post_merged(&merged, &fetched.revision).unwrap();
        assert_eq!(
            outcome,
            PostOutcome::Ack(RevisionToken::for_snapshot(&merged).unwrap())
        );
        assert_eq!(remote.snapshot(), &merged);
        assert_eq!(remote.accepted_posts(), 1);
    }

    #[test]
    fn memory_post_with_stale_token_conflicts() {
        let mut remote = MemoryTransport::new(Snapshot::default()).unwrap();
        let fetched = remote.fetch_remote().unwrap();
        let advanced = remote.publish(snap(r#"[{"id":"q","type":"debug"}]"#)).unwrap();
        let outcome = remote.post_merged(&Snapshot::default(), &fetched.revision).unwrap();
        assert_eq!(outcome, PostOutcome::Conflict(advanced));
        assert_eq!(remote.snapshot().len(), 1);
        assert_eq!(remote.accepted_posts(), 0);
    }

    #[test]
    fn file_transport_reads_missing_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FileTransport::new(dir.path().join("flows.json"));
        let fetched = t.fetch_remote().unwrap();
        assert!(fetched.snapshot.is_empty());
    }

    #[test]
    fn file_transport_round_trips_and_detects_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.json");
        let mut t = FileTransport::new(&path);
        let empty = t.fetch_remote().unwrap();

        let merged = snap(r#"[{"id":"t","type":"tab"}]"#);
        assert!(matches!(
            t.post_merged(&merged, &empty.revision).unwrap(),
            PostOutcome::Ack(_)
        ));
        assert_eq!(t.fetch_remote().unwrap().snapshot, merged);

        // Stale token: the file now holds `merged`, not the empty config.
        let outcome = t.post_merged(&Snapshot::default(), &empty.revision).unwrap();
        assert!(matches!(outcome, PostOutcome::Conflict(_)));
        assert_eq!(t.fetch_remote().unwrap().snapshot, merged);
    }

    #[test]
    fn file_transport_reports_malformed_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.json");
        fs::write(&path, "{not json").unwrap();
        let err = FileTransport::new(&path).fetch_remote().unwrap_err();
        assert!(matches!(err, FlowError::Parse { .. }));
    }
}
