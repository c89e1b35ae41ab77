//! Three-way flow reconciliation engine.
//!
//! Implements the partition → diff → reconcile → commit pipeline. Each phase
//! is a separate module:
//!
//! - **partition**: Index a flat [`Snapshot`](crate::model::Snapshot) by id,
//!   container, and template ([`partition::ParsedConfiguration`]).
//! - **diff**: Compare two indexes into added/deleted/changed/moved id sets
//!   ([`diff::DiffResult`]). Run twice: base → local and base → remote.
//! - **reconcile**: Combine the two diffs into conflicts and default
//!   resolutions ([`reconcile::ReconciliationResult`]).
//! - **commit**: Once every conflict has a resolution, build the merged
//!   snapshot and apply it to the working store in one step.
//!
//! [`view`] projects a reconciliation into the sectioned row model a diff UI
//! renders.
//!
//! # Determinism guarantee
//!
//! The same (base, local, remote) triple always produces the same conflicts,
//! resolutions, and merged snapshot:
//!
//! - Id sets and maps are ordered (`BTreeSet`/`BTreeMap`).
//! - Record equality is structural; property order never matters and array
//!   order always does.
//! - Output order follows declaration order, never hash order.

pub mod commit;
pub mod diff;
pub mod partition;
pub mod reconcile;
pub mod view;

pub use commit::{CommitOutcome, MergeOutcome, commit, merge};
pub use diff::{ChangeKind, DiffResult, diff};
pub use partition::{ParsedConfiguration, partition};
pub use reconcile::{ConflictKind, ReconciliationResult, reconcile};
pub use view::{DiffView, property_diff};
