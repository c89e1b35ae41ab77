//! Flow snapshot data model: identifiers, records, and canonical forms.

pub mod canonical;
pub mod record;
pub mod types;

pub use record::{Record, Snapshot, WireRef};
pub use types::{RecordId, RevisionToken, Side};
