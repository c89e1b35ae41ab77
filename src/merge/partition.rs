//! PARTITION step of the reconciliation pipeline.
//!
//! Builds a navigable, read-only index ([`ParsedConfiguration`]) over a flat
//! [`Snapshot`] in two passes:
//!
//! 1. Register every container and template, in declaration order.
//! 2. Assign every remaining record to a bucket by its `z`.
//!
//! ```text
//! [tab t1] [subflow s1] [inject a z=t1] [debug b z=s1] [broker c] [x z=gone]
//!
//! containers: t1 → [a]
//! templates:  s1 → [b]
//! globals:    [c, x]        orphans: {x}
//! ```
//!
//! The partition is total and disjoint: every id is either a group key or in
//! exactly one of the member lists / `globals`. A record whose `z` names no
//! container or template lands in `globals` and is listed in `orphans`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::model::record::{Record, Snapshot};
use crate::model::types::RecordId;

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// Where a record sits in a [`ParsedConfiguration`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket<'a> {
    /// The record is a container.
    Container,
    /// The record is a template.
    Template,
    /// Member of the named container.
    InContainer(&'a RecordId),
    /// Member of the named template.
    InTemplate(&'a RecordId),
    /// Global scope (including orphans).
    Global,
}

// ---------------------------------------------------------------------------
// ParsedConfiguration
// ---------------------------------------------------------------------------

/// Indexed view over one snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedConfiguration {
    /// Identity map of every record.
    pub all: BTreeMap<RecordId, Record>,
    /// Every id in snapshot order.
    pub order: Vec<RecordId>,
    /// Container ids in declaration order.
    pub container_order: Vec<RecordId>,
    /// Container id → member ids in snapshot order.
    pub containers: BTreeMap<RecordId, Vec<RecordId>>,
    /// Template ids in declaration order.
    pub template_order: Vec<RecordId>,
    /// Template id → member ids in snapshot order.
    pub templates: BTreeMap<RecordId, Vec<RecordId>>,
    /// Records in global scope, in snapshot order.
    pub globals: Vec<RecordId>,
    /// Global records whose `z` named a missing container/template.
    pub orphans: BTreeSet<RecordId>,
}

impl ParsedConfiguration {
    /// Look up a record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.all.get(id)
    }

    /// Whether the configuration holds this id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.all.contains_key(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Returns `true` if the configuration is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Whether `id` is a container or template key.
    #[must_use]
    pub fn is_group(&self, id: &str) -> bool {
        self.containers.contains_key(id) || self.templates.contains_key(id)
    }

    /// Member ids of a container or template.
    #[must_use]
    pub fn members(&self, group: &str) -> &[RecordId] {
        self.containers
            .get(group)
            .or_else(|| self.templates.get(group))
            .map_or(&[], Vec::as_slice)
    }

    /// Records in snapshot order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.order.iter().filter_map(|id| self.all.get(id))
    }

    /// Rebuild the snapshot this configuration was parsed from.
    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        self.records().cloned().collect()
    }

    /// Locate `id`.
    #[must_use]
    pub fn bucket_of(&self, id: &str) -> Option<Bucket<'_>> {
        if self.containers.contains_key(id) {
            return Some(Bucket::Container);
        }
        if self.templates.contains_key(id) {
            return Some(Bucket::Template);
        }
        let record = self.all.get(id)?;
        let Some(z) = record.z.as_ref().filter(|_| !self.orphans.contains(id)) else {
            return Some(Bucket::Global);
        };
        if let Some((key, _)) = self.containers.get_key_value(z) {
            Some(Bucket::InContainer(key))
        } else if let Some((key, _)) = self.templates.get_key_value(z) {
            Some(Bucket::InTemplate(key))
        } else {
            Some(Bucket::Global)
        }
    }
}

// ---------------------------------------------------------------------------
// partition
// ---------------------------------------------------------------------------

/// Index a snapshot.
///
/// Snapshots are id-unique by construction ([`Snapshot::from_json`] rejects
/// duplicates); should a hand-built one repeat an id, the first record wins.
#[must_use]
pub fn partition(snapshot: &Snapshot) -> ParsedConfiguration {
    let mut parsed = ParsedConfiguration::default();

    // Pass 1: identity map and groups.
    for record in snapshot {
        if parsed.all.contains_key(&record.id) {
            warn!(id = %record.id, "duplicate record id; keeping the first occurrence");
            continue;
        }
        parsed.order.push(record.id.clone());
        parsed.all.insert(record.id.clone(), record.clone());
        if record.is_container() {
            parsed.container_order.push(record.id.clone());
            parsed.containers.insert(record.id.clone(), Vec::new());
        } else if record.is_template() {
            parsed.template_order.push(record.id.clone());
            parsed.templates.insert(record.id.clone(), Vec::new());
        }
    }

    // Pass 2: members.
    for id in &parsed.order {
        let Some(record) = parsed.all.get(id) else {
            continue;
        };
        if record.is_container() || record.is_template() {
            continue;
        }
        match &record.z {
            None => parsed.globals.push(id.clone()),
            Some(z) => {
                if let Some(members) = parsed.containers.get_mut(z) {
                    members.push(id.clone());
                } else if let Some(members) = parsed.templates.get_mut(z) {
                    members.push(id.clone());
                } else {
                    warn!(id = %id, z = %z, "record scoped to a missing container; treating as global");
                    parsed.globals.push(id.clone());
                    parsed.orphans.insert(id.clone());
                }
            }
        }
    }

    debug!(
        records = parsed.all.len(),
        containers = parsed.container_order.len(),
        templates = parsed.template_order.len(),
        globals = parsed.globals.len(),
        orphans = parsed.orphans.len(),
        "partitioned snapshot"
    );
    parsed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
