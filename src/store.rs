//! The working store: live records, materialized connections, and the
//! baseline/revision bookkeeping a reconciliation session needs.
//!
//! [`WorkingStore`] is the seam the merge committer and session coordinator
//! talk to. [`FlowStore`] is the in-memory implementation: one store per
//! editor session, owning its [`TypeRegistry`] rather than reaching for any
//! process-wide state.
//!
//! Live records keep their outbound connections as separate [`Link`]s (the
//! way an editor canvas holds them); the codec collapses links back into
//! `wires` when a snapshot is taken.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::codec::{self, DecodeOptions, DecodeReport};
use crate::error::FlowError;
use crate::model::record::Snapshot;
use crate::model::types::{RecordId, RevisionToken};
use crate::registry::{RecordKind, TypeRegistry};

// ---------------------------------------------------------------------------
// NodeFlags
// ---------------------------------------------------------------------------

/// Editor-side state flags of one live record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeFlags {
    /// Needs redrawing.
    pub dirty: bool,
    /// Diverges from what was last known-deployed.
    pub changed: bool,
    /// Passes its type's property schema.
    pub valid: bool,
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self {
            dirty: false,
            changed: false,
            valid: true,
        }
    }
}

impl NodeFlags {
    /// Flags for a record freshly applied from the remote side.
    #[must_use]
    pub const fn applied(valid: bool) -> Self {
        Self {
            dirty: true,
            changed: true,
            valid,
        }
    }
}

// ---------------------------------------------------------------------------
// LiveRecord / Link
// ---------------------------------------------------------------------------

/// A record as held by the editor.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveRecord {
    /// Record id.
    pub id: RecordId,
    /// Original type name (kept verbatim for unknown types).
    pub type_name: String,
    /// Classification at the time the record was materialized.
    pub kind: RecordKind,
    /// Owning container/template.
    pub z: Option<RecordId>,
    /// Property bag (includes `x`/`y`).
    pub props: Map<String, Value>,
    /// Output port count; encoded as the number of wire groups.
    pub outputs: usize,
    /// Whether the record carries a `wires` field at all.
    pub wired: bool,
    /// Editor flags.
    pub flags: NodeFlags,
}

/// One materialized connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Link {
    /// Source record.
    pub source: RecordId,
    /// Source output port.
    pub source_port: usize,
    /// Target record.
    pub target: RecordId,
    /// Target input port.
    pub target_port: u32,
}

// ---------------------------------------------------------------------------
// WorkingStore
// ---------------------------------------------------------------------------

/// What the reconciliation core needs from the live store.
pub trait WorkingStore {
    /// Encode the live state into a snapshot.
    fn current_snapshot(&self) -> Snapshot;

    /// Replace all content with `snapshot`, preserving ids.
    ///
    /// Ids in `changed` get freshly applied flags; other ids that existed
    /// before keep their previous flags. Either the whole replacement happens
    /// or the store is left untouched.
    ///
    /// # Errors
    /// Returns [`FlowError::Parse`] if the snapshot cannot be materialized.
    fn replace(
        &mut self,
        snapshot: &Snapshot,
        changed: &BTreeSet<RecordId>,
    ) -> Result<DecodeReport, FlowError>;

    /// Check that `snapshot` would be accepted by [`WorkingStore::replace`]
    /// without touching the store.
    ///
    /// # Errors
    /// Same conditions as [`WorkingStore::replace`].
    fn check(&self, snapshot: &Snapshot) -> Result<DecodeReport, FlowError>;

    /// The snapshot last known to match the server (the reconciliation base).
    fn baseline(&self) -> &Snapshot;

    /// Record a new reconciliation base.
    fn set_baseline(&mut self, snapshot: Snapshot);

    /// The server revision the baseline corresponds to.
    fn revision_token(&self) -> Option<&RevisionToken>;

    /// Record the server revision.
    fn set_revision_token(&mut self, token: Option<RevisionToken>);

    /// Current flags of every live record.
    fn flags(&self) -> BTreeMap<RecordId, NodeFlags>;

    /// Overwrite flags for the listed ids (ids not present are ignored).
    fn restore_flags(&mut self, flags: &BTreeMap<RecordId, NodeFlags>);
}

// ---------------------------------------------------------------------------
// FlowStore
// ---------------------------------------------------------------------------

/// In-memory working store.
///
/// Records are kept in four declaration-ordered lists, matching the order
/// the codec emits them in: containers, templates, config-style records,
/// then canvas nodes.
#[derive(Clone, Debug)]
pub struct FlowStore {
    registry: Arc<TypeRegistry>,
    containers: Vec<LiveRecord>,
    templates: Vec<LiveRecord>,
    configs: Vec<LiveRecord>,
    nodes: Vec<LiveRecord>,
    links: Vec<Link>,
    baseline: Snapshot,
    revision: Option<RevisionToken>,
    strict_refs: bool,
}

impl FlowStore {
    /// An empty store using `registry` for classification and validation.
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            containers: Vec::new(),
            templates: Vec::new(),
            configs: Vec::new(),
            nodes: Vec::new(),
            links: Vec::new(),
            baseline: Snapshot::default(),
            revision: None,
            strict_refs: false,
        }
    }

    /// Fail replacements that reference missing ids instead of dropping them.
    #[must_use]
    pub const fn with_strict_refs(mut self, strict: bool) -> Self {
        self.strict_refs = strict;
        self
    }

    /// Load `snapshot` as both the live content and the baseline.
    ///
    /// # Errors
    /// Returns [`FlowError::Parse`] if the snapshot cannot be materialized.
    pub fn load(
        registry: Arc<TypeRegistry>,
        snapshot: &Snapshot,
        revision: Option<RevisionToken>,
    ) -> Result<(Self, DecodeReport), FlowError> {
        let mut store = Self::new(registry);
        let report = codec::decode(snapshot, &mut store, DecodeOptions::preserve_ids())?;
        store.baseline = snapshot.clone();
        store.revision = revision;
        Ok((store, report))
    }

    /// The registry this store classifies records with.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Shared handle to the registry.
    #[must_use]
    pub fn registry_handle(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.registry)
    }

    /// Whether dangling references fail decoding.
    #[must_use]
    pub const fn strict_refs(&self) -> bool {
        self.strict_refs
    }

    /// All live records in encode order.
    pub fn records(&self) -> impl Iterator<Item = &LiveRecord> {
        self.containers
            .iter()
            .chain(&self.templates)
            .chain(&self.configs)
            .chain(&self.nodes)
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut LiveRecord> {
        self.containers
            .iter_mut()
            .chain(&mut self.templates)
            .chain(&mut self.configs)
            .chain(&mut self.nodes)
    }

    /// Containers in declaration order.
    #[must_use]
    pub fn containers(&self) -> &[LiveRecord] {
        &self.containers
    }

    /// Templates in declaration order.
    #[must_use]
    pub fn templates(&self) -> &[LiveRecord] {
        &self.templates
    }

    /// Config-style records in declaration order.
    #[must_use]
    pub fn configs(&self) -> &[LiveRecord] {
        &self.configs
    }

    /// Canvas nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[LiveRecord] {
        &self.nodes
    }

    /// Connections in the order they were established.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.len() + self.templates.len() + self.configs.len() + self.nodes.len()
    }

    /// Returns `true` if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LiveRecord> {
        self.records().find(|r| r.id.as_str() == id)
    }

    /// Whether a live record with this id exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Records kept as unrecognized passthrough.
    pub fn unknown_records(&self) -> impl Iterator<Item = &LiveRecord> {
        self.records().filter(|r| r.kind == RecordKind::Unknown)
    }

    /// Insert a live record into the list its kind belongs to.
    ///
    /// Unknown records with a canvas position are treated as nodes, the rest
    /// as config-style records.
    pub fn insert(&mut self, record: LiveRecord) {
        let list = match record.kind {
            RecordKind::Container => &mut self.containers,
            RecordKind::Template => &mut self.templates,
            RecordKind::Config => &mut self.configs,
            RecordKind::Unknown if !record.props.contains_key("x") => &mut self.configs,
            RecordKind::Leaf | RecordKind::TemplateInstance { .. } | RecordKind::Unknown => {
                &mut self.nodes
            }
        };
        list.push(record);
    }

    /// Establish a connection. The source grows enough output ports to hold it.
    ///
    /// Returns `false` (and does nothing) if either end is missing.
    pub fn connect(&mut self, link: Link) -> bool {
        if !self.contains(link.target.as_str()) {
            return false;
        }
        let Some(source) = self.records_mut().find(|r| r.id == link.source) else {
            return false;
        };
        source.outputs = source.outputs.max(link.source_port + 1);
        source.wired = true;
        self.links.push(link);
        true
    }

    /// Set a property on a live record as an interactive edit.
    ///
    /// Returns `false` if the record does not exist.
    pub fn set_prop(&mut self, id: &str, key: &str, value: Value) -> bool {
        let Some(record) = self.records_mut().find(|r| r.id.as_str() == id) else {
            return false;
        };
        record.props.insert(key.to_owned(), value);
        record.flags.dirty = true;
        record.flags.changed = true;
        true
    }

    /// Remove a record and every connection touching it.
    ///
    /// Returns the removed record, if it existed.
    pub fn remove(&mut self, id: &str) -> Option<LiveRecord> {
        let mut removed = None;
        for list in [
            &mut self.containers,
            &mut self.templates,
            &mut self.configs,
            &mut self.nodes,
        ] {
            if let Some(pos) = list.iter().position(|r| r.id.as_str() == id) {
                removed = Some(list.remove(pos));
                break;
            }
        }
        if removed.is_some() {
            self.links
                .retain(|l| l.source.as_str() != id && l.target.as_str() != id);
        }
        removed
    }

    /// Drop all records and connections. Baseline and revision are kept.
    pub fn clear(&mut self) {
        self.containers.clear();
        self.templates.clear();
        self.configs.clear();
        self.nodes.clear();
        self.links.clear();
    }

    /// Decode `snapshot` into a fresh store sharing this store's registry.
    fn materialize(&self, snapshot: &Snapshot) -> Result<(Self, DecodeReport), FlowError> {
        let mut fresh = Self::new(Arc::clone(&self.registry)).with_strict_refs(self.strict_refs);
        let options = DecodeOptions::preserve_ids().drop_dangling(!self.strict_refs);
        let report = codec::decode(snapshot, &mut fresh, options)?;
        Ok((fresh, report))
    }

    /// Move another store's content (records and links) into this one.
    fn take_content(&mut self, other: Self) {
        self.containers = other.containers;
        self.templates = other.templates;
        self.configs = other.configs;
        self.nodes = other.nodes;
        self.links = other.links;
    }
}

impl WorkingStore for FlowStore {
    fn current_snapshot(&self) -> Snapshot {
        codec::encode(self)
    }

    fn replace(
        &mut self,
        snapshot: &Snapshot,
        changed: &BTreeSet<RecordId>,
    ) -> Result<DecodeReport, FlowError> {
        let previous = self.flags();
        let (mut fresh, report) = self.materialize(snapshot)?;

        for record in fresh.records_mut() {
            let valid = record.flags.valid;
            record.flags = if changed.contains(&record.id) {
                NodeFlags::applied(valid)
            } else if let Some(prior) = previous.get(&record.id) {
                NodeFlags { valid, ..*prior }
            } else {
                NodeFlags {
                    valid,
                    ..NodeFlags::default()
                }
            };
        }

        self.take_content(fresh);
        Ok(report)
    }

    fn check(&self, snapshot: &Snapshot) -> Result<DecodeReport, FlowError> {
        self.materialize(snapshot).map(|(_, report)| report)
    }

    fn baseline(&self) -> &Snapshot {
        &self.baseline
    }

    fn set_baseline(&mut self, snapshot: Snapshot) {
        self.baseline = snapshot;
    }

    fn revision_token(&self) -> Option<&RevisionToken> {
        self.revision.as_ref()
    }

    fn set_revision_token(&mut self, token: Option<RevisionToken>) {
        self.revision = token;
    }

    fn flags(&self) -> BTreeMap<RecordId, NodeFlags> {
        self.records().map(|r| (r.id.clone(), r.flags)).collect()
    }

    fn restore_flags(&mut self, flags: &BTreeMap<RecordId, NodeFlags>) {
        for record in self.records_mut() {
            if let Some(f) = flags.get(&record.id) {
                record.flags = *f;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::TypeSchema;

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::new().with(TypeSchema::node("function", 1)))
    }

    fn loaded() -> FlowStore {
        let snap = Snapshot::from_json(
            r#"[
              {"id":"t1","type":"tab","label":"Flow 1"},
              {"id":"a","type":"function","z":"t1","x":10,"y":10,"wires":[["b"]]},
              {"id":"b","type":"function","z":"t1","x":90,"y":10,"wires":[[]]}
            ]"#,
        )
        .unwrap();
        FlowStore::load(registry(), &snap, None).unwrap().0
    }

    #[test]
    fn load_sets_baseline_and_links() {
        let store = loaded();
        assert_eq!(store.len(), 3);
        assert_eq!(store.links().len(), 1);
        assert_eq!(store.baseline().len(), 3);
        assert_eq!(store.containers()[0].id, id("t1"));
    }

    #[test]
    fn set_prop_marks_changed() {
        let mut store = loaded();
        assert!(store.set_prop("a", "name", json!("renamed")));
        let flags = store.get("a").unwrap().flags;
        assert!(flags.changed && flags.dirty);
        assert!(!store.set_prop("missing", "name", json!("x")));
    }

    #[test]
    fn remove_drops_links_touching_record() {
        let mut store = loaded();
        assert!(store.remove("b").is_some());
        assert!(store.links().is_empty());
        assert!(store.remove("b").is_none());
    }

    #[test]
    fn connect_grows_outputs_and_requires_both_ends() {
        let mut store = loaded();
        assert!(store.connect(Link {
            source: id("b"),
            source_port: 2,
            target: id("a"),
            target_port: 0,
        }));
        assert_eq!(store.get("b").unwrap().outputs, 3);
        assert!(!store.connect(Link {
            source: id("b"),
            source_port: 0,
            target: id("ghost"),
            target_port: 0,
        }));
    }

    #[test]
    fn replace_carries_flags_and_marks_changed_ids() {
        let mut store = loaded();
        store.set_prop("a", "name", json!("local edit"));
        let next = Snapshot::from_json(
            r#"[
              {"id":"t1","type":"tab","label":"Flow 1"},
              {"id":"a","type":"function","z":"t1","x":10,"y":10,"name":"local edit","wires":[["b"]]},
              {"id":"b","type":"function","z":"t1","x":95,"y":10,"wires":[[]]},
              {"id":"c","type":"function","z":"t1","x":5,"y":50,"wires":[[]]}
            ]"#,
        )
        .unwrap();
        let changed: BTreeSet<_> = [id("b"), id("c")].into_iter().collect();
        store.replace(&next, &changed).unwrap();

        assert!(store.get("a").unwrap().flags.changed);
        assert!(store.get("b").unwrap().flags.changed);
        assert!(store.get("c").unwrap().flags.dirty);
        assert!(!store.get("t1").unwrap().flags.changed);
        assert_eq!(store.current_snapshot(), next);
    }

    #[test]
    fn failed_replace_leaves_store_untouched() {
        let mut store = loaded().with_strict_refs(true);
        let before = store.current_snapshot();
        let bad = Snapshot::from_json(
            r#"[{"id":"x","type":"function","x":1,"y":1,"wires":[["nowhere"]]}]"#,
        )
        .unwrap();
        assert!(store.replace(&bad, &BTreeSet::new()).is_err());
        assert_eq!(store.current_snapshot(), before);
    }

    #[test]
    fn unknown_records_are_listed() {
        let snap = Snapshot::from_json(
            r#"[{"id":"t1","type":"tab"},{"id":"u","type":"mystery","z":"t1","x":1,"y":2,"foo":[1,2]}]"#,
        )
        .unwrap();
        let (store, report) = FlowStore::load(registry(), &snap, None).unwrap();
        assert_eq!(store.unknown_records().count(), 1);
        assert_eq!(report.unknown_types(), vec!["mystery"]);
        assert_eq!(store.current_snapshot(), snap);
    }
}
