//! Snapshot codec: live store ⇄ flat record list.
//!
//! - [`encode`] walks the store (containers, templates, config-style records,
//!   then canvas nodes) and collapses each record's live connections back
//!   into its `wires` field, one group per output port, each group in the
//!   order its connections were established.
//! - [`decode`] rebuilds live records and connections from a [`Snapshot`].
//!   With ids preserved (the merge-commit path), references to ids that
//!   exist nowhere are dropped with a warning instead of failing the decode.
//!   With fresh ids (import), every id is replaced and every reference to it
//!   rewritten.
//!
//! Decoding is all-or-nothing: every record and link is built and checked
//! before the store is touched.
//!
//! Round trip: `decode(encode(s))` into an empty store re-encodes to a
//! snapshot equal to `encode(s)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::FlowError;
use crate::model::record::{Record, Snapshot, TEMPLATE_INSTANCE_PREFIX, WireRef};
use crate::model::types::RecordId;
use crate::registry::RecordKind;
use crate::store::{FlowStore, LiveRecord, Link, NodeFlags};

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

/// How [`decode`] treats ids and dangling references.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Replace every id with a fresh random one.
    pub assign_new_ids: bool,
    /// Drop references to missing ids (with a warning) instead of failing.
    pub drop_dangling: bool,
}

impl DecodeOptions {
    /// Keep ids as-is; drop dangling references.
    #[must_use]
    pub const fn preserve_ids() -> Self {
        Self {
            assign_new_ids: false,
            drop_dangling: true,
        }
    }

    /// Assign fresh ids; drop dangling references.
    #[must_use]
    pub const fn fresh_ids() -> Self {
        Self {
            assign_new_ids: true,
            drop_dangling: true,
        }
    }

    /// Set whether dangling references are dropped or rejected.
    #[must_use]
    pub const fn drop_dangling(mut self, drop: bool) -> Self {
        self.drop_dangling = drop;
        self
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::preserve_ids()
    }
}

/// A non-fatal observation made while decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeWarning {
    /// The record's type is not registered; it was kept verbatim.
    UnknownType {
        /// Record id (after any remapping).
        id: RecordId,
        /// The unrecognized type name.
        type_name: String,
    },
    /// A wire pointed at a record that does not exist; it was dropped.
    DanglingWire {
        /// Wire source.
        source: RecordId,
        /// Missing target.
        target: RecordId,
    },
    /// A `z` pointed at a record that does not exist; the record became global.
    DanglingScope {
        /// Record id.
        id: RecordId,
        /// Missing container/template id.
        z: RecordId,
    },
    /// Declared properties are missing or fail validation; the record was
    /// kept and flagged invalid.
    InvalidProperties {
        /// Record id.
        id: RecordId,
        /// Offending property names.
        properties: Vec<String>,
    },
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { id, type_name } => {
                write!(f, "{id}: unknown type '{type_name}' kept as passthrough")
            }
            Self::DanglingWire { source, target } => {
                write!(f, "{source}: dropped wire to missing record {target}")
            }
            Self::DanglingScope { id, z } => {
                write!(f, "{id}: container {z} is missing; record moved to global scope")
            }
            Self::InvalidProperties { id, properties } => {
                write!(f, "{id}: invalid properties {}", properties.join(", "))
            }
        }
    }
}

/// What [`decode`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Number of records materialized.
    pub decoded: usize,
    /// Number of connections materialized.
    pub links: usize,
    /// Old id → new id, populated only when fresh ids were assigned.
    pub id_map: BTreeMap<RecordId, RecordId>,
    /// Non-fatal observations, in decode order.
    pub warnings: Vec<DecodeWarning>,
}

impl DecodeReport {
    /// Type names that were kept as unknown passthrough.
    #[must_use]
    pub fn unknown_types(&self) -> Vec<&str> {
        self.warnings
            .iter()
            .filter_map(|w| match w {
                DecodeWarning::UnknownType { type_name, .. } => Some(type_name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of dropped dangling references (wires and scopes).
    #[must_use]
    pub fn dropped_refs(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| {
                matches!(
                    w,
                    DecodeWarning::DanglingWire { .. } | DecodeWarning::DanglingScope { .. }
                )
            })
            .count()
    }
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

/// Encode the live store as a snapshot.
#[must_use]
pub fn encode(store: &FlowStore) -> Snapshot {
    let mut groups: BTreeMap<&RecordId, Vec<Vec<WireRef>>> = BTreeMap::new();
    for record in store.records().filter(|r| r.wired) {
        groups.insert(&record.id, vec![Vec::new(); record.outputs]);
    }
    for link in store.links() {
        if let Some(ports) = groups.get_mut(&link.source)
            && let Some(group) = ports.get_mut(link.source_port)
        {
            group.push(WireRef {
                id: link.target.clone(),
                port: link.target_port,
            });
        }
    }

    store
        .records()
        .map(|live| Record {
            id: live.id.clone(),
            type_name: live.type_name.clone(),
            z: live.z.clone(),
            wires: groups.remove(&live.id),
            props: live.props.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// Materialize `snapshot` into `store`.
///
/// References may point at records in the snapshot or already in the store.
///
/// # Errors
/// Returns [`FlowError::Parse`] if a preserved id already exists in the
/// store, or if a reference is dangling and `drop_dangling` is off. The store
/// is untouched on error.
pub fn decode(
    snapshot: &Snapshot,
    store: &mut FlowStore,
    options: DecodeOptions,
) -> Result<DecodeReport, FlowError> {
    let mut report = DecodeReport::default();

    let id_map = if options.assign_new_ids {
        fresh_id_map(snapshot, store)?
    } else {
        for record in snapshot {
            if store.contains(record.id.as_str()) {
                return Err(FlowError::Parse {
                    detail: format!("record '{}' already exists in the working store", record.id),
                });
            }
        }
        BTreeMap::new()
    };
    let remap = |id: &RecordId| id_map.get(id).cloned().unwrap_or_else(|| id.clone());

    let known: BTreeSet<RecordId> = snapshot
        .ids()
        .map(&remap)
        .chain(store.records().map(|r| r.id.clone()))
        .collect();

    let registry = store.registry_handle();
    let mut pending: Vec<LiveRecord> = Vec::with_capacity(snapshot.len());
    let mut links: Vec<Link> = Vec::new();

    for record in snapshot {
        let id = remap(&record.id);
        let type_name = remap_instance_type(&record.type_name, &id_map);
        let mut props = record.props.clone();
        if options.assign_new_ids && record.is_template() {
            remap_template_ports(&mut props, &id_map);
        }

        let z = match record.z.as_ref().map(&remap) {
            Some(z) if !known.contains(&z) => {
                if !options.drop_dangling {
                    return Err(FlowError::Parse {
                        detail: format!("record '{id}' is scoped to missing record '{z}'"),
                    });
                }
                warn!(id = %id, z = %z, "dropping dangling scope reference");
                report
                    .warnings
                    .push(DecodeWarning::DanglingScope { id: id.clone(), z });
                None
            }
            other => other,
        };

        let kind = registry.kind_of(&type_name);
        if kind == RecordKind::Unknown {
            warn!(id = %id, type_name = %type_name, "keeping record of unknown type verbatim");
            report.warnings.push(DecodeWarning::UnknownType {
                id: id.clone(),
                type_name: type_name.clone(),
            });
        }

        let invalid = registry.invalid_properties(record);
        if !invalid.is_empty() {
            debug!(id = %id, properties = ?invalid, "record fails its type schema");
            report.warnings.push(DecodeWarning::InvalidProperties {
                id: id.clone(),
                properties: invalid.clone(),
            });
        }

        let outputs = record.wires.as_ref().map_or(0, Vec::len);
        for (port, group) in record.wires.iter().flatten().enumerate() {
            for wire in group {
                let target = remap(&wire.id);
                if !known.contains(&target) {
                    if !options.drop_dangling {
                        return Err(FlowError::Parse {
                            detail: format!("record '{id}' is wired to missing record '{target}'"),
                        });
                    }
                    warn!(source = %id, target = %target, "dropping dangling wire");
                    report.warnings.push(DecodeWarning::DanglingWire {
                        source: id.clone(),
                        target,
                    });
                    continue;
                }
                links.push(Link {
                    source: id.clone(),
                    source_port: port,
                    target,
                    target_port: wire.port,
                });
            }
        }

        pending.push(LiveRecord {
            id,
            type_name,
            kind,
            z,
            props,
            outputs,
            wired: record.wires.is_some(),
            flags: NodeFlags {
                valid: invalid.is_empty(),
                ..NodeFlags::default()
            },
        });
    }

    report.decoded = pending.len();
    for live in pending {
        store.insert(live);
    }
    for link in links {
        if store.connect(link) {
            report.links += 1;
        }
    }
    report.id_map = id_map;

    debug!(
        records = report.decoded,
        links = report.links,
        warnings = report.warnings.len(),
        "decoded snapshot"
    );
    Ok(report)
}

/// Allocate a fresh, unused 16-hex-digit id for every record in `snapshot`.
fn fresh_id_map(
    snapshot: &Snapshot,
    store: &FlowStore,
) -> Result<BTreeMap<RecordId, RecordId>, FlowError> {
    let mut rng = rand::rng();
    let mut taken: BTreeSet<String> = store.records().map(|r| r.id.to_string()).collect();
    taken.extend(snapshot.ids().map(ToString::to_string));

    let mut map = BTreeMap::new();
    for old in snapshot.ids() {
        let fresh = loop {
            let candidate = format!("{:016x}", rng.random::<u64>());
            if taken.insert(candidate.clone()) {
                break candidate;
            }
        };
        let fresh = RecordId::new(&fresh).map_err(|e| FlowError::Parse {
            detail: e.to_string(),
        })?;
        map.insert(old.clone(), fresh);
    }
    Ok(map)
}

/// `subflow:<old>` → `subflow:<new>` when the template was remapped.
fn remap_instance_type(type_name: &str, id_map: &BTreeMap<RecordId, RecordId>) -> String {
    type_name
        .strip_prefix(TEMPLATE_INSTANCE_PREFIX)
        .and_then(|template| id_map.get(template))
        .map_or_else(
            || type_name.to_owned(),
            |fresh| format!("{TEMPLATE_INSTANCE_PREFIX}{fresh}"),
        )
}

/// Rewrite ids inside a template's `in`/`out` port wiring.
fn remap_template_ports(props: &mut Map<String, Value>, id_map: &BTreeMap<RecordId, RecordId>) {
    for key in ["in", "out"] {
        let Some(Value::Array(ports)) = props.get_mut(key) else {
            continue;
        };
        for port in ports {
            let Some(Value::Array(wires)) = port.get_mut("wires") else {
                continue;
            };
            for wire in wires {
                if let Some(Value::String(target)) = wire.get_mut("id")
                    && let Some(fresh) = id_map.get(target.as_str())
                {
                    *target = fresh.to_string();
                }
            }
        }
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
    use crate::registry::{TypeRegistry, TypeSchema, Validator};

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new()
                .with(TypeSchema::node("inject", 1))
                .with(TypeSchema::node("switch", 2))
                .with(TypeSchema::node("debug", 0))
                .with(
                    TypeSchema::config("mqtt-broker").with_property(
                        "broker",
                        true,
                        Validator::NonEmpty,
                    ),
                ),
        )
    }

    fn sample() -> Snapshot {
        Snapshot::from_json(
            r#"[
              {"id":"t1","type":"tab","label":"Flow 1"},
              {"id":"sf","type":"subflow","name":"Sub","in":[{"x":10,"y":10,"wires":[{"id":"sn"}]}],"out":[]},
              {"id":"b1","type":"mqtt-broker","broker":"localhost"},
              {"id":"sn","type":"debug","z":"sf","x":50,"y":50},
              {"id":"i1","type":"inject","z":"t1","x":10,"y":10,"wires":[["s1"]]},
              {"id":"s1","type":"switch","z":"t1","x":80,"y":10,"wires":[["d1",{"id":"inst","port":0}],["d1"]]},
              {"id":"inst","type":"subflow:sf","z":"t1","x":140,"y":40,"wires":[]},
              {"id":"d1","type":"debug","z":"t1","x":200,"y":10}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn round_trip_reproduces_snapshot() {
        let snap = sample();
        let mut store = FlowStore::new(registry());
        let report = decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        assert_eq!(report.decoded, 8);
        assert_eq!(report.links, 4);
        assert!(report.warnings.is_empty());
        assert_eq!(encode(&store), snap);
    }

    #[test]
    fn encode_orders_containers_templates_configs_nodes() {
        let snap = Snapshot::from_json(
            r#"[
              {"id":"n","type":"inject","z":"t","x":1,"y":1,"wires":[[]]},
              {"id":"c","type":"mqtt-broker","broker":"b"},
              {"id":"s","type":"subflow"},
              {"id":"t","type":"tab"}
            ]"#,
        )
        .unwrap();
        let mut store = FlowStore::new(registry());
        decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        let ids: Vec<_> = encode(&store).ids().map(ToString::to_string).collect();
        assert_eq!(ids, ["t", "s", "c", "n"]);
    }

    #[test]
    fn dangling_references_are_dropped_with_warnings() {
        let snap = Snapshot::from_json(
            r#"[
              {"id":"t1","type":"tab"},
              {"id":"a","type":"inject","z":"t1","x":1,"y":1,"wires":[["gone","b"]]},
              {"id":"b","type":"debug","z":"ghost-tab","x":2,"y":2}
            ]"#,
        )
        .unwrap();
        let mut store = FlowStore::new(registry());
        let report = decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        assert_eq!(report.dropped_refs(), 2);
        assert!(store.get("b").unwrap().z.is_none());
        let out = encode(&store);
        assert_eq!(
            out.get("a").unwrap().wires,
            Some(vec![vec![WireRef::to(RecordId::new("b").unwrap())]])
        );
    }

    #[test]
    fn strict_decode_rejects_dangling_wire_without_mutation() {
        let snap = Snapshot::from_json(
            r#"[{"id":"a","type":"inject","x":1,"y":1,"wires":[["gone"]]}]"#,
        )
        .unwrap();
        let mut store = FlowStore::new(registry());
        let err = decode(&snap, &mut store, DecodeOptions::preserve_ids().drop_dangling(false))
            .unwrap_err();
        assert!(matches!(err, FlowError::Parse { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn preserved_id_collision_is_rejected() {
        let snap = sample();
        let mut store = FlowStore::new(registry());
        decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        assert!(decode(&snap, &mut store, DecodeOptions::preserve_ids()).is_err());
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn unknown_types_pass_through_verbatim() {
        let snap = Snapshot::from_json(
            r#"[
              {"id":"t1","type":"tab"},
              {"id":"u1","type":"contrib-widget","z":"t1","x":5,"y":6,"deep":{"k":[1,2,3]},"wires":[["u2"]]},
              {"id":"u2","type":"contrib-config","secret":"s"}
            ]"#,
        )
        .unwrap();
        let mut store = FlowStore::new(registry());
        let report = decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        assert_eq!(report.unknown_types(), ["contrib-widget", "contrib-config"]);
        assert_eq!(store.configs()[0].id.as_str(), "u2");
        let out = encode(&store);
        assert_eq!(out.get("u1"), snap.get("u1"));
        assert_eq!(out.get("u2"), snap.get("u2"));
    }

    #[test]
    fn invalid_records_are_kept_and_flagged() {
        let snap = Snapshot::from_json(r#"[{"id":"b","type":"mqtt-broker","broker":""}]"#).unwrap();
        let mut store = FlowStore::new(registry());
        let report = decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        assert!(!store.get("b").unwrap().flags.valid);
        assert_eq!(
            report.warnings,
            vec![DecodeWarning::InvalidProperties {
                id: RecordId::new("b").unwrap(),
                properties: vec!["broker".to_owned()],
            }]
        );
    }

    #[test]
    fn fresh_ids_remap_every_reference() {
        let snap = sample();
        let mut store = FlowStore::new(registry());
        decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        let report = decode(&snap, &mut store, DecodeOptions::fresh_ids()).unwrap();
        assert_eq!(store.len(), 16);
        assert_eq!(report.id_map.len(), 8);

        let new = |old: &str| report.id_map[old].to_string();
        for fresh in report.id_map.values() {
            assert_eq!(fresh.as_str().len(), 16);
            assert!(fresh.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }

        let out = encode(&store);
        let inst = out.get(&new("inst")).unwrap();
        assert_eq!(inst.type_name, format!("subflow:{}", new("sf")));
        assert_eq!(inst.z.as_ref().map(ToString::to_string), Some(new("t1")));

        let s1 = out.get(&new("s1")).unwrap();
        let targets: Vec<_> = s1
            .wires
            .iter()
            .flatten()
            .flatten()
            .map(|w| w.id.to_string())
            .collect();
        assert_eq!(targets, [new("d1"), new("inst"), new("d1")]);

        let sf = out.get(&new("sf")).unwrap();
        assert_eq!(sf.prop("in").unwrap()[0]["wires"][0]["id"], json!(new("sn")));
    }

    #[test]
    fn connections_keep_establishment_order_per_port() {
        let snap = Snapshot::from_json(
            r#"[{"id":"a","type":"switch","x":0,"y":0,"wires":[["c","b"],[]]},
                {"id":"b","type":"debug","x":0,"y":0},
                {"id":"c","type":"debug","x":0,"y":0}]"#,
        )
        .unwrap();
        let mut store = FlowStore::new(registry());
        decode(&snap, &mut store, DecodeOptions::preserve_ids()).unwrap();
        store.connect(Link {
            source: RecordId::new("a").unwrap(),
            source_port: 1,
            target: RecordId::new("b").unwrap(),
            target_port: 0,
        });
        let out = encode(&store);
        let wires = serde_json::to_value(&out.get("a").unwrap().wires).unwrap();
        assert_eq!(wires, json!([["c", "b"], ["b"]]));
    }
}
