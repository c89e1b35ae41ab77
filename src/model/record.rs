//! Records and snapshots: the serialized shape of a flow configuration.
//!
//! A [`Snapshot`] is an ordered list of [`Record`]s. It is what the codec
//! produces from a working store, what the transport fetches and posts, and
//! the unit the partition → diff → reconcile → commit pipeline operates on.
//!
//! # Record shape
//!
//! ```text
//! { "id": "n1", "type": "inject", "z": "tab1",
//!   "x": 120, "y": 80, "wires": [["n2", {"id": "n3", "port": 1}]],
//!   ...type-specific properties... }
//! ```
//!
//! Everything except `id`, `type`, `z` and `wires` lives in an opaque,
//! key-sorted property bag, so structural equality never depends on the
//! order properties were written in. `wires` order is kept exactly.

use std::collections::BTreeSet;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FlowError;
use crate::model::types::RecordId;

/// Type name of a container ("flow tab").
pub const CONTAINER_TYPE: &str = "tab";
/// Type name of a template definition.
pub const TEMPLATE_TYPE: &str = "subflow";
/// Prefix of a template-instance type (`subflow:<templateId>`).
pub const TEMPLATE_INSTANCE_PREFIX: &str = "subflow:";

// ---------------------------------------------------------------------------
// WireRef
// ---------------------------------------------------------------------------

/// One outbound connection target: the target record and its input port.
///
/// Serialized as a bare id string when `port == 0`, otherwise as
/// `{"id": ..., "port": ...}`. Both forms are accepted on input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireRefRepr", into = "WireRefRepr")]
pub struct WireRef {
    /// Target record.
    pub id: RecordId,
    /// Target input port.
    pub port: u32,
}

impl WireRef {
    /// A connection into input port 0 of `id`.
    #[must_use]
    pub const fn to(id: RecordId) -> Self {
        Self { id, port: 0 }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireRefRepr {
    Bare(String),
    Full {
        id: String,
        #[serde(default)]
        port: u32,
    },
}

impl TryFrom<WireRefRepr> for WireRef {
    type Error = crate::model::types::ValidationError;

    fn try_from(repr: WireRefRepr) -> Result<Self, Self::Error> {
        match repr {
            WireRefRepr::Bare(id) => Ok(Self {
                id: RecordId::try_from(id)?,
                port: 0,
            }),
            WireRefRepr::Full { id, port } => Ok(Self {
                id: RecordId::try_from(id)?,
                port,
            }),
        }
    }
}

impl From<WireRef> for WireRefRepr {
    fn from(wire: WireRef) -> Self {
        if wire.port == 0 {
            Self::Bare(wire.id.into())
        } else {
            Self::Full {
                id: wire.id.into(),
                port: wire.port,
            }
        }
    }
}

/// A single output group may be written as one bare reference instead of a
/// list; normalize to a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireGroupRepr {
    Many(Vec<WireRef>),
    One(WireRef),
}

fn deserialize_wires<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<WireRef>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let groups: Option<Vec<WireGroupRepr>> = Option::deserialize(deserializer)?;
    Ok(groups.map(|groups| {
        groups
            .into_iter()
            .map(|g| match g {
                WireGroupRepr::Many(refs) => refs,
                WireGroupRepr::One(r) => vec![r],
            })
            .collect()
    }))
}

fn deserialize_scope<'de, D>(deserializer: D) -> Result<Option<RecordId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => RecordId::try_from(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One typed, identified configuration entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique id within a snapshot.
    pub id: RecordId,
    /// Type discriminator (`tab`, `subflow`, `subflow:<id>`, a registered
    /// leaf type, or an unrecognized type kept verbatim).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Owning container or template. `None` (or `""` on input) means global.
    #[serde(
        default,
        deserialize_with = "deserialize_scope",
        skip_serializing_if = "Option::is_none"
    )]
    pub z: Option<RecordId>,
    /// Outbound connections, indexed by output port.
    #[serde(
        default,
        deserialize_with = "deserialize_wires",
        skip_serializing_if = "Option::is_none"
    )]
    pub wires: Option<Vec<Vec<WireRef>>>,
    /// Every other property, including `x` and `y`.
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Record {
    /// A record with no scope, no wires, and no properties.
    #[must_use]
    pub fn new(id: RecordId, type_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            z: None,
            wires: None,
            props: Map::new(),
        }
    }

    /// Set the owning container/template.
    #[must_use]
    pub fn with_z(mut self, z: RecordId) -> Self {
        self.z = Some(z);
        self
    }

    /// Set one property.
    #[must_use]
    pub fn with_prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.props.insert(key.to_owned(), value.into());
        self
    }

    /// Set the outbound wires.
    #[must_use]
    pub fn with_wires(mut self, wires: Vec<Vec<WireRef>>) -> Self {
        self.wires = Some(wires);
        self
    }

    /// Look up a property from the bag.
    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Horizontal canvas position, if numeric.
    #[must_use]
    pub fn x(&self) -> Option<f64> {
        self.props.get("x").and_then(Value::as_f64)
    }

    /// Vertical canvas position, if numeric.
    #[must_use]
    pub fn y(&self) -> Option<f64> {
        self.props.get("y").and_then(Value::as_f64)
    }

    /// Whether this record carries a canvas position.
    #[must_use]
    pub fn has_position(&self) -> bool {
        self.props.contains_key("x")
    }

    /// Whether this record is a container.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.type_name == CONTAINER_TYPE
    }

    /// Whether this record is a template definition.
    #[must_use]
    pub fn is_template(&self) -> bool {
        self.type_name == TEMPLATE_TYPE
    }

    /// For a template instance (`subflow:<id>`), the template id.
    #[must_use]
    pub fn template_ref(&self) -> Option<&str> {
        self.type_name
            .strip_prefix(TEMPLATE_INSTANCE_PREFIX)
            .filter(|s| !s.is_empty())
    }

    /// Human-facing label: `label`, then `name`, then the id.
    #[must_use]
    pub fn label(&self) -> &str {
        ["label", "name"]
            .iter()
            .filter_map(|k| self.props.get(*k).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A flat, ordered list of records: one version of the configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Vec<Record>);

impl Snapshot {
    /// Wrap a record list.
    #[must_use]
    pub const fn new(records: Vec<Record>) -> Self {
        Self(records)
    }

    /// Parse and structurally validate a snapshot from JSON text.
    ///
    /// # Errors
    /// Returns [`FlowError::Parse`] if the text is not a JSON array of
    /// records, a record lacks an `id` or `type`, or two records share an id.
    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        let snapshot: Self = serde_json::from_str(text).map_err(|e| FlowError::Parse {
            detail: e.to_string(),
        })?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Parse and validate a snapshot from an already-decoded JSON value.
    ///
    /// # Errors
    /// Same conditions as [`Snapshot::from_json`].
    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        let snapshot: Self = serde_json::from_value(value).map_err(|e| FlowError::Parse {
            detail: e.to_string(),
        })?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    /// Only fails if a property value cannot be represented as JSON.
    pub fn to_json_pretty(&self) -> Result<String, FlowError> {
        serde_json::to_string_pretty(self).map_err(|e| FlowError::Parse {
            detail: e.to_string(),
        })
    }

    fn validate(&self) -> Result<(), FlowError> {
        let mut seen = BTreeSet::new();
        for record in &self.0 {
            if record.type_name.is_empty() {
                return Err(FlowError::Parse {
                    detail: format!("record '{}' has an empty type", record.id),
                });
            }
            if !seen.insert(&record.id) {
                return Err(FlowError::Parse {
                    detail: format!("duplicate record id '{}'", record.id),
                });
            }
        }
        Ok(())
    }

    /// The records in snapshot order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.0
    }

    /// Iterate records in snapshot order.
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.0.iter()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the snapshot holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Find a record by id (linear scan; use a partition for repeated lookups).
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.0.iter().find(|r| r.id.as_str() == id)
    }

    /// Iterate ids in snapshot order.
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.0.iter().map(|r| &r.id)
    }

    /// Consume into the record list.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.0
    }
}

impl FromIterator<Record> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
