//! Canonical serialization and structural fingerprints.
//!
//! Change detection compares records structurally. Object keys are emitted
//! in sorted order at every depth, so two records that differ only in how
//! their properties were enumerated serialize identically. Array order is
//! kept as-is everywhere, which is what makes reordered `wires` register as
//! a change. Integral floats are written as integers, so `20` and `20.0`
//! are the same value.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::error::FlowError;
use crate::model::record::{Record, Snapshot};
use crate::model::types::RevisionToken;

/// Largest magnitude below which every integral `f64` is exact.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

/// Rebuild `value` with object keys inserted in sorted order and numbers
/// normalized, recursively.
#[must_use]
pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonical_value(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        Value::Number(n) => Value::Number(canonical_number(n)),
        other => other.clone(),
    }
}

#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
fn canonical_number(n: &Number) -> Number {
    if n.is_f64()
        && let Some(f) = n.as_f64()
        && f.trunc() == f
        && f.abs() < MAX_EXACT_F64
    {
        return Number::from(f as i64);
    }
    n.clone()
}

/// Canonical JSON bytes for a record.
///
/// # Errors
/// Only fails if the record cannot be represented as JSON.
pub fn record_bytes(record: &Record) -> Result<Vec<u8>, FlowError> {
    let value = serde_json::to_value(record).map_err(|e| FlowError::Parse {
        detail: e.to_string(),
    })?;
    serde_json::to_vec(&canonical_value(&value)).map_err(|e| FlowError::Parse {
        detail: e.to_string(),
    })
}

/// Canonical JSON bytes for a whole snapshot (record order preserved).
///
/// # Errors
/// Only fails if a record cannot be represented as JSON.
pub fn snapshot_bytes(snapshot: &Snapshot) -> Result<Vec<u8>, FlowError> {
    let value = serde_json::to_value(snapshot).map_err(|e| FlowError::Parse {
        detail: e.to_string(),
    })?;
    serde_json::to_vec(&canonical_value(&value)).map_err(|e| FlowError::Parse {
        detail: e.to_string(),
    })
}

/// Structural equality of two records.
///
/// Property bags compare as maps; `wires` and nested arrays compare in order.
/// Property values compare in canonical form.
#[must_use]
pub fn records_equal(a: &Record, b: &Record) -> bool {
    a.id == b.id
        && a.type_name == b.type_name
        && a.z == b.z
        && a.wires == b.wires
        && a.props.len() == b.props.len()
        && a.props.iter().all(|(key, value)| {
            b.props
                .get(key)
                .is_some_and(|other| canonical_value(value) == canonical_value(other))
        })
}

/// Lowercase hex sha256 of canonical bytes.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl RevisionToken {
    /// The content revision of a snapshot: sha256 over its canonical form.
    ///
    /// # Errors
    /// Only fails if a record cannot be represented as JSON.
    pub fn for_snapshot(snapshot: &Snapshot) -> Result<Self, FlowError> {
        let hex = fingerprint(&snapshot_bytes(snapshot)?);
        Self::new(&hex).map_err(|e| FlowError::Parse {
            detail: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
