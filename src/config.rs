//! flowsync configuration (`flowsync.toml`).
//!
//! Defines the typed configuration: registered record types, the flows file
//! used by the file transport, and codec strictness.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::FlowError;
use crate::registry::{TypeRegistry, TypeSchema};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level flowsync configuration.
///
/// Parsed from `flowsync.toml`. Missing fields use sensible defaults.
/// Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowSyncConfig {
    /// Registered record types.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// File transport settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Snapshot codec settings.
    #[serde(default)]
    pub codec: CodecConfig,
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Type declarations, one `[[registry.types]]` table each.
///
/// ```toml
/// [[registry.types]]
/// name = "switch"
/// outputs = 2
///
/// [registry.types.properties.rule]
/// required = true
/// validate = { one-of = ["eq", "neq"] }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Declared types, applied in order (later names replace earlier ones).
    #[serde(default)]
    pub types: Vec<TypeSchema>,
}

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

/// Where the file transport keeps the remote flows.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Flows JSON path (default: `flows.json`).
    #[serde(default = "default_flows_file")]
    pub flows_file: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            flows_file: default_flows_file(),
        }
    }
}

fn default_flows_file() -> PathBuf {
    PathBuf::from("flows.json")
}

// ---------------------------------------------------------------------------
// CodecConfig
// ---------------------------------------------------------------------------

/// Decode behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodecConfig {
    /// Drop references to missing ids with a warning (default: `true`).
    ///
    /// When `false`, a merged snapshot with a dangling wire or scope fails
    /// to decode instead.
    #[serde(default = "default_drop_dangling_refs")]
    pub drop_dangling_refs: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            drop_dangling_refs: default_drop_dangling_refs(),
        }
    }
}

const fn default_drop_dangling_refs() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl FlowSyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns [`FlowError::Config`] with line-level detail.
    ///
    /// # Errors
    /// Returns [`FlowError::Config`] on I/O errors (other than not-found) or
    /// parse errors.
    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(FlowError::Config {
                    path: path.to_owned(),
                    detail: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|detail| FlowError::Config {
            path: path.to_owned(),
            detail,
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns the parser message, prefixed with the line number when known.
    pub fn parse(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| {
            let message = e.message().to_owned();
            match e.span() {
                Some(span) => {
                    let line = toml_str[..span.start]
                        .chars()
                        .filter(|&c| c == '\n')
                        .count()
                        + 1;
                    format!("line {line}: {message}")
                }
                None => message,
            }
        })
    }

    /// Build the type registry: built-in `tab` and `subflow` plus every
    /// declared type.
    #[must_use]
    pub fn registry(&self) -> TypeRegistry {
        self.registry
            .types
            .iter()
            .cloned()
            .fold(TypeRegistry::new(), TypeRegistry::with)
    }

    /// Whether decoding should fail on dangling references.
    #[must_use]
    pub const fn strict_refs(&self) -> bool {
        !self.codec.drop_dangling_refs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
