//! Type registry: per-type schemas and record classification.
//!
//! The registry is an explicit value owned by the editor session and passed
//! by reference into the codec and partitioner. Tests build fixture
//! registries; the CLI builds one from `flowsync.toml`.
//!
//! Each registered type declares its property schema
//! (`name -> { required, validate }`), whether it is a config-style record,
//! and its output count. The two structural types, `tab` (container) and
//! `subflow` (template), are always present.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::model::record::{CONTAINER_TYPE, Record, TEMPLATE_INSTANCE_PREFIX, TEMPLATE_TYPE};

// ---------------------------------------------------------------------------
// Validator / PropertySpec
// ---------------------------------------------------------------------------

/// A value check applied to one declared property.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Validator {
    /// Any value is accepted.
    #[default]
    Any,
    /// A non-empty string.
    NonEmpty,
    /// Any JSON number, or a string that parses as one.
    Number,
    /// An integral JSON number.
    Integer,
    /// A JSON boolean.
    Boolean,
    /// One of a fixed set of strings.
    OneOf(Vec<String>),
}

impl Validator {
    /// Check a property value.
    #[must_use]
    pub fn validate(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::NonEmpty => value.as_str().is_some_and(|s| !s.is_empty()),
            Self::Number => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            Self::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::Boolean => value.is_boolean(),
            Self::OneOf(options) => value
                .as_str()
                .is_some_and(|s| options.iter().any(|o| o == s)),
        }
    }
}

/// Declaration of one property of a registered type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertySpec {
    /// Whether the property must be present.
    #[serde(default)]
    pub required: bool,
    /// Value check applied when the property is present.
    #[serde(default)]
    pub validate: Validator,
}

// ---------------------------------------------------------------------------
// TypeSchema
// ---------------------------------------------------------------------------

/// Whether a type is a canvas node or a config-style record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Drawn on a container canvas; carries `x`, `y` and `wires`.
    #[default]
    Node,
    /// Shared configuration, usually global (no `z`), never wired.
    Config,
}

/// Schema of one registered type.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeSchema {
    /// Type name as it appears in a record's `type` field.
    pub name: String,
    /// Node or config.
    #[serde(default)]
    pub category: Category,
    /// Number of output ports (node category only).
    #[serde(default = "default_outputs")]
    pub outputs: usize,
    /// Declared properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
}

const fn default_outputs() -> usize {
    1
}

impl TypeSchema {
    /// A node type with the given output count and no declared properties.
    #[must_use]
    pub fn node(name: &str, outputs: usize) -> Self {
        Self {
            name: name.to_owned(),
            category: Category::Node,
            outputs,
            properties: BTreeMap::new(),
        }
    }

    /// A config type with no declared properties.
    #[must_use]
    pub fn config(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            category: Category::Config,
            outputs: 0,
            properties: BTreeMap::new(),
        }
    }

    /// Declare a property.
    #[must_use]
    pub fn with_property(mut self, name: &str, required: bool, validate: Validator) -> Self {
        self.properties
            .insert(name.to_owned(), PropertySpec { required, validate });
        self
    }

    /// Names of properties that are missing or fail validation on `record`.
    #[must_use]
    pub fn invalid_properties(&self, record: &Record) -> Vec<String> {
        self.properties
            .iter()
            .filter(|(name, spec)| match record.prop(name) {
                None => spec.required,
                Some(value) => !spec.validate.validate(value),
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

/// How a record is bucketed and materialized.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A container (`tab`).
    Container,
    /// A template definition (`subflow`).
    Template,
    /// An instance of a template (`subflow:<templateId>`).
    TemplateInstance {
        /// Id of the instantiated template.
        template: String,
    },
    /// A registered config-style type.
    Config,
    /// A registered canvas node type.
    Leaf,
    /// A type absent from the registry, kept verbatim.
    Unknown,
}

impl RecordKind {
    /// Containers and templates own members; everything else is a member.
    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Container | Self::Template)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Template => write!(f, "template"),
            Self::TemplateInstance { template } => write!(f, "instance of {template}"),
            Self::Config => write!(f, "config"),
            Self::Leaf => write!(f, "node"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What the codec and partitioner need to know about one type name.
#[derive(Clone, Copy, Debug)]
pub struct SchemaInfo<'a> {
    /// Declared properties (empty for structural and unknown types).
    pub properties: Option<&'a BTreeMap<String, PropertySpec>>,
    /// Whether records of this type are containers.
    pub is_container: bool,
    /// Whether records of this type are templates.
    pub is_template: bool,
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Registry of known types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeSchema>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry holding only the structural `tab` and `subflow` types.
    #[must_use]
    pub fn new() -> Self {
        let mut types = BTreeMap::new();
        let tab = TypeSchema {
            name: CONTAINER_TYPE.to_owned(),
            category: Category::Node,
            outputs: 0,
            properties: BTreeMap::new(),
        }
        .with_property("label", false, Validator::Any)
        .with_property("disabled", false, Validator::Boolean);
        let subflow = TypeSchema {
            name: TEMPLATE_TYPE.to_owned(),
            category: Category::Node,
            outputs: 0,
            properties: BTreeMap::new(),
        }
        .with_property("name", false, Validator::Any);
        types.insert(tab.name.clone(), tab);
        types.insert(subflow.name.clone(), subflow);
        Self { types }
    }

    /// Register (or replace) a type.
    pub fn register(&mut self, schema: TypeSchema) {
        self.types.insert(schema.name.clone(), schema);
    }

    /// Builder-style [`TypeRegistry::register`].
    #[must_use]
    pub fn with(mut self, schema: TypeSchema) -> Self {
        self.register(schema);
        self
    }

    /// The full schema of a registered type.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&TypeSchema> {
        self.types.get(type_name)
    }

    /// Capability lookup used for bucketing.
    #[must_use]
    pub fn schema_for(&self, type_name: &str) -> SchemaInfo<'_> {
        SchemaInfo {
            properties: self.types.get(type_name).map(|s| &s.properties),
            is_container: type_name == CONTAINER_TYPE,
            is_template: type_name == TEMPLATE_TYPE,
        }
    }

    /// Classify a type name.
    #[must_use]
    pub fn kind_of(&self, type_name: &str) -> RecordKind {
        if type_name == CONTAINER_TYPE {
            return RecordKind::Container;
        }
        if type_name == TEMPLATE_TYPE {
            return RecordKind::Template;
        }
        if let Some(template) = type_name.strip_prefix(TEMPLATE_INSTANCE_PREFIX)
            && !template.is_empty()
        {
            return RecordKind::TemplateInstance {
                template: template.to_owned(),
            };
        }
        match self.types.get(type_name).map(|s| s.category) {
            Some(Category::Config) => RecordKind::Config,
            Some(Category::Node) => RecordKind::Leaf,
            None => RecordKind::Unknown,
        }
    }

    /// Whether `type_name` resolves to something other than [`RecordKind::Unknown`].
    #[must_use]
    pub fn is_known(&self, type_name: &str) -> bool {
        self.kind_of(type_name) != RecordKind::Unknown
    }

    /// Names of properties on `record` that fail its type's schema.
    ///
    /// Unknown and template-instance types have no schema and always pass.
    #[must_use]
    pub fn invalid_properties(&self, record: &Record) -> Vec<String> {
        self.types
            .get(&record.type_name)
            .map(|schema| schema.invalid_properties(record))
            .unwrap_or_default()
    }

    /// Number of registered types (including the structural ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Always `false`: the structural types are always registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
