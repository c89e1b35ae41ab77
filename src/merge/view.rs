//! Diff viewer model.
//!
//! Turns a [`ReconciliationResult`] (or a single [`DiffResult`]) into the
//! sectioned, row-per-record model a diff UI renders:
//!
//! - one [`Section`] for global records, then one per container, then one
//!   per template
//! - one [`ViewRow`] per record, carrying its [`RowState`] on each side, its
//!   conflict (if any) and its current resolution
//! - per-section [`SectionStats`]
//!
//! [`property_diff`] drills into one record and compares it property by
//! property.
//!
//! The view is a read-only projection. Resolutions are changed on the
//! [`ReconciliationResult`]; [`DiffView::refresh_resolutions`] re-reads them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

use super::diff::{ChangeKind, DiffResult};
use super::partition::{Bucket, ParsedConfiguration};
use super::reconcile::{ConflictKind, ReconciliationResult};
use crate::model::record::Record;
use crate::model::types::{RecordId, Side};
use crate::registry::TypeSchema;

// ---------------------------------------------------------------------------
// Row model
// ---------------------------------------------------------------------------

/// The state of one record on one side, relative to the base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowState {
    /// Same as the base.
    Unchanged,
    /// Added on this side.
    Added,
    /// Changed on this side.
    Changed,
    /// Changed and moved to another container on this side.
    Moved,
    /// Deleted on this side.
    Deleted,
    /// Never existed on this side (added only on the other side).
    Absent,
}

impl RowState {
    fn of(diff: &DiffResult, id: &str) -> Self {
        match diff.kind_of(id) {
            Some(ChangeKind::Added) => Self::Added,
            Some(ChangeKind::Deleted) => Self::Deleted,
            Some(ChangeKind::Moved) => Self::Moved,
            Some(ChangeKind::Changed) => Self::Changed,
            None if diff.base.contains(id) || diff.candidate.contains(id) => Self::Unchanged,
            None => Self::Absent,
        }
    }

    /// Whether this side did anything to the record.
    #[must_use]
    pub const fn is_touched(self) -> bool {
        !matches!(self, Self::Unchanged | Self::Absent)
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::Added => write!(f, "added"),
            Self::Changed => write!(f, "changed"),
            Self::Moved => write!(f, "moved"),
            Self::Deleted => write!(f, "deleted"),
            Self::Absent => write!(f, "-"),
        }
    }
}

/// One record in the view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ViewRow {
    /// Record id.
    pub id: RecordId,
    /// Type name (from the newest side that has the record).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Display label.
    pub label: String,
    /// State on the local side.
    pub local: RowState,
    /// State on the remote side (`None` in a two-way view).
    pub remote: Option<RowState>,
    /// Conflict, if any.
    pub conflict: Option<ConflictKind>,
    /// Current resolution, if any.
    pub resolution: Option<Side>,
}

impl ViewRow {
    /// Whether either side touched the record.
    #[must_use]
    pub fn is_touched(&self) -> bool {
        self.local.is_touched() || self.remote.is_some_and(RowState::is_touched)
    }

    /// Whether the row is conflicted and still lacks a resolution.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        self.conflict.is_some() && self.resolution.is_none()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Change counts for one side of one section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SideStats {
    /// Rows added on this side.
    pub added: usize,
    /// Rows deleted on this side.
    pub deleted: usize,
    /// Rows changed (or moved) on this side.
    pub changed: usize,
    /// Rows present and unchanged on this side.
    pub unchanged: usize,
}

impl SideStats {
    fn count(&mut self, state: RowState) {
        match state {
            RowState::Added => self.added += 1,
            RowState::Deleted => self.deleted += 1,
            RowState::Changed | RowState::Moved => self.changed += 1,
            RowState::Unchanged => self.unchanged += 1,
            RowState::Absent => {}
        }
    }
}

/// Change counts for one section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SectionStats {
    /// Local side.
    pub local: SideStats,
    /// Remote side (all zero in a two-way view).
    pub remote: SideStats,
    /// Conflicted rows.
    pub conflicts: usize,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// What a section groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    /// Records with no container.
    Globals,
    /// One container and its members.
    Container,
    /// One template and its members.
    Template,
}

/// A group of rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Section {
    /// Globals, container, or template.
    pub kind: SectionKind,
    /// Display label.
    pub label: String,
    /// Row for the container/template record itself (`None` for globals).
    pub header: Option<ViewRow>,
    /// Member rows.
    pub rows: Vec<ViewRow>,
    /// Counts over `rows`.
    pub stats: SectionStats,
}

impl Section {
    /// The container/template id (`None` for globals).
    #[must_use]
    pub fn group_id(&self) -> Option<&RecordId> {
        self.header.as_ref().map(|h| &h.id)
    }

    /// Header and member rows.
    pub fn all_rows(&self) -> impl Iterator<Item = &ViewRow> {
        self.header.iter().chain(&self.rows)
    }
}

/// The full view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiffView {
    /// Sections in display order.
    pub sections: Vec<Section>,
    /// Whether a remote column is present.
    pub three_way: bool,
}

impl DiffView {
    /// Three-way view of a reconciliation.
    #[must_use]
    pub fn new(result: &ReconciliationResult) -> Self {
        let configs = [
            &*result.local.base,
            &*result.local.candidate,
            &*result.remote.candidate,
        ];
        let sections = build_sections(&configs, |id| {
            row(
                id,
                &configs,
                RowState::of(&result.local, id.as_str()),
                Some(RowState::of(&result.remote, id.as_str())),
                result.conflicts.get(id).copied(),
                result.resolution(id.as_str()),
            )
        });
        Self {
            sections,
            three_way: true,
        }
    }

    /// Two-way view of local changes only.
    #[must_use]
    pub fn two_way(diff: &DiffResult) -> Self {
        let configs = [&*diff.base, &*diff.candidate];
        let sections = build_sections(&configs, |id| {
            row(id, &configs, RowState::of(diff, id.as_str()), None, None, None)
        });
        Self {
            sections,
            three_way: false,
        }
    }

    /// Every row (headers included) in display order.
    pub fn rows(&self) -> impl Iterator<Item = &ViewRow> {
        self.sections.iter().flat_map(Section::all_rows)
    }

    /// Look up a row by id.
    #[must_use]
    pub fn row(&self, id: &str) -> Option<&ViewRow> {
        self.rows().find(|r| r.id.as_str() == id)
    }

    /// Number of conflicted rows.
    #[must_use]
    pub fn conflict_count(&self) -> usize {
        self.rows().filter(|r| r.conflict.is_some()).count()
    }

    /// Whether every conflicted row has a resolution (gates the merge action).
    #[must_use]
    pub fn all_resolved(&self) -> bool {
        self.rows().all(|r| !r.is_unresolved())
    }

    /// Re-read resolutions after they were changed on `result`.
    pub fn refresh_resolutions(&mut self, result: &ReconciliationResult) {
        for section in &mut self.sections {
            for row in section.header.iter_mut().chain(&mut section.rows) {
                row.resolution = result.resolution(row.id.as_str());
            }
        }
    }
}

fn row(
    id: &RecordId,
    configs: &[&ParsedConfiguration],
    local: RowState,
    remote: Option<RowState>,
    conflict: Option<ConflictKind>,
    resolution: Option<Side>,
) -> ViewRow {
    let record = configs.iter().rev().find_map(|c| c.get(id.as_str()));
    ViewRow {
        id: id.clone(),
        type_name: record.map(|r| r.type_name.clone()).unwrap_or_default(),
        label: record.map_or_else(|| id.to_string(), |r| r.label().to_owned()),
        local,
        remote,
        conflict,
        resolution,
    }
}

/// Where a record is displayed: the first config (base, local, remote) that
/// holds it decides.
enum Home<'a> {
    Group,
    Member(&'a RecordId),
    Global,
}

fn home<'a>(configs: &[&'a ParsedConfiguration], id: &str) -> Home<'a> {
    for &config in configs {
        match config.bucket_of(id) {
            Some(Bucket::Container | Bucket::Template) => return Home::Group,
            Some(Bucket::InContainer(g) | Bucket::InTemplate(g)) => return Home::Member(g),
            Some(Bucket::Global) => return Home::Global,
            None => {}
        }
    }
    Home::Global
}

fn build_sections<'a, F>(configs: &[&'a ParsedConfiguration], mut make_row: F) -> Vec<Section>
where
    F: FnMut(&RecordId) -> ViewRow,
{
    // Group ids in display order: base order, then local-only, then remote-only.
    let containers = configs.iter().flat_map(|&c| {
        c.container_order
            .iter()
            .map(|id| (SectionKind::Container, id))
    });
    let templates = configs.iter().flat_map(|&c| {
        c.template_order
            .iter()
            .map(|id| (SectionKind::Template, id))
    });
    let mut seen: BTreeSet<&'a RecordId> = BTreeSet::new();
    let mut groups: Vec<(SectionKind, &'a RecordId)> = Vec::new();
    for (kind, id) in containers.chain(templates) {
        if seen.insert(id) {
            groups.push((kind, id));
        }
    }

    // Member ids in display order, bucketed by home.
    let mut placed = BTreeSet::new();
    let mut globals: Vec<&RecordId> = Vec::new();
    let mut members: BTreeMap<&RecordId, Vec<&RecordId>> = BTreeMap::new();
    for &config in configs {
        for id in &config.order {
            if seen.contains(id) || !placed.insert(id) {
                continue;
            }
            match home(configs, id.as_str()) {
                Home::Member(group) if seen.contains(group) => {
                    members.entry(group).or_default().push(id);
                }
                Home::Group | Home::Member(_) | Home::Global => globals.push(id),
            }
        }
    }

    let mut sections = Vec::with_capacity(groups.len() + 1);
    if !globals.is_empty() {
        sections.push(section(SectionKind::Globals, None, &globals, &mut make_row));
    }
    for (kind, id) in groups {
        let rows = members.remove(id).unwrap_or_default();
        sections.push(section(kind, Some(make_row(id)), &rows, &mut make_row));
    }
    sections
}

fn section<F>(kind: SectionKind, header: Option<ViewRow>, ids: &[&RecordId], make_row: &mut F) -> Section
where
    F: FnMut(&RecordId) -> ViewRow,
{
    let rows: Vec<ViewRow> = ids.iter().map(|&id| make_row(id)).collect();
    let mut stats = SectionStats::default();
    for r in &rows {
        stats.local.count(r.local);
        if let Some(state) = r.remote {
            stats.remote.count(state);
        }
        if r.conflict.is_some() {
            stats.conflicts += 1;
        }
    }
    let label = header
        .as_ref()
        .map_or_else(|| "Global".to_owned(), |h| h.label.clone());
    Section {
        kind,
        label,
        header,
        rows,
        stats,
    }
}

// ---------------------------------------------------------------------------
// Property diff
// ---------------------------------------------------------------------------

/// One compared property of one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PropertyRow {
    /// Property name (`position` for x/y, `wires` for connections).
    pub name: String,
    /// Base value (`None` when absent).
    pub base: Option<Value>,
    /// Local value.
    pub local: Option<Value>,
    /// Remote value.
    pub remote: Option<Value>,
    /// Local differs from base.
    pub local_changed: bool,
    /// Remote differs from base.
    pub remote_changed: bool,
    /// The two sides cannot both be honored for this property.
    pub conflict: bool,
}

/// Compare one record across base, local and remote, property by property.
///
/// Row order: `position` (when the base record is positioned), `wires`
/// (when any side has them), then every other property sorted by name.
/// Properties declared by `schema` are listed even when absent everywhere.
#[must_use]
pub fn property_diff(
    base: Option<&Record>,
    local: Option<&Record>,
    remote: Option<&Record>,
    schema: Option<&TypeSchema>,
) -> Vec<PropertyRow> {
    let local_deleted = base.is_some() && local.is_none();
    let remote_deleted = base.is_some() && remote.is_none();
    let compare = |name: &str, value: &dyn Fn(&Record) -> Option<Value>| {
        let b = base.and_then(value);
        let l = local.and_then(value);
        let r = remote.and_then(value);
        let lc = local.is_some() && l != b;
        let rc = remote.is_some() && r != b;
        let conflict =
            (lc && rc && l != r) || (!lc && rc && local_deleted) || (lc && !rc && remote_deleted);
        PropertyRow {
            name: name.to_owned(),
            base: b,
            local: l,
            remote: r,
            local_changed: lc,
            remote_changed: rc,
            conflict,
        }
    };

    let mut rows = Vec::new();
    if base.is_some_and(Record::has_position) {
        rows.push(compare("position", &|r: &Record| {
            r.has_position()
                .then(|| json!({ "x": r.prop("x"), "y": r.prop("y") }))
        }));
    }
    let sides = [base, local, remote];
    if sides.iter().flatten().any(|r| r.wires.is_some()) {
        rows.push(compare("wires", &|r: &Record| {
            r.wires.as_ref().and_then(|w| serde_json::to_value(w).ok())
        }));
    }

    let mut names: BTreeSet<&str> = sides
        .iter()
        .flatten()
        .flat_map(|r| r.props.keys().map(String::as_str))
        .filter(|k| !matches!(*k, "x" | "y"))
        .collect();
    if let Some(schema) = schema {
        names.extend(schema.properties.keys().map(String::as_str));
    }
    for name in names {
        rows.push(compare(name, &|r: &Record| r.prop(name).cloned()));
    }
    rows
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
