//! `flowsync` subcommands.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use flowsync::FlowError;
use flowsync::codec::DecodeReport;
use flowsync::config::FlowSyncConfig;
use flowsync::history::HistoryLog;
use flowsync::merge::reconcile::ReconciliationResult;
use flowsync::merge::view::{Section, ViewRow};
use flowsync::merge::{ConflictKind, DiffView, diff, merge, partition, property_diff};
use flowsync::model::record::{Record, Snapshot};
use flowsync::model::types::{RecordId, Side};
use flowsync::registry::TypeRegistry;
use flowsync::session::{SyncSession, reconcile_snapshots};
use flowsync::store::{FlowStore, WorkingStore};
use flowsync::transport::FileTransport;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct DiffArgs {
    /// Snapshot to compare against
    base: PathBuf,
    /// Snapshot to compare
    candidate: PathBuf,
    /// Print the id sets as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct ReconcileArgs {
    /// Common ancestor snapshot
    base: PathBuf,
    /// Local edit
    local: PathBuf,
    /// Remote edit
    remote: PathBuf,
    /// Print conflicts and resolutions as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct MergeArgs {
    /// Common ancestor snapshot
    base: PathBuf,
    /// Local edit
    local: PathBuf,
    /// Remote edit
    remote: PathBuf,
    /// Resolution for one record, as ID=local or ID=remote (repeatable)
    #[arg(long = "resolve", value_name = "ID=SIDE", value_parser = parse_resolution)]
    resolve: Vec<(RecordId, Side)>,
    /// Write the merged snapshot here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Args)]
pub struct ViewArgs {
    /// Common ancestor snapshot
    base: PathBuf,
    /// Local edit
    local: PathBuf,
    /// Remote edit (omit for a local-only view)
    remote: Option<PathBuf>,
    /// Include unchanged rows
    #[arg(long)]
    all: bool,
    /// Show property-level differences under each touched row
    #[arg(long)]
    props: bool,
    /// Print the view model as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Last deployed snapshot (rewritten with the new baseline on success)
    #[arg(long)]
    base: PathBuf,
    /// Local edit
    local: PathBuf,
    /// Resolution for one record, as ID=local or ID=remote (repeatable)
    #[arg(long = "resolve", value_name = "ID=SIDE", value_parser = parse_resolution)]
    resolve: Vec<(RecordId, Side)>,
    /// Flows file to sync with (overrides `[transport] flows_file`)
    #[arg(long)]
    flows: Option<PathBuf>,
    /// Write the merged snapshot here instead of over LOCAL
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn parse_resolution(s: &str) -> Result<(RecordId, Side), String> {
    let (id, side) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected ID=local|remote, got '{s}'"))?;
    let id = RecordId::new(id).map_err(|e| e.to_string())?;
    let side = side.parse::<Side>().map_err(|e| e.to_string())?;
    Ok((id, side))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct DiffEnvelope<'a> {
    added: &'a BTreeSet<RecordId>,
    deleted: &'a BTreeSet<RecordId>,
    changed: &'a BTreeSet<RecordId>,
    moved: &'a BTreeSet<RecordId>,
}

pub fn run_diff(args: &DiffArgs) -> Result<()> {
    let base = Arc::new(partition(&read_snapshot(&args.base)?));
    let candidate = Arc::new(partition(&read_snapshot(&args.candidate)?));
    let result = diff(base, candidate);

    if args.json {
        let envelope = DiffEnvelope {
            added: &result.added,
            deleted: &result.deleted,
            changed: &result.changed,
            moved: &result.moved,
        };
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    if result.is_empty() {
        println!("No changes.");
        return Ok(());
    }
    for id in &result.added {
        println!("+ {}", describe(result.candidate_record(id.as_str()), id));
    }
    for id in &result.deleted {
        println!("- {}", describe(result.base_record(id.as_str()), id));
    }
    for id in &result.changed {
        let marker = if result.moved.contains(id) { '>' } else { '~' };
        println!("{marker} {}", describe(result.candidate_record(id.as_str()), id));
    }
    println!(
        "\n{} added, {} deleted, {} changed ({} moved)",
        result.added.len(),
        result.deleted.len(),
        result.changed.len(),
        result.moved.len()
    );
    Ok(())
}

#[derive(Serialize)]
struct ReconcileEnvelope<'a> {
    conflicts: &'a BTreeMap<RecordId, ConflictKind>,
    resolutions: &'a BTreeMap<RecordId, Side>,
    all_resolved: bool,
}

pub fn run_reconcile(args: &ReconcileArgs) -> Result<()> {
    let result = reconcile_files(&args.base, &args.local, &args.remote)?;

    if args.json {
        let envelope = ReconcileEnvelope {
            conflicts: &result.conflicts,
            resolutions: &result.resolutions,
            all_resolved: result.all_resolved(),
        };
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    print_conflicts(&result);
    let (local, remote) = result
        .resolutions
        .values()
        .fold((0, 0), |(l, r), side| match side {
            Side::Local => (l + 1, r),
            Side::Remote => (l, r + 1),
        });
    println!(
        "{} record(s) resolved by default ({local} local, {remote} remote)",
        result.resolutions.len()
    );
    Ok(())
}

pub fn run_merge(config: &FlowSyncConfig, args: &MergeArgs) -> Result<()> {
    let mut result = reconcile_files(&args.base, &args.local, &args.remote)?;
    for (id, side) in &args.resolve {
        result
            .resolve(id, *side)
            .with_context(|| format!("Cannot resolve '{id}'"))?;
    }

    let outcome = match merge(&result) {
        Ok(outcome) => outcome,
        Err(FlowError::UnresolvedConflicts { ids }) => {
            print_unresolved(&result, &ids);
            bail!(
                "{} conflict(s) unresolved; re-run with --resolve ID=local|remote for each",
                ids.len()
            );
        }
        Err(e) => return Err(e).context("Merge failed"),
    };

    // Materialize once so dangling references and invalid records surface
    // before anything is written.
    let mut store = FlowStore::new(Arc::new(config.registry())).with_strict_refs(config.strict_refs());
    let report = store
        .replace(&outcome.snapshot, &outcome.changed)
        .context("Merged snapshot does not decode")?;
    print_warnings(&report);

    let json = outcome.snapshot.to_json_pretty()?;
    match &args.output {
        Some(path) => {
            write_file(path, &json)?;
            eprintln!(
                "Merged {} record(s) into {} ({} taken from remote).",
                outcome.snapshot.len(),
                path.display(),
                outcome.changed.len()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

pub fn run_view(config: &FlowSyncConfig, args: &ViewArgs) -> Result<()> {
    let base = read_snapshot(&args.base)?;
    let local = read_snapshot(&args.local)?;

    let (view, result) = match &args.remote {
        Some(remote) => {
            let remote = read_snapshot(remote)?;
            let result = reconcile_snapshots(&base, &local, &remote)?;
            (DiffView::new(&result), Some(result))
        }
        None => {
            let result = diff(Arc::new(partition(&base)), Arc::new(partition(&local)));
            (DiffView::two_way(&result), None)
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let registry = config.registry();
    let props = args.props.then_some(PropertySource {
        base: &base,
        local: &local,
        result: result.as_ref(),
        registry: &registry,
    });
    print!("{}", render_view(&view, args.all, props.as_ref()));
    Ok(())
}

pub fn run_sync(config: &FlowSyncConfig, args: &SyncArgs) -> Result<()> {
    let base = read_snapshot(&args.base)?;
    let local = read_snapshot(&args.local)?;

    let (store, _) = FlowStore::load(Arc::new(config.registry()), &base, None)
        .context("Base snapshot does not decode")?;
    let mut store = store.with_strict_refs(config.strict_refs());
    let edited: BTreeSet<RecordId> = local.ids().cloned().collect();
    store
        .replace(&local, &edited)
        .context("Local snapshot does not decode")?;

    let flows = args
        .flows
        .clone()
        .unwrap_or_else(|| config.transport.flows_file.clone());
    let mut session = SyncSession::new(FileTransport::new(&flows));
    let result = session.begin(&store).context("Failed to open session")?;
    eprintln!(
        "Reconciling against {} ({} conflict(s)).",
        flows.display(),
        result.conflicts.len()
    );

    for (id, side) in &args.resolve {
        session
            .resolve(id, *side)
            .with_context(|| format!("Cannot resolve '{id}'"))?;
    }

    let mut history = HistoryLog::default();
    let outcome = match session.commit(&mut store, &mut history) {
        Ok(outcome) => outcome,
        Err(FlowError::UnresolvedConflicts { ids }) => {
            if let Some(result) = session.result() {
                print_unresolved(result, &ids);
            }
            bail!(
                "{} conflict(s) unresolved; re-run with --resolve ID=local|remote for each",
                ids.len()
            );
        }
        Err(e @ FlowError::StaleRevision { .. }) => {
            return Err(e).context("Flows file changed during sync; run sync again");
        }
        Err(e) => return Err(e).context("Sync failed"),
    };
    print_warnings(&outcome.report);

    let output = args.output.as_ref().unwrap_or(&args.local);
    write_file(output, &store.current_snapshot().to_json_pretty()?)?;
    write_file(&args.base, &store.baseline().to_json_pretty()?)?;
    eprintln!(
        "Deployed {} record(s) to {}; {} taken from remote.",
        outcome.merge.snapshot.len(),
        flows.display(),
        outcome.merge.changed.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Snapshot::from_json(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

fn reconcile_files(base: &Path, local: &Path, remote: &Path) -> Result<ReconciliationResult> {
    let base = read_snapshot(base)?;
    let local = read_snapshot(local)?;
    let remote = read_snapshot(remote)?;
    Ok(reconcile_snapshots(&base, &local, &remote)?)
}

fn describe(record: Option<&Record>, id: &RecordId) -> String {
    match record {
        Some(r) if r.label() != id.as_str() => format!("{id} ({}) {}", r.type_name, r.label()),
        Some(r) => format!("{id} ({})", r.type_name),
        None => id.to_string(),
    }
}

fn print_conflicts(result: &ReconciliationResult) {
    if result.conflicts.is_empty() {
        println!("No conflicts.");
        return;
    }
    println!("{} conflict(s):", result.conflicts.len());
    for (id, kind) in &result.conflicts {
        let chosen = result
            .resolution(id.as_str())
            .map_or_else(String::new, |side| format!("  [{side}]"));
        println!("  ! {id}: {kind}{chosen}");
    }
}

fn print_unresolved(result: &ReconciliationResult, ids: &[RecordId]) {
    eprintln!("Unresolved conflicts:");
    for id in ids {
        match result.conflicts.get(id) {
            Some(kind) => eprintln!("  ! {id}: {kind}"),
            None => eprintln!("  ! {id}"),
        }
    }
}

fn print_warnings(report: &DecodeReport) {
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

// ---------------------------------------------------------------------------
// View rendering
// ---------------------------------------------------------------------------

struct PropertySource<'a> {
    base: &'a Snapshot,
    local: &'a Snapshot,
    result: Option<&'a ReconciliationResult>,
    registry: &'a TypeRegistry,
}

impl PropertySource<'_> {
    fn render(&self, row: &ViewRow, out: &mut String) {
        let id = row.id.as_str();
        let base = self.base.get(id);
        let local = self.local.get(id);
        let remote = self
            .result
            .and_then(|r| r.record_on(Side::Remote, id));
        let schema = self.registry.get(&row.type_name);
        for prop in property_diff(base, local, remote, schema) {
            if !prop.local_changed && !prop.remote_changed {
                continue;
            }
            let marker = if prop.conflict { '!' } else { ' ' };
            let show = |v: Option<&serde_json::Value>| v.map_or_else(|| "-".to_owned(), ToString::to_string);
            let _ = write!(
                out,
                "      {marker} {}: {} -> {}",
                prop.name,
                show(prop.base.as_ref()),
                show(prop.local.as_ref())
            );
            if self.result.is_some() {
                let _ = write!(out, " | {}", show(prop.remote.as_ref()));
            }
            out.push('\n');
        }
    }
}

fn render_view(view: &DiffView, all: bool, props: Option<&PropertySource<'_>>) -> String {
    let mut out = String::new();
    for section in &view.sections {
        let rows: Vec<&ViewRow> = section.all_rows().filter(|r| all || r.is_touched()).collect();
        if rows.is_empty() {
            continue;
        }
        render_section_header(section, view.three_way, &mut out);
        for row in rows {
            let remote = row.remote.map_or_else(String::new, |s| format!("{:<10}", s.to_string()));
            let flag = match (row.conflict, row.resolution) {
                (Some(_), None) => "CONFLICT".to_owned(),
                (Some(_), Some(side)) => format!("resolved {side}"),
                (None, _) => String::new(),
            };
            let _ = writeln!(
                out,
                "  {:<18} {:<14} {:<20} {:<10}{remote} {flag}",
                row.id.as_str(),
                row.type_name,
                truncate(&row.label, 20),
                row.local.to_string(),
            );
            if let Some(props) = props
                && row.is_touched()
            {
                props.render(row, &mut out);
            }
        }
        out.push('\n');
    }
    let conflicts = view.conflict_count();
    if conflicts > 0 {
        let state = if view.all_resolved() { "all resolved" } else { "unresolved remain" };
        let _ = writeln!(out, "{conflicts} conflict(s), {state}");
    } else if out.is_empty() {
        out.push_str("No changes.\n");
    }
    out
}

fn render_section_header(section: &Section, three_way: bool, out: &mut String) {
    let stats = &section.stats;
    let _ = write!(
        out,
        "== {} ==  local: +{} ~{} -{}",
        section.label, stats.local.added, stats.local.changed, stats.local.deleted
    );
    if three_way {
        let _ = write!(
            out,
            "  remote: +{} ~{} -{}  conflicts: {}",
            stats.remote.added, stats.remote.changed, stats.remote.deleted, stats.conflicts
        );
    }
    out.push('\n');
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut t: String = s.chars().take(max.saturating_sub(1)).collect();
    t.push('…');
    t
}
