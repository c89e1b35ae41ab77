//! Sessions against a flows file on disk, configured through `flowsync.toml`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use flowsync::FlowError;
use flowsync::config::FlowSyncConfig;
use flowsync::history::HistoryLog;
use flowsync::model::record::Snapshot;
use flowsync::model::types::{RecordId, RevisionToken, Side};
use flowsync::session::{SessionPhase, SyncSession};
use flowsync::store::{FlowStore, WorkingStore};
use flowsync::transport::{FileTransport, Transport};

fn snap(value: serde_json::Value) -> Snapshot {
    Snapshot::from_value(value).unwrap()
}

fn write_flows(path: &Path, snapshot: &Snapshot) {
    fs::write(path, snapshot.to_json_pretty().unwrap()).unwrap();
}

fn base_flows() -> Snapshot {
    snap(json!([
        { "id": "t", "type": "tab", "label": "Main" },
        { "id": "i", "type": "inject", "z": "t", "x": 10, "y": 10, "wires": [["d"]] },
        { "id": "d", "type": "debug", "z": "t", "x": 100, "y": 10 }
    ]))
}

const CONFIG: &str = r#"
[transport]
flows_file = "flows.json"

[[registry.types]]
name = "inject"

[[registry.types]]
name = "debug"
outputs = 0
"#;

/// Config, store at the deployed base, and a transport over the flows file.
fn setup(dir: &Path) -> (FlowSyncConfig, FlowStore, FileTransport) {
    let config_path = dir.join("flowsync.toml");
    fs::write(&config_path, CONFIG).unwrap();
    let config = FlowSyncConfig::load(&config_path).unwrap();

    let flows = dir.join(&config.transport.flows_file);
    let base = base_flows();
    write_flows(&flows, &base);

    let revision = RevisionToken::for_snapshot(&base).unwrap();
    let (store, report) =
        FlowStore::load(Arc::new(config.registry()), &base, Some(revision)).unwrap();
    assert!(report.unknown_types().is_empty());
    (config, store, FileTransport::new(flows))
}

#[test]
fn sync_deploys_merge_to_flows_file() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut store, transport) = setup(dir.path());
    store.set_prop("i", "name", json!("tick"));

    // The server side renames the tab.
    let mut remote = base_flows().into_records();
    remote[0].props.insert("label".to_owned(), json!("Renamed"));
    write_flows(transport.path(), &Snapshot::new(remote));

    let mut session = SyncSession::new(transport);
    assert!(session.begin(&store).unwrap().all_resolved());
    let mut history = HistoryLog::default();
    let outcome = session.commit(&mut store, &mut history).unwrap();
    assert_eq!(session.phase(), Some(SessionPhase::Committed));

    let on_disk = session.transport_mut().fetch_remote().unwrap();
    assert_eq!(on_disk.snapshot, outcome.merge.snapshot);
    assert_eq!(store.revision_token(), Some(&on_disk.revision));
    let tab = on_disk.snapshot.get("t").unwrap();
    assert_eq!(tab.label(), "Renamed");
    assert_eq!(
        on_disk.snapshot.get("i").and_then(|r| r.prop("name")),
        Some(&json!("tick"))
    );
}

#[test]
fn concurrent_write_to_flows_file_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut store, transport) = setup(dir.path());
    let flows = transport.path().to_owned();
    store.set_prop("d", "name", json!("mine"));

    let mut session = SyncSession::new(transport);
    session.begin(&store).unwrap();

    let intruder = snap(json!([{ "id": "t", "type": "tab" }]));
    write_flows(&flows, &intruder);

    let mut history = HistoryLog::default();
    let err = session.commit(&mut store, &mut history).unwrap_err();
    assert!(matches!(err, FlowError::StaleRevision { .. }));
    assert_eq!(session.phase(), Some(SessionPhase::Stale));

    // The intruder's content is left in place.
    let text = fs::read_to_string(&flows).unwrap();
    assert_eq!(Snapshot::from_json(&text).unwrap(), intruder);
}

#[test]
fn conflict_resolved_remote_takes_server_content() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut store, transport) = setup(dir.path());
    store.set_prop("d", "name", json!("mine"));

    let mut remote = base_flows().into_records();
    remote[2].props.insert("name".to_owned(), json!("theirs"));
    write_flows(transport.path(), &Snapshot::new(remote));

    let mut session = SyncSession::new(transport);
    session.begin(&store).unwrap();
    let d = RecordId::new("d").unwrap();
    session.resolve(&d, Side::Remote).unwrap();

    let mut history = HistoryLog::default();
    session.commit(&mut store, &mut history).unwrap();
    let merged = store.current_snapshot();
    assert_eq!(
        merged.get("d").and_then(|r| r.prop("name")),
        Some(&json!("theirs"))
    );
    assert!(store.flags()[&d].changed);
}

#[test]
fn strict_codec_rejects_dangling_wires_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flowsync.toml");
    fs::write(&config_path, "[codec]\ndrop_dangling_refs = false\n").unwrap();
    let config = FlowSyncConfig::load(&config_path).unwrap();
    assert!(config.strict_refs());

    let base = base_flows();
    let (store, _) = FlowStore::load(Arc::new(config.registry()), &base, None).unwrap();
    let mut store = store.with_strict_refs(config.strict_refs());

    // Remote deletes `d`; local keeps the wire from `i` to it.
    let flows = dir.path().join("flows.json");
    write_flows(
        &flows,
        &snap(json!([
            { "id": "t", "type": "tab", "label": "Main" },
            { "id": "i", "type": "inject", "z": "t", "x": 10, "y": 10, "wires": [["d"]] }
        ])),
    );

    let mut session = SyncSession::new(FileTransport::new(&flows));
    let remote = session.begin(&store).unwrap().remote.candidate.to_snapshot();
    let before = store.current_snapshot();
    let mut history = HistoryLog::default();
    let err = session.commit(&mut store, &mut history).unwrap_err();
    assert!(matches!(err, FlowError::Parse { .. }));
    assert_eq!(store.current_snapshot(), before);
    assert!(history.is_empty());

    // Rejected before posting: the flows file is untouched.
    assert!(session.is_open());
    assert_eq!(session.transport_mut().fetch_remote().unwrap().snapshot, remote);
}

#[test]
fn invalid_config_is_reported_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowsync.toml");
    fs::write(&path, "[[registry.types]]\noutputs = 2\n").unwrap();
    let err = FlowSyncConfig::load(&path).unwrap_err();
    assert!(matches!(err, FlowError::Config { .. }));
    assert!(err.to_string().contains("flowsync.toml"));
}
