//! Snapshot lifecycle against a live pipeline.

use std::collections::{BTreeMap, BTreeSet};

use sheetsession_config::SessionSettings;
use sheetsession_engine::{
    AssetEntry, EventContext, FormTable, Pipeline, PipelineOptions, SheetKind, SourceCatalog,
    WorksheetParts,
};
use sheetsession_io::{
    decompress, filter_by_owner, reactivate, snapshot_sheet, CompressedSnapshot, SessionState,
    SnapshotStore,
};
use sheetsession_protocol::{Binding, Command, DataRef, Event, EventBody, FormValue};

fn parts() -> WorksheetParts {
    let mut bindings = BTreeMap::new();
    bindings.insert("grid".to_string(), Binding::to_table("orders").detail(DataRef::new("region")));
    let mut forms = BTreeMap::new();
    forms.insert(
        "grid".to_string(),
        FormTable::from_rows(2, vec![vec![FormValue::from("east"), FormValue::from(3.0)]]),
    );
    WorksheetParts {
        assemblies: BTreeSet::from(["grid".to_string()]),
        bindings,
        forms,
        join: None,
    }
}

fn pipeline() -> Pipeline {
    Pipeline::new(
        SourceCatalog::new().with_base_table("orders", &["region", "amount"]),
        PipelineOptions::default(),
    )
}

#[test]
fn edited_viewsheet_survives_snapshot_and_reactivation() {
    let mut pipeline = pipeline();
    let vs = pipeline.open_viewsheet(
        AssetEntry::viewsheet("dash/orders"),
        AssetEntry::worksheet("ws/orders"),
        "carol",
        BTreeSet::from(["kpi".to_string()]),
        parts(),
    );
    let mut ctx = EventContext::new();
    let events = vec![
        Event::new(vs.raw(), EventBody::AddAssembly { name: "notes".into() }),
        Event::new(
            vs.raw(),
            EventBody::EditFormCell {
                table: "grid".into(),
                row: 0,
                col: 1,
                value: Some(FormValue::from(4.5)),
                label: Some("adjusted".into()),
            },
        ),
    ];
    pipeline.process_request(&mut ctx, &events).unwrap();

    let before = SessionState::capture(pipeline.arena(), vs).unwrap();
    let snap = snapshot_sheet(pipeline.arena(), vs, 9).unwrap();
    assert_eq!(snap.kind(), SheetKind::Viewsheet);
    assert_eq!(snap.owner(), "carol");

    pipeline.close_sheet(vs).unwrap();
    assert!(pipeline.arena().is_empty());

    let restored = reactivate(&mut pipeline, &snap).unwrap();
    assert_ne!(restored, vs);
    assert_eq!(SessionState::capture(pipeline.arena(), restored).unwrap(), before);
    assert_eq!(pipeline.history(restored).unwrap().undo_count, 2);
}

#[test]
fn reactivated_sheet_keeps_working_history() {
    let mut pipeline = pipeline();
    let ws = pipeline.open_worksheet(AssetEntry::worksheet("ws/orders"), "carol", parts());
    let mut ctx = EventContext::new();
    pipeline
        .process_request(&mut ctx, &[Event::new(ws.raw(), EventBody::AddAssembly { name: "notes".into() })])
        .unwrap();

    let snap = snapshot_sheet(pipeline.arena(), ws, 6).unwrap();
    pipeline.close_sheet(ws).unwrap();
    let restored = reactivate(&mut pipeline, &snap).unwrap();
    assert!(pipeline.history(restored).unwrap().is_undoable());

    let undo = Event::new(restored.raw(), EventBody::Undo);
    let commands = pipeline.process_request(&mut ctx, &[undo]).unwrap().flush();
    assert!(commands.contains(&Command::HistoryChanged {
        undoable: false,
        redoable: true,
        undo_name: None,
        redo_name: Some("add_assembly".into()),
    }));

    let add = Event::new(restored.raw(), EventBody::AddAssembly { name: "pivot".into() });
    let commands = pipeline.process_request(&mut ctx, &[add]).unwrap().flush();
    assert!(commands.contains(&Command::HistoryChanged {
        undoable: true,
        redoable: false,
        undo_name: Some("add_assembly".into()),
        redo_name: None,
    }));
}

#[test]
fn viewsheet_stays_snapshottable_after_refused_nested_close() {
    let mut pipeline = pipeline();
    let vs = pipeline.open_viewsheet(
        AssetEntry::viewsheet("dash/orders"),
        AssetEntry::worksheet("ws/orders"),
        "carol",
        BTreeSet::new(),
        parts(),
    );
    let nested = pipeline.arena().get(vs).unwrap().as_viewsheet().unwrap().worksheet;
    let mut ctx = EventContext::new();

    let err = pipeline
        .process_request(&mut ctx, &[Event::new(nested.raw(), EventBody::CloseSheet)])
        .unwrap_err();
    assert_eq!(err.code(), "nested_worksheet");
    assert!(snapshot_sheet(pipeline.arena(), vs, 6).is_ok());
}

#[test]
fn store_on_disk_filters_by_owner_without_decoding() {
    let dir = tempfile::tempdir().unwrap();
    let settings = SessionSettings {
        snapshot_db: Some(dir.path().join("db").join("snapshots.sqlite")),
        ..SessionSettings::default()
    };
    let store = SnapshotStore::from_settings(&settings).unwrap();

    let mut pipeline = pipeline();
    let ws = pipeline.open_worksheet(AssetEntry::worksheet("ws/orders"), "carol", parts());
    let good = snapshot_sheet(pipeline.arena(), ws, settings.compression_level).unwrap();
    let corrupt = CompressedSnapshot::from_parts(b"not gzip".to_vec(), SheetKind::Worksheet, "carol");
    let other = CompressedSnapshot::from_parts(good.payload().to_vec(), SheetKind::Worksheet, "dave");

    store.put("carol/1", &good).unwrap();
    store.put("carol/2", &corrupt).unwrap();
    store.put("dave/1", &other).unwrap();

    assert_eq!(store.keys_for_owner("carol").unwrap(), vec!["carol/1", "carol/2"]);
    assert_eq!(store.len().unwrap(), 3);

    let loaded = store.get("carol/2").unwrap().unwrap();
    assert_eq!(loaded.owner(), "carol");
    assert_eq!(decompress(&loaded).unwrap_err().code(), "snapshot_decode");

    // reopening sees the same rows
    drop(store);
    let reopened = SnapshotStore::from_settings(&settings).unwrap();
    assert_eq!(reopened.get("carol/1").unwrap(), Some(good));
}

#[test]
fn in_memory_filter_keeps_corrupt_entries() {
    let corrupt = CompressedSnapshot::from_parts(Vec::new(), SheetKind::Worksheet, "erin");
    let mut pipeline = pipeline();
    let ws = pipeline.open_worksheet(AssetEntry::worksheet("ws/orders"), "frank", parts());
    let valid = snapshot_sheet(pipeline.arena(), ws, 0).unwrap();

    let all = vec![corrupt.clone(), valid.clone()];
    assert_eq!(filter_by_owner(&all, "erin"), vec![&corrupt]);
    assert_eq!(filter_by_owner(&all, "frank"), vec![&valid]);
    assert!(filter_by_owner(&all, "nobody").is_empty());
    assert!(decompress(&corrupt).is_err());
}
