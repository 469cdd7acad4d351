//! Derived-sequence propagation and cascade deletion

mod common;

use std::collections::BTreeMap;
use torusdb::{
    Database, DatabaseConfig, DeleteOptions, Edit, FieldKind, FieldType, InsertOptions, KeyCodec,
    KeyField, RingConfig, Schema, SchemaCatalog, ScanOptions, SelectOptions, SequenceConfig,
    SequenceKind, UpdateOptions, Value,
};

fn data(fields: &[(&str, Value)]) -> BTreeMap<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn indexed_db() -> Database {
    common::init_tracing();
    Database::open(DatabaseConfig {
        rings: vec![RingConfig {
            sequences: vec![
                SequenceConfig {
                    name: "by_category".into(),
                    kind: SequenceKind::Index,
                    key: vec![KeyField::int("category"), KeyField::int("id")],
                    payload: vec!["name".into()],
                    sums: vec![],
                    category: None,
                },
                SequenceConfig {
                    name: "view_totals".into(),
                    kind: SequenceKind::Aggregation,
                    key: vec![KeyField::int("category")],
                    payload: vec![],
                    sums: vec!["views".into()],
                    category: None,
                },
            ],
            ..RingConfig::memory("main")
        }],
        ..DatabaseConfig::default()
    })
    .unwrap()
}

fn index_key(category: i64, id: u64) -> Vec<u8> {
    KeyCodec::new(vec![FieldKind::Int, FieldKind::Int])
        .encode(&[Value::Int(category), Value::Int(id as i64)])
        .unwrap()
}

fn agg_key(category: i64) -> Vec<u8> {
    KeyCodec::new(vec![FieldKind::Int])
        .encode(&[Value::Int(category)])
        .unwrap()
}

fn scan_values(db: &Database, name: &str) -> Vec<(Vec<u8>, String)> {
    db.scan(name, &ScanOptions::default())
        .unwrap()
        .collect::<torusdb::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn insert_places_one_index_record() {
    let db = indexed_db();
    let id = db
        .insert(
            data(&[("category", Value::Int(7)), ("name", Value::from("x"))]),
            InsertOptions::default(),
        )
        .unwrap();

    let records = scan_values(&db, "by_category");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, index_key(7, id));
    assert_eq!(records[0].1, "{\"name\":\"x\"}");

    // Deleting the source removes the index record
    db.delete(id, &DeleteOptions::default()).unwrap();
    assert!(scan_values(&db, "by_category").is_empty());
}

#[test]
fn update_moves_index_record_between_keys() {
    let db = indexed_db();
    let id = db
        .insert(
            data(&[("category", Value::Int(7)), ("name", Value::from("x"))]),
            InsertOptions::default(),
        )
        .unwrap();
    db.update(
        id,
        &[Edit::Set {
            path: "category".into(),
            value: serde_json::json!(8),
        }],
        &UpdateOptions::default(),
    )
    .unwrap();

    let records = scan_values(&db, "by_category");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, index_key(8, id));
}

#[test]
fn every_data_record_appears_in_the_index_exactly_once() {
    let db = indexed_db();
    for i in 0..6 {
        db.insert(
            data(&[
                ("category", Value::Int(i % 2)),
                ("name", Value::from(format!("obj{}", i))),
            ]),
            InsertOptions::default(),
        )
        .unwrap();
    }
    let records = scan_values(&db, "by_category");
    assert_eq!(records.len(), 6);
    let mut keys: Vec<Vec<u8>> = records.iter().map(|(k, _)| k.clone()).collect();
    keys.dedup();
    assert_eq!(keys.len(), 6);
}

#[test]
fn aggregation_folds_and_unfolds() {
    let db = indexed_db();
    let mut ids = Vec::new();
    for views in [10, 20, 30] {
        ids.push(
            db.insert(
                data(&[("category", Value::Int(7)), ("views", Value::Int(views))]),
                InsertOptions::default(),
            )
            .unwrap(),
        );
    }
    let records = scan_values(&db, "view_totals");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, agg_key(7));
    assert_eq!(records[0].1, "[3,60]");

    db.delete(ids[0], &DeleteOptions::default()).unwrap();
    let records = scan_values(&db, "view_totals");
    assert_eq!(records[0].1, "[2,50]");

    // Removing the rest empties the accumulator away
    db.delete(ids[1], &DeleteOptions::default()).unwrap();
    db.delete(ids[2], &DeleteOptions::default()).unwrap();
    assert!(scan_values(&db, "view_totals").is_empty());
}

#[test]
fn update_of_summed_field_adjusts_the_accumulator() {
    let db = indexed_db();
    let id = db
        .insert(
            data(&[("category", Value::Int(7)), ("views", Value::Int(10))]),
            InsertOptions::default(),
        )
        .unwrap();
    db.update(
        id,
        &[Edit::Set {
            path: "views".into(),
            value: serde_json::json!(25),
        }],
        &UpdateOptions::default(),
    )
    .unwrap();
    let records = scan_values(&db, "view_totals");
    assert_eq!(records[0].1, "[1,25]");
}

#[test]
fn rebuild_indexes_restores_derived_state() {
    let db = indexed_db();
    for views in [10, 20] {
        db.insert(
            data(&[("category", Value::Int(7)), ("views", Value::Int(views))]),
            InsertOptions::default(),
        )
        .unwrap();
    }
    let before_index = scan_values(&db, "by_category");
    let before_totals = scan_values(&db, "view_totals");

    // Corrupt the derived state, then rebuild
    db.rings()[0]
        .derived_by_name("view_totals")
        .unwrap()
        .put(&agg_key(99), "[9,999]")
        .unwrap();
    db.rebuild_indexes().unwrap();

    assert_eq!(scan_values(&db, "by_category"), before_index);
    assert_eq!(scan_values(&db, "view_totals"), before_totals);

    // Idempotent: a second rebuild changes nothing
    db.rebuild_indexes().unwrap();
    assert_eq!(scan_values(&db, "view_totals"), before_totals);
}

fn cascade_db() -> Database {
    common::init_tracing();
    let catalog = SchemaCatalog::new(
        Schema::new()
            .with_field("child", FieldType::Ref { strong: true })
            .with_field("link", FieldType::Ref { strong: false }),
    );
    Database::open_with_catalog(
        DatabaseConfig {
            rings: vec![RingConfig::memory("main")],
            ..DatabaseConfig::default()
        },
        catalog,
    )
    .unwrap()
}

#[test]
fn dropping_a_strong_ref_cascades() {
    let db = cascade_db();
    let child = db.insert(data(&[]), InsertOptions::default()).unwrap();
    let parent = db
        .insert(
            data(&[("child", Value::Ref(child))]),
            InsertOptions::default(),
        )
        .unwrap();

    db.update(
        parent,
        &[Edit::Delete {
            path: "child".into(),
        }],
        &UpdateOptions::default(),
    )
    .unwrap();

    let err = db.select(child, &SelectOptions::default()).unwrap_err();
    assert!(err.is_not_found());
    assert!(db.select(parent, &SelectOptions::default()).is_ok());
}

#[test]
fn deleting_the_parent_cascades_transitively() {
    let db = cascade_db();
    let grandchild = db.insert(data(&[]), InsertOptions::default()).unwrap();
    let child = db
        .insert(
            data(&[("child", Value::Ref(grandchild))]),
            InsertOptions::default(),
        )
        .unwrap();
    let parent = db
        .insert(
            data(&[("child", Value::Ref(child))]),
            InsertOptions::default(),
        )
        .unwrap();

    assert_eq!(db.delete(parent, &DeleteOptions::default()).unwrap(), 1);
    assert!(db.select(child, &SelectOptions::default()).is_err());
    assert!(db.select(grandchild, &SelectOptions::default()).is_err());
}

#[test]
fn weak_refs_do_not_cascade() {
    let db = cascade_db();
    let target = db.insert(data(&[]), InsertOptions::default()).unwrap();
    let holder = db
        .insert(
            data(&[("link", Value::Ref(target))]),
            InsertOptions::default(),
        )
        .unwrap();

    db.delete(holder, &DeleteOptions::default()).unwrap();
    assert!(db.select(target, &SelectOptions::default()).is_ok());
}

#[test]
fn retargeted_strong_ref_cascades_only_the_dropped_target() {
    let db = cascade_db();
    let old = db.insert(data(&[]), InsertOptions::default()).unwrap();
    let new = db.insert(data(&[]), InsertOptions::default()).unwrap();
    let parent = db
        .insert(data(&[("child", Value::Ref(old))]), InsertOptions::default())
        .unwrap();

    db.update(
        parent,
        &[Edit::Set {
            path: "child".into(),
            value: serde_json::json!({"__ref": new}),
        }],
        &UpdateOptions::default(),
    )
    .unwrap();

    assert!(db.select(old, &SelectOptions::default()).is_err());
    assert!(db.select(new, &SelectOptions::default()).is_ok());
}

#[test]
fn provisional_refs_rectify_within_a_batch() {
    let db = cascade_db();
    let ids = db
        .insert_batch(
            vec![
                torusdb::InsertDraft::new(data(&[("child", Value::NewRef(1))])),
                torusdb::InsertDraft::new(data(&[("n", Value::from("b"))])),
            ],
            InsertOptions::default(),
        )
        .unwrap();

    let parent = db.select(ids[0], &SelectOptions::default()).unwrap();
    assert_eq!(parent["child"], serde_json::json!({"__ref": ids[1]}));

    // The rectified reference is strong: deleting the parent cascades
    db.delete(ids[0], &DeleteOptions::default()).unwrap();
    assert!(db.select(ids[1], &SelectOptions::default()).is_err());
}
