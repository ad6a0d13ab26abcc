use std::collections::HashSet;
use std::fs;
use std::path::Path;

use docstore::{
    Collection, Document, Error, SortSpec, Store, StoreConfig, Strictness, UpdateOptions, WriteMode,
};
use serde_json::{json, Value};
use tempfile::tempdir;

fn collection(dir: &Path, name: &str) -> Collection {
    Store::open(StoreConfig::new(dir)).unwrap().collection(name).unwrap()
}

fn values(docs: Vec<Document>) -> Vec<Value> {
    docs.into_iter().map(Document::into_value).collect()
}

#[test]
fn create_then_find_by_id_round_trips() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    let data = json!({"name": "Alice", "role": "doctor", "tags": ["a", "b"], "meta": {"x": 1}});

    let created = users.create(data.clone()).unwrap();
    let found = users.find_by_id(created.id().unwrap()).unwrap();
    assert_eq!(found, created);

    let mut stripped = found.into_map();
    assert!(stripped.shift_remove("_id").is_some());
    assert!(stripped.shift_remove("createdAt").is_some());
    assert!(stripped.shift_remove("updatedAt").is_some());
    assert_eq!(Value::Object(stripped), data);
}

#[test]
fn date_strings_round_trip_unchanged() {
    let dir = tempdir().unwrap();
    let logs = collection(dir.path(), "access-logs");
    let data = json!({"at": "2024-01-15T10:30:00Z", "local": "2024-01-15T10:30:00", "day": "2024-01-15"});

    let created = logs.create(data.clone()).unwrap();
    let mut stored = logs.find_by_id(created.id().unwrap()).unwrap().into_map();
    stored.shift_remove("_id");
    stored.shift_remove("createdAt");
    stored.shift_remove("updatedAt");
    assert_eq!(Value::Object(stored), data);

    let mut saved = created.clone();
    saved.insert("at", json!("2024-02-01T00:00:00+01:00"));
    assert!(logs.save(&saved).unwrap());
    let reread = logs.find_by_id(created.id().unwrap()).unwrap();
    assert_eq!(reread.get("at"), Some(&json!("2024-02-01T00:00:00+01:00")));
}

#[test]
fn ids_are_unique() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    let mut ids = HashSet::new();
    for i in 0..200 {
        let doc = users.create(json!({"i": i})).unwrap();
        assert!(ids.insert(doc.id().unwrap().to_string()));
    }
    let many = users.create_many((0..50).map(|i| json!({"j": i})).collect()).unwrap();
    for doc in many {
        assert!(ids.insert(doc.id().unwrap().to_string()));
    }
}

#[test]
fn equality_query_keeps_original_order() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    users.create(json!({"role": "doctor", "n": 1})).unwrap();
    users.create(json!({"role": "patient", "n": 2})).unwrap();
    users.create(json!({"role": "patient", "n": 3})).unwrap();

    let found = users.find(json!({"role": "patient"})).exec().unwrap();
    let ns: Vec<&Value> = found.iter().map(|d| d.get("n").unwrap()).collect();
    assert_eq!(ns, [&json!(2), &json!(3)]);
}

#[test]
fn range_operators_select_window() {
    let dir = tempdir().unwrap();
    let records = collection(dir.path(), "medical-records");
    for size in [500, 2000, 50000] {
        records.create(json!({"fileSize": size})).unwrap();
    }
    let found = records
        .find(json!({"fileSize": {"$gte": 1000, "$lte": 10000}}))
        .exec()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("fileSize"), Some(&json!(2000)));
}

#[test]
fn date_queries_compare_instants() {
    let dir = tempdir().unwrap();
    let logs = collection(dir.path(), "access-logs");
    logs.create(json!({"at": "2024-01-10T12:00:00+02:00"})).unwrap();
    logs.create(json!({"at": "2024-03-01T00:00:00Z"})).unwrap();

    // Stored as written; comparisons go by instant.
    let first = logs.find_one(json!({})).exec().unwrap().unwrap();
    assert_eq!(first.get("at"), Some(&json!("2024-01-10T12:00:00+02:00")));

    let hits = logs.count_documents(&json!({"at": "2024-01-10T10:00:00Z"})).unwrap();
    assert_eq!(hits, 1);
    let later = logs
        .count_documents(&json!({"at": {"$gt": "2024-02-01T00:00:00.000Z"}}))
        .unwrap();
    assert_eq!(later, 1);
}

#[test]
fn upsert_creates_then_updates_same_document() {
    let dir = tempdir().unwrap();
    let perms = collection(dir.path(), "access-permissions");
    let query = json!({"patientId": "PAT1", "doctorId": "DOC1"});

    let first = perms
        .find_one_and_update(
            &query,
            &json!({"granted": true, "$unset": {"revokedAt": 1}}),
            UpdateOptions::upsert(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(perms.count_documents(&Value::Null).unwrap(), 1);
    assert_eq!(first.get("granted"), Some(&json!(true)));
    assert!(!first.contains("revokedAt"));
    assert_eq!(first.get("patientId"), Some(&json!("PAT1")));

    let second = perms
        .find_one_and_update(
            &query,
            &json!({"granted": false, "revokedAt": "2024-05-01T09:00:00Z"}),
            UpdateOptions::upsert(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(perms.count_documents(&Value::Null).unwrap(), 1);
    assert_eq!(second.id(), first.id());
    assert_eq!(second.created_at(), first.created_at());
    assert_eq!(second.get("granted"), Some(&json!(false)));
    assert_eq!(second.get("revokedAt"), Some(&json!("2024-05-01T09:00:00Z")));
    assert_eq!(second.get("doctorId"), Some(&json!("DOC1")));
}

#[test]
fn sort_and_projection_through_builder() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    users.create(json!({"name": "B", "age": 1, "password": "p"})).unwrap();
    users.create(json!({"name": "A", "age": 1, "password": "p"})).unwrap();
    users.create(json!({"name": "A", "age": 2, "password": "p"})).unwrap();

    let docs = users
        .find(Value::Null)
        .sort(SortSpec::new().asc("name"))
        .select("-password -_id -createdAt -updatedAt")
        .exec()
        .unwrap();
    assert_eq!(
        values(docs),
        vec![
            json!({"name": "A", "age": 1}),
            json!({"name": "A", "age": 2}),
            json!({"name": "B", "age": 1}),
        ]
    );
}

#[test]
fn data_survives_reopen() {
    let dir = tempdir().unwrap();
    let id = {
        let users = collection(dir.path(), "users");
        users.create(json!({"name": "kept"})).unwrap().id().unwrap().to_string()
    };

    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(store.list_collections().unwrap(), ["users"]);
    let users = store.collection("users").unwrap();
    assert_eq!(users.find_by_id(&id).unwrap().get("name"), Some(&json!("kept")));

    let raw: Value = serde_json::from_str(&fs::read_to_string(dir.path().join("users.json")).unwrap()).unwrap();
    assert_eq!(raw.as_array().unwrap().len(), 1);
}

#[test]
fn interleaved_updates_lose_the_first_write() {
    let dir = tempdir().unwrap();
    let counters = collection(dir.path(), "counters");
    counters.create(json!({"key": "visits", "a": 0, "b": 0})).unwrap();
    let query = json!({"key": "visits"});

    // Both read the same snapshot before either writes.
    let first = counters
        .prepare_update(&query, &json!({"a": 1}), UpdateOptions::default())
        .unwrap();
    let second = counters
        .prepare_update(&query, &json!({"b": 1}), UpdateOptions::default())
        .unwrap();
    first.commit().unwrap();
    second.commit().unwrap();

    let stored = counters.find_one(query).exec().unwrap().unwrap();
    assert_eq!(stored.get("b"), Some(&json!(1)));
    assert_eq!(stored.get("a"), Some(&json!(0)), "first update was overwritten");
}

#[test]
fn interleaved_upserts_keep_only_the_last_snapshot() {
    let dir = tempdir().unwrap();
    let perms = collection(dir.path(), "access-permissions");
    let query = json!({"patientId": "PAT9"});

    let first = perms
        .prepare_update(&query, &json!({"granted": true}), UpdateOptions::upsert())
        .unwrap();
    let second = perms
        .prepare_update(&query, &json!({"granted": true}), UpdateOptions::upsert())
        .unwrap();
    first.commit().unwrap();
    second.commit().unwrap();

    // The second snapshot never saw the first insert, so only one survives.
    assert_eq!(perms.count_documents(&query).unwrap(), 1);
}

#[test]
fn sequential_updates_do_not_lose_writes() {
    let dir = tempdir().unwrap();
    let counters = collection(dir.path(), "counters");
    counters.create(json!({"key": "visits"})).unwrap();
    let query = json!({"key": "visits"});

    counters.update_one(&query, &json!({"a": 1})).unwrap();
    counters.update_one(&query, &json!({"b": 1})).unwrap();

    let stored = counters.find_one(query).exec().unwrap().unwrap();
    assert_eq!(stored.get("a"), Some(&json!(1)));
    assert_eq!(stored.get("b"), Some(&json!(1)));
}

#[test]
fn atomic_rename_mode_persists() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path()).write_mode(WriteMode::AtomicRename)).unwrap();
    let users = store.collection("users").unwrap();
    users.create(json!({"n": 1})).unwrap();
    users.update_one(&json!({"n": 1}), &json!({"$set": {"n": 2}})).unwrap();

    assert_eq!(users.count_documents(&json!({"n": 2})).unwrap(), 1);
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn corrupt_file_reads_as_empty_and_is_replaced_on_write() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    fs::write(dir.path().join("users.json"), "{ not json").unwrap();

    assert!(users.find(json!({})).exec().unwrap().is_empty());
    assert_eq!(users.count_documents(&json!({})).unwrap(), 0);
    assert!(users.find_one(json!({})).exec().unwrap().is_none());

    users.create(json!({"fresh": true})).unwrap();
    assert_eq!(users.count_documents(&json!({})).unwrap(), 1);
}

#[test]
fn lenient_mode_ignores_unknown_operators() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    users.create(json!({"name": "a"})).unwrap();
    users.create(json!({"name": "b"})).unwrap();

    let n = users
        .count_documents(&json!({"name": {"$regex": "^a"}}))
        .unwrap();
    assert_eq!(n, 2);
    let grouped = users
        .aggregate(&json!([{"$limit": 1}, {"$group": {"_id": null, "n": {"$sum": 1}}}]))
        .unwrap();
    assert_eq!(values(grouped), vec![json!({"_id": null, "n": 2})]);
}

#[test]
fn strict_mode_rejects_unknown_operators() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path()).strictness(Strictness::Strict)).unwrap();
    let users = store.collection("users").unwrap();
    users.create(json!({"name": "a"})).unwrap();

    assert!(matches!(
        users.count_documents(&json!({"name": {"$regex": "^a"}})),
        Err(Error::InvalidQuery(_))
    ));
    assert!(matches!(
        users.update_one(&json!({}), &json!({"$inc": {"n": 1}})),
        Err(Error::InvalidUpdate(_))
    ));
    assert!(matches!(
        users.aggregate(&json!([{"$limit": 1}])),
        Err(Error::InvalidPipeline(_))
    ));
    // Rejected updates write nothing.
    let stored = users.find_one(json!({})).exec().unwrap().unwrap();
    assert!(!stored.contains("n"));
}

#[test]
fn collections_are_independent() {
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let users = store.collection("users").unwrap();
    let logs = store.collection("access-logs").unwrap();
    users.create(json!({"a": 1})).unwrap();
    logs.create(json!({"b": 1})).unwrap();
    logs.create(json!({"b": 2})).unwrap();

    assert_eq!(users.count_documents(&json!({})).unwrap(), 1);
    assert_eq!(logs.count_documents(&json!({})).unwrap(), 2);
}

#[test]
fn failed_writes_report_context_and_change_nothing() {
    let dir = tempdir().unwrap();
    let users = collection(dir.path(), "users");
    let original = users.create(json!({"name": "kept"})).unwrap();

    let path = dir.path().join("users.json");
    let saved = fs::read_to_string(&path).unwrap();
    fs::remove_file(&path).unwrap();
    fs::create_dir(&path).unwrap();

    match users.create(json!({"name": "lost"})) {
        Err(Error::Write { collection, op, .. }) => {
            assert_eq!(collection, "users");
            assert_eq!(op, "create");
        }
        other => panic!("expected a write error, got {other:?}"),
    }
    // Reading a directory yields an empty collection, so only an upsert writes.
    let res = users.find_one_and_update(&json!({"k": 1}), &json!({"v": 2}), UpdateOptions::upsert());
    assert!(matches!(res, Err(Error::Write { op: "findOneAndUpdate", .. })));

    fs::remove_dir(&path).unwrap();
    fs::write(&path, saved).unwrap();
    let all = users.find(json!({})).exec().unwrap();
    assert_eq!(all, vec![original]);
}
