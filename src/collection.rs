use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::Strictness;
use crate::document::{now_timestamp, set_path, Document, CREATED_AT, ID_FIELD, UPDATED_AT};
use crate::error::{Error, Result};
use crate::find::{Find, Many, One};
use crate::pipeline::Pipeline;
use crate::query::Query;
use crate::storage::CollectionFile;
use crate::update::UpdateSpec;
use crate::value::normalize_date;

/// Options for [`Collection::find_one_and_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a document seeded from the query when nothing matches.
    pub upsert: bool,
    /// Return the document after the update. With `false` nothing is
    /// returned.
    pub return_new: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            upsert: false,
            return_new: true,
        }
    }
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self {
            upsert: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub modified_count: u64,
}

/// A mutated snapshot of a collection that has not been written yet.
///
/// Holding one across other writes is exactly the interleaving that loses
/// updates: `commit` replaces the file with this snapshot regardless of
/// what happened since it was read.
#[must_use = "a PendingWrite changes nothing until commit() is called"]
pub struct PendingWrite {
    file: Arc<CollectionFile>,
    op: &'static str,
    docs: Vec<Document>,
    target: Option<usize>,
    return_new: bool,
}

impl PendingWrite {
    /// The document this write touches, as it will be stored.
    pub fn document(&self) -> Option<&Document> {
        self.docs.get(self.target?)
    }

    pub fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    /// Write the snapshot. A no-op (nothing matched, no upsert) writes
    /// nothing and returns `None`.
    pub fn commit(self) -> Result<Option<Document>> {
        let Some(idx) = self.target else {
            return Ok(None);
        };
        self.file.write_all(&self.docs, self.op)?;
        if !self.return_new {
            return Ok(None);
        }
        Ok(self.docs.into_iter().nth(idx))
    }
}

/// Handle to one named collection. Clones share the backing file and carry
/// no cached documents.
#[derive(Clone)]
pub struct Collection {
    file: Arc<CollectionFile>,
    strictness: Strictness,
}

impl Collection {
    pub(crate) fn new(file: CollectionFile, strictness: Strictness) -> Self {
        Self {
            file: Arc::new(file),
            strictness,
        }
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub(crate) fn read_snapshot(&self) -> Vec<Document> {
        self.file.read_all()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Deferred read of every matching document. `null` or `{}` matches all.
    pub fn find(&self, query: Value) -> Find<Many> {
        Find::new(self.clone(), query)
    }

    /// Deferred read of the first matching document.
    pub fn find_one(&self, query: Value) -> Find<One> {
        Find::new(self.clone(), query)
    }

    pub fn find_by_id(&self, id: &str) -> Option<Document> {
        self.file
            .read_all()
            .into_iter()
            .find(|doc| doc.id() == Some(id))
    }

    pub fn count_documents(&self, query: &Value) -> Result<usize> {
        let query = Query::parse_with(query, self.strictness)?;
        let docs = self.file.read_all();
        if query == Query::All {
            return Ok(docs.len());
        }
        Ok(docs.iter().filter(|doc| query.matches(doc)).count())
    }

    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Document>> {
        let pipeline = Pipeline::parse_with(pipeline, self.strictness)?;
        Ok(pipeline.run(self.file.read_all()))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store a new document with a fresh `_id` and timestamps. Fields are
    /// stored as given; a caller supplied `createdAt`/`updatedAt` is kept,
    /// normalized to the timestamp format.
    pub fn create(&self, data: Value) -> Result<Document> {
        let doc = self.stamp_new(data)?;
        let mut docs = self.file.read_all();
        docs.push(doc.clone());
        self.file.write_all(&docs, "create")?;
        Ok(doc)
    }

    /// Like [`create`](Self::create) for several documents, with a single
    /// write.
    pub fn create_many(&self, data: Vec<Value>) -> Result<Vec<Document>> {
        let created = data
            .into_iter()
            .map(|d| self.stamp_new(d))
            .collect::<Result<Vec<_>>>()?;
        if created.is_empty() {
            return Ok(created);
        }
        let mut docs = self.file.read_all();
        docs.extend(created.iter().cloned());
        self.file.write_all(&docs, "createMany")?;
        Ok(created)
    }

    pub fn find_one_and_update(
        &self,
        query: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> Result<Option<Document>> {
        self.prepare("findOneAndUpdate", query, update, options)?.commit()
    }

    pub fn update_one(&self, query: &Value, update: &Value) -> Result<UpdateResult> {
        let pending = self.prepare("updateOne", query, update, UpdateOptions::default())?;
        let modified_count = if pending.is_noop() { 0 } else { 1 };
        pending.commit()?;
        Ok(UpdateResult { modified_count })
    }

    /// Read the collection and apply the update to the first match (or the
    /// upserted document) in memory. Nothing is written until
    /// [`PendingWrite::commit`].
    pub fn prepare_update(
        &self,
        query: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> Result<PendingWrite> {
        self.prepare("findOneAndUpdate", query, update, options)
    }

    /// Replace the stored document that has the same `_id`. `_id` and
    /// `createdAt` are kept from the stored copy. Returns `false` when no
    /// such document exists.
    pub fn save(&self, doc: &Document) -> Result<bool> {
        let Some(id) = doc.id() else {
            return Ok(false);
        };
        let mut docs = self.file.read_all();
        let Some(stored) = docs.iter_mut().find(|d| d.id() == Some(id)) else {
            return Ok(false);
        };

        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        if let Some(created) = stored.as_map().get(CREATED_AT) {
            map.insert(CREATED_AT.to_string(), created.clone());
        }
        for (key, value) in doc.as_map() {
            if key != ID_FIELD && key != CREATED_AT {
                map.insert(key.clone(), value.clone());
            }
        }
        map.insert(UPDATED_AT.to_string(), Value::String(now_timestamp()));
        *stored = Document::from_map(map);

        self.file.write_all(&docs, "save")?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn prepare(
        &self,
        op: &'static str,
        query_json: &Value,
        update_json: &Value,
        options: UpdateOptions,
    ) -> Result<PendingWrite> {
        let query = Query::parse_with(query_json, self.strictness)?;
        let update = UpdateSpec::parse_with(update_json, self.strictness)?;

        let mut docs = self.file.read_all();
        let mut target = docs.iter().position(|doc| query.matches(doc));

        if target.is_none() && options.upsert {
            let seed = self.upsert_seed(query_json, &docs)?;
            docs.push(seed);
            target = Some(docs.len() - 1);
        }

        if let Some(idx) = target {
            let doc = &mut docs[idx];
            update.apply(doc);
            doc.insert(UPDATED_AT, Value::String(now_timestamp()));
        }

        Ok(PendingWrite {
            file: Arc::clone(&self.file),
            op,
            docs,
            target,
            return_new: options.return_new,
        })
    }

    fn stamp_new(&self, data: Value) -> Result<Document> {
        let Value::Object(data) = data else {
            return Err(Error::NotAnObject);
        };
        let now = now_timestamp();
        let mut created_at = Value::String(now.clone());
        let mut updated_at = Value::String(now);

        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Value::String(self.file.new_id()));
        for (key, value) in data {
            match key.as_str() {
                ID_FIELD => log::debug!("create ignores caller supplied _id in '{}'", self.name()),
                CREATED_AT if !value.is_null() => created_at = normalize_date(value),
                UPDATED_AT if !value.is_null() => updated_at = normalize_date(value),
                CREATED_AT | UPDATED_AT => {}
                _ => {
                    map.insert(key, value);
                }
            }
        }
        map.insert(CREATED_AT.to_string(), created_at);
        map.insert(UPDATED_AT.to_string(), updated_at);
        Ok(Document::from_map(map))
    }

    /// New document for an upsert: literal (non-operator) fields of the
    /// query plus identity and timestamps. A literal string `_id` in the
    /// query is used unless a stored document already has it.
    fn upsert_seed(&self, query: &Value, docs: &[Document]) -> Result<Document> {
        let now = now_timestamp();
        let mut map = Map::new();
        let literal_id = match query.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) if docs.iter().any(|d| d.id() == Some(id)) => {
                let msg = format!("upsert _id '{id}' is already taken in '{}'", self.name());
                if self.strictness.is_strict() {
                    return Err(Error::InvalidUpdate(msg));
                }
                log::warn!("{msg}, assigning a fresh id");
                None
            }
            other => other.map(str::to_string),
        };
        map.insert(
            ID_FIELD.to_string(),
            Value::String(literal_id.unwrap_or_else(|| self.file.new_id())),
        );

        if let Some(fields) = query.as_object() {
            for (key, value) in fields {
                let is_operator = value
                    .as_object()
                    .is_some_and(|o| o.keys().any(|k| k.starts_with('$')));
                if key.starts_with('$') || key == ID_FIELD || is_operator {
                    continue;
                }
                set_path(&mut map, key, value.clone());
            }
        }
        map.insert(CREATED_AT.to_string(), Value::String(now.clone()));
        map.insert(UPDATED_AT.to_string(), Value::String(now));
        Ok(Document::from_map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, WriteMode};
    use crate::engine::Store;
    use serde_json::json;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Collection {
        Store::open(StoreConfig::new(dir)).unwrap().collection("things").unwrap()
    }

    #[test]
    fn create_assigns_identity_and_timestamps() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let doc = things.create(json!({"name": "a", "_id": "mine"})).unwrap();

        let id = doc.id().unwrap();
        assert_eq!(id.len(), 24);
        assert_ne!(id, "mine");
        assert_eq!(doc.created_at(), doc.updated_at());
        assert_eq!(doc.get("name"), Some(&json!("a")));

        let keys: Vec<&String> = doc.as_map().keys().collect();
        assert_eq!(keys, ["_id", "name", "createdAt", "updatedAt"]);
    }

    #[test]
    fn create_normalizes_only_timestamp_fields() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let doc = things
            .create(json!({"createdAt": "2023-06-01T08:00:00+02:00", "seenAt": "2023-06-02T00:00:00"}))
            .unwrap();
        assert_eq!(doc.created_at(), Some("2023-06-01T06:00:00.000Z"));
        assert_eq!(doc.get("seenAt"), Some(&json!("2023-06-02T00:00:00")));
        assert_ne!(doc.updated_at(), doc.created_at());
    }

    #[test]
    fn create_rejects_non_objects() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        assert!(matches!(things.create(json!([1])), Err(Error::NotAnObject)));
        assert_eq!(things.count_documents(&Value::Null).unwrap(), 0);
    }

    #[test]
    fn create_many_writes_once_and_keeps_order() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let created = things
            .create_many(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .unwrap();
        assert_eq!(created.len(), 3);
        let stored = things.find(json!({})).exec().unwrap();
        assert_eq!(stored, created);
    }

    #[test]
    fn find_by_id_and_count() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let a = things.create(json!({"kind": "x"})).unwrap();
        things.create(json!({"kind": "y"})).unwrap();

        assert_eq!(things.find_by_id(a.id().unwrap()), Some(a));
        assert_eq!(things.find_by_id("nope"), None);
        assert_eq!(things.count_documents(&json!({})).unwrap(), 2);
        assert_eq!(things.count_documents(&json!({"kind": "y"})).unwrap(), 1);
    }

    #[test]
    fn find_one_and_update_returns_new_or_nothing() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        things.create(json!({"k": 1, "v": "a"})).unwrap();

        let updated = things
            .find_one_and_update(&json!({"k": 1}), &json!({"v": "b"}), UpdateOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("v"), Some(&json!("b")));

        let quiet = UpdateOptions {
            return_new: false,
            ..UpdateOptions::default()
        };
        let none = things
            .find_one_and_update(&json!({"k": 1}), &json!({"v": "c"}), quiet)
            .unwrap();
        assert!(none.is_none());
        assert_eq!(things.find_one(json!({"k": 1})).exec().unwrap().unwrap().get("v"), Some(&json!("c")));
    }

    #[test]
    fn no_match_without_upsert_writes_nothing() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let got = things
            .find_one_and_update(&json!({"k": 1}), &json!({"v": 1}), UpdateOptions::default())
            .unwrap();
        assert!(got.is_none());
        assert_eq!(std::fs::read_to_string(dir.path().join("things.json")).unwrap(), "[]");
    }

    #[test]
    fn update_refreshes_updated_at_only() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let doc = things
            .create(json!({"k": 1, "createdAt": "2020-01-01T00:00:00Z", "updatedAt": "2020-01-01T00:00:00Z"}))
            .unwrap();

        let res = things.update_one(&json!({"k": 1}), &json!({"$set": {"v": true}})).unwrap();
        assert_eq!(res.modified_count, 1);

        let after = things.find_by_id(doc.id().unwrap()).unwrap();
        assert_eq!(after.created_at(), Some("2020-01-01T00:00:00.000Z"));
        assert_ne!(after.updated_at(), Some("2020-01-01T00:00:00.000Z"));
        assert_eq!(after.id(), doc.id());

        let res = things.update_one(&json!({"k": 2}), &json!({"v": false})).unwrap();
        assert_eq!(res.modified_count, 0);
    }

    #[test]
    fn upsert_seeds_from_query_literals() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let doc = things
            .find_one_and_update(
                &json!({"patientId": "P1", "age": {"$gte": 3}, "$or": [{"a": 1}]}),
                &json!({"granted": true}),
                UpdateOptions::upsert(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(doc.get("patientId"), Some(&json!("P1")));
        assert_eq!(doc.get("granted"), Some(&json!(true)));
        assert!(!doc.contains("age"));
        assert!(!doc.contains("$or"));
        assert!(doc.created_at().is_some());
    }

    #[test]
    fn upsert_uses_literal_string_id() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let doc = things
            .find_one_and_update(&json!({"_id": "fixed"}), &json!({"n": 1}), UpdateOptions::upsert())
            .unwrap()
            .unwrap();
        assert_eq!(doc.id(), Some("fixed"));
        assert!(things.find_by_id("fixed").is_some());
    }

    #[test]
    fn upsert_with_taken_id_gets_a_fresh_one() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let existing = things.create(json!({"granted": true})).unwrap();
        let id = existing.id().unwrap();

        let doc = things
            .find_one_and_update(&json!({"_id": id, "granted": false}), &json!({"x": 1}), UpdateOptions::upsert())
            .unwrap()
            .unwrap();
        assert_ne!(doc.id(), Some(id));
        assert_eq!(doc.get("granted"), Some(&json!(false)));
        assert_eq!(things.count_documents(&json!({"_id": id})).unwrap(), 1);
        assert_eq!(things.count_documents(&json!({})).unwrap(), 2);
        assert_eq!(things.find_by_id(id), Some(existing));
    }

    #[test]
    fn strict_upsert_rejects_taken_id() {
        let dir = tempdir().unwrap();
        let things = Store::open(StoreConfig::new(dir.path()).strictness(Strictness::Strict))
            .unwrap()
            .collection("things")
            .unwrap();
        let existing = things.create(json!({"granted": true})).unwrap();
        let id = existing.id().unwrap();

        let res = things.find_one_and_update(&json!({"_id": id, "granted": false}), &json!({"x": 1}), UpdateOptions::upsert());
        assert!(matches!(res, Err(Error::InvalidUpdate(_))));
        assert_eq!(things.count_documents(&json!({})).unwrap(), 1);
    }

    #[test]
    fn save_replaces_and_keeps_identity() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let mut doc = things.create(json!({"name": "a", "extra": 1})).unwrap();
        let created = doc.created_at().map(str::to_string);

        doc.insert("name", json!("b"));
        doc.remove("extra");
        doc.insert("createdAt", json!("1999-01-01T00:00:00Z"));
        assert!(things.save(&doc).unwrap());

        let stored = things.find_by_id(doc.id().unwrap()).unwrap();
        assert_eq!(stored.get("name"), Some(&json!("b")));
        assert!(!stored.contains("extra"));
        assert_eq!(stored.created_at().map(str::to_string), created);
        assert_eq!(things.count_documents(&Value::Null).unwrap(), 1);
    }

    #[test]
    fn save_unknown_document_is_false() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        let ghost = Document::new(json!({"_id": "ghost"})).unwrap();
        assert!(!things.save(&ghost).unwrap());
        assert!(!things.save(&Document::default()).unwrap());
        assert_eq!(things.count_documents(&Value::Null).unwrap(), 0);
    }

    #[test]
    fn pending_write_is_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let things = open(dir.path());
        things.create(json!({"k": 1, "n": 0})).unwrap();

        let pending = things
            .prepare_update(&json!({"k": 1}), &json!({"n": 5}), UpdateOptions::default())
            .unwrap();
        assert_eq!(pending.document().unwrap().get("n"), Some(&json!(5)));
        assert_eq!(things.find_one(json!({})).exec().unwrap().unwrap().get("n"), Some(&json!(0)));

        pending.commit().unwrap();
        assert_eq!(things.find_one(json!({})).exec().unwrap().unwrap().get("n"), Some(&json!(5)));
    }

    #[test]
    fn clones_observe_each_others_writes() {
        let dir = tempdir().unwrap();
        let a = open(dir.path());
        let b = a.clone();
        a.create(json!({"x": 1})).unwrap();
        assert_eq!(b.count_documents(&json!({})).unwrap(), 1);
    }

    #[test]
    fn aggregate_reads_collection() {
        let dir = tempdir().unwrap();
        let store = Store::open(StoreConfig::new(dir.path()).write_mode(WriteMode::AtomicRename)).unwrap();
        let files = store.collection("files").unwrap();
        files
            .create_many(vec![
                json!({"owner": "a", "size": 10}),
                json!({"owner": "b", "size": 5}),
                json!({"owner": "a", "size": 1}),
            ])
            .unwrap();
        let out = files
            .aggregate(&json!([
                {"$group": {"_id": "$owner", "bytes": {"$sum": "$size"}}},
                {"$sort": {"bytes": 1}}
            ]))
            .unwrap();
        let out: Vec<Value> = out.into_iter().map(Document::into_value).collect();
        assert_eq!(out, vec![json!({"_id": "b", "bytes": 5}), json!({"_id": "a", "bytes": 11})]);
    }
}
