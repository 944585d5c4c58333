//! Single-process table store backed by one JSON document on disk.
//!
//! Every mutation rewrites the whole document to a sibling temp file and
//! renames it over the real path. A write that arrives while another one is
//! still being flushed updates memory only; its rows are picked up by the
//! next flush. There is no cross-process locking.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::codec::{decode_entity, encode_entity, FieldValue, TableRecord};
use super::filter::FieldFilter;
use super::init::InitGuard;
use super::{ExtraFields, ExtraFieldsFn, StoredEntity, TableStore};
use crate::error::{FeedscopeError, Result};
use crate::model::paginate;

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
    version: u32,
    last_modified: i64,
    entities: BTreeMap<String, BTreeMap<String, StoredRow>>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            last_modified: 0,
            entities: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    id: String,
    partition: String,
    data: BTreeMap<String, FieldValue>,
    timestamp: i64,
    /// Changed in memory since the last flush.
    dirty: bool,
}

impl StoredRow {
    fn from_record(record: TableRecord, timestamp: i64) -> Self {
        Self {
            id: record.row_key,
            partition: record.partition_key,
            data: record.fields,
            timestamp,
            dirty: true,
        }
    }

    fn to_record(&self) -> TableRecord {
        TableRecord {
            partition_key: self.partition.clone(),
            row_key: self.id.clone(),
            fields: self.data.clone(),
        }
    }
}

pub struct LocalTableStore<T> {
    path: PathBuf,
    document: InitGuard<Mutex<StoreDocument>>,
    flushing: AtomicBool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: StoredEntity> LocalTableStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: InitGuard::new(),
            flushing: AtomicBool::new(false),
            _entity: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn document(&self) -> Result<&Mutex<StoreDocument>> {
        self.document
            .get_or_init(|| async { load_document(&self.path).await.map(Mutex::new) })
            .await
    }

    /// Apply `change` in memory, then flush the document unless another
    /// flush is already in flight.
    async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut StoreDocument),
    {
        let mut document = self.document().await?.lock().await;
        change(&mut document);

        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!("Flush of {} already in flight, skipping", self.path.display());
            return Ok(());
        }

        document.last_modified = Utc::now().timestamp_millis();
        for row in document.entities.values_mut().flat_map(|p| p.values_mut()) {
            row.dirty = false;
        }
        let bytes = match serde_json::to_vec_pretty(&*document) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.flushing.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        drop(document);

        let result = write_atomically(&self.path, &bytes).await;
        self.flushing.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            error!("Failed to persist {}: {}", self.path.display(), e);
        }
        result
    }

    /// Matching rows decoded in partition then key order. Corrupt rows are
    /// skipped.
    async fn select(
        &self,
        filter: Option<&FieldFilter>,
        partition: Option<&str>,
    ) -> Result<Vec<T>> {
        let document = self.document().await?.lock().await;

        let partitions: Vec<&BTreeMap<String, StoredRow>> = match partition {
            Some(p) => document.entities.get(p).into_iter().collect(),
            None => document.entities.values().collect(),
        };

        let mut out = Vec::new();
        for row in partitions.into_iter().flat_map(|p| p.values()) {
            let record = row.to_record();
            if filter.is_some_and(|f| !f.matches(&record)) {
                continue;
            }
            if let Some(entity) = decode_entity(&record) {
                out.push(entity);
            }
        }
        Ok(out)
    }
}

async fn load_document(path: &Path) -> Result<StoreDocument> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No store at {}, starting empty", path.display());
            return Ok(StoreDocument::default());
        }
        Err(e) => return Err(e.into()),
    };

    let document: StoreDocument = serde_json::from_str(&data).map_err(|e| {
        error!("Store {} is unreadable: {}", path.display(), e);
        FeedscopeError::Format(format!("{}: {}", path.display(), e))
    })?;

    if document.version != DOCUMENT_VERSION {
        error!("Store {} has unsupported version {}", path.display(), document.version);
        return Err(FeedscopeError::Format(format!(
            "{}: unsupported version {}",
            path.display(),
            document.version
        )));
    }

    let rows: usize = document.entities.values().map(|p| p.len()).sum();
    info!("Loaded {} rows from {}", rows, path.display());
    Ok(document)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl<T: StoredEntity> TableStore<T> for LocalTableStore<T> {
    async fn get(&self, key: &str, partition: &str) -> Result<Option<T>> {
        let document = self.document().await?.lock().await;
        Ok(document
            .entities
            .get(partition)
            .and_then(|p| p.get(key))
            .and_then(|row| decode_entity(&row.to_record())))
    }

    async fn get_all(&self, top: Option<usize>, skip: usize) -> Result<Vec<T>> {
        let all = self.select(None, None).await?;
        Ok(paginate(all, top, skip))
    }

    async fn query(
        &self,
        filter: Option<&str>,
        partition: Option<&str>,
        top: Option<usize>,
        skip: usize,
    ) -> Result<Vec<T>> {
        let parsed = match filter {
            Some(raw) => match FieldFilter::parse(raw) {
                Some(parsed) => Some(parsed),
                None => {
                    warn!("Unsupported filter for local store: {}", raw);
                    return Ok(Vec::new());
                }
            },
            None => None,
        };

        let matched = self.select(parsed.as_ref(), partition).await?;
        Ok(paginate(matched, top, skip))
    }

    async fn write(&self, data: &T, partition: &str, extra: Option<&ExtraFields>) -> Result<()> {
        let record = encode_entity(data, partition, &data.row_key(), extra)?;
        let now = Utc::now().timestamp_millis();
        self.mutate(|document| insert_row(document, StoredRow::from_record(record, now)))
            .await
    }

    async fn write_batch(
        &self,
        data: &[T],
        partition: &str,
        extra: Option<ExtraFieldsFn<T>>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let records = data
            .iter()
            .map(|entity| {
                let fields = extra.map(|f| f(entity));
                encode_entity(entity, partition, &entity.row_key(), fields.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;

        let now = Utc::now().timestamp_millis();
        self.mutate(|document| {
            for record in records {
                insert_row(document, StoredRow::from_record(record, now));
            }
        })
        .await
    }

    async fn delete(&self, key: &str, partition: &str) -> Result<()> {
        self.mutate(|document| remove_row(document, partition, key))
            .await
    }

    async fn delete_batch(&self, keys: &[String], partition: &str) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.mutate(|document| {
            for key in keys {
                remove_row(document, partition, key);
            }
        })
        .await
    }
}

fn insert_row(document: &mut StoreDocument, row: StoredRow) {
    document
        .entities
        .entry(row.partition.clone())
        .or_default()
        .insert(row.id.clone(), row);
}

fn remove_row(document: &mut StoreDocument, partition: &str, key: &str) {
    if let Some(rows) = document.entities.get_mut(partition) {
        rows.remove(key);
        if rows.is_empty() {
            document.entities.remove(partition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{CHUNK_SIZE, MAX_CHUNKS};
    use crate::storage::ExtraValue;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
        stamp: i64,
    }

    impl StoredEntity for Note {
        fn row_key(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str, stamp: i64) -> Note {
        Note {
            id: id.to_string(),
            body: format!("note {}", id),
            stamp,
        }
    }

    fn note_extra(note: &Note) -> ExtraFields {
        vec![("stamp".to_string(), ExtraValue::Int(note.stamp))]
    }

    fn store_in(dir: &tempfile::TempDir) -> LocalTableStore<Note> {
        LocalTableStore::new(dir.path().join("notes.json"))
    }

    #[tokio::test]
    async fn test_write_then_read_from_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&note("a", 1), "p1", None).await.unwrap();

        let reopened = store_in(&dir);
        assert_eq!(reopened.get("a", "p1").await.unwrap(), Some(note("a", 1)));
        assert_eq!(reopened.get("a", "p2").await.unwrap(), None);
        assert_eq!(reopened.get("missing", "p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&note("a", 1), "p1", None).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["lastModified"].as_i64().unwrap() > 0);
        let row = &json["entities"]["p1"]["a"];
        assert_eq!(row["id"], "a");
        assert_eq!(row["partition"], "p1");
        assert_eq!(row["dirty"], false);
        assert_eq!(row["data"]["isProto"]["value"], false);
        assert_eq!(row["data"]["dataChunks"]["value"], 1);
        assert_eq!(row["data"]["dataChunk_0"]["type"], "Binary");
    }

    #[tokio::test]
    async fn test_query_by_int_extra() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let notes = vec![
            note("old", 1_600_000_000_000),
            note("edge", 1_700_000_000_000),
            note("new", 1_800_000_000_000),
        ];
        store.write_batch(&notes, "p", Some(note_extra)).await.unwrap();

        let mut found = store
            .query(Some("extra_stamp ge 1700000000000L"), Some("p"), None, 0)
            .await
            .unwrap();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(found, vec![notes[1].clone(), notes[2].clone()]);

        let none = store
            .query(Some("extra_stamp ge 1700000000000L"), Some("other"), None, 0)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_filter_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&note("a", 5), "p", Some(&note_extra(&note("a", 5)))).await.unwrap();

        let found = store
            .query(Some("extra_stamp ne 5L"), None, None, 0)
            .await
            .unwrap();
        assert!(found.is_empty());

        let all = store.query(None, None, None, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_get_all_paginates_across_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write_batch(&[note("a", 1), note("b", 2)], "p1", None).await.unwrap();
        store.write_batch(&[note("c", 3)], "p2", None).await.unwrap();

        let page = store.get_all(Some(2), 1).await.unwrap();
        let ids: Vec<_> = page.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_oversize_batch_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut huge = note("huge", 0);
        huge.body = "x".repeat(CHUNK_SIZE * MAX_CHUNKS + 1);

        let err = store
            .write_batch(&[note("ok", 0), huge], "p", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedscopeError::StorageCapacity { .. }));
        assert_eq!(store.get("ok", "p").await.unwrap(), None);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_delete_and_delete_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .write_batch(&[note("a", 1), note("b", 2), note("c", 3)], "p", None)
            .await
            .unwrap();

        store.delete("a", "p").await.unwrap();
        store
            .delete_batch(&["b".to_string(), "zzz".to_string()], "p")
            .await
            .unwrap();

        let reopened = store_in(&dir);
        let left = reopened.get_all(None, 0).await.unwrap();
        assert_eq!(left, vec![note("c", 3)]);
    }

    #[tokio::test]
    async fn test_interrupted_flush_keeps_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&note("a", 1), "p", None).await.unwrap();

        // crash after the temp file was written but before the rename
        std::fs::write(temp_path(store.path()), b"{\"version\":1,\"entit").unwrap();

        let reopened = store_in(&dir);
        assert_eq!(reopened.get("a", "p").await.unwrap(), Some(note("a", 1)));
    }

    #[tokio::test]
    async fn test_write_during_flush_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&note("a", 1), "p", None).await.unwrap();

        store.flushing.store(true, Ordering::SeqCst);
        store.write(&note("b", 2), "p", None).await.unwrap();
        assert_eq!(store.get("b", "p").await.unwrap(), Some(note("b", 2)));
        assert_eq!(store_in(&dir).get("b", "p").await.unwrap(), None);

        store.flushing.store(false, Ordering::SeqCst);
        store.write(&note("c", 3), "p", None).await.unwrap();
        let reopened = store_in(&dir);
        assert_eq!(reopened.get_all(None, 0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_document_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), b"not json").unwrap();

        let err = store.get("a", "p").await.unwrap_err();
        assert!(matches!(err, FeedscopeError::Format(_)));
    }

    #[tokio::test]
    async fn test_corrupt_row_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write_batch(&[note("a", 1), note("b", 2)], "p", None).await.unwrap();

        {
            let mut document = store.document().await.unwrap().lock().await;
            let row = document.entities.get_mut("p").unwrap().get_mut("a").unwrap();
            row.data.remove("dataChunks");
        }

        assert_eq!(store.get("a", "p").await.unwrap(), None);
        assert_eq!(store.get_all(None, 0).await.unwrap(), vec![note("b", 2)]);
    }
}
