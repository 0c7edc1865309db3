//! In-memory collaborators for tests and embedded use.

use super::{BlobStorage, HistoryRecord, HistoryWriter, IndexAck, IndexEntry, VectorIndex};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

/// Blob storage backed by a concurrent map. URIs are `memory://{key}`.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: DashMap<String, StoredBlob>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Metadata stored alongside `key`.
    pub fn metadata(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.blobs.get(key).map(|b| b.metadata.clone())
    }

    /// Insert an object directly, bypassing overwrite checks.
    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) -> String {
        let key = key.into();
        let uri = format!("{MEMORY_SCHEME}{key}");
        self.blobs.insert(
            key,
            StoredBlob {
                bytes: bytes.into(),
                metadata: BTreeMap::new(),
            },
        );
        uri
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        if !overwrite && self.blobs.contains_key(key) {
            return Err(PipelineError::Storage(format!(
                "object '{key}' already exists"
            )));
        }
        self.blobs.insert(
            key.to_string(),
            StoredBlob {
                bytes,
                metadata: metadata.clone(),
            },
        );
        Ok(format!("{MEMORY_SCHEME}{key}"))
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let key = uri
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| PipelineError::Storage(format!("not a memory uri: {uri}")))?;
        self.blobs
            .get(key)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| PipelineError::Storage(format!("object '{key}' not found")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| PipelineError::Storage(format!("object '{key}' not found")))
    }

    fn owns(&self, uri: &str) -> bool {
        uri.starts_with(MEMORY_SCHEME)
    }
}

/// Vector index that keeps points in memory and records every successful
/// upsert in call order.
///
/// [`fail_on`](Self::fail_on) makes the n-th upsert call (1-based) fail,
/// which is how partial-index failures are exercised.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    points: DashMap<String, IndexEntry>,
    upserts: Mutex<Vec<IndexEntry>>,
    calls: AtomicUsize,
    fail_on: Option<usize>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, call: usize) -> Self {
        self.fail_on = Some(call);
        self
    }

    /// Successful upserts, in call order.
    pub fn upserts(&self) -> Vec<IndexEntry> {
        self.upserts.lock().map(|u| u.clone()).unwrap_or_default()
    }

    /// Upsert calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, point_id: &str) -> Option<IndexEntry> {
        self.points.get(point_id).map(|p| p.clone())
    }

    /// Distinct points currently stored.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<IndexAck> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return Err(PipelineError::Index(format!(
                "upsert of '{}' rejected",
                entry.point_id
            )));
        }
        let point_id = entry.point_id.clone();
        self.upserts
            .lock()
            .map_err(|_| PipelineError::Index("upsert log lock poisoned".into()))?
            .push(entry.clone());
        let created = self.points.insert(point_id.clone(), entry).is_none();
        Ok(IndexAck { point_id, created })
    }
}

/// History writer that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HistoryWriter for MemoryHistory {
    async fn append(&self, record: HistoryRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| PipelineError::Other("history lock poisoned".into()))?
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> IndexEntry {
        IndexEntry {
            point_id: id.into(),
            partition_key: "conv".into(),
            document_id: "file".into(),
            text: "text".into(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_blob_round_trip_and_overwrite() {
        let store = MemoryBlobStorage::new();
        let meta = BTreeMap::from([("owner".to_string(), "a".to_string())]);
        let uri = store.upload("p/c/f/a.txt", b"one".to_vec(), false, &meta).await.unwrap();
        assert_eq!(uri, "memory://p/c/f/a.txt");
        assert!(store.owns(&uri));
        assert_eq!(store.download(&uri).await.unwrap(), b"one");
        assert_eq!(store.metadata("p/c/f/a.txt").unwrap()["owner"], "a");

        let err = store
            .upload("p/c/f/a.txt", b"two".to_vec(), false, &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        store.upload("p/c/f/a.txt", b"two".to_vec(), true, &meta).await.unwrap();
        assert_eq!(store.download(&uri).await.unwrap(), b"two");

        store.delete("p/c/f/a.txt").await.unwrap();
        assert!(store.download(&uri).await.is_err());
        assert!(store.delete("p/c/f/a.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_index_overwrites_by_point_id() {
        let index = MemoryVectorIndex::new();
        assert!(index.upsert(entry("f#0")).await.unwrap().created);
        assert!(!index.upsert(entry("f#0")).await.unwrap().created);
        assert_eq!(index.len(), 1);
        assert_eq!(index.upserts().len(), 2);
    }

    #[tokio::test]
    async fn test_index_fails_on_nth_call() {
        let index = MemoryVectorIndex::new().fail_on(2);
        index.upsert(entry("f#0")).await.unwrap();
        assert!(index.upsert(entry("f#1")).await.is_err());
        index.upsert(entry("f#2")).await.unwrap();
        assert_eq!(index.calls(), 3);
        let ids: Vec<_> = index.upserts().into_iter().map(|e| e.point_id).collect();
        assert_eq!(ids, vec!["f#0", "f#2"]);
    }

    #[tokio::test]
    async fn test_index_reports_poisoned_log() {
        let index = MemoryVectorIndex::new();
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _held = index.upserts.lock().unwrap();
                    panic!("poison the upsert log");
                })
                .join()
        });

        let err = index.upsert(entry("f#0")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Index(_)));
        assert!(index.is_empty());
        assert_eq!(index.upserts().len(), 0);
    }

    #[tokio::test]
    async fn test_memory_history() {
        let history = MemoryHistory::new();
        history
            .append(HistoryRecord {
                conversation_id: "c".into(),
                session_id: "s".into(),
                file_id: "f".into(),
                action: "upload".into(),
                source_uri: None,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(history.records()[0].action, "upload");
    }
}
