//! Local filesystem chunk store.
//!
//! Keeps chunks in a [`MemoryChunkStore`] and writes a JSON snapshot under the
//! store root after every mutation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::corpus::DocumentChunk;
use crate::storage::memory::MemoryChunkStore;
use crate::storage::{ChunkStore, ScoredChunk, SearchFilters, StorageError, StoreStats, UpsertOutcome};

const SNAPSHOT_FILE: &str = "chunks.json";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: String,
    dimension: usize,
    #[serde(default)]
    chunks: Vec<DocumentChunk>,
}

/// Chunk store persisted as a snapshot file in a local directory.
pub struct LocalChunkStore {
    root: PathBuf,
    inner: MemoryChunkStore,
    // Serializes mutation + snapshot write so snapshots land in mutation order.
    write_lock: Mutex<()>,
}

impl LocalChunkStore {
    /// Open the store rooted at `root`, loading an existing snapshot if present.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ReadError` / `ParseError` if the snapshot cannot be
    /// loaded, or `InvalidDimension` if it was written with another dimension.
    pub fn open(root: PathBuf, dimension: usize) -> Result<Self, StorageError> {
        let path = root.join(SNAPSHOT_FILE);

        let inner = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| StorageError::ReadError(format!("{}: {e}", path.display())))?;
            let snapshot: Snapshot = serde_json::from_str(&contents)
                .map_err(|e| StorageError::ParseError(format!("{}: {e}", path.display())))?;

            if snapshot.dimension != dimension {
                return Err(StorageError::InvalidDimension {
                    expected: dimension,
                    actual: snapshot.dimension,
                });
            }

            tracing::debug!(path = %path.display(), chunks = snapshot.chunks.len(), "Loaded chunk snapshot");
            MemoryChunkStore::with_chunks(dimension, snapshot.chunks)?
        } else {
            MemoryChunkStore::new(dimension)
        };

        Ok(Self {
            root,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    /// Persist the current state, or put `before` back if the write fails.
    fn commit(&self, before: HashMap<String, DocumentChunk>) -> Result<(), StorageError> {
        self.persist().inspect_err(|_| self.inner.restore(before))
    }

    fn persist(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(|e| {
            StorageError::WriteError(format!("create dir {}: {e}", self.root.display()))
        })?;

        let snapshot = Snapshot {
            version: "1".to_string(),
            dimension: self.inner.dimension(),
            chunks: self.inner.snapshot(),
        };
        let contents = serde_json::to_string(&snapshot)
            .map_err(|e| StorageError::SerializeError(e.to_string()))?;

        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .map_err(|e| StorageError::WriteError(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| StorageError::WriteError(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn upsert(&self, chunk: DocumentChunk) -> Result<UpsertOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.entries();
        let outcome = self.inner.upsert(chunk).await?;
        if outcome != UpsertOutcome::Unchanged {
            self.commit(before)?;
        }
        Ok(outcome)
    }

    async fn batch_upsert(
        &self,
        chunks: Vec<DocumentChunk>,
    ) -> Result<Vec<UpsertOutcome>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.entries();
        let outcomes = self.inner.batch_upsert(chunks).await?;
        if outcomes.iter().any(|o| *o != UpsertOutcome::Unchanged) {
            self.commit(before)?;
        }
        Ok(outcomes)
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        self.inner.search(query, limit, filters).await
    }

    async fn list(&self, filters: &SearchFilters) -> Result<Vec<DocumentChunk>, StorageError> {
        self.inner.list(filters).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DocumentChunk>, StorageError> {
        self.inner.get_by_id(id).await
    }

    async fn get_chunks_by_file(
        &self,
        file_name: &str,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        self.inner.get_chunks_by_file(file_name).await
    }

    async fn get_stats(&self) -> Result<StoreStats, StorageError> {
        self.inner.get_stats().await
    }

    async fn delete_chunks_by_file(&self, file_name: &str) -> Result<Vec<String>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.entries();
        let removed = self.inner.delete_chunks_by_file(file_name).await?;
        if !removed.is_empty() {
            self.commit(before)?;
        }
        Ok(removed)
    }

    async fn clear_all(&self) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.entries();
        let removed = self.inner.clear_all().await?;
        self.commit(before)?;
        Ok(removed)
    }
}
