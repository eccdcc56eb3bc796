//! In-memory chunk store with brute-force cosine ranking.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;

use crate::corpus::{DocumentChunk, cosine_similarity, first_non_finite};
use crate::storage::{ChunkStore, ScoredChunk, SearchFilters, StorageError, StoreStats, UpsertOutcome};

/// Chunk store that keeps everything in process memory.
///
/// Stats are cached until the next mutation.
pub struct MemoryChunkStore {
    dimension: usize,
    chunks: RwLock<HashMap<String, DocumentChunk>>,
    stats_cache: Mutex<Option<StoreStats>>,
}

impl MemoryChunkStore {
    /// Create an empty store accepting embeddings of `dimension` floats.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: RwLock::new(HashMap::new()),
            stats_cache: Mutex::new(None),
        }
    }

    /// Create a store pre-populated with chunks (e.g., from a snapshot).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidDimension` if any chunk has the wrong
    /// embedding length.
    pub fn with_chunks(
        dimension: usize,
        chunks: impl IntoIterator<Item = DocumentChunk>,
    ) -> Result<Self, StorageError> {
        let store = Self::new(dimension);
        {
            let mut map = store.write();
            for chunk in chunks {
                store.check_embedding(&chunk.embedding)?;
                map.insert(chunk.id.clone(), chunk);
            }
        }
        Ok(store)
    }

    /// Copy of every stored chunk, ordered by file then chunk index.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DocumentChunk> {
        let mut chunks: Vec<DocumentChunk> = self.read().values().cloned().collect();
        sort_by_position(&mut chunks);
        chunks
    }

    /// Embeddings and queries must have the store dimension and finite components.
    fn check_embedding(&self, vector: &[f32]) -> Result<(), StorageError> {
        if vector.len() != self.dimension {
            return Err(StorageError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        match first_non_finite(vector) {
            Some(index) => Err(StorageError::NonFiniteEmbedding { index }),
            None => Ok(()),
        }
    }

    pub(crate) fn entries(&self) -> HashMap<String, DocumentChunk> {
        self.read().clone()
    }

    /// Put back state captured by [`Self::entries`].
    pub(crate) fn restore(&self, entries: HashMap<String, DocumentChunk>) {
        *self.write() = entries;
        self.invalidate_stats();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DocumentChunk>> {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DocumentChunk>> {
        self.chunks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate_stats(&self) {
        *self.stats_cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn upsert_into(map: &mut HashMap<String, DocumentChunk>, chunk: DocumentChunk) -> UpsertOutcome {
    match map.get(&chunk.id) {
        Some(existing) if *existing == chunk => UpsertOutcome::Unchanged,
        Some(_) => {
            map.insert(chunk.id.clone(), chunk);
            UpsertOutcome::Updated
        }
        None => {
            map.insert(chunk.id.clone(), chunk);
            UpsertOutcome::Inserted
        }
    }
}

fn sort_by_position(chunks: &mut [DocumentChunk]) {
    chunks.sort_by(|a, b| {
        a.file_name
            .cmp(&b.file_name)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, chunk: DocumentChunk) -> Result<UpsertOutcome, StorageError> {
        self.check_embedding(&chunk.embedding)?;

        let outcome = {
            let mut map = self.write();
            upsert_into(&mut map, chunk)
        };
        if outcome != UpsertOutcome::Unchanged {
            self.invalidate_stats();
        }
        Ok(outcome)
    }

    async fn batch_upsert(
        &self,
        chunks: Vec<DocumentChunk>,
    ) -> Result<Vec<UpsertOutcome>, StorageError> {
        // Validate everything first so a bad chunk leaves the store untouched.
        for chunk in &chunks {
            self.check_embedding(&chunk.embedding)?;
        }

        let outcomes: Vec<UpsertOutcome> = {
            let mut map = self.write();
            chunks
                .into_iter()
                .map(|chunk| upsert_into(&mut map, chunk))
                .collect()
        };
        if outcomes.iter().any(|o| *o != UpsertOutcome::Unchanged) {
            self.invalidate_stats();
        }
        Ok(outcomes)
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        self.check_embedding(query)?;
        filters.validate()?;

        if limit == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<ScoredChunk> = self
            .read()
            .values()
            .filter(|chunk| filters.matches(chunk))
            .filter_map(|chunk| {
                let score = cosine_similarity(query, &chunk.embedding);
                if !score.is_finite() || filters.min_similarity.is_some_and(|min| score < min) {
                    return None;
                }
                Some(ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    async fn list(&self, filters: &SearchFilters) -> Result<Vec<DocumentChunk>, StorageError> {
        filters.validate()?;

        let mut chunks: Vec<DocumentChunk> = self
            .read()
            .values()
            .filter(|chunk| filters.matches(chunk))
            .cloned()
            .collect();
        sort_by_position(&mut chunks);

        Ok(chunks)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DocumentChunk>, StorageError> {
        Ok(self.read().get(id).cloned())
    }

    async fn get_chunks_by_file(
        &self,
        file_name: &str,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        let mut chunks: Vec<DocumentChunk> = self
            .read()
            .values()
            .filter(|chunk| chunk.file_name == file_name)
            .cloned()
            .collect();
        sort_by_position(&mut chunks);

        Ok(chunks)
    }

    async fn get_stats(&self) -> Result<StoreStats, StorageError> {
        let mut cache = self.stats_cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = cache.as_ref() {
            return Ok(stats.clone());
        }

        let stats = StoreStats::from_chunks(self.read().values());
        *cache = Some(stats.clone());

        Ok(stats)
    }

    async fn delete_chunks_by_file(&self, file_name: &str) -> Result<Vec<String>, StorageError> {
        let removed: Vec<String> = {
            let mut map = self.write();
            let ids: Vec<String> = map
                .values()
                .filter(|chunk| chunk.file_name == file_name)
                .map(|chunk| chunk.id.clone())
                .collect();
            for id in &ids {
                map.remove(id);
            }
            ids
        };

        if !removed.is_empty() {
            self.invalidate_stats();
        }
        Ok(removed)
    }

    async fn clear_all(&self) -> Result<usize, StorageError> {
        let removed = {
            let mut map = self.write();
            let count = map.len();
            map.clear();
            count
        };
        self.invalidate_stats();
        Ok(removed)
    }
}
