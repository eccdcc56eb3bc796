//! Ingestion: store chunks, then fold their entities into the graph.
//!
//! The store write is the only fatal step. Extraction failures degrade: the
//! chunk stays searchable, its stale graph contribution is dropped, and it is
//! queued for [`Ingestor::reprocess_pending`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use crate::corpus::{ChunkRecord, CorpusError, DocumentChunk};
use crate::embedding::{Embedder, EmbeddingError};
use crate::extract::Extractor;
use crate::graph::{EntityId, SharedGraph};
use crate::storage::{ChunkStore, SearchFilters, StorageError, UpsertOutcome};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

/// What happened to a chunk's graph contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionStatus {
    Extracted {
        entities: usize,
        relationships: usize,
    },
    /// Extraction failed; the chunk is flagged for reprocessing.
    Degraded { reason: String },
    /// The chunk was unchanged and already extracted.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub chunk_id: String,
    pub outcome: UpsertOutcome,
    pub extraction: ExtractionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub chunk_ids: Vec<String>,
    pub pruned_entities: Vec<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessReport {
    pub retried: usize,
    pub recovered: usize,
    /// Flagged chunks that no longer exist in the store.
    pub dropped: usize,
    pub still_pending: Vec<String>,
}

/// Per-chunk-id async locks serializing updates to the same chunk.
///
/// Entries are dropped once the last guard or waiter for an id goes away.
#[derive(Debug, Default)]
pub struct ChunkLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Holds one chunk id's lock; releasing it prunes the id's table entry when
/// nobody else is waiting.
#[derive(Debug)]
pub struct ChunkGuard<'a> {
    locks: &'a ChunkLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.id);
    }
}

impl ChunkLocks {
    fn handle(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(id.to_string()).or_default())
    }

    fn release(&self, id: &str) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(id).is_some_and(|handle| Arc::strong_count(handle) == 1) {
            table.remove(id);
        }
    }

    pub async fn lock(&self, id: &str) -> ChunkGuard<'_> {
        let guard = self.handle(id).lock_owned().await;
        ChunkGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    /// Lock several ids in sorted order so overlapping batches cannot deadlock.
    pub async fn lock_many(&self, ids: &BTreeSet<String>) -> Vec<ChunkGuard<'_>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    /// Number of ids currently locked or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Ingestor {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    graph: SharedGraph,
    extractor: Extractor,
    locks: ChunkLocks,
    /// Held shared by writers of individual chunks and exclusively by
    /// operations that remove or re-derive many chunks at once.
    gate: AsyncRwLock<()>,
}

impl Ingestor {
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        graph: SharedGraph,
        extractor: Extractor,
    ) -> Self {
        Self {
            store,
            embedder,
            graph,
            extractor,
            locks: ChunkLocks::default(),
            gate: AsyncRwLock::new(()),
        }
    }

    /// Store one chunk and refresh its graph contribution.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Storage` if the store rejects the chunk.
    pub async fn ingest(&self, chunk: DocumentChunk) -> Result<IngestReport, IngestError> {
        let _shared = self.gate.read().await;
        let _guard = self.locks.lock(&chunk.id).await;
        let outcome = self.store.upsert(chunk.clone()).await?;
        let extraction = self.refresh(&chunk, outcome).await;
        Ok(IngestReport {
            chunk_id: chunk.id,
            outcome,
            extraction,
        })
    }

    /// Store several chunks, then extract them concurrently. When an id repeats,
    /// the last occurrence wins.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Storage` if the store rejects a chunk.
    pub async fn ingest_batch(
        &self,
        chunks: Vec<DocumentChunk>,
    ) -> Result<Vec<IngestReport>, IngestError> {
        let _shared = self.gate.read().await;
        let ids: BTreeSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let _guards = self.locks.lock_many(&ids).await;
        let outcomes = self.store.batch_upsert(chunks.clone()).await?;

        let last: HashMap<&str, usize> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        let reports = join_all(chunks.iter().zip(outcomes).enumerate().map(
            |(i, (chunk, outcome))| {
                let superseded = last.get(chunk.id.as_str()) != Some(&i);
                async move {
                    let extraction = if superseded {
                        ExtractionStatus::Skipped
                    } else {
                        self.refresh(chunk, outcome).await
                    };
                    IngestReport {
                        chunk_id: chunk.id.clone(),
                        outcome,
                        extraction,
                    }
                }
            },
        ))
        .await;

        let degraded = reports
            .iter()
            .filter(|r| matches!(r.extraction, ExtractionStatus::Degraded { .. }))
            .count();
        info!(chunks = reports.len(), degraded, "Ingested batch");
        Ok(reports)
    }

    /// Embed records that carry no embedding, then ingest them as a batch.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Corpus` for malformed records,
    /// `IngestError::Embedding` if embedding fails, or a storage error.
    pub async fn ingest_records(
        &self,
        records: Vec<ChunkRecord>,
    ) -> Result<Vec<IngestReport>, IngestError> {
        let mut chunks = Vec::with_capacity(records.len());
        for mut record in records {
            let embedding = match record.embedding.take() {
                Some(embedding) => embedding,
                None => self.embedder.embed(&record.content).await?,
            };
            chunks.push(record.into_chunk(embedding)?);
        }
        self.ingest_batch(chunks).await
    }

    /// Remove a file's chunks from the store and the graph.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Storage` if the store fails.
    pub async fn delete_file(&self, file_name: &str) -> Result<DeleteReport, IngestError> {
        let _exclusive = self.gate.write().await;
        let chunk_ids = self.store.delete_chunks_by_file(file_name).await?;
        let mut pruned_entities = Vec::new();
        {
            let mut graph = self.graph.write();
            for id in &chunk_ids {
                pruned_entities.extend(graph.remove_chunk(id));
            }
        }

        info!(file = file_name, chunks = chunk_ids.len(), pruned = pruned_entities.len(), "Deleted file");
        Ok(DeleteReport {
            chunk_ids,
            pruned_entities,
        })
    }

    /// Remove every chunk and reset the graph.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Storage` if the store fails.
    pub async fn clear_all(&self) -> Result<usize, IngestError> {
        let _exclusive = self.gate.write().await;
        let removed = self.store.clear_all().await?;
        self.graph.write().clear();
        info!(removed, "Cleared vault");
        Ok(removed)
    }

    /// Retry extraction for chunks flagged after a degraded run.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Storage` if a chunk cannot be read back.
    pub async fn reprocess_pending(&self) -> Result<ReprocessReport, IngestError> {
        let _shared = self.gate.read().await;
        let pending = self.graph.read().pending_reprocessing();
        let mut report = ReprocessReport::default();

        for id in pending {
            let _guard = self.locks.lock(&id).await;
            report.retried += 1;
            match self.store.get_by_id(&id).await? {
                Some(chunk) => {
                    if matches!(self.extract(&chunk).await, ExtractionStatus::Extracted { .. }) {
                        report.recovered += 1;
                    }
                }
                None => {
                    self.graph.write().remove_chunk(&id);
                    report.dropped += 1;
                }
            }
        }

        report.still_pending = self.graph.read().pending_reprocessing();
        Ok(report)
    }

    /// Re-derive the whole graph from the stored chunks.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Storage` if the chunks cannot be listed.
    pub async fn rebuild_graph(&self) -> Result<usize, IngestError> {
        let _exclusive = self.gate.write().await;
        let chunks = self.store.list(&SearchFilters::default()).await?;
        self.graph.write().clear();

        let statuses = join_all(chunks.iter().map(|chunk| self.extract(chunk))).await;

        let graph = self.graph.read();
        info!(
            chunks = statuses.len(),
            entities = graph.entity_count(),
            relationships = graph.relationship_count(),
            "Rebuilt knowledge graph"
        );
        Ok(statuses.len())
    }

    async fn refresh(&self, chunk: &DocumentChunk, outcome: UpsertOutcome) -> ExtractionStatus {
        if outcome == UpsertOutcome::Unchanged && self.graph.read().is_extracted(&chunk.id) {
            debug!(chunk = %chunk.id, "Chunk unchanged; keeping graph contribution");
            return ExtractionStatus::Skipped;
        }
        self.extract(chunk).await
    }

    async fn extract(&self, chunk: &DocumentChunk) -> ExtractionStatus {
        match self.extractor.extract(chunk).await {
            Ok(extraction) => {
                let report = self.graph.write().apply_extraction(&extraction);
                if !report.low_confidence.is_empty() {
                    debug!(chunk = %chunk.id, entities = ?report.low_confidence, "Low-confidence entities kept");
                }
                ExtractionStatus::Extracted {
                    entities: report.entities.len(),
                    relationships: report.relationships,
                }
            }
            Err(e) => {
                warn!(chunk = %chunk.id, error = %e, "Entity extraction degraded; chunk flagged for reprocessing");
                let mut graph = self.graph.write();
                graph.remove_chunk(&chunk.id);
                graph.flag_for_reprocessing(&chunk.id);
                ExtractionStatus::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::ExtractionSettings;
    use crate::corpus::ChunkMetadata;
    use crate::embedding::HashingEmbedder;
    use crate::extract::rules::RuleBasedModel;
    use crate::extract::{DetectedMention, EntityModel, ExtractionError, RelationshipGuess};
    use crate::storage::memory::MemoryChunkStore;

    const DIM: usize = 32;

    /// Rule-based model that can be switched off to simulate an outage, or
    /// slowed down to hold extractions open.
    #[derive(Default)]
    struct FlakyModel {
        down: AtomicBool,
        delay_ms: AtomicU64,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        inner: RuleBasedModel,
    }

    #[async_trait]
    impl EntityModel for FlakyModel {
        async fn detect_entities(&self, text: &str) -> Result<Vec<DetectedMention>, ExtractionError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ExtractionError::Model("model offline".into()));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.detect_entities(text).await
        }

        async fn classify_relationship(
            &self,
            source: &DetectedMention,
            target: &DetectedMention,
            between: &str,
        ) -> Result<Option<RelationshipGuess>, ExtractionError> {
            self.inner.classify_relationship(source, target, between).await
        }
    }

    struct Fixture {
        ingestor: Ingestor,
        store: Arc<MemoryChunkStore>,
        graph: SharedGraph,
        model: Arc<FlakyModel>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryChunkStore::new(DIM));
        let embedder = Arc::new(HashingEmbedder::new(DIM));
        let graph = SharedGraph::default();
        let model = Arc::new(FlakyModel::default());
        let extractor = Extractor::new(model.clone(), ExtractionSettings::default());
        let ingestor = Ingestor::new(store.clone(), embedder, graph.clone(), extractor);
        Fixture {
            ingestor,
            store,
            graph,
            model,
        }
    }

    fn chunk(id: &str, file: &str, content: &str) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            file_name: file.to_string(),
            folder: String::new(),
            chunk_index: 0,
            content: content.to_string(),
            embedding: HashingEmbedder::new(DIM).embed_sync(content),
            metadata: ChunkMetadata::default(),
        }
    }

    #[tokio::test]
    async fn ingest_stores_chunk_and_indexes_entities() {
        let f = fixture();

        let report = f
            .ingestor
            .ingest(chunk("a", "a.md", "Alice works at Acme Corp."))
            .await
            .unwrap();

        assert_eq!(report.outcome, UpsertOutcome::Inserted);
        assert_eq!(
            report.extraction,
            ExtractionStatus::Extracted {
                entities: 2,
                relationships: 1
            }
        );
        assert!(f.graph.read().entity("organization/acme-corp").is_some());
    }

    #[tokio::test]
    async fn unchanged_chunks_skip_extraction() {
        let f = fixture();
        let a = chunk("a", "a.md", "Alice works at Acme Corp.");
        f.ingestor.ingest(a.clone()).await.unwrap();
        let before = f.graph.read().clone();

        let report = f.ingestor.ingest(a).await.unwrap();

        assert_eq!(report.outcome, UpsertOutcome::Unchanged);
        assert_eq!(report.extraction, ExtractionStatus::Skipped);
        assert_eq!(*f.graph.read(), before);
    }

    #[tokio::test]
    async fn degraded_extraction_keeps_chunk_searchable_and_flags_it() {
        let f = fixture();
        f.ingestor
            .ingest(chunk("a", "a.md", "Alice works at Acme Corp."))
            .await
            .unwrap();
        f.model.down.store(true, Ordering::SeqCst);

        let report = f
            .ingestor
            .ingest(chunk("a", "a.md", "Alice works at Globex Inc."))
            .await
            .unwrap();

        assert!(matches!(report.extraction, ExtractionStatus::Degraded { .. }));
        assert!(f.store.get_by_id("a").await.unwrap().is_some());
        let graph = f.graph.read().clone();
        assert_eq!(graph.pending_reprocessing(), vec!["a".to_string()]);
        assert!(graph.entity("organization/acme-corp").is_none());
    }

    #[tokio::test]
    async fn reprocessing_recovers_flagged_chunks() {
        let f = fixture();
        f.model.down.store(true, Ordering::SeqCst);
        f.ingestor
            .ingest(chunk("a", "a.md", "Alice works at Acme Corp."))
            .await
            .unwrap();
        f.model.down.store(false, Ordering::SeqCst);

        let report = f.ingestor.reprocess_pending().await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.recovered, 1);
        assert!(report.still_pending.is_empty());
        assert!(f.graph.read().entity("person/alice").is_some());
    }

    #[tokio::test]
    async fn deleting_a_file_prunes_orphaned_entities() {
        let f = fixture();
        f.ingestor
            .ingest_batch(vec![
                chunk("a", "a.md", "Alice works at Acme Corp."),
                chunk("b", "b.md", "Acme Corp is located in Springfield."),
            ])
            .await
            .unwrap();

        let report = f.ingestor.delete_file("b.md").await.unwrap();

        assert_eq!(report.chunk_ids, vec!["b".to_string()]);
        assert_eq!(report.pruned_entities, vec!["location/springfield".to_string()]);
        assert!(f.store.get_chunks_by_file("b.md").await.unwrap().is_empty());
        assert!(f.graph.read().entity("organization/acme-corp").is_some());
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_batch_keep_the_last_version() {
        let f = fixture();

        let reports = f
            .ingestor
            .ingest_batch(vec![
                chunk("a", "a.md", "Alice works at Acme Corp."),
                chunk("a", "a.md", "Bob works at Globex Inc."),
            ])
            .await
            .unwrap();

        assert_eq!(reports[0].extraction, ExtractionStatus::Skipped);
        let graph = f.graph.read().clone();
        assert!(graph.entity("person/bob").is_some());
        assert!(graph.entity("person/alice").is_none());
    }

    #[tokio::test]
    async fn records_without_embeddings_are_embedded() {
        let f = fixture();
        let records = ChunkRecord::parse_many(
            r#"[{"file_name": "notes/acme.md", "content": "Acme Corp is located in Springfield."}]"#,
        )
        .unwrap();

        let reports = f.ingestor.ingest_records(records).await.unwrap();

        assert_eq!(reports[0].chunk_id, "notes/acme.md#0");
        let stored = f.store.get_by_id("notes/acme.md#0").await.unwrap().unwrap();
        assert_eq!(stored.embedding.len(), DIM);
        assert_eq!(stored.folder, "notes");
    }

    #[tokio::test]
    async fn rebuild_rederives_the_graph_from_the_store() {
        let f = fixture();
        f.ingestor
            .ingest(chunk("a", "a.md", "Alice works at Acme Corp."))
            .await
            .unwrap();
        f.graph.write().clear();

        let count = f.ingestor.rebuild_graph().await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(f.graph.read().entity_count(), 2);
    }

    #[tokio::test]
    async fn clear_all_empties_store_and_graph() {
        let f = fixture();
        f.ingestor
            .ingest(chunk("a", "a.md", "Alice works at Acme Corp."))
            .await
            .unwrap();

        let removed = f.ingestor.clear_all().await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(f.graph.read().entity_count(), 0);
    }

    #[tokio::test]
    async fn clear_all_waits_for_in_flight_ingest() {
        let f = fixture();
        f.model.delay_ms.store(200, Ordering::SeqCst);

        let (ingested, cleared) = tokio::join!(
            f.ingestor.ingest(chunk("a", "a.md", "Alice works at Acme Corp.")),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.ingestor.clear_all().await
            }
        );

        ingested.unwrap();
        assert_eq!(cleared.unwrap(), 1);
        assert!(f.store.get_by_id("a").await.unwrap().is_none());
        assert_eq!(f.graph.read().entity_count(), 0);
    }

    #[tokio::test]
    async fn delete_file_waits_for_in_flight_ingest() {
        let f = fixture();
        f.model.delay_ms.store(200, Ordering::SeqCst);

        let (ingested, deleted) = tokio::join!(
            f.ingestor.ingest(chunk("a", "a.md", "Alice works at Acme Corp.")),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.ingestor.delete_file("a.md").await
            }
        );

        ingested.unwrap();
        assert_eq!(deleted.unwrap().chunk_ids, vec!["a".to_string()]);
        assert!(f.store.get_by_id("a").await.unwrap().is_none());
        assert!(f.graph.read().entity("person/alice").is_none());
    }

    #[tokio::test]
    async fn concurrent_ingests_of_one_id_run_one_at_a_time() {
        let f = fixture();
        f.model.delay_ms.store(50, Ordering::SeqCst);

        let (first, second) = tokio::join!(
            f.ingestor.ingest(chunk("a", "a.md", "Alice works at Acme Corp.")),
            f.ingestor.ingest(chunk("a", "a.md", "Bob works at Globex Inc.")),
        );

        first.unwrap();
        assert_eq!(second.unwrap().outcome, UpsertOutcome::Updated);
        assert_eq!(f.model.peak.load(Ordering::SeqCst), 1);
        let stored = f.store.get_by_id("a").await.unwrap().unwrap();
        assert!(stored.content.contains("Bob"));
        let graph = f.graph.read().clone();
        assert!(graph.entity("person/bob").is_some());
        assert!(graph.entity("person/alice").is_none());
    }

    #[tokio::test]
    async fn ingests_of_different_ids_overlap() {
        let f = fixture();
        f.model.delay_ms.store(50, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            f.ingestor.ingest(chunk("a", "a.md", "Alice works at Acme Corp.")),
            f.ingestor.ingest(chunk("b", "b.md", "Bob works at Globex Inc.")),
        );

        a.unwrap();
        b.unwrap();
        assert_eq!(f.model.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chunk_locks_are_released_after_use() {
        let f = fixture();
        f.ingestor
            .ingest_batch(vec![
                chunk("a", "a.md", "Alice works at Acme Corp."),
                chunk("b", "b.md", "Acme Corp is located in Springfield."),
            ])
            .await
            .unwrap();
        f.ingestor
            .ingest(chunk("c", "c.md", "Bob works at Globex Inc."))
            .await
            .unwrap();
        f.ingestor.delete_file("a.md").await.unwrap();

        assert!(f.ingestor.locks.is_empty());
    }

    #[tokio::test]
    async fn a_waiting_locker_keeps_the_entry_alive() {
        let locks = ChunkLocks::default();
        let held = locks.lock("a").await;

        let waiter = locks.lock("a");
        tokio::pin!(waiter);
        assert!(futures::poll!(waiter.as_mut()).is_pending());
        drop(held);
        assert_eq!(locks.len(), 1);

        let second = waiter.await;
        drop(second);
        assert!(locks.is_empty());
    }
}
