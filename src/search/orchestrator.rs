//! The search pipeline: validate, embed, retrieve, enrich.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::SearchSettings;
use crate::corpus::{ContentType, DocumentChunk, normalize};
use crate::embedding::Embedder;
use crate::graph::{ClusterPath, EntityId, KnowledgeGraphIndex, SharedGraph};
use crate::search::highlight::highlights;
use crate::search::{
    ClusterSummary, Concept, EntityRef, Exploration, GraphContext, GraphInsights, NeighborRef,
    RelatedChunk, RelatedReason, ResponseFacets, ResultFacets, SearchError, SearchOptions,
    SearchResponse, SearchResult, SharedEntity,
};
use crate::storage::{ChunkStore, ScoredChunk, SearchFilters, StoreStats};

pub struct SearchOrchestrator {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    graph: SharedGraph,
    settings: SearchSettings,
}

/// What `explore_knowledge_cluster` gathered from the graph.
struct ExplorationPlan {
    exploration: Exploration,
    /// (chunk id, mentions the seed, explored entities mentioned)
    chunks: Vec<(String, bool, usize)>,
}

impl SearchOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        graph: SharedGraph,
        settings: SearchSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            graph,
            settings,
        }
    }

    /// Semantic search for `query`.
    ///
    /// # Errors
    ///
    /// - `SearchError::InvalidInput` for a blank query or malformed filters
    /// - `SearchError::UpstreamUnavailable` if the embedder or store fails
    /// - `SearchError::Cancelled` if the request is cancelled
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::InvalidInput("query must not be empty".into()));
        }
        let filters = self.effective_filters(options)?;
        options.check_cancelled()?;

        let vector = self.embedder.embed(query).await?;
        options.check_cancelled()?;

        let hits = self
            .store
            .search(&vector, self.limit(options), &filters)
            .await?;
        debug!(query, hits = hits.len(), "Retrieved chunks");

        self.respond(Some(query), hits, options).await
    }

    /// Chunks carrying `tag`, most recently modified first, each scored 1.0.
    /// The tag replaces any tag filter in `options`.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::InvalidInput` for a blank tag or malformed filters.
    pub async fn search_by_tag(
        &self,
        tag: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let tag = tag.trim().trim_start_matches('#');
        if tag.is_empty() {
            return Err(SearchError::InvalidInput("tag must not be empty".into()));
        }
        let mut filters = options.filters.clone();
        filters.tags = vec![tag.to_string()];
        filters.min_similarity = None;
        filters.validate()?;
        options.check_cancelled()?;

        let mut chunks = self.store.list(&filters).await?;
        chunks.sort_by(|a, b| {
            b.metadata
                .modified_at
                .cmp(&a.metadata.modified_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        chunks.truncate(self.limit(options));

        let hits = chunks
            .into_iter()
            .map(|chunk| ScoredChunk { chunk, score: 1.0 })
            .collect();
        self.respond(None, hits, options).await
    }

    /// Maps of content. With a query, the normal pipeline restricted to MOCs;
    /// without, every MOC ranked by how many chunks link to it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::search`].
    pub async fn search_mocs(
        &self,
        query: Option<&str>,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let mut options = options.clone();
        options.filters.content_type = Some(ContentType::Moc);

        if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
            return self.search(query, &options).await;
        }

        let mut filters = options.filters.clone();
        filters.min_similarity = None;
        filters.validate()?;
        options.check_cancelled()?;

        let chunks = self.store.list(&filters).await?;
        let stats = self.store.get_stats().await?;
        let inbound = |chunk: &DocumentChunk| {
            stats
                .inbound_links
                .get(&chunk.file_key())
                .copied()
                .unwrap_or_default()
        };
        let max = chunks.iter().map(&inbound).max().unwrap_or_default();

        let mut hits: Vec<ScoredChunk> = chunks
            .into_iter()
            .map(|chunk| {
                #[allow(clippy::cast_precision_loss)]
                let score = if max == 0 {
                    0.0
                } else {
                    inbound(&chunk) as f32 / max as f32
                };
                ScoredChunk { chunk, score }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(self.limit(&options));

        self.respond(None, hits, &options).await
    }

    /// Semantic search restricted to conversation logs.
    ///
    /// # Errors
    ///
    /// Same as [`Self::search`].
    pub async fn search_conversations(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let mut options = options.clone();
        options.filters.content_type = Some(ContentType::Conversation);
        self.search(query, &options).await
    }

    /// Notes similar to a file as a whole, excluding the file itself. An
    /// unknown file yields an empty response.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::InvalidInput` for malformed filters, or an
    /// upstream error from the store.
    pub async fn find_related_notes(
        &self,
        file_name: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let mut filters = self.effective_filters(options)?;
        options.check_cancelled()?;

        let chunks = self.store.get_chunks_by_file(file_name).await?;
        let Some(seed) = mean_embedding(&chunks) else {
            debug!(file = file_name, "No chunks for file; nothing related");
            return Ok(SearchResponse::default());
        };

        filters.exclude_files.push(file_name.to_string());
        let hits = self
            .store
            .search(&seed, self.limit(options), &filters)
            .await?;

        self.respond(None, hits, options).await
    }

    /// Chunks about a concept and the entities around it in the graph.
    ///
    /// The concept is resolved like any mention (exact name, then embedding
    /// similarity). Chunks mentioning the concept itself rank first, then by
    /// how many explored entities they mention. An unknown concept yields an
    /// empty response.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::InvalidInput` for a blank concept or malformed
    /// filters, or an upstream error from the store.
    pub async fn explore_knowledge_cluster(
        &self,
        concept: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let concept = concept.trim();
        if concept.is_empty() {
            return Err(SearchError::InvalidInput("concept must not be empty".into()));
        }
        let filters = options.filters.clone();
        filters.validate()?;
        options.check_cancelled()?;

        let embedding = match self.embedder.embed(concept).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                debug!(concept, error = %e, "Concept embedding unavailable; exact matching only");
                None
            }
        };
        options.check_cancelled()?;

        let Some(mut plan) = self.plan_exploration(concept, embedding.as_deref()) else {
            debug!(concept, "Concept not in graph");
            return Ok(SearchResponse::default());
        };
        plan.chunks
            .sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then_with(|| a.0.cmp(&b.0)));

        #[allow(clippy::cast_precision_loss)]
        let explored = plan.exploration.explored.len().max(1) as f32;
        let limit = self.limit(options);
        let mut hits = Vec::new();
        for (id, _, matched) in plan.chunks {
            if hits.len() >= limit {
                break;
            }
            options.check_cancelled()?;
            let Some(chunk) = self.store.get_by_id(&id).await? else {
                continue;
            };
            if !filters.matches(&chunk) {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let score = matched as f32 / explored;
            hits.push(ScoredChunk { chunk, score });
        }

        let mut response = self.respond(Some(concept), hits, options).await?;
        response.exploration = Some(plan.exploration);
        Ok(response)
    }

    /// Every chunk of a file in chunk order.
    ///
    /// # Errors
    ///
    /// Returns an upstream error from the store.
    pub async fn get_file_chunks(
        &self,
        file_name: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        options.check_cancelled()?;
        let hits = self
            .store
            .get_chunks_by_file(file_name)
            .await?
            .into_iter()
            .map(|chunk| ScoredChunk { chunk, score: 1.0 })
            .collect();
        self.respond(None, hits, options).await
    }

    /// Store-wide stats.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::UpstreamUnavailable` if the store fails.
    pub async fn stats(&self) -> Result<StoreStats, SearchError> {
        Ok(self.store.get_stats().await?)
    }

    fn limit(&self, options: &SearchOptions) -> usize {
        options.limit.unwrap_or(self.settings.default_limit)
    }

    fn effective_filters(&self, options: &SearchOptions) -> Result<SearchFilters, SearchError> {
        let mut filters = options.filters.clone();
        if filters.min_similarity.is_none() {
            filters.min_similarity = self.settings.min_similarity;
        }
        filters.validate()?;
        Ok(filters)
    }

    async fn respond(
        &self,
        query: Option<&str>,
        hits: Vec<ScoredChunk>,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        options.check_cancelled()?;
        let stats = match self.store.get_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Store stats unavailable; facets degraded");
                None
            }
        };

        let results = self.enhance(query, hits, stats.as_ref(), options).await?;
        let (graph_insights, concepts) = self.insights(&results);
        let facets = response_facets(&results, stats);

        Ok(SearchResponse {
            results,
            facets,
            graph_insights,
            concepts,
            exploration: None,
        })
    }

    /// Enrich every hit concurrently, keeping the store's order. The store is
    /// listed once per response for wikilink relations.
    async fn enhance(
        &self,
        query: Option<&str>,
        hits: Vec<ScoredChunk>,
        stats: Option<&StoreStats>,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, SearchError> {
        options.check_cancelled()?;
        let corpus = if hits.is_empty() || self.settings.related_limit == 0 {
            None
        } else {
            match self.store.list(&SearchFilters::default()).await {
                Ok(chunks) => Some(chunks),
                Err(e) => {
                    warn!(error = %e, "Related chunk lookup failed");
                    None
                }
            }
        };
        let corpus = corpus.as_deref();

        join_all(
            hits.into_iter()
                .map(|hit| self.enhance_hit(query, hit, corpus, stats, options)),
        )
        .await
        .into_iter()
        .collect()
    }

    async fn enhance_hit(
        &self,
        query: Option<&str>,
        hit: ScoredChunk,
        corpus: Option<&[DocumentChunk]>,
        stats: Option<&StoreStats>,
        options: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        options.check_cancelled()?;
        let ScoredChunk { chunk, score } = hit;

        let highlights = query
            .map(|q| highlights(&chunk.content, q, self.settings.highlight_limit))
            .unwrap_or_default();

        let related_chunks = match corpus {
            Some(corpus) => match self.related_chunks(&chunk, corpus).await {
                Ok(related) => related,
                Err(e) => {
                    warn!(chunk = %chunk.id, error = %e, "Related chunk lookup failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let graph_context = self.graph_context(&chunk.id);
        let facets = ResultFacets {
            content_type: chunk.metadata.content_type,
            folder: chunk.folder.clone(),
            top_tags: top_tags(&chunk, stats, self.settings.top_tag_limit),
        };

        Ok(SearchResult {
            chunk: chunk.into(),
            score,
            highlights,
            related_chunks,
            graph_context,
            facets,
        })
    }

    /// Chunks in other files sharing wikilinks with `chunk` (Jaccard over link
    /// keys, the file's own key included so backlinks count), then chunks
    /// similar by embedding.
    async fn related_chunks(
        &self,
        chunk: &DocumentChunk,
        corpus: &[DocumentChunk],
    ) -> Result<Vec<RelatedChunk>, SearchError> {
        let limit = self.settings.related_limit;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut related: Vec<RelatedChunk> = corpus
            .iter()
            .filter(|other| other.file_name != chunk.file_name)
            .filter_map(|other| {
                let score = link_overlap(chunk, other);
                (score > 0.0).then(|| RelatedChunk {
                    id: other.id.clone(),
                    file_name: other.file_name.clone(),
                    reason: RelatedReason::SharedWikilink,
                    score,
                })
            })
            .collect();
        related.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        related.truncate(limit);

        if related.len() < limit && !chunk.embedding.is_empty() {
            let similar = SearchFilters {
                min_similarity: Some(self.settings.related_min_similarity),
                exclude_files: vec![chunk.file_name.clone()],
                exclude_ids: related.iter().map(|r| r.id.clone()).collect(),
                ..SearchFilters::default()
            };
            let hits = self
                .store
                .search(&chunk.embedding, limit - related.len(), &similar)
                .await?;
            related.extend(hits.into_iter().map(|hit| RelatedChunk {
                id: hit.chunk.id,
                file_name: hit.chunk.file_name,
                reason: RelatedReason::Similar,
                score: hit.score,
            }));
        }

        Ok(related)
    }

    fn graph_context(&self, chunk_id: &str) -> GraphContext {
        let graph = self.graph.read();
        let mut entities = graph.entities_in_chunk(chunk_id);
        entities.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });

        let local: BTreeSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        let mut seen = BTreeSet::new();
        let mut neighbors: Vec<NeighborRef> = entities
            .iter()
            .flat_map(|entity| {
                graph
                    .neighbors(&entity.id, None)
                    .into_iter()
                    .map(move |n| (entity.id.clone(), n))
            })
            .filter(|(_, n)| !local.contains(n.entity.id.as_str()))
            .map(|(via, n)| NeighborRef {
                entity: EntityRef::new(n.entity, graph.is_low_confidence(n.entity)),
                via,
                relationship: n.relationship.relationship_type.clone(),
                direction: n.direction,
                confidence: n.relationship.confidence(),
            })
            .collect();
        neighbors.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        neighbors.retain(|n| seen.insert(n.entity.id.clone()));
        neighbors.truncate(self.settings.neighbor_limit);

        GraphContext {
            entities: entities
                .into_iter()
                .map(|e| EntityRef::new(e, graph.is_low_confidence(e)))
                .collect(),
            neighbors,
        }
    }

    /// Shared entities, cluster summary and concepts over the enriched hits.
    fn insights(&self, results: &[SearchResult]) -> (GraphInsights, Vec<Concept>) {
        let graph = self.graph.read();

        let mut hits_per_entity: BTreeMap<&str, usize> = BTreeMap::new();
        let mut hits_per_cluster: BTreeMap<String, (ClusterPath, BTreeSet<usize>)> = BTreeMap::new();
        let mut frequency: BTreeMap<&str, usize> = BTreeMap::new();

        for (i, result) in results.iter().enumerate() {
            for entity in &result.graph_context.entities {
                *hits_per_entity.entry(entity.id.as_str()).or_default() += 1;
                if let Some(path) = graph.cluster_of(&entity.id) {
                    hits_per_cluster
                        .entry(path.cluster.id.clone())
                        .or_insert_with(|| (path, BTreeSet::new()))
                        .1
                        .insert(i);
                }
                if let Some(full) = graph.entity(&entity.id) {
                    let mentions = full
                        .mentions
                        .iter()
                        .filter(|m| m.chunk_id == result.chunk.id)
                        .count();
                    *frequency.entry(entity.id.as_str()).or_default() += mentions;
                }
            }
        }

        let mut shared_entities: Vec<SharedEntity> = hits_per_entity
            .into_iter()
            .filter(|(_, hits)| *hits >= 2)
            .filter_map(|(id, hits)| {
                let entity = graph.entity(id)?;
                Some(SharedEntity {
                    entity: EntityRef::new(entity, graph.is_low_confidence(entity)),
                    hits,
                })
            })
            .collect();
        shared_entities.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.entity.id.cmp(&b.entity.id)));

        let mut clusters: Vec<ClusterSummary> = hits_per_cluster
            .into_iter()
            .map(|(id, (path, hits))| ClusterSummary {
                id,
                label: path.cluster.label,
                hits: hits.len(),
                ancestors: path.ancestors.into_iter().map(|c| c.label).collect(),
            })
            .collect();
        clusters.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.id.cmp(&b.id)));

        let mut concepts: Vec<Concept> = frequency
            .into_iter()
            .filter_map(|(id, frequency)| {
                let entity = graph.entity(id)?;
                (entity.confidence >= self.settings.concept_min_confidence).then(|| Concept {
                    entity: EntityRef::new(entity, graph.is_low_confidence(entity)),
                    frequency,
                })
            })
            .collect();
        concepts.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        concepts.truncate(self.settings.concept_limit);

        (
            GraphInsights {
                shared_entities,
                clusters,
            },
            concepts,
        )
    }

    fn plan_exploration(&self, concept: &str, embedding: Option<&[f32]>) -> Option<ExplorationPlan> {
        let graph = self.graph.read();
        let resolution = graph.resolve(concept, None, embedding)?;
        let seed = graph.entity(&resolution.entity_id)?;
        let cluster = graph.cluster_of(&seed.id);

        let mut explored: BTreeSet<EntityId> = BTreeSet::from([seed.id.clone()]);
        if let Some(headed) = graph.clusters().headed_by(&seed.id) {
            explored.extend(headed.members.iter().cloned());
        }
        if let Some(path) = &cluster
            && path.cluster.concept.is_some()
        {
            explored.extend(path.cluster.members.iter().cloned());
        }
        let neighbors = graph.neighbor_entities(&seed.id, None);
        explored.extend(neighbors.iter().map(|e| e.id.clone()));

        let chunks = graph
            .chunks_mentioning(explored.iter().map(String::as_str))
            .into_iter()
            .map(|chunk_id| {
                let mentioned = chunk_entity_ids(&graph, &chunk_id);
                let seeded = mentioned.contains(seed.id.as_str());
                let matched = mentioned
                    .iter()
                    .filter(|id| explored.contains(**id))
                    .count();
                (chunk_id, seeded, matched)
            })
            .collect();

        let exploration = Exploration {
            entity: EntityRef::new(seed, graph.is_low_confidence(seed)),
            cluster,
            neighbors: neighbors
                .into_iter()
                .map(|e| EntityRef::new(e, graph.is_low_confidence(e)))
                .collect(),
            explored: explored.into_iter().collect(),
        };
        Some(ExplorationPlan { exploration, chunks })
    }
}

fn chunk_entity_ids<'a>(graph: &'a KnowledgeGraphIndex, chunk_id: &str) -> BTreeSet<&'a str> {
    graph
        .entities_in_chunk(chunk_id)
        .into_iter()
        .map(|e| e.id.as_str())
        .collect()
}

/// Jaccard overlap of two chunks' link keys, each side's own file key
/// included. Files with the same name in different folders do not relate
/// through that name unless one of them links to it.
fn link_overlap(a: &DocumentChunk, b: &DocumentChunk) -> f32 {
    let (a_links, b_links) = (a.link_keys(), b.link_keys());
    let (a_key, b_key) = (a.file_key(), b.file_key());
    let namesake = a_key == b_key && !a_links.contains(&a_key) && !b_links.contains(&b_key);

    let mut a_keys = a_links;
    let mut b_keys = b_links;
    if !namesake {
        a_keys.insert(a_key);
        b_keys.insert(b_key);
    }
    jaccard(&a_keys, &b_keys)
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let shared = a.intersection(b).count();
    if shared == 0 {
        return 0.0;
    }
    let union = a.union(b).count();
    #[allow(clippy::cast_precision_loss)]
    let score = shared as f32 / union as f32;
    score
}

/// Normalized mean of the chunks' embeddings; `None` when there are none.
fn mean_embedding(chunks: &[DocumentChunk]) -> Option<Vec<f32>> {
    let dimension = chunks.first()?.embedding.len();
    let mut mean = vec![0.0_f32; dimension];
    for chunk in chunks {
        for (acc, value) in mean.iter_mut().zip(&chunk.embedding) {
            *acc += value;
        }
    }
    normalize(&mut mean);
    Some(mean)
}

fn top_tags(chunk: &DocumentChunk, stats: Option<&StoreStats>, limit: usize) -> Vec<String> {
    let count = |tag: &String| {
        stats
            .and_then(|s| s.tag_distribution.get(tag))
            .copied()
            .unwrap_or_default()
    };
    let mut tags: Vec<&String> = chunk.metadata.tags.iter().collect();
    tags.sort_by(|a, b| count(b).cmp(&count(a)).then_with(|| a.cmp(b)));
    tags.into_iter().take(limit).cloned().collect()
}

fn response_facets(results: &[SearchResult], store: Option<StoreStats>) -> ResponseFacets {
    let mut facets = ResponseFacets {
        store,
        ..ResponseFacets::default()
    };
    for result in results {
        let chunk = &result.chunk;
        *facets
            .content_types
            .entry(chunk.metadata.content_type.to_string())
            .or_default() += 1;
        *facets.folders.entry(chunk.folder.clone()).or_default() += 1;
        for tag in &chunk.metadata.tags {
            *facets.tags.entry(tag.clone()).or_default() += 1;
        }
    }
    facets
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::ExtractionSettings;
    use crate::corpus::{ChunkMetadata, folder_of};
    use crate::embedding::{EmbeddingError, HashingEmbedder};
    use crate::extract::Extractor;
    use crate::extract::rules::RuleBasedModel;
    use crate::ingest::Ingestor;
    use crate::search::RelatedReason;
    use crate::storage::memory::MemoryChunkStore;
    use crate::storage::{StorageError, UpsertOutcome};

    const DIM: usize = 256;

    struct Vault {
        orchestrator: SearchOrchestrator,
        ingestor: Ingestor,
        graph: SharedGraph,
    }

    fn chunk(id: &str, file: &str, content: &str) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            file_name: file.to_string(),
            folder: folder_of(file),
            chunk_index: 0,
            content: content.to_string(),
            embedding: HashingEmbedder::new(DIM).embed_sync(content),
            metadata: ChunkMetadata::default(),
        }
    }

    fn with_meta(mut chunk: DocumentChunk, metadata: ChunkMetadata) -> DocumentChunk {
        chunk.metadata = metadata;
        chunk
    }

    async fn vault_over(store: Arc<dyn ChunkStore>, chunks: Vec<DocumentChunk>) -> Vault {
        let embedder = Arc::new(HashingEmbedder::new(DIM));
        let graph = SharedGraph::default();
        let extractor = Extractor::new(Arc::new(RuleBasedModel::new()), ExtractionSettings::default());
        let ingestor = Ingestor::new(store.clone(), embedder.clone(), graph.clone(), extractor);
        ingestor.ingest_batch(chunks).await.unwrap();
        let orchestrator =
            SearchOrchestrator::new(store, embedder, graph.clone(), SearchSettings::default());
        Vault {
            orchestrator,
            ingestor,
            graph,
        }
    }

    async fn vault(chunks: Vec<DocumentChunk>) -> Vault {
        vault_over(Arc::new(MemoryChunkStore::new(DIM)), chunks).await
    }

    fn scenario() -> Vec<DocumentChunk> {
        vec![
            chunk("a", "notes/a.md", "Alice works at Acme Corp."),
            chunk("b", "notes/b.md", "Acme Corp is located in Springfield."),
        ]
    }

    #[tokio::test]
    async fn scenario_builds_typed_entities_and_relationships() {
        let v = vault(scenario()).await;
        let graph = v.graph.read();

        let alice = graph.entity("person/alice").unwrap();
        let acme = graph.entity("organization/acme-corp").unwrap();
        let springfield = graph.entity("location/springfield").unwrap();
        assert_eq!(alice.chunk_ids().len(), 1);
        assert_eq!(acme.chunk_ids().len(), 2);
        assert_eq!(springfield.chunk_ids().len(), 1);

        let kinds: BTreeSet<String> = graph
            .relationships_of(&acme.id)
            .iter()
            .map(|r| r.relationship_type.to_string())
            .collect();
        assert_eq!(kinds, BTreeSet::from(["located-in".to_string(), "works-for".to_string()]));
    }

    #[tokio::test]
    async fn exploring_a_concept_returns_chunks_around_it() {
        let v = vault(scenario()).await;

        let response = v
            .orchestrator
            .explore_knowledge_cluster("Acme Corp", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.chunk_ids(), vec!["a", "b"]);
        let exploration = response.exploration.unwrap();
        assert_eq!(exploration.entity.id, "organization/acme-corp");
        let neighbors: BTreeSet<&str> = exploration.neighbors.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(neighbors, BTreeSet::from(["Alice", "Springfield"]));
        assert!(response.results.iter().all(|r| r.score > 0.0 && r.score <= 1.0));
    }

    #[tokio::test]
    async fn exploring_an_unknown_concept_is_empty() {
        let v = vault(scenario()).await;

        let response = v
            .orchestrator
            .explore_knowledge_cluster("Globex", &SearchOptions::default())
            .await
            .unwrap();

        assert!(response.results.is_empty());
        assert!(response.exploration.is_none());
    }

    #[tokio::test]
    async fn high_cutoff_over_unrelated_chunks_is_empty() {
        let v = vault(vec![
            chunk("x", "garden.md", "Tomatoes need full sun and deep watering."),
            chunk("y", "bread.md", "Sourdough starter feeds on flour and water."),
        ])
        .await;
        let mut options = SearchOptions::default();
        options.filters.min_similarity = Some(0.9);

        let response = v.orchestrator.search("Acme", &options).await.unwrap();

        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn hits_respect_limit_cutoff_and_order() {
        let v = vault(vec![
            chunk("a", "a.md", "Acme Corp builds rockets."),
            chunk("b", "b.md", "Acme Corp rockets launch from Springfield."),
            chunk("c", "c.md", "Acme rockets."),
            chunk("d", "d.md", "Bread recipes."),
        ])
        .await;
        let mut options = SearchOptions::with_limit(2);
        options.filters.min_similarity = Some(0.1);

        let response = v.orchestrator.search("acme rockets", &options).await.unwrap();

        assert!(response.results.len() <= 2);
        assert!(!response.results.is_empty());
        assert!(response.results.iter().all(|r| r.score >= 0.1));
        assert!(response.results.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(response.results[0].chunk.id, "c");
    }

    #[tokio::test]
    async fn reingesting_identical_chunks_keeps_rankings() {
        let v = vault(scenario()).await;
        let before = v.orchestrator.search("Acme", &SearchOptions::default()).await.unwrap();

        let reports = v.ingestor.ingest_batch(scenario()).await.unwrap();
        let after = v.orchestrator.search("Acme", &SearchOptions::default()).await.unwrap();

        assert!(reports.iter().all(|r| r.outcome == UpsertOutcome::Unchanged));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn results_carry_highlights_graph_context_and_insights() {
        let v = vault(scenario()).await;

        let response = v
            .orchestrator
            .search("Acme Corp", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.results.len(), 2);
        let a = response.results.iter().find(|r| r.chunk.id == "a").unwrap();
        assert!(!a.highlights.is_empty());
        assert!(a.graph_context.entities.iter().any(|e| e.name == "Alice"));
        assert!(a.graph_context.neighbors.iter().any(|n| n.entity.name == "Springfield"));

        let shared = &response.graph_insights.shared_entities;
        assert_eq!(shared[0].entity.id, "organization/acme-corp");
        assert_eq!(shared[0].hits, 2);
        assert_eq!(response.concepts[0].entity.name, "Acme Corp");
        assert_eq!(response.concepts[0].frequency, 2);
        assert_eq!(response.facets.folders.get("notes"), Some(&2));
        assert!(response.facets.store.is_some());
    }

    #[tokio::test]
    async fn blank_queries_and_bad_filters_are_invalid_input() {
        let v = vault(scenario()).await;
        let mut bad = SearchOptions::default();
        bad.filters.min_similarity = Some(2.0);

        let blank = v.orchestrator.search("   ", &SearchOptions::default()).await;
        let malformed = v.orchestrator.search("Acme", &bad).await;

        assert!(matches!(blank, Err(SearchError::InvalidInput(_))));
        assert!(matches!(malformed, Err(SearchError::InvalidInput(_))));
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn embedder_outage_is_upstream_unavailable() {
        let store = Arc::new(MemoryChunkStore::new(DIM));
        let orchestrator = SearchOrchestrator::new(
            store,
            Arc::new(DownEmbedder),
            SharedGraph::default(),
            SearchSettings::default(),
        );
        let mut bad = SearchOptions::default();
        bad.filters.tags = vec![" ".into()];

        let down = orchestrator.search("Acme", &SearchOptions::default()).await;
        let invalid_first = orchestrator.search("Acme", &bad).await;

        assert!(matches!(down, Err(SearchError::UpstreamUnavailable(_))));
        assert!(matches!(invalid_first, Err(SearchError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn cancelled_requests_stop() {
        let v = vault(scenario()).await;
        let options = SearchOptions::default();
        options.cancel.cancel();

        let result = v.orchestrator.search("Acme", &options).await;

        assert!(matches!(result, Err(SearchError::Cancelled)));
    }

    /// Store whose listing and stats fail while search keeps working.
    struct DegradedStore(MemoryChunkStore);

    #[async_trait]
    impl ChunkStore for DegradedStore {
        fn dimension(&self) -> usize {
            self.0.dimension()
        }

        async fn upsert(&self, chunk: DocumentChunk) -> Result<UpsertOutcome, StorageError> {
            self.0.upsert(chunk).await
        }

        async fn search(
            &self,
            query: &[f32],
            limit: usize,
            filters: &SearchFilters,
        ) -> Result<Vec<ScoredChunk>, StorageError> {
            self.0.search(query, limit, filters).await
        }

        async fn list(&self, _filters: &SearchFilters) -> Result<Vec<DocumentChunk>, StorageError> {
            Err(StorageError::Unavailable("replica lagging".into()))
        }

        async fn get_by_id(&self, id: &str) -> Result<Option<DocumentChunk>, StorageError> {
            self.0.get_by_id(id).await
        }

        async fn get_chunks_by_file(
            &self,
            file_name: &str,
        ) -> Result<Vec<DocumentChunk>, StorageError> {
            self.0.get_chunks_by_file(file_name).await
        }

        async fn get_stats(&self) -> Result<StoreStats, StorageError> {
            Err(StorageError::Unavailable("replica lagging".into()))
        }

        async fn delete_chunks_by_file(&self, file_name: &str) -> Result<Vec<String>, StorageError> {
            self.0.delete_chunks_by_file(file_name).await
        }

        async fn clear_all(&self) -> Result<usize, StorageError> {
            self.0.clear_all().await
        }
    }

    #[tokio::test]
    async fn failed_enrichment_leaves_fields_empty_but_keeps_hits() {
        let store = Arc::new(DegradedStore(MemoryChunkStore::new(DIM)));
        let v = vault_over(store, scenario()).await;

        let response = v.orchestrator.search("Acme", &SearchOptions::default()).await.unwrap();

        assert_eq!(response.results.len(), 2);
        assert!(response.results.iter().all(|r| r.related_chunks.is_empty()));
        assert!(response.facets.store.is_none());
        assert!(!response.results[0].graph_context.entities.is_empty());
    }

    #[tokio::test]
    async fn tag_search_orders_by_recency() {
        let tagged = |id: &str, day: Option<u32>| {
            with_meta(
                chunk(id, &format!("{id}.md"), "Project log."),
                ChunkMetadata {
                    tags: BTreeSet::from(["project".to_string()]),
                    modified_at: day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()),
                    ..ChunkMetadata::default()
                },
            )
        };
        let v = vault(vec![
            tagged("t1", Some(1)),
            tagged("t2", Some(20)),
            tagged("t3", None),
            chunk("t4", "t4.md", "Untagged."),
        ])
        .await;

        let response = v
            .orchestrator
            .search_by_tag("#project", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.chunk_ids(), vec!["t2", "t1", "t3"]);
        assert!(response.results.iter().all(|r| (r.score - 1.0).abs() < f32::EPSILON));
    }

    #[tokio::test]
    async fn mocs_without_query_rank_by_inbound_links() {
        let moc = |id: &str, file: &str| {
            with_meta(
                chunk(id, file, "Map of content."),
                ChunkMetadata {
                    content_type: ContentType::Moc,
                    ..ChunkMetadata::default()
                },
            )
        };
        let linking = |id: &str, links: &[&str]| {
            with_meta(
                chunk(id, &format!("{id}.md"), "Daily note."),
                ChunkMetadata {
                    wikilinks: links.iter().map(ToString::to_string).collect(),
                    ..ChunkMetadata::default()
                },
            )
        };
        let v = vault(vec![
            moc("hub", "Hub.md"),
            moc("index", "maps/Index.md"),
            linking("n1", &["Index"]),
            linking("n2", &["[[Index|home]]", "Hub"]),
        ])
        .await;

        let response = v
            .orchestrator
            .search_mocs(None, &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.chunk_ids(), vec!["index", "hub"]);
        assert!((response.results[0].score - 1.0).abs() < f32::EPSILON);
        assert!((response.results[1].score - 0.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn conversations_mode_filters_content_type() {
        let v = vault(vec![
            with_meta(
                chunk("c1", "chats/acme.md", "We talked about Acme Corp pricing."),
                ChunkMetadata {
                    content_type: ContentType::Conversation,
                    ..ChunkMetadata::default()
                },
            ),
            chunk("n1", "notes/acme.md", "Acme Corp pricing notes."),
        ])
        .await;

        let response = v
            .orchestrator
            .search_conversations("Acme pricing", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.chunk_ids(), vec!["c1"]);
    }

    #[tokio::test]
    async fn related_notes_exclude_the_seed_file() {
        let mut second = chunk("p2", "proj/acme.md", "Acme Corp rockets and fuel.");
        second.chunk_index = 1;
        let v = vault(vec![
            chunk("p1", "proj/acme.md", "Acme Corp rockets."),
            second,
            chunk("q", "people/alice.md", "Alice builds Acme rockets."),
            chunk("z", "garden.md", "Tomatoes and basil."),
        ])
        .await;

        let response = v
            .orchestrator
            .find_related_notes("proj/acme.md", &SearchOptions::default())
            .await
            .unwrap();
        let unknown = v
            .orchestrator
            .find_related_notes("missing.md", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.results[0].chunk.id, "q");
        assert!(response.results.iter().all(|r| r.chunk.file_name != "proj/acme.md"));
        assert!(unknown.results.is_empty());
    }

    #[tokio::test]
    async fn shared_wikilinks_relate_chunks_across_files() {
        let v = vault(vec![
            with_meta(
                chunk("a", "notes/alice.md", "Alice works at Acme Corp."),
                ChunkMetadata {
                    wikilinks: vec!["Acme Corp".into()],
                    ..ChunkMetadata::default()
                },
            ),
            chunk("b", "orgs/Acme Corp.md", "Acme Corp is located in Springfield."),
        ])
        .await;

        let response = v
            .orchestrator
            .search("Alice", &SearchOptions::with_limit(1))
            .await
            .unwrap();

        let related = &response.results[0].related_chunks;
        assert_eq!(related[0].id, "b");
        assert_eq!(related[0].reason, RelatedReason::SharedWikilink);
    }

    #[tokio::test]
    async fn deleted_files_disappear_with_their_orphaned_entities() {
        let v = vault(scenario()).await;

        v.ingestor.delete_file("notes/b.md").await.unwrap();
        let response = v
            .orchestrator
            .get_file_chunks("notes/b.md", &SearchOptions::default())
            .await
            .unwrap();

        assert!(response.results.is_empty());
        assert!(v.graph.read().entity("location/springfield").is_none());
        assert!(v.graph.read().entity("organization/acme-corp").is_some());
    }

    #[tokio::test]
    async fn file_chunks_come_back_in_order_with_graph_context() {
        let mut second = chunk("a1", "notes/a.md", "Acme Corp is located in Springfield.");
        second.chunk_index = 1;
        let v = vault(vec![second, chunk("a0", "notes/a.md", "Alice works at Acme Corp.")]).await;

        let response = v
            .orchestrator
            .get_file_chunks("notes/a.md", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.chunk_ids(), vec!["a0", "a1"]);
        assert!(!response.results[1].graph_context.entities.is_empty());
    }

    /// Store counting `list` calls, optionally cancelling a request from
    /// inside the first one.
    struct CountingStore {
        inner: MemoryChunkStore,
        lists: AtomicUsize,
        cancel_on_list: Option<CancellationToken>,
    }

    impl CountingStore {
        fn new(cancel_on_list: Option<CancellationToken>) -> Self {
            Self {
                inner: MemoryChunkStore::new(DIM),
                lists: AtomicUsize::new(0),
                cancel_on_list,
            }
        }
    }

    #[async_trait]
    impl ChunkStore for CountingStore {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn upsert(&self, chunk: DocumentChunk) -> Result<UpsertOutcome, StorageError> {
            self.inner.upsert(chunk).await
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
            self.lists.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_list {
                token.cancel();
            }
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
            self.inner.delete_chunks_by_file(file_name).await
        }

        async fn clear_all(&self) -> Result<usize, StorageError> {
            self.inner.clear_all().await
        }
    }

    #[tokio::test]
    async fn enrichment_lists_the_store_once_per_response() {
        let store = Arc::new(CountingStore::new(None));
        let v = vault_over(
            store.clone(),
            vec![
                chunk("a", "notes/a.md", "Alice works at Acme Corp."),
                chunk("b", "notes/b.md", "Acme Corp is located in Springfield."),
                chunk("c", "notes/c.md", "Acme Corp hired Bob."),
            ],
        )
        .await;
        store.lists.store(0, Ordering::SeqCst);

        let response = v.orchestrator.search("Acme Corp", &SearchOptions::default()).await.unwrap();

        assert_eq!(response.results.len(), 3);
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_enrichment_stops_the_request() {
        let options = SearchOptions::default();
        let store = Arc::new(CountingStore::new(Some(options.cancel.clone())));
        let v = vault_over(store.clone(), scenario()).await;

        let result = v.orchestrator.search("Acme", &options).await;

        assert!(matches!(result, Err(SearchError::Cancelled)));
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn weak_entities_are_flagged_in_graph_context() {
        let v = vault(vec![
            chunk("a", "notes/a.md", "Alice works at Acme Corp."),
            chunk("c", "places/lagoon.md", "We visited the Blue Lagoon yesterday."),
        ])
        .await;

        let lagoon = v
            .orchestrator
            .get_file_chunks("places/lagoon.md", &SearchOptions::default())
            .await
            .unwrap();
        let acme = v
            .orchestrator
            .get_file_chunks("notes/a.md", &SearchOptions::default())
            .await
            .unwrap();

        let weak = &lagoon.results[0].graph_context.entities;
        assert!(weak.iter().any(|e| e.name == "Blue Lagoon" && e.low_confidence));
        let strong = &acme.results[0].graph_context.entities;
        assert!(strong.iter().any(|e| e.id == "organization/acme-corp" && !e.low_confidence));
    }

    #[tokio::test]
    async fn namesake_files_in_different_folders_are_not_linked() {
        let v = vault(vec![
            chunk("a", "work/index.md", "Quarterly planning for the platform team."),
            chunk("b", "home/index.md", "Grocery list and weekend errands."),
        ])
        .await;

        let response = v
            .orchestrator
            .get_file_chunks("work/index.md", &SearchOptions::default())
            .await
            .unwrap();

        assert!(
            response.results[0]
                .related_chunks
                .iter()
                .all(|r| r.reason != RelatedReason::SharedWikilink)
        );
    }
}
