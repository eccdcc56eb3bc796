//! Search orchestration and the response envelope.
//!
//! Every search mode returns the same [`SearchResponse`]: hits in store
//! similarity order, each enriched with highlights, related chunks, graph
//! context and facets, plus response-level graph insights and concepts.

pub mod highlight;
pub mod orchestrator;

use std::collections::BTreeMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::corpus::{ChunkMetadata, ContentType, DocumentChunk};
use crate::embedding::EmbeddingError;
use crate::graph::{ClusterId, ClusterPath, Direction, Entity, EntityId, EntityType, RelationshipType};
use crate::storage::{SearchFilters, StorageError, StoreStats};

pub use highlight::Highlight;
pub use orchestrator::SearchOrchestrator;

/// Errors returned to search callers.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Search cancelled")]
    Cancelled,
}

impl From<StorageError> for SearchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidDimension { .. }
            | StorageError::NonFiniteEmbedding { .. }
            | StorageError::InvalidFilter(_) => {
                Self::InvalidInput(err.to_string())
            }
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<EmbeddingError> for SearchError {
    fn from(err: EmbeddingError) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

/// Per-request options shared by every search mode.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum hits; the configured default when `None`.
    pub limit: Option<usize>,
    pub filters: SearchFilters,
    /// Cancelling this token stops the request at the next checkpoint.
    pub cancel: CancellationToken,
}

impl SearchOptions {
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns `SearchError::Cancelled` once the token has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), SearchError> {
        if self.cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        Ok(())
    }
}

/// A chunk as returned to callers, without its embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkView {
    pub id: String,
    pub file_name: String,
    pub folder: String,
    pub chunk_index: u32,
    pub content: String,
    pub metadata: ChunkMetadata,
}

impl From<DocumentChunk> for ChunkView {
    fn from(chunk: DocumentChunk) -> Self {
        Self {
            id: chunk.id,
            file_name: chunk.file_name,
            folder: chunk.folder,
            chunk_index: chunk.chunk_index,
            content: chunk.content,
            metadata: chunk.metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RelatedReason {
    SharedWikilink,
    Similar,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedChunk {
    pub id: String,
    pub file_name: String,
    pub reason: RelatedReason,
    pub score: f32,
}

/// A compact view of an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub id: EntityId,
    pub name: String,
    pub entity_type: EntityType,
    pub confidence: f32,
    pub low_confidence: bool,
}

impl EntityRef {
    #[must_use]
    pub fn new(entity: &Entity, low_confidence: bool) -> Self {
        Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            entity_type: entity.entity_type,
            confidence: entity.confidence,
            low_confidence,
        }
    }
}

/// An entity one relationship away from an entity in the chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborRef {
    pub entity: EntityRef,
    pub via: EntityId,
    pub relationship: RelationshipType,
    pub direction: Direction,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphContext {
    pub entities: Vec<EntityRef>,
    pub neighbors: Vec<NeighborRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFacets {
    pub content_type: ContentType,
    pub folder: String,
    /// The chunk's tags, most common across the store first.
    pub top_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk: ChunkView,
    pub score: f32,
    pub highlights: Vec<Highlight>,
    pub related_chunks: Vec<RelatedChunk>,
    pub graph_context: GraphContext,
    pub facets: ResultFacets,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFacets {
    pub content_types: BTreeMap<String, usize>,
    pub folders: BTreeMap<String, usize>,
    pub tags: BTreeMap<String, usize>,
    /// Store-wide counts; absent when stats could not be computed.
    pub store: Option<StoreStats>,
}

/// An entity mentioned by more than one hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedEntity {
    pub entity: EntityRef,
    pub hits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub label: String,
    /// Number of hits mentioning an entity in this cluster.
    pub hits: usize,
    /// Ancestor labels, broadest last.
    pub ancestors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphInsights {
    pub shared_entities: Vec<SharedEntity>,
    pub clusters: Vec<ClusterSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    pub entity: EntityRef,
    /// Mentions within the returned chunks.
    pub frequency: usize,
}

/// Context for an `explore_knowledge_cluster` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exploration {
    pub entity: EntityRef,
    pub cluster: Option<ClusterPath>,
    pub neighbors: Vec<EntityRef>,
    /// Entities whose mentions were gathered.
    pub explored: Vec<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub facets: ResponseFacets,
    pub graph_insights: GraphInsights,
    pub concepts: Vec<Concept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exploration: Option<Exploration>,
}

impl SearchResponse {
    /// Chunk ids of the hits, in order.
    #[must_use]
    pub fn chunk_ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.chunk.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_caller_or_upstream_faults() {
        let bad = SearchError::from(StorageError::InvalidDimension {
            expected: 4,
            actual: 3,
        });
        let down = SearchError::from(StorageError::Unavailable("disk".into()));
        let non_finite = SearchError::from(StorageError::NonFiniteEmbedding { index: 0 });

        assert!(matches!(bad, SearchError::InvalidInput(_)));
        assert!(matches!(non_finite, SearchError::InvalidInput(_)));
        assert!(matches!(down, SearchError::UpstreamUnavailable(_)));
    }

    #[test]
    fn cancelled_token_is_reported() {
        let options = SearchOptions::default();
        assert!(options.check_cancelled().is_ok());

        options.cancel.cancel();

        assert!(matches!(options.check_cancelled(), Err(SearchError::Cancelled)));
    }

    #[test]
    fn empty_response_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(SearchResponse::default()).unwrap();

        assert!(json.get("graphInsights").is_some());
        assert!(json["facets"].get("contentTypes").is_some());
        assert!(json.get("exploration").is_none());
    }
}
