//! Chunk store trait and implementations.
//!
//! This module provides the similarity-search contract the rest of vaultgraph
//! consumes, allowing different persistence backends (in-memory, local JSON
//! snapshot, or an external vector database) behind one trait.

pub mod local;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::corpus::{ContentType, DocumentChunk, link_key};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Embedding component {index} is not a finite number")]
    NonFiniteEmbedding { index: usize },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read: {0}")]
    ReadError(String),

    #[error("Failed to write: {0}")]
    WriteError(String),

    #[error("Failed to parse snapshot: {0}")]
    ParseError(String),

    #[error("Failed to serialize: {0}")]
    SerializeError(String),
}

/// What an upsert did to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored chunk was already identical; nothing changed.
    Unchanged,
}

/// How multiple tag filters combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    /// A chunk matches when it carries at least one of the tags.
    #[default]
    Any,
    /// A chunk matches only when it carries every tag.
    All,
}

/// Structured filters applied to the candidate set before ranking.
///
/// Structural filters (content type, folder, wikilink presence, date range)
/// must all hold when set. Tags combine according to `tag_match`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub content_type: Option<ContentType>,
    pub folder_prefix: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag_match: TagMatch,
    pub has_wikilinks: Option<bool>,
    /// Keep chunks linking to at least one of these targets.
    #[serde(default)]
    pub links_to: Vec<String>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exclude_files: Vec<String>,
    #[serde(default)]
    pub exclude_ids: Vec<String>,
    /// Hits scoring below this are dropped. Ignored by `list`.
    pub min_similarity: Option<f32>,
}

impl SearchFilters {
    /// Reject filters that can never be satisfied or are malformed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidFilter` describing the first problem found.
    pub fn validate(&self) -> Result<(), StorageError> {
        if let Some(min) = self.min_similarity
            && !(-1.0..=1.0).contains(&min)
        {
            return Err(StorageError::InvalidFilter(format!(
                "min_similarity must be within [-1, 1], got {min}"
            )));
        }

        if let (Some(after), Some(before)) = (self.modified_after, self.modified_before)
            && after > before
        {
            return Err(StorageError::InvalidFilter(
                "modified_after is later than modified_before".to_string(),
            ));
        }

        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(StorageError::InvalidFilter("tags cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Whether a chunk passes every structural and tag filter.
    #[must_use]
    pub fn matches(&self, chunk: &DocumentChunk) -> bool {
        let meta = &chunk.metadata;

        if let Some(content_type) = self.content_type
            && meta.content_type != content_type
        {
            return false;
        }

        if let Some(prefix) = &self.folder_prefix {
            let prefix = prefix.trim_end_matches('/');
            let inside = prefix.is_empty()
                || chunk.folder == prefix
                || chunk
                    .folder
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'));
            if !inside {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let matched = match self.tag_match {
                TagMatch::Any => self.tags.iter().any(|t| meta.tags.contains(t)),
                TagMatch::All => self.tags.iter().all(|t| meta.tags.contains(t)),
            };
            if !matched {
                return false;
            }
        }

        if let Some(has_links) = self.has_wikilinks
            && meta.wikilinks.is_empty() == has_links
        {
            return false;
        }

        if !self.links_to.is_empty() {
            let keys = chunk.link_keys();
            if !self.links_to.iter().any(|t| keys.contains(&link_key(t))) {
                return false;
            }
        }

        if self.modified_after.is_some() || self.modified_before.is_some() {
            let Some(modified) = meta.modified_at else {
                return false;
            };
            if self.modified_after.is_some_and(|after| modified < after)
                || self.modified_before.is_some_and(|before| modified > before)
            {
                return false;
            }
        }

        if self.exclude_files.iter().any(|f| f == &chunk.file_name) {
            return false;
        }

        !self.exclude_ids.iter().any(|id| id == &chunk.id)
    }
}

/// A chunk returned by similarity search with its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    /// Cosine similarity in [-1, 1]; higher is more relevant.
    pub score: f32,
}

/// Aggregate counts over the stored chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_files: usize,
    pub by_content_type: BTreeMap<String, usize>,
    pub by_folder: BTreeMap<String, usize>,
    pub tag_distribution: BTreeMap<String, usize>,
    /// Link key → number of chunks linking to it.
    pub inbound_links: BTreeMap<String, usize>,
}

impl StoreStats {
    /// Compute stats over a set of chunks.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a DocumentChunk>) -> Self {
        let mut stats = Self::default();
        let mut files = std::collections::BTreeSet::new();

        for chunk in chunks {
            stats.total_chunks += 1;
            files.insert(chunk.file_name.as_str());
            *stats
                .by_content_type
                .entry(chunk.metadata.content_type.to_string())
                .or_default() += 1;
            *stats.by_folder.entry(chunk.folder.clone()).or_default() += 1;
            for tag in &chunk.metadata.tags {
                *stats.tag_distribution.entry(tag.clone()).or_default() += 1;
            }
            for key in chunk.link_keys() {
                *stats.inbound_links.entry(key).or_default() += 1;
            }
        }

        stats.total_files = files.len();
        stats
    }
}

/// Trait for chunk store backends (in-memory, local snapshot, vector database).
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Embedding dimension every stored chunk and query must have.
    fn dimension(&self) -> usize;

    /// Insert or replace a chunk by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidDimension` if the embedding has the wrong
    /// length, or a backend error if the write fails.
    async fn upsert(&self, chunk: DocumentChunk) -> Result<UpsertOutcome, StorageError>;

    /// Insert or replace several chunks; outcomes are returned in input order.
    ///
    /// # Errors
    ///
    /// Returns the first error hit; chunks before it may already be stored.
    async fn batch_upsert(
        &self,
        chunks: Vec<DocumentChunk>,
    ) -> Result<Vec<UpsertOutcome>, StorageError> {
        let mut outcomes = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            outcomes.push(self.upsert(chunk).await?);
        }
        Ok(outcomes)
    }

    /// Return up to `limit` chunks by descending similarity to `query`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidDimension` if `query` has the wrong length,
    /// `StorageError::InvalidFilter` for malformed filters.
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, StorageError>;

    /// Return every chunk passing `filters`, ordered by file then chunk index.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidFilter` for malformed filters.
    async fn list(&self, filters: &SearchFilters) -> Result<Vec<DocumentChunk>, StorageError>;

    /// Look up a chunk; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the lookup itself fails.
    async fn get_by_id(&self, id: &str) -> Result<Option<DocumentChunk>, StorageError>;

    /// Chunks of one file in chunk order; empty for unknown files.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the lookup itself fails.
    async fn get_chunks_by_file(&self, file_name: &str)
    -> Result<Vec<DocumentChunk>, StorageError>;

    /// Aggregate counts over the stored chunks.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the stats cannot be computed.
    async fn get_stats(&self) -> Result<StoreStats, StorageError>;

    /// Remove every chunk of a file, returning the removed ids.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the removal fails.
    async fn delete_chunks_by_file(&self, file_name: &str) -> Result<Vec<String>, StorageError>;

    /// Remove every chunk, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the removal fails.
    async fn clear_all(&self) -> Result<usize, StorageError>;
}
