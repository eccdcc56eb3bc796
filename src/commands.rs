//! Command implementations shared by CLI and MCP server.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::debug;

use crate::config::{Config, EmbeddingProvider};
use crate::corpus::ChunkRecord;
use crate::embedding::http::HttpEmbedder;
use crate::embedding::{Embedder, HashingEmbedder};
use crate::extract::Extractor;
use crate::extract::rules::RuleBasedModel;
use crate::graph::{KnowledgeGraphIndex, SharedGraph};
use crate::ingest::{ExtractionStatus, IngestReport, Ingestor};
use crate::search::{RelatedReason, SearchOrchestrator, SearchResponse};
use crate::storage::local::LocalChunkStore;
use crate::storage::{ChunkStore, StoreStats, UpsertOutcome};

/// Maximum length for user-provided queries.
const MAX_QUERY_LENGTH: usize = 1000;

/// An opened vault: store, graph, and the services over them.
pub struct Vault {
    graph: SharedGraph,
    ingestor: Ingestor,
    search: SearchOrchestrator,
}

impl Vault {
    /// Open the store configured in `config` and rebuild the graph from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or embedder cannot be set up, or the
    /// stored chunks cannot be read.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let vault = Self::open_store(config)?;
        let chunks = vault.ingestor.rebuild_graph().await?;
        debug!(chunks, "Rebuilt graph for vault");
        Ok(vault)
    }

    /// Open the configured store but leave the graph empty, for commands
    /// that only touch stored chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or embedder cannot be set up.
    pub fn open_store(config: &Config) -> anyhow::Result<Self> {
        let root = config.store_path();
        let store = LocalChunkStore::open(root.clone(), config.store.dimension)
            .with_context(|| format!("Cannot open store at {}", root.display()))?;
        let embedder = build_embedder(config)?;
        debug!(store = %root.display(), "Opened vault");
        Ok(Self::from_parts(config, Arc::new(store), embedder))
    }

    /// Assemble a vault over an existing store and embedder. The graph starts
    /// empty; call [`Ingestor::rebuild_graph`] if the store already has chunks.
    #[must_use]
    pub fn from_parts(
        config: &Config,
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let graph = SharedGraph::new(KnowledgeGraphIndex::new(&config.extraction));
        let extractor = Extractor::new(Arc::new(RuleBasedModel::new()), config.extraction.clone())
            .with_embedder(Arc::clone(&embedder));

        let ingestor = Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            graph.clone(),
            extractor,
        );
        let search = SearchOrchestrator::new(store, embedder, graph.clone(), config.search.clone());

        Self {
            graph,
            ingestor,
            search,
        }
    }

    #[must_use]
    pub fn search(&self) -> &SearchOrchestrator {
        &self.search
    }

    #[must_use]
    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    #[must_use]
    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    /// Ingest a JSON array of chunk records from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or ingestion fails.
    pub async fn ingest_file(&self, path: &Path) -> anyhow::Result<Vec<IngestReport>> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let records = ChunkRecord::parse_many(&json)?;
        Ok(self.ingestor.ingest_records(records).await?)
    }
}

/// Build the embedder selected by `[embedding] provider`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    let dimension = config.store.dimension;
    Ok(match config.embedding.provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(dimension)),
        EmbeddingProvider::Http => Arc::new(HttpEmbedder::new(&config.embedding, dimension)?),
    })
}

/// Reject queries the CLI and MCP surfaces will not forward.
///
/// # Errors
///
/// Returns an error for queries longer than the maximum length.
pub fn validate_query(query: &str) -> anyhow::Result<()> {
    if query.len() > MAX_QUERY_LENGTH {
        anyhow::bail!(
            "Query too long: {} chars (max {MAX_QUERY_LENGTH})",
            query.len()
        );
    }
    Ok(())
}

/// Parse comma-separated tags into a vector.
///
/// Splits the input on commas, trims whitespace and a leading `#`, and filters
/// out empty strings.
#[must_use]
pub fn parse_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(|s| s.trim().trim_start_matches('#').to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Pretty-printed JSON for `--json` output and MCP structured replies.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Render a search response as plain text.
///
/// `subject` names what was searched for and appears in the empty message.
#[must_use]
pub fn format_response(subject: &str, response: &SearchResponse) -> String {
    let mut out = String::new();

    if let Some(exploration) = &response.exploration {
        let _ = writeln!(
            out,
            "Exploring {} ({})",
            exploration.entity.name, exploration.entity.entity_type
        );
        if let Some(path) = &exploration.cluster {
            let mut labels = vec![path.cluster.label.as_str()];
            labels.extend(path.ancestors.iter().map(|c| c.label.as_str()));
            let _ = writeln!(out, "  cluster: {}", labels.join(" < "));
        }
        if !exploration.neighbors.is_empty() {
            let names: Vec<&str> = exploration.neighbors.iter().map(|n| n.name.as_str()).collect();
            let _ = writeln!(out, "  neighbors: {}", names.join(", "));
        }
        out.push('\n');
    }

    if response.results.is_empty() {
        let _ = writeln!(out, "No matches found for '{subject}'");
        return out;
    }

    for (rank, result) in response.results.iter().enumerate() {
        let chunk = &result.chunk;
        let _ = writeln!(
            out,
            "{}. {} [{}] score {:.3}",
            rank + 1,
            chunk.id,
            result.facets.content_type,
            result.score
        );
        if !chunk.metadata.tags.is_empty() {
            let tags: Vec<String> = chunk.metadata.tags.iter().map(|t| format!("#{t}")).collect();
            let _ = writeln!(out, "   tags: {}", tags.join(" "));
        }
        for highlight in &result.highlights {
            let _ = writeln!(out, "   > {}", highlight.text);
        }
        if !result.graph_context.entities.is_empty() {
            let entities: Vec<String> = result
                .graph_context
                .entities
                .iter()
                .map(|e| {
                    let marker = if e.low_confidence { "?" } else { "" };
                    format!("{}{marker} ({})", e.name, e.entity_type)
                })
                .collect();
            let _ = writeln!(out, "   entities: {}", entities.join(", "));
        }
        for related in &result.related_chunks {
            let reason = match related.reason {
                RelatedReason::SharedWikilink => "shared links",
                RelatedReason::Similar => "similar",
            };
            let _ = writeln!(out, "   related: {} ({reason} {:.2})", related.id, related.score);
        }
    }

    if !response.concepts.is_empty() {
        let concepts: Vec<String> = response
            .concepts
            .iter()
            .map(|c| format!("{} x{}", c.entity.name, c.frequency))
            .collect();
        let _ = writeln!(out, "\nConcepts: {}", concepts.join(", "));
    }
    if !response.graph_insights.shared_entities.is_empty() {
        let shared: Vec<String> = response
            .graph_insights
            .shared_entities
            .iter()
            .map(|s| format!("{} ({} hits)", s.entity.name, s.hits))
            .collect();
        let _ = writeln!(out, "Shared entities: {}", shared.join(", "));
    }

    let _ = writeln!(out, "\n{} result(s) found", response.results.len());
    out
}

/// Render store stats as plain text.
#[must_use]
pub fn format_stats(stats: &StoreStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Chunks: {}", stats.total_chunks);
    let _ = writeln!(out, "Files: {}", stats.total_files);

    let sections = [
        ("Content types", &stats.by_content_type),
        ("Folders", &stats.by_folder),
        ("Tags", &stats.tag_distribution),
    ];
    for (title, counts) in sections {
        if counts.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{title}:");
        for (key, count) in counts {
            let key = if key.is_empty() { "(root)" } else { key };
            let _ = writeln!(out, "  {key}: {count}");
        }
    }
    out
}

/// Render ingestion reports as plain text.
#[must_use]
pub fn format_ingest(reports: &[IngestReport]) -> String {
    let mut out = String::new();
    let mut degraded = 0;

    for report in reports {
        let outcome = match report.outcome {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        };
        let detail = match &report.extraction {
            ExtractionStatus::Extracted {
                entities,
                relationships,
            } => format!("{entities} entities, {relationships} relationships"),
            ExtractionStatus::Degraded { reason } => {
                degraded += 1;
                format!("extraction degraded: {reason}")
            }
            ExtractionStatus::Skipped => "extraction skipped".to_string(),
        };
        let _ = writeln!(out, "{}: {outcome} ({detail})", report.chunk_id);
    }

    let _ = writeln!(out, "Ingested {} chunk(s)", reports.len());
    if degraded > 0 {
        let _ = writeln!(out, "{degraded} chunk(s) queued for reprocessing");
    }
    out
}
