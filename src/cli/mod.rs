//! CLI interface for vaultgraph.
//!
//! Provides command-line argument parsing using clap.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use crate::commands::parse_tags;
use crate::corpus::ContentType;
use crate::search::SearchOptions;
use crate::storage::{SearchFilters, TagMatch};

/// Command-line interface for vaultgraph.
#[derive(Parser)]
#[command(name = "vaultgraph")]
#[command(
    author,
    version,
    about = "Semantic search and knowledge graph over a note vault",
    long_about = None
)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Result shaping shared by every search-like command.
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Maximum number of results to return (config default when omitted).
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Print the full JSON response instead of text.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub filters: FilterArgs,
}

/// Structured filters applied before ranking.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only chunks of this content type.
    #[arg(short = 't', long = "type", value_enum)]
    pub content_type: Option<ContentType>,

    /// Only chunks under this folder (e.g., "projects/2024").
    #[arg(short, long)]
    pub folder: Option<String>,

    /// Comma-separated tags to filter by.
    #[arg(short = 'T', long)]
    pub tags: Option<String>,

    /// How multiple tags combine.
    #[arg(long, value_enum, default_value_t = TagMatch::Any)]
    pub tag_match: TagMatch,

    /// Only chunks that contain wikilinks.
    #[arg(long, conflicts_with = "no_wikilinks")]
    pub has_wikilinks: bool,

    /// Only chunks without wikilinks.
    #[arg(long)]
    pub no_wikilinks: bool,

    /// Only chunks linking to this note (repeatable).
    #[arg(long = "links-to")]
    pub links_to: Vec<String>,

    /// Only chunks modified at or after this RFC 3339 timestamp.
    #[arg(long)]
    pub modified_after: Option<DateTime<Utc>>,

    /// Only chunks modified at or before this RFC 3339 timestamp.
    #[arg(long)]
    pub modified_before: Option<DateTime<Utc>>,

    /// Exclude chunks of this file (repeatable).
    #[arg(long = "exclude-file")]
    pub exclude_files: Vec<String>,

    /// Drop hits scoring below this similarity.
    #[arg(long)]
    pub min_similarity: Option<f32>,
}

impl FilterArgs {
    #[must_use]
    pub fn into_filters(self) -> SearchFilters {
        let has_wikilinks = match (self.has_wikilinks, self.no_wikilinks) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };

        SearchFilters {
            content_type: self.content_type,
            folder_prefix: self.folder,
            tags: parse_tags(self.tags),
            tag_match: self.tag_match,
            has_wikilinks,
            links_to: self.links_to,
            modified_after: self.modified_after,
            modified_before: self.modified_before,
            exclude_files: self.exclude_files,
            exclude_ids: Vec::new(),
            min_similarity: self.min_similarity,
        }
    }
}

impl QueryArgs {
    #[must_use]
    pub fn options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.limit,
            filters: self.filters.clone().into_filters(),
            ..SearchOptions::default()
        }
    }
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Semantic search across the vault.
    Search {
        /// The search query string.
        query: String,

        #[command(flatten)]
        args: QueryArgs,
    },

    /// List chunks carrying a tag, most recently modified first.
    Tag {
        /// Tag to look up (with or without a leading '#').
        tag: String,

        #[command(flatten)]
        args: QueryArgs,
    },

    /// Find maps of content, optionally ranked against a query.
    Mocs {
        /// Optional query; without one MOCs are ranked by inbound links.
        query: Option<String>,

        #[command(flatten)]
        args: QueryArgs,
    },

    /// Search conversation logs only.
    Conversations {
        /// The search query string.
        query: String,

        #[command(flatten)]
        args: QueryArgs,
    },

    /// Find notes related to a file.
    Related {
        /// Vault-relative file path (e.g., "notes/acme.md").
        file: String,

        #[command(flatten)]
        args: QueryArgs,
    },

    /// Explore the knowledge cluster around a concept.
    Explore {
        /// Concept or entity name.
        concept: String,

        #[command(flatten)]
        args: QueryArgs,
    },

    /// Show every chunk of a file in order.
    File {
        /// Vault-relative file path.
        file: String,

        /// Print the full JSON response instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show store statistics.
    Stats {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Ingest a JSON array of chunk records.
    Ingest {
        /// Path to the JSON file.
        path: String,

        /// Print JSON reports instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Remove every chunk of a file.
    Delete {
        /// Vault-relative file path.
        file: String,
    },

    /// Remove every chunk from the store.
    Clear,

    /// Retry entity extraction for chunks whose extraction failed.
    Reprocess,

    /// Start the MCP server for AI editor integration.
    #[cfg(feature = "mcp")]
    Serve,
}

impl Commands {
    /// Whether the command reads the knowledge graph. The others run
    /// without re-deriving it from the store.
    #[must_use]
    pub fn needs_graph(&self) -> bool {
        !matches!(self, Self::Stats { .. } | Self::Clear)
    }
}
