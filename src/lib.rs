//! vaultgraph - Semantic retrieval and a knowledge graph over a note vault.
//!
//! Chunks of vault notes are stored with their embeddings; every search mode
//! returns hits enriched with highlights, related chunks, and the entities and
//! clusters the knowledge graph knows about.
//!
//! # Modules
//!
//! - [`commands`] - The opened [`commands::Vault`] and output formatting
//! - [`corpus`] - Chunk and metadata types
//! - [`storage`] - Chunk store trait and implementations
//! - [`embedding`] - Embedder trait, hashing and HTTP embedders
//! - [`extract`] - Entity and relationship extraction
//! - [`graph`] - Knowledge graph index and cluster hierarchy
//! - [`ingest`] - Store writes and graph maintenance
//! - [`search`] - Search orchestration and the response envelope
//! - [`config`] - Configuration loading
//! - [`cli`] - Command-line interface definitions

pub mod cli;
pub mod commands;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod search;
pub mod storage;

#[cfg(feature = "mcp")]
pub mod mcp;
