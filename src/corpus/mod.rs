//! Vault chunk model: document chunks, their metadata, and link keys.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when building chunks from user input.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Unknown content type: {0}")]
    UnknownContentType(String),

    #[error("Chunk is missing a file name")]
    MissingFileName,

    #[error("Failed to parse chunk records: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// What kind of note a chunk was cut from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// A regular note.
    #[default]
    Note,
    /// A map of content: a curated index of other notes.
    Moc,
    /// A conversation log.
    Conversation,
    /// Reference material (clippings, papers, docs).
    Reference,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Moc => "moc",
            Self::Conversation => "conversation",
            Self::Reference => "reference",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = CorpusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "note" => Ok(Self::Note),
            "moc" => Ok(Self::Moc),
            "conversation" => Ok(Self::Conversation),
            "reference" => Ok(Self::Reference),
            other => Err(CorpusError::UnknownContentType(other.to_string())),
        }
    }
}

/// Metadata carried alongside chunk text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Wikilink targets in the order they appear in the chunk.
    #[serde(default)]
    pub wikilinks: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// A bounded span of a vault file, stored with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Stable identifier (e.g., "notes/acme.md#0").
    pub id: String,
    /// Vault-relative file path (e.g., "notes/acme.md").
    pub file_name: String,
    /// Folder the file lives in (e.g., "notes").
    pub folder: String,
    /// Position of this chunk within its file.
    pub chunk_index: u32,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl DocumentChunk {
    /// Link key of the file this chunk belongs to.
    #[must_use]
    pub fn file_key(&self) -> String {
        link_key(&self.file_name)
    }

    /// Link keys of every wikilink target in this chunk, deduplicated.
    #[must_use]
    pub fn link_keys(&self) -> BTreeSet<String> {
        self.metadata
            .wikilinks
            .iter()
            .map(|l| link_key(l))
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// A chunk as supplied for ingestion, before its embedding is known.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub chunk_index: u32,
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(flatten)]
    pub metadata: ChunkMetadata,
}

impl ChunkRecord {
    /// Parse a JSON array of chunk records.
    ///
    /// # Errors
    ///
    /// Returns `CorpusError::ParseError` if the JSON is invalid.
    pub fn parse_many(json: &str) -> Result<Vec<Self>, CorpusError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Turn the record into a chunk with the given embedding.
    ///
    /// # Errors
    ///
    /// Returns `CorpusError::MissingFileName` if the file name is blank.
    pub fn into_chunk(self, embedding: Vec<f32>) -> Result<DocumentChunk, CorpusError> {
        let file_name = self.file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(CorpusError::MissingFileName);
        }

        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{file_name}#{}", self.chunk_index));
        let folder = self.folder.unwrap_or_else(|| folder_of(&file_name));

        Ok(DocumentChunk {
            id,
            file_name,
            folder,
            chunk_index: self.chunk_index,
            content: self.content,
            embedding,
            metadata: self.metadata,
        })
    }
}

/// Folder component of a vault-relative path ("" for files at the root).
#[must_use]
pub fn folder_of(file_name: &str) -> String {
    Path::new(file_name)
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

/// Normalize a wikilink target or file name into a comparable key.
///
/// `[[Projects/Acme Corp.md#History|Acme]]` and `projects/acme corp.md` both
/// become `acme corp`.
#[must_use]
pub fn link_key(target: &str) -> String {
    let inner = target.trim().trim_start_matches("[[").trim_end_matches("]]");
    let inner = inner.split('|').next().unwrap_or_default();
    let inner = inner.split('#').next().unwrap_or_default();
    let last = inner.rsplit(['/', '\\']).next().unwrap_or_default();
    let last = last.strip_suffix(".md").unwrap_or(last);

    last.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cosine similarity of two vectors; 0.0 when either is all zeros or the
/// lengths differ. Accumulates in f64 so large finite components cannot
/// overflow.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}

/// Index of the first NaN or infinite component, if any.
#[must_use]
pub fn first_non_finite(vector: &[f32]) -> Option<usize> {
    vector.iter().position(|v| !v.is_finite())
}

/// Scale a vector to unit length in place; zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_key_strips_alias_heading_and_folder() {
        assert_eq!(link_key("[[Projects/Acme Corp.md#History|Acme]]"), "acme corp");
        assert_eq!(link_key("projects/acme corp.md"), "acme corp");
        assert_eq!(link_key("  Daily   Log "), "daily log");
    }

    #[test]
    fn cosine_of_huge_finite_components_stays_finite() {
        let score = cosine_similarity(&[1e30, 0.0], &[1e30, 1e30]);

        assert!(score.is_finite());
        assert!((score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert_eq!(first_non_finite(&[0.0, f32::INFINITY]), Some(1));
        assert_eq!(first_non_finite(&[0.0, 1.0]), None);
    }

    #[test]
    fn link_key_of_empty_is_empty() {
        assert_eq!(link_key("[[]]"), "");
    }

    #[test]
    fn folder_of_nested_and_root_files() {
        assert_eq!(folder_of("notes/people/alice.md"), "notes/people");
        assert_eq!(folder_of("inbox.md"), "");
    }

    #[test]
    fn cosine_handles_zero_and_mismatched_vectors() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn record_defaults_id_and_folder() {
        let records = ChunkRecord::parse_many(
            r#"[{"file_name": "notes/acme.md", "chunk_index": 2, "content": "x", "tags": ["places"]}]"#,
        )
        .unwrap();
        let chunk = records.into_iter().next().unwrap().into_chunk(vec![1.0]).unwrap();

        assert_eq!(chunk.id, "notes/acme.md#2");
        assert_eq!(chunk.folder, "notes");
        assert!(chunk.metadata.tags.contains("places"));
        assert_eq!(chunk.metadata.content_type, ContentType::Note);
    }

    #[test]
    fn content_type_parses_case_insensitively() {
        assert_eq!("MOC".parse::<ContentType>().unwrap(), ContentType::Moc);
        assert!("slides".parse::<ContentType>().is_err());
    }
}
