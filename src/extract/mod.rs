//! Entity and relationship extraction from chunk text.
//!
//! The recognizer itself is an [`EntityModel`]; [`Extractor`] wraps one with
//! vault-specific weak signals (wikilinks and tags), a pairing window, and
//! optional name embeddings for disambiguation.

pub mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ExtractionSettings;
use crate::corpus::{DocumentChunk, link_key};
use crate::embedding::Embedder;
use crate::graph::{EntityType, RelationshipType, normalize_name};

/// Confidence added to a mention that matches a wikilink or tag.
const SIGNAL_BOOST: f32 = 0.1;

/// Confidence of a concept known only from a wikilink.
const LINK_ONLY_CONFIDENCE: f32 = 0.55;

/// Errors from entity extraction. Never fatal to ingestion.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Entity model failed: {0}")]
    Model(String),

    #[error("Extraction timed out after {0} ms")]
    Timeout(u64),
}

/// A span the model believes names an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedMention {
    pub text: String,
    /// Byte offset within the chunk text.
    pub offset: usize,
    pub entity_type: EntityType,
    pub confidence: f32,
}

impl DetectedMention {
    fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipGuess {
    pub relationship_type: RelationshipType,
    pub confidence: f32,
}

/// Named-entity recognizer and relationship classifier.
#[async_trait]
pub trait EntityModel: Send + Sync {
    /// Find entity mentions in `text`.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::Model` if the model cannot run.
    async fn detect_entities(&self, text: &str) -> Result<Vec<DetectedMention>, ExtractionError>;

    /// Classify the relation from `source` to `target`, given the text
    /// between them. `None` means no relation.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::Model` if the model cannot run.
    async fn classify_relationship(
        &self,
        source: &DetectedMention,
        target: &DetectedMention,
        between: &str,
    ) -> Result<Option<RelationshipGuess>, ExtractionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMention {
    pub surface: String,
    pub offset: usize,
    pub confidence: f32,
}

/// Mentions within one chunk that refer to the same thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub confidence: f32,
    pub mentions: Vec<CandidateMention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_embedding: Option<Vec<f32>>,
}

/// A relation between two candidates, by index into `candidates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRelationship {
    pub source: usize,
    pub target: usize,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
}

/// Everything extracted from one chunk, ready to merge into the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkExtraction {
    pub chunk_id: String,
    pub candidates: Vec<CandidateEntity>,
    pub relationships: Vec<CandidateRelationship>,
}

pub struct Extractor {
    model: Arc<dyn EntityModel>,
    embedder: Option<Arc<dyn Embedder>>,
    settings: ExtractionSettings,
}

impl Extractor {
    #[must_use]
    pub fn new(model: Arc<dyn EntityModel>, settings: ExtractionSettings) -> Self {
        Self {
            model,
            embedder: None,
            settings,
        }
    }

    /// Embed candidate names so the graph can fall back to similarity matching.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &ExtractionSettings {
        &self.settings
    }

    /// Extract entities and relationships from a chunk, bounded by the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::Timeout` when the model is too slow, or the
    /// model's own error.
    pub async fn extract(&self, chunk: &DocumentChunk) -> Result<ChunkExtraction, ExtractionError> {
        let timeout_ms = self.settings.timeout_ms;
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.extract_inner(chunk))
            .await
            .map_err(|_| ExtractionError::Timeout(timeout_ms))?
    }

    async fn extract_inner(&self, chunk: &DocumentChunk) -> Result<ChunkExtraction, ExtractionError> {
        let text = chunk.content.as_str();
        let mut mentions = self.model.detect_entities(text).await?;
        mentions.retain(|m| !normalize_name(&m.text).is_empty());
        mentions.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| b.text.len().cmp(&a.text.len())));

        let signals = signal_keys(chunk);
        let mut matched = BTreeSet::new();
        for mention in &mut mentions {
            let key = normalize_name(&mention.text);
            if signals.contains(&key) {
                mention.confidence = (mention.confidence + SIGNAL_BOOST).min(1.0);
                if mention.entity_type == EntityType::Other {
                    mention.entity_type = EntityType::Concept;
                }
                matched.insert(key);
            }
        }

        let (mut candidates, owner) = group_mentions(&mentions);

        for target in &chunk.metadata.wikilinks {
            let display = link_display(target);
            let key = normalize_name(&display);
            if key.is_empty() || matched.contains(&key) {
                continue;
            }
            if candidates.iter().any(|c| normalize_name(&c.name) == key) {
                continue;
            }
            matched.insert(key);
            candidates.push(link_candidate(text, target, display));
        }

        let relationships = self.pair_mentions(text, &mentions, &owner).await?;

        if let Some(embedder) = &self.embedder {
            let mut vectors = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                match embedder.embed(&candidate.name).await {
                    Ok(vector) => vectors.push(vector),
                    Err(e) => {
                        warn!(chunk = %chunk.id, error = %e, "Name embedding failed; similarity matching disabled for this chunk");
                        vectors.clear();
                        break;
                    }
                }
            }
            if vectors.len() == candidates.len() {
                for (candidate, vector) in candidates.iter_mut().zip(vectors) {
                    candidate.name_embedding = Some(vector);
                }
            }
        }

        debug!(
            chunk = %chunk.id,
            candidates = candidates.len(),
            relationships = relationships.len(),
            "Extracted chunk"
        );

        Ok(ChunkExtraction {
            chunk_id: chunk.id.clone(),
            candidates,
            relationships,
        })
    }

    /// Classify every in-window pair within a sentence; keep the strongest
    /// guess per (source, type, target).
    async fn pair_mentions(
        &self,
        text: &str,
        mentions: &[DetectedMention],
        owner: &[usize],
    ) -> Result<Vec<CandidateRelationship>, ExtractionError> {
        let mut best: BTreeMap<(usize, String, usize), CandidateRelationship> = BTreeMap::new();

        for (i, source) in mentions.iter().enumerate() {
            for (j, target) in mentions.iter().enumerate().skip(i + 1) {
                let (start, end) = (source.end(), target.offset);
                if end < start {
                    continue;
                }
                if end - start > self.settings.window {
                    break;
                }
                let (from, to) = (owner[i], owner[j]);
                if from == to {
                    continue;
                }
                let Some(between) = text.get(start..end) else {
                    continue;
                };
                if crosses_sentence(between) {
                    continue;
                }

                let Some(guess) = self
                    .model
                    .classify_relationship(source, target, between)
                    .await?
                else {
                    continue;
                };
                if guess.confidence < self.settings.min_relationship_confidence {
                    continue;
                }

                let key = (from, guess.relationship_type.to_string(), to);
                let keep = best
                    .get(&key)
                    .is_none_or(|existing| existing.confidence < guess.confidence);
                if keep {
                    best.insert(
                        key,
                        CandidateRelationship {
                            source: from,
                            target: to,
                            relationship_type: guess.relationship_type,
                            confidence: guess.confidence,
                        },
                    );
                }
            }
        }

        Ok(best.into_values().collect())
    }
}

/// Group mentions by normalized name and compatible type. Returns the
/// candidates and, for each mention, the index of its candidate.
fn group_mentions(mentions: &[DetectedMention]) -> (Vec<CandidateEntity>, Vec<usize>) {
    let mut candidates: Vec<CandidateEntity> = Vec::new();
    let mut owner = Vec::with_capacity(mentions.len());

    for mention in mentions {
        let key = normalize_name(&mention.text);
        let existing = candidates.iter().position(|c| {
            normalize_name(&c.name) == key && c.entity_type.agrees_with(mention.entity_type)
        });
        let index = if let Some(index) = existing {
            let candidate = &mut candidates[index];
            if candidate.entity_type == EntityType::Other {
                candidate.entity_type = mention.entity_type;
            }
            candidate.confidence = candidate.confidence.max(mention.confidence);
            index
        } else {
            candidates.push(CandidateEntity {
                name: mention.text.clone(),
                entity_type: mention.entity_type,
                confidence: mention.confidence,
                mentions: Vec::new(),
                name_embedding: None,
            });
            candidates.len() - 1
        };

        candidates[index].mentions.push(CandidateMention {
            surface: mention.text.clone(),
            offset: mention.offset,
            confidence: mention.confidence,
        });
        owner.push(index);
    }

    (candidates, owner)
}

/// Normalized names of the chunk's wikilink targets and tags.
fn signal_keys(chunk: &DocumentChunk) -> BTreeSet<String> {
    let links = chunk
        .metadata
        .wikilinks
        .iter()
        .map(|w| normalize_name(&link_key(w)));
    let tags = chunk.metadata.tags.iter().map(|t| {
        let last = t.trim_start_matches('#').rsplit('/').next().unwrap_or_default();
        normalize_name(&last.replace(['-', '_'], " "))
    });
    links.chain(tags).filter(|k| !k.is_empty()).collect()
}

/// Human-readable name of a wikilink target, keeping its case.
fn link_display(target: &str) -> String {
    let inner = target.trim().trim_start_matches("[[").trim_end_matches("]]");
    let inner = inner.split('|').next().unwrap_or_default();
    let inner = inner.split('#').next().unwrap_or_default();
    let last = inner.rsplit(['/', '\\']).next().unwrap_or_default();
    let last = last.strip_suffix(".md").unwrap_or(last);
    last.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn link_candidate(text: &str, target: &str, display: String) -> CandidateEntity {
    let offset = text.find(target).or_else(|| text.find(&display)).unwrap_or(0);
    CandidateEntity {
        mentions: vec![CandidateMention {
            surface: display.clone(),
            offset,
            confidence: LINK_ONLY_CONFIDENCE,
        }],
        name: display,
        entity_type: EntityType::Concept,
        confidence: LINK_ONLY_CONFIDENCE,
        name_embedding: None,
    }
}

fn crosses_sentence(between: &str) -> bool {
    between.contains(['.', '!', '?', ';', '\n'])
}
