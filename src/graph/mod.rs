//! Knowledge graph types: entities, relationships, and concept clusters.
//!
//! Everything is keyed by string ids so the graph serializes cleanly and can
//! be shared read-only across concurrent searches.

pub mod cluster;
pub mod index;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

pub use cluster::ClusterTree;
pub use index::{ApplyReport, KnowledgeGraphIndex, Resolution};

pub type EntityId = String;
pub type ClusterId = String;
pub type RelationshipId = String;

/// Coarse entity category.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Concept,
    #[default]
    Other,
}

impl EntityType {
    pub const ALL: [Self; 5] = [
        Self::Person,
        Self::Organization,
        Self::Location,
        Self::Concept,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Concept => "concept",
            Self::Other => "other",
        }
    }

    /// Whether a mention of type `self` may co-refer with an entity of `other`.
    #[must_use]
    pub fn agrees_with(self, other: Self) -> bool {
        self == other || self == Self::Other || other == Self::Other
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship taxonomy; unknown kinds are kept as custom labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum RelationshipType {
    WorksFor,
    LocatedIn,
    PartOf,
    IsA,
    RelatedTo,
    Custom(String),
}

impl RelationshipType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorksFor => "works-for",
            Self::LocatedIn => "located-in",
            Self::PartOf => "part-of",
            Self::IsA => "is-a",
            Self::RelatedTo => "related-to",
            Self::Custom(label) => label,
        }
    }

    /// Taxonomic edges that place the source under the target in a cluster.
    #[must_use]
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Self::IsA | Self::PartOf)
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RelationshipType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "works-for" => Self::WorksFor,
            "located-in" => Self::LocatedIn,
            "part-of" => Self::PartOf,
            "is-a" => Self::IsA,
            "related-to" => Self::RelatedTo,
            _ => Self::Custom(value),
        }
    }
}

impl From<RelationshipType> for String {
    fn from(value: RelationshipType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for RelationshipType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.trim().to_ascii_lowercase().replace([' ', '_'], "-")))
    }
}

/// One textual occurrence of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub surface: String,
    pub chunk_id: String,
    /// Byte offset of the surface form within the chunk text.
    pub offset: usize,
    pub confidence: f32,
}

/// A canonical, cross-document entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub entity_type: EntityType,
    pub mentions: Vec<Mention>,
    /// Highest confidence among the entity's mentions.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_embedding: Option<Vec<f32>>,
}

impl Entity {
    /// Distinct chunk ids this entity is mentioned in.
    #[must_use]
    pub fn chunk_ids(&self) -> BTreeSet<&str> {
        self.mentions.iter().map(|m| m.chunk_id.as_str()).collect()
    }

    pub(crate) fn refresh_confidence(&mut self) {
        self.confidence = self
            .mentions
            .iter()
            .map(|m| m.confidence)
            .fold(0.0_f32, f32::max);
    }
}

/// Where a relationship was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub chunk_id: String,
    pub confidence: f32,
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub source: EntityId,
    pub target: EntityId,
    pub relationship_type: RelationshipType,
    pub evidence: Vec<Evidence>,
}

impl Relationship {
    #[must_use]
    pub fn make_id(source: &str, relationship_type: &RelationshipType, target: &str) -> String {
        format!("{source}|{relationship_type}|{target}")
    }

    /// Strongest confidence among the evidence.
    #[must_use]
    pub fn confidence(&self) -> f32 {
        self.evidence
            .iter()
            .map(|e| e.confidence)
            .fold(0.0_f32, f32::max)
    }
}

/// A grouping of entities under a parent concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeCluster {
    pub id: ClusterId,
    /// Concept entity this cluster is rooted at; `None` for type roots.
    pub concept: Option<EntityId>,
    pub label: String,
    pub members: BTreeSet<EntityId>,
    pub parent: Option<ClusterId>,
}

/// The narrowest cluster containing an entity, plus its ancestors (broadest last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPath {
    pub cluster: KnowledgeCluster,
    pub ancestors: Vec<KnowledgeCluster>,
}

/// Which way an edge points relative to the entity being queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Normalize an entity name for exact-match disambiguation.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '&' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .to_lowercase();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    let words = match words.first() {
        Some(&"the") if words.len() > 1 => &words[1..],
        _ => &words[..],
    };
    words.join(" ")
}

/// Stable id for a newly created entity.
#[must_use]
pub fn entity_id(entity_type: EntityType, name: &str) -> EntityId {
    format!("{entity_type}/{}", normalize_name(name).replace(' ', "-"))
}

/// Handle to the graph index shared between ingestion and search.
#[derive(Debug, Clone, Default)]
pub struct SharedGraph(Arc<RwLock<KnowledgeGraphIndex>>);

impl SharedGraph {
    #[must_use]
    pub fn new(index: KnowledgeGraphIndex) -> Self {
        Self(Arc::new(RwLock::new(index)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, KnowledgeGraphIndex> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, KnowledgeGraphIndex> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}
