//! In-memory knowledge graph index, maintained incrementally per chunk.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::ExtractionSettings;
use crate::corpus::cosine_similarity;
use crate::extract::ChunkExtraction;
use crate::graph::{
    ClusterPath, ClusterTree, Direction, Entity, EntityId, EntityType, Evidence, Mention,
    Relationship, RelationshipId, RelationshipType, entity_id, normalize_name,
};

/// How a name was matched to an existing entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Exact,
    Embedding,
}

/// Outcome of disambiguating a name against the entity table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub entity_id: EntityId,
    pub method: ResolutionMethod,
    /// 1.0 for exact matches, the cosine similarity otherwise.
    pub confidence: f32,
}

/// What merging one chunk's extraction changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub chunk_id: String,
    pub entities: Vec<EntityId>,
    pub created: usize,
    pub merged: usize,
    pub relationships: usize,
    /// Entities from this chunk whose confidence is below the low-confidence mark.
    pub low_confidence: Vec<EntityId>,
    /// Entities pruned because their last mention went away.
    pub pruned: Vec<EntityId>,
}

/// A related entity reached through one relationship.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub entity: &'a Entity,
    pub relationship: &'a Relationship,
    pub direction: Direction,
}

/// Entity arena plus mention, relationship and cluster indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraphIndex {
    similarity_threshold: f32,
    low_confidence: f32,
    entities: BTreeMap<EntityId, Entity>,
    chunk_entities: BTreeMap<String, BTreeSet<EntityId>>,
    chunk_relationships: BTreeMap<String, BTreeSet<RelationshipId>>,
    relationships: BTreeMap<RelationshipId, Relationship>,
    outgoing: BTreeMap<EntityId, BTreeSet<RelationshipId>>,
    incoming: BTreeMap<EntityId, BTreeSet<RelationshipId>>,
    clusters: ClusterTree,
    /// Chunks whose extraction has been merged.
    extracted: BTreeSet<String>,
    /// Chunks whose extraction failed and should be retried.
    pending: BTreeSet<String>,
}

impl Default for KnowledgeGraphIndex {
    fn default() -> Self {
        Self::new(&ExtractionSettings::default())
    }
}

impl KnowledgeGraphIndex {
    #[must_use]
    pub fn new(settings: &ExtractionSettings) -> Self {
        Self {
            similarity_threshold: settings.similarity_threshold,
            low_confidence: settings.low_confidence,
            entities: BTreeMap::new(),
            chunk_entities: BTreeMap::new(),
            chunk_relationships: BTreeMap::new(),
            relationships: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
            clusters: ClusterTree::default(),
            extracted: BTreeSet::new(),
            pending: BTreeSet::new(),
        }
    }

    /// Match a name to an existing entity.
    ///
    /// Exact normalized-name equality (against the canonical name and every
    /// surface form) is tried first, then embedding similarity at or above the
    /// threshold. Either way the type must agree with `type_hint`, and ties go
    /// to the entity with the most mentions, then the smallest id.
    #[must_use]
    pub fn resolve(
        &self,
        name: &str,
        type_hint: Option<EntityType>,
        embedding: Option<&[f32]>,
    ) -> Option<Resolution> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return None;
        }

        let agrees = |entity: &Entity| type_hint.is_none_or(|t| t.agrees_with(entity.entity_type));

        let exact = self
            .entities
            .values()
            .filter(|&e| agrees(e))
            .filter(|e| {
                normalize_name(&e.name) == normalized
                    || e.mentions.iter().any(|m| normalize_name(&m.surface) == normalized)
            })
            .max_by(|a, b| {
                a.mentions
                    .len()
                    .cmp(&b.mentions.len())
                    .then_with(|| b.id.cmp(&a.id))
            });
        if let Some(entity) = exact {
            return Some(Resolution {
                entity_id: entity.id.clone(),
                method: ResolutionMethod::Exact,
                confidence: 1.0,
            });
        }

        let embedding = embedding?;
        self.entities
            .values()
            .filter(|&e| agrees(e))
            .filter_map(|e| {
                let other = e.name_embedding.as_deref()?;
                let score = cosine_similarity(embedding, other);
                (score >= self.similarity_threshold).then_some((e, score))
            })
            .max_by(|(a, sa), (b, sb)| {
                sa.total_cmp(sb)
                    .then_with(|| a.mentions.len().cmp(&b.mentions.len()))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(entity, score)| Resolution {
                entity_id: entity.id.clone(),
                method: ResolutionMethod::Embedding,
                confidence: score,
            })
    }

    /// Replace a chunk's contribution with a fresh extraction.
    pub fn apply_extraction(&mut self, extraction: &ChunkExtraction) -> ApplyReport {
        let chunk_id = extraction.chunk_id.as_str();
        let pruned = self.remove_contributions(chunk_id);

        let mut report = ApplyReport {
            chunk_id: chunk_id.to_string(),
            ..ApplyReport::default()
        };
        let mut resolved: Vec<EntityId> = Vec::with_capacity(extraction.candidates.len());

        for candidate in &extraction.candidates {
            let resolution = self.resolve(
                &candidate.name,
                Some(candidate.entity_type),
                candidate.name_embedding.as_deref(),
            );
            let (id, scale) = match resolution {
                Some(r) => {
                    report.merged += 1;
                    (r.entity_id, r.confidence)
                }
                None => {
                    report.created += 1;
                    let id = entity_id(candidate.entity_type, &candidate.name);
                    self.entities.entry(id.clone()).or_insert_with(|| Entity {
                        id: id.clone(),
                        name: candidate.name.clone(),
                        entity_type: candidate.entity_type,
                        mentions: Vec::new(),
                        confidence: 0.0,
                        name_embedding: candidate.name_embedding.clone(),
                    });
                    (id, 1.0)
                }
            };

            if let Some(entity) = self.entities.get_mut(&id) {
                if entity.entity_type == EntityType::Other && candidate.entity_type != EntityType::Other {
                    entity.entity_type = candidate.entity_type;
                }
                if entity.name_embedding.is_none() {
                    entity.name_embedding.clone_from(&candidate.name_embedding);
                }
                for mention in &candidate.mentions {
                    entity.mentions.push(Mention {
                        surface: mention.surface.clone(),
                        chunk_id: chunk_id.to_string(),
                        offset: mention.offset,
                        confidence: mention.confidence * scale,
                    });
                }
                entity.refresh_confidence();
            }

            self.chunk_entities
                .entry(chunk_id.to_string())
                .or_default()
                .insert(id.clone());
            if !report.entities.contains(&id) {
                report.entities.push(id.clone());
            }
            resolved.push(id);
        }

        for candidate in &extraction.relationships {
            let (Some(source), Some(target)) =
                (resolved.get(candidate.source), resolved.get(candidate.target))
            else {
                continue;
            };
            if source == target {
                continue;
            }

            let rid = Relationship::make_id(source, &candidate.relationship_type, target);
            let relationship = self
                .relationships
                .entry(rid.clone())
                .or_insert_with(|| Relationship {
                    id: rid.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    relationship_type: candidate.relationship_type.clone(),
                    evidence: Vec::new(),
                });
            relationship.evidence.push(Evidence {
                chunk_id: chunk_id.to_string(),
                confidence: candidate.confidence,
            });

            self.outgoing.entry(source.clone()).or_default().insert(rid.clone());
            self.incoming.entry(target.clone()).or_default().insert(rid.clone());
            if self
                .chunk_relationships
                .entry(chunk_id.to_string())
                .or_default()
                .insert(rid)
            {
                report.relationships += 1;
            }
        }

        report.low_confidence = report
            .entities
            .iter()
            .filter(|id| {
                self.entities
                    .get(*id)
                    .is_some_and(|e| e.confidence < self.low_confidence)
            })
            .cloned()
            .collect();
        report.pruned = pruned
            .into_iter()
            .filter(|id| !self.entities.contains_key(id))
            .collect();

        self.extracted.insert(chunk_id.to_string());
        self.pending.remove(chunk_id);
        self.rebuild_clusters();

        report
    }

    /// Drop everything derived from a chunk; returns pruned entity ids.
    pub fn remove_chunk(&mut self, chunk_id: &str) -> Vec<EntityId> {
        let pruned = self.remove_contributions(chunk_id);
        self.extracted.remove(chunk_id);
        self.pending.remove(chunk_id);
        self.rebuild_clusters();
        pruned
    }

    pub fn clear(&mut self) {
        *self = Self {
            similarity_threshold: self.similarity_threshold,
            low_confidence: self.low_confidence,
            ..Self::default()
        };
    }

    fn remove_contributions(&mut self, chunk_id: &str) -> Vec<EntityId> {
        for rid in self.chunk_relationships.remove(chunk_id).unwrap_or_default() {
            let Some(relationship) = self.relationships.get_mut(&rid) else {
                continue;
            };
            relationship.evidence.retain(|e| e.chunk_id != chunk_id);
            if relationship.evidence.is_empty() {
                self.drop_relationship(&rid);
            }
        }

        let mut pruned = Vec::new();
        for id in self.chunk_entities.remove(chunk_id).unwrap_or_default() {
            let Some(entity) = self.entities.get_mut(&id) else {
                continue;
            };
            entity.mentions.retain(|m| m.chunk_id != chunk_id);
            if entity.mentions.is_empty() {
                self.entities.remove(&id);
                let dangling: Vec<RelationshipId> = self
                    .outgoing
                    .remove(&id)
                    .into_iter()
                    .chain(self.incoming.remove(&id))
                    .flatten()
                    .collect();
                for rid in dangling {
                    self.drop_relationship(&rid);
                }
                pruned.push(id);
            } else {
                entity.refresh_confidence();
            }
        }

        pruned
    }

    fn drop_relationship(&mut self, rid: &str) {
        let Some(relationship) = self.relationships.remove(rid) else {
            return;
        };
        for (map, key) in [
            (&mut self.outgoing, &relationship.source),
            (&mut self.incoming, &relationship.target),
        ] {
            if let Some(set) = map.get_mut(key) {
                set.remove(rid);
                if set.is_empty() {
                    map.remove(key);
                }
            }
        }
        for evidence in &relationship.evidence {
            if let Some(set) = self.chunk_relationships.get_mut(&evidence.chunk_id) {
                set.remove(rid);
            }
        }
    }

    fn rebuild_clusters(&mut self) {
        self.clusters = ClusterTree::build(&self.entities, self.relationships.values());
    }

    #[must_use]
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Entities mentioned in a chunk, ordered by id.
    #[must_use]
    pub fn entities_in_chunk(&self, chunk_id: &str) -> Vec<&Entity> {
        self.chunk_entities
            .get(chunk_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entities.get(id))
            .collect()
    }

    /// Relationships touching an entity, optionally restricted to some types,
    /// strongest first.
    #[must_use]
    pub fn neighbors(
        &self,
        entity_id: &str,
        types: Option<&[RelationshipType]>,
    ) -> Vec<Neighbor<'_>> {
        let edges = [
            (self.outgoing.get(entity_id), Direction::Outgoing),
            (self.incoming.get(entity_id), Direction::Incoming),
        ];

        let mut neighbors: Vec<Neighbor<'_>> = edges
            .into_iter()
            .flat_map(|(ids, direction)| {
                ids.into_iter().flatten().map(move |rid| (rid, direction))
            })
            .filter_map(|(rid, direction)| {
                let relationship = self.relationships.get(rid)?;
                if types.is_some_and(|t| !t.contains(&relationship.relationship_type)) {
                    return None;
                }
                let other = match direction {
                    Direction::Outgoing => &relationship.target,
                    Direction::Incoming => &relationship.source,
                };
                Some(Neighbor {
                    entity: self.entities.get(other)?,
                    relationship,
                    direction,
                })
            })
            .collect();

        neighbors.sort_by(|a, b| {
            b.relationship
                .confidence()
                .total_cmp(&a.relationship.confidence())
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        neighbors
    }

    /// Every relationship with the entity at either end, ordered by id.
    #[must_use]
    pub fn relationships_of(&self, entity_id: &str) -> Vec<&Relationship> {
        let ids: BTreeSet<&RelationshipId> = self
            .outgoing
            .get(entity_id)
            .into_iter()
            .chain(self.incoming.get(entity_id))
            .flatten()
            .collect();
        ids.into_iter()
            .filter_map(|id| self.relationships.get(id))
            .collect()
    }

    /// Distinct related entities, strongest connection first.
    #[must_use]
    pub fn neighbor_entities(
        &self,
        entity_id: &str,
        types: Option<&[RelationshipType]>,
    ) -> Vec<&Entity> {
        let mut seen = BTreeSet::new();
        self.neighbors(entity_id, types)
            .into_iter()
            .filter(|n| seen.insert(n.entity.id.as_str()))
            .map(|n| n.entity)
            .collect()
    }

    #[must_use]
    pub fn cluster_of(&self, entity_id: &str) -> Option<ClusterPath> {
        self.clusters.cluster_of(entity_id)
    }

    #[must_use]
    pub fn clusters(&self) -> &ClusterTree {
        &self.clusters
    }

    /// Chunk ids mentioning any of the given entities.
    #[must_use]
    pub fn chunks_mentioning<'a>(
        &self,
        entity_ids: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        entity_ids
            .into_iter()
            .filter_map(|id| self.entities.get(id))
            .flat_map(|e| e.mentions.iter().map(|m| m.chunk_id.clone()))
            .collect()
    }

    /// Whether a chunk's extraction has been merged.
    #[must_use]
    pub fn is_extracted(&self, chunk_id: &str) -> bool {
        self.extracted.contains(chunk_id)
    }

    pub fn flag_for_reprocessing(&mut self, chunk_id: &str) {
        self.pending.insert(chunk_id.to_string());
    }

    #[must_use]
    pub fn pending_reprocessing(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_low_confidence(&self, entity: &Entity) -> bool {
        entity.confidence < self.low_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{CandidateEntity, CandidateMention, CandidateRelationship};

    fn candidate(name: &str, entity_type: EntityType, offset: usize) -> CandidateEntity {
        CandidateEntity {
            name: name.to_string(),
            entity_type,
            confidence: 0.9,
            mentions: vec![CandidateMention {
                surface: name.to_string(),
                offset,
                confidence: 0.9,
            }],
            name_embedding: None,
        }
    }

    fn extraction(
        chunk_id: &str,
        candidates: Vec<CandidateEntity>,
        relationships: Vec<CandidateRelationship>,
    ) -> ChunkExtraction {
        ChunkExtraction {
            chunk_id: chunk_id.to_string(),
            candidates,
            relationships,
        }
    }

    fn rel(source: usize, kind: RelationshipType, target: usize) -> CandidateRelationship {
        CandidateRelationship {
            source,
            target,
            relationship_type: kind,
            confidence: 0.8,
        }
    }

    fn scenario() -> KnowledgeGraphIndex {
        let mut index = KnowledgeGraphIndex::default();
        index.apply_extraction(&extraction(
            "a",
            vec![
                candidate("Alice", EntityType::Person, 0),
                candidate("Acme Corp", EntityType::Organization, 15),
            ],
            vec![rel(0, RelationshipType::WorksFor, 1)],
        ));
        index.apply_extraction(&extraction(
            "b",
            vec![
                candidate("Acme Corp", EntityType::Organization, 0),
                candidate("Springfield", EntityType::Location, 23),
            ],
            vec![rel(0, RelationshipType::LocatedIn, 1)],
        ));
        index
    }

    #[test]
    fn mentions_across_chunks_merge_into_one_entity() {
        let index = scenario();

        assert_eq!(index.entity_count(), 3);
        let acme = index.entity("organization/acme-corp").unwrap();
        assert_eq!(acme.chunk_ids().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(index.relationship_count(), 2);
    }

    #[test]
    fn neighbors_are_bidirectional_and_filterable() {
        let index = scenario();

        let all: Vec<&str> = index
            .neighbor_entities("organization/acme-corp", None)
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(all, vec!["Springfield", "Alice"]);

        let located = index.neighbor_entities(
            "organization/acme-corp",
            Some(&[RelationshipType::LocatedIn]),
        );
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].name, "Springfield");
    }

    #[test]
    fn resolution_is_deterministic_and_prefers_frequent_entities() {
        let mut index = scenario();
        index.apply_extraction(&extraction(
            "c",
            vec![candidate("Acme", EntityType::Other, 0)],
            vec![],
        ));

        let first = index.resolve("ACME corp", None, None);
        let second = index.resolve("ACME corp", None, None);

        assert_eq!(first, second);
        assert_eq!(first.unwrap().entity_id, "organization/acme-corp");
        assert!(index.resolve("Acme Corp", Some(EntityType::Person), None).is_none());
    }

    #[test]
    fn embedding_fallback_respects_threshold() {
        let mut index = KnowledgeGraphIndex::default();
        let mut acme = candidate("Acme Corp", EntityType::Organization, 0);
        acme.name_embedding = Some(vec![1.0, 0.0, 0.0]);
        index.apply_extraction(&extraction("a", vec![acme], vec![]));

        let near = index.resolve("Acme Corporation", None, Some(&[0.95, 0.05, 0.0]));
        let far = index.resolve("Globex", None, Some(&[0.0, 1.0, 0.0]));

        assert_eq!(near.unwrap().method, ResolutionMethod::Embedding);
        assert!(far.is_none());
    }

    #[test]
    fn reapplying_a_chunk_replaces_its_contribution() {
        let mut index = scenario();
        let again = extraction(
            "a",
            vec![
                candidate("Alice", EntityType::Person, 0),
                candidate("Acme Corp", EntityType::Organization, 15),
            ],
            vec![rel(0, RelationshipType::WorksFor, 1)],
        );

        index.apply_extraction(&again);
        let snapshot = index.clone();
        index.apply_extraction(&again);

        assert_eq!(index, snapshot);
        assert_eq!(index.entity("person/alice").unwrap().mentions.len(), 1);
    }

    #[test]
    fn removing_a_chunk_prunes_only_orphaned_entities() {
        let mut index = scenario();

        let pruned = index.remove_chunk("b");

        assert_eq!(pruned, vec!["location/springfield".to_string()]);
        assert!(index.entity("organization/acme-corp").is_some());
        assert_eq!(index.relationship_count(), 1);
        assert!(index.entities_in_chunk("b").is_empty());
        assert!(index.neighbor_entities("organization/acme-corp", Some(&[RelationshipType::LocatedIn])).is_empty());
    }

    #[test]
    fn pending_chunks_clear_on_successful_apply() {
        let mut index = KnowledgeGraphIndex::default();
        index.flag_for_reprocessing("a");
        assert_eq!(index.pending_reprocessing(), vec!["a".to_string()]);

        index.apply_extraction(&extraction("a", vec![], vec![]));

        assert!(index.pending_reprocessing().is_empty());
        assert!(index.is_extracted("a"));
    }

    #[test]
    fn index_serializes() {
        let index = scenario();

        let json = serde_json::to_string(&index).unwrap();
        let back: KnowledgeGraphIndex = serde_json::from_str(&json).unwrap();

        assert_eq!(back, index);
    }

    #[test]
    fn weak_mentions_are_kept_but_reported_low_confidence() {
        let mut index = KnowledgeGraphIndex::default();
        let mut weak = candidate("Zed", EntityType::Person, 0);
        weak.confidence = 0.3;
        weak.mentions[0].confidence = 0.3;

        let report = index.apply_extraction(&extraction(
            "a",
            vec![weak, candidate("Acme Corp", EntityType::Organization, 10)],
            vec![],
        ));

        assert_eq!(report.entities.len(), 2);
        assert_eq!(report.low_confidence, vec!["person/zed".to_string()]);
        let zed = index.entity("person/zed").unwrap();
        assert!(index.is_low_confidence(zed));
        assert!(!index.is_low_confidence(index.entity("organization/acme-corp").unwrap()));
    }
}
