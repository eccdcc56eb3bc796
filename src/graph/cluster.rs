//! Concept cluster hierarchy derived from `is-a` / `part-of` relationships.
//!
//! Each entity type has a root cluster. An entity that is the target of a
//! hierarchical edge heads a concept cluster holding the edge sources. Every
//! entity keeps at most one parent edge (the strongest), and edges that would
//! close a cycle are skipped, so the hierarchy is always a tree.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::graph::{
    ClusterId, ClusterPath, Entity, EntityId, EntityType, KnowledgeCluster, Relationship,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTree {
    clusters: BTreeMap<ClusterId, KnowledgeCluster>,
    /// Entity → narrowest cluster containing it.
    membership: BTreeMap<EntityId, ClusterId>,
}

fn root_id(entity_type: EntityType) -> ClusterId {
    format!("type/{entity_type}")
}

fn concept_id(entity: &str) -> ClusterId {
    format!("concept/{entity}")
}

impl ClusterTree {
    /// Rebuild the hierarchy from the current entity and relationship tables.
    #[must_use]
    pub fn build<'a>(
        entities: &BTreeMap<EntityId, Entity>,
        relationships: impl IntoIterator<Item = &'a Relationship>,
    ) -> Self {
        let mut edges: Vec<(&str, &str, f32)> = relationships
            .into_iter()
            .filter(|r| r.relationship_type.is_hierarchical() && r.source != r.target)
            .filter(|r| entities.contains_key(&r.source) && entities.contains_key(&r.target))
            .map(|r| (r.source.as_str(), r.target.as_str(), r.confidence()))
            .collect();
        edges.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
                .then_with(|| a.1.cmp(b.1))
        });

        let mut parent_of: BTreeMap<&str, &str> = BTreeMap::new();
        for (source, target, _) in edges {
            if parent_of.contains_key(source) || reaches(&parent_of, target, source) {
                continue;
            }
            parent_of.insert(source, target);
        }

        let mut clusters: BTreeMap<ClusterId, KnowledgeCluster> = EntityType::ALL
            .iter()
            .map(|t| {
                let id = root_id(*t);
                let cluster = KnowledgeCluster {
                    id: id.clone(),
                    concept: None,
                    label: t.as_str().to_string(),
                    members: BTreeSet::new(),
                    parent: None,
                };
                (id, cluster)
            })
            .collect();

        for concept in parent_of.values().copied().collect::<BTreeSet<_>>() {
            let Some(entity) = entities.get(concept) else {
                continue;
            };
            let parent = parent_of
                .get(concept)
                .map_or_else(|| root_id(entity.entity_type), |p| concept_id(p));
            let id = concept_id(concept);
            clusters.insert(
                id.clone(),
                KnowledgeCluster {
                    id,
                    concept: Some(concept.to_string()),
                    label: entity.name.clone(),
                    members: BTreeSet::new(),
                    parent: Some(parent),
                },
            );
        }

        let mut membership = BTreeMap::new();
        for (id, entity) in entities {
            let cluster_id = parent_of
                .get(id.as_str())
                .map_or_else(|| root_id(entity.entity_type), |p| concept_id(p));
            if let Some(cluster) = clusters.get_mut(&cluster_id) {
                cluster.members.insert(id.clone());
            }
            membership.insert(id.clone(), cluster_id);
        }

        Self {
            clusters,
            membership,
        }
    }

    /// Narrowest cluster of an entity and its ancestor chain.
    #[must_use]
    pub fn cluster_of(&self, entity: &str) -> Option<ClusterPath> {
        let cluster = self.clusters.get(self.membership.get(entity)?)?.clone();
        let ancestors = self.ancestors(&cluster);
        Some(ClusterPath { cluster, ancestors })
    }

    /// The cluster headed by a concept entity, if it heads one.
    #[must_use]
    pub fn headed_by(&self, entity: &str) -> Option<&KnowledgeCluster> {
        self.clusters.get(&concept_id(entity))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&KnowledgeCluster> {
        self.clusters.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnowledgeCluster> {
        self.clusters.values()
    }

    fn ancestors(&self, cluster: &KnowledgeCluster) -> Vec<KnowledgeCluster> {
        let mut seen = BTreeSet::from([cluster.id.clone()]);
        let mut chain = Vec::new();
        let mut next = cluster.parent.clone();

        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                break;
            }
            let Some(parent) = self.clusters.get(&id) else {
                break;
            };
            next = parent.parent.clone();
            chain.push(parent.clone());
        }

        chain
    }
}

/// Whether following parent edges from `from` arrives at `to`.
fn reaches(parent_of: &BTreeMap<&str, &str>, from: &str, to: &str) -> bool {
    let mut current = from;
    let mut steps = 0;
    loop {
        if current == to {
            return true;
        }
        match parent_of.get(current) {
            Some(&next) if steps <= parent_of.len() => {
                current = next;
                steps += 1;
            }
            _ => return false,
        }
    }
}
