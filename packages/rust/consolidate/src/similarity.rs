//! Pairwise similarity signals between two extracted entities.

use std::collections::{HashMap, HashSet};

use graphloom_shared::{
    EntityId, EntityRelationship, EntityType, ExtractedEntity, PipelineError, Result,
    SimilarityBreakdown,
};

use crate::phonetic::{metaphone_key, soundex_key};

// ---------------------------------------------------------------------------
// Neighborhoods
// ---------------------------------------------------------------------------

/// Directly related entity ids, per entity.
#[derive(Debug, Default, Clone)]
pub struct NeighborIndex {
    neighbors: HashMap<EntityId, HashSet<EntityId>>,
}

impl NeighborIndex {
    pub fn from_relationships(relationships: &[EntityRelationship]) -> Self {
        let mut neighbors: HashMap<EntityId, HashSet<EntityId>> = HashMap::new();
        for rel in relationships {
            if rel.source_entity_id == rel.target_entity_id {
                continue;
            }
            neighbors
                .entry(rel.source_entity_id)
                .or_default()
                .insert(rel.target_entity_id);
            neighbors
                .entry(rel.target_entity_id)
                .or_default()
                .insert(rel.source_entity_id);
        }
        Self { neighbors }
    }

    pub fn neighbors(&self, id: EntityId) -> Option<&HashSet<EntityId>> {
        self.neighbors.get(&id).filter(|set| !set.is_empty())
    }

    /// Jaccard of the two neighborhoods, each excluding the other entity.
    ///
    /// `None` when either entity has no relationships, or when nothing is
    /// left to compare once the pair itself is excluded.
    pub fn jaccard(&self, a: EntityId, b: EntityId) -> Option<f64> {
        let na = self.neighbors(a)?;
        let nb = self.neighbors(b)?;
        let na: HashSet<EntityId> = na.iter().copied().filter(|id| *id != b).collect();
        let nb: HashSet<EntityId> = nb.iter().copied().filter(|id| *id != a).collect();
        let union = na.union(&nb).count();
        if union == 0 {
            return None;
        }
        Some(na.intersection(&nb).count() as f64 / union as f64)
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Character trigrams of a name padded with two leading and one trailing space.
pub fn trigrams(name: &str) -> Vec<String> {
    let padded: Vec<char> = format!("  {name} ").chars().collect();
    padded.windows(3).map(|w| w.iter().collect()).collect()
}

fn trigram_jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = trigrams(a).into_iter().collect();
    let tb: HashSet<String> = trigrams(b).into_iter().collect();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

/// Cosine similarity of two embeddings.
///
/// `Ok(None)` when either vector has zero norm.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<Option<f64>> {
    if a.len() != b.len() {
        return Err(PipelineError::Consolidation(format!(
            "embedding dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(None);
    }
    Ok(Some(dot / (norm_a.sqrt() * norm_b.sqrt())))
}

fn key_match(a: Option<String>, b: Option<String>) -> Option<bool> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a == b),
        _ => None,
    }
}

/// Score a pair. The result does not depend on argument order.
pub fn score(
    a: &ExtractedEntity,
    b: &ExtractedEntity,
    graph: &NeighborIndex,
) -> Result<SimilarityBreakdown> {
    // Jaro-Winkler weights the prefix, so fix an order before comparing.
    let (a, b) = if (a.normalized_name.as_str(), a.id) <= (b.normalized_name.as_str(), b.id) {
        (a, b)
    } else {
        (b, a)
    };
    let (na, nb) = (a.normalized_name.as_str(), b.normalized_name.as_str());

    let embedding_cosine = match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine(ea, eb)?,
        _ => None,
    };

    Ok(SimilarityBreakdown {
        jaro_winkler: Some(strsim::jaro_winkler(na, nb)),
        levenshtein: Some(strsim::normalized_levenshtein(na, nb)),
        trigram: Some(trigram_jaccard(na, nb)),
        soundex_match: key_match(soundex_key(na), soundex_key(nb)),
        metaphone_match: key_match(metaphone_key(na), metaphone_key(nb)),
        embedding_cosine,
        graph_neighborhood: graph.jaccard(a.id, b.id),
        type_match: Some(a.entity_type == b.entity_type),
        same_page: Some(a.source_page_id == b.source_page_id),
    })
}

/// Whether a type mismatch is tolerated for this pair.
pub(crate) fn types_compatible(a: EntityType, b: EntityType) -> bool {
    a == b || a == EntityType::Custom || b == EntityType::Custom
}


#[cfg(test)]
mod tests {
    use graphloom_shared::{PageId, RelationshipId, TenantId};

    use super::fixtures::entity;
    use super::*;

    fn rel(a: EntityId, b: EntityId) -> EntityRelationship {
        EntityRelationship {
            id: RelationshipId::new(),
            tenant_id: TenantId::new("tenant-a"),
            job_id: graphloom_shared::JobId::new(),
            source_entity_id: a,
            target_entity_id: b,
            relationship_type: "related_to".into(),
            properties: serde_json::Map::new(),
            confidence_score: 0.8,
        }
    }

    #[test]
    fn trigram_padding() {
        assert_eq!(trigrams("ab"), vec!["  a", " ab", "ab "]);
    }

    #[test]
    fn scoring_is_symmetric() {
        let page = PageId::new();
        let names = ["Jon Smith", "John Smith", "Smith & Co", "J. Smith", "Acme", "acme corp"];
        let entities: Vec<_> = names
            .iter()
            .map(|n| entity(n, EntityType::Person, page))
            .collect();
        let graph = NeighborIndex::from_relationships(&[rel(entities[0].id, entities[4].id)]);
        for a in &entities {
            for b in &entities {
                assert_eq!(score(a, b, &graph).unwrap(), score(b, a, &graph).unwrap());
            }
        }
    }

    #[test]
    fn phonetic_flags_for_spelling_variants() {
        let page = PageId::new();
        let a = entity("Jon Smith", EntityType::Person, page);
        let b = entity("John Smith", EntityType::Person, page);
        let s = score(&a, &b, &NeighborIndex::default()).unwrap();
        assert_eq!(s.soundex_match, Some(true));
        assert_eq!(s.metaphone_match, Some(true));
        assert_eq!(s.same_page, Some(true));
        assert_eq!(s.type_match, Some(true));
        assert_eq!(s.embedding_cosine, None);
        assert_eq!(s.graph_neighborhood, None);
        assert!((s.levenshtein.unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn embedding_dimension_mismatch_is_an_error() {
        let page = PageId::new();
        let mut a = entity("Acme", EntityType::Organization, page);
        let mut b = entity("Acme", EntityType::Organization, page);
        a.embedding = Some(vec![1.0, 0.0]);
        b.embedding = Some(vec![1.0, 0.0, 0.0]);
        let err = score(&a, &b, &NeighborIndex::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Consolidation(_)));
    }

    #[test]
    fn cosine_values() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]).unwrap(), Some(1.0));
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), Some(0.0));
        assert_eq!(cosine(&[0.0, 0.0], &[0.0, 1.0]).unwrap(), None);
    }

    #[test]
    fn graph_jaccard_excludes_the_pair() {
        let [a, b, c, d] = [EntityId::new(), EntityId::new(), EntityId::new(), EntityId::new()];
        let graph = NeighborIndex::from_relationships(&[
            rel(a, b),
            rel(a, c),
            rel(b, c),
            rel(b, d),
        ]);
        // a: {c}, b: {c, d} once each other is removed.
        assert_eq!(graph.jaccard(a, b), Some(0.5));
        assert_eq!(graph.jaccard(a, EntityId::new()), None);

        let only_each_other = NeighborIndex::from_relationships(&[rel(a, b)]);
        assert_eq!(only_each_other.jaccard(a, b), None);
    }

    #[test]
    fn custom_type_is_compatible_with_anything() {
        assert!(types_compatible(EntityType::Custom, EntityType::Person));
        assert!(!types_compatible(EntityType::Location, EntityType::Person));
    }
}
