//! Candidate pair generation.
//!
//! Two entities are compared only if they share an entity type or the first
//! trigram of their normalized name. Entities already merged away never
//! take part.

use std::collections::{BTreeSet, HashMap};

use graphloom_shared::{EntityType, ExtractedEntity};

use crate::similarity::trigrams;

/// First padded trigram of a normalized name.
pub fn first_trigram(normalized_name: &str) -> Option<String> {
    if normalized_name.is_empty() {
        return None;
    }
    trigrams(normalized_name).into_iter().next()
}

/// Index pairs `(i, j)` with `i < j` into `entities`, sorted and unique.
pub fn blocked_pairs(entities: &[ExtractedEntity]) -> Vec<(usize, usize)> {
    let mut by_type: HashMap<EntityType, Vec<usize>> = HashMap::new();
    let mut by_trigram: HashMap<String, Vec<usize>> = HashMap::new();

    for (i, entity) in entities.iter().enumerate() {
        if entity.is_merged() {
            continue;
        }
        by_type.entry(entity.entity_type).or_default().push(i);
        if let Some(tri) = first_trigram(&entity.normalized_name) {
            by_trigram.entry(tri).or_default().push(i);
        }
    }

    let mut pairs = BTreeSet::new();
    for block in by_type.values().chain(by_trigram.values()) {
        for (n, &i) in block.iter().enumerate() {
            for &j in &block[n + 1..] {
                pairs.insert((i.min(j), i.max(j)));
            }
        }
    }
    pairs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use graphloom_shared::{EntityId, PageId};

    use super::*;
    use crate::similarity::fixtures::entity;

    #[test]
    fn first_trigram_is_padded() {
        assert_eq!(first_trigram("acme").as_deref(), Some("  a"));
        assert_eq!(first_trigram(""), None);
    }

    #[test]
    fn blocks_by_type_or_leading_letter() {
        let page = PageId::new();
        let entities = vec![
            entity("Jon Smith", EntityType::Person, page),
            entity("John Smith", EntityType::Person, page),
            entity("Jakarta", EntityType::Location, page),
            entity("Paris", EntityType::Location, page),
            entity("Acme", EntityType::Organization, page),
        ];
        let pairs = blocked_pairs(&entities);
        // Persons together, locations together, and every "j" name together.
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2), (2, 3)]);
    }

    #[test]
    fn merged_entities_are_excluded() {
        let page = PageId::new();
        let mut entities = vec![
            entity("Acme", EntityType::Organization, page),
            entity("Acme", EntityType::Organization, page),
        ];
        entities[1].canonical_id = Some(EntityId::new());
        assert!(blocked_pairs(&entities).is_empty());
    }
}
