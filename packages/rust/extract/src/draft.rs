//! Strategy output before ids are assigned, and the per-page hybrid merge.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use graphloom_shared::{EntityType, ExtractionMethod, normalize_name};

/// Identity of an entity within one page: normalized name plus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DraftKey {
    pub normalized_name: String,
    pub entity_type: EntityType,
}

/// An entity as a single strategy saw it.
#[derive(Debug, Clone)]
pub struct EntityDraft {
    pub name: String,
    pub entity_type: EntityType,
    pub description: Option<String>,
    pub properties: Map<String, Value>,
    pub method: ExtractionMethod,
    pub confidence: f64,
}

impl EntityDraft {
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        method: ExtractionMethod,
        confidence: f64,
    ) -> Self {
        Self {
            name: name.into().trim().to_string(),
            entity_type,
            description: None,
            properties: Map::new(),
            method,
            confidence,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// `None` when the name normalizes to nothing.
    pub fn key(&self) -> Option<DraftKey> {
        let normalized_name = normalize_name(&self.name);
        if normalized_name.is_empty() {
            return None;
        }
        Some(DraftKey {
            normalized_name,
            entity_type: self.entity_type,
        })
    }
}

/// A relationship between two drafts on the same page.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDraft {
    pub source: DraftKey,
    pub target: DraftKey,
    pub relationship_type: String,
    pub confidence: f64,
}

/// Everything one strategy produced for one page.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub entities: Vec<EntityDraft>,
    pub relationships: Vec<RelationshipDraft>,
}

impl StrategyOutput {
    /// Add an entity, returning its key. Nameless drafts are dropped.
    pub fn push_entity(&mut self, draft: EntityDraft) -> Option<DraftKey> {
        let key = draft.key()?;
        self.entities.push(draft);
        Some(key)
    }

    pub fn relate(
        &mut self,
        source: &DraftKey,
        target: &DraftKey,
        relationship_type: impl Into<String>,
        confidence: f64,
    ) {
        if source == target {
            return;
        }
        self.relationships.push(RelationshipDraft {
            source: source.clone(),
            target: target.clone(),
            relationship_type: relationship_type.into(),
            confidence,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// An entity after merging every strategy's view of it.
#[derive(Debug, Clone)]
pub struct MergedEntity {
    pub key: DraftKey,
    pub name: String,
    pub description: Option<String>,
    pub properties: Map<String, Value>,
    pub method: ExtractionMethod,
    pub confidence: f64,
    pub methods: BTreeSet<ExtractionMethod>,
}

/// Merged result for one page.
#[derive(Debug, Clone, Default)]
pub struct MergedPage {
    pub entities: Vec<MergedEntity>,
    pub relationships: Vec<RelationshipDraft>,
}

/// Merge strategy outputs by (normalized name, type).
///
/// An entity seen by two or more methods becomes `hybrid` with confidence
/// `min(1, max + hybrid_boost)`. At most `max_entities` survive, highest
/// confidence first; relationships to dropped entities go with them.
pub fn merge_outputs(
    outputs: Vec<StrategyOutput>,
    hybrid_boost: f64,
    max_entities: usize,
) -> MergedPage {
    let mut index: HashMap<DraftKey, usize> = HashMap::new();
    let mut merged: Vec<MergedEntity> = Vec::new();
    let mut relationships = Vec::new();

    for output in outputs {
        for draft in output.entities {
            let Some(key) = draft.key() else { continue };
            match index.get(&key) {
                Some(&i) => absorb(&mut merged[i], draft),
                None => {
                    index.insert(key.clone(), merged.len());
                    merged.push(MergedEntity {
                        key,
                        name: draft.name,
                        description: draft.description,
                        properties: draft.properties,
                        method: draft.method,
                        confidence: draft.confidence,
                        methods: BTreeSet::from([draft.method]),
                    });
                }
            }
        }
        relationships.extend(output.relationships);
    }

    for entity in &mut merged {
        if entity.methods.len() >= 2 {
            entity.method = ExtractionMethod::Hybrid;
            entity.confidence = (entity.confidence + hybrid_boost).min(1.0);
            let methods: Vec<Value> = entity
                .methods
                .iter()
                .map(|m| Value::from(m.as_str()))
                .collect();
            entity
                .properties
                .insert("extraction_methods".into(), Value::Array(methods));
        }
        entity.confidence = entity.confidence.clamp(0.0, 1.0);
    }

    if merged.len() > max_entities {
        merged.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        merged.truncate(max_entities);
    }

    let kept: BTreeSet<&DraftKey> = merged.iter().map(|e| &e.key).collect();
    let mut by_edge: HashMap<(DraftKey, DraftKey, String), RelationshipDraft> = HashMap::new();
    let mut order = Vec::new();
    for rel in relationships {
        if rel.source == rel.target || !kept.contains(&rel.source) || !kept.contains(&rel.target) {
            continue;
        }
        let edge = (
            rel.source.clone(),
            rel.target.clone(),
            rel.relationship_type.clone(),
        );
        match by_edge.get_mut(&edge) {
            Some(existing) => existing.confidence = existing.confidence.max(rel.confidence),
            None => {
                order.push(edge.clone());
                by_edge.insert(edge, rel);
            }
        }
    }
    let relationships = order
        .into_iter()
        .filter_map(|edge| by_edge.remove(&edge))
        .collect();

    MergedPage {
        entities: merged,
        relationships,
    }
}

fn absorb(entity: &mut MergedEntity, draft: EntityDraft) {
    entity.methods.insert(draft.method);
    if draft.confidence > entity.confidence {
        entity.confidence = draft.confidence;
        entity.name = draft.name;
        entity.method = draft.method;
    }
    if entity.description.is_none() {
        entity.description = draft.description;
    }
    for (key, value) in draft.properties {
        entity.properties.entry(key).or_insert(value);
    }
}
