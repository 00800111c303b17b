//! Canonical choice and property absorption.

use serde_json::Value;
use tracing::{info, warn};

use graphloom_shared::{
    CandidateResolution, ConsolidationCandidate, EntityId, ExtractedEntity, PipelineError, Result,
    normalize_name,
};
use graphloom_storage::Storage;

/// Redirect chains longer than this indicate corrupt data.
const MAX_REDIRECT_HOPS: usize = 16;

/// Split a pair into `(canonical, absorbed)`.
///
/// The higher `confidence_score` survives; ties go to the lower id.
pub fn choose_canonical<'e>(
    a: &'e ExtractedEntity,
    b: &'e ExtractedEntity,
) -> (&'e ExtractedEntity, &'e ExtractedEntity) {
    let a_wins = match a.confidence_score.total_cmp(&b.confidence_score) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.id <= b.id,
    };
    if a_wins { (a, b) } else { (b, a) }
}

/// Fold `absorbed` into `canonical` in memory.
///
/// Fills a missing description, adds properties the canonical lacks, and
/// records the absorbed name (and its own aliases) under `"aliases"`.
pub fn absorb(canonical: &mut ExtractedEntity, absorbed: &ExtractedEntity) {
    if canonical.description.as_deref().is_none_or(str::is_empty) {
        if let Some(description) = absorbed.description.as_ref().filter(|d| !d.is_empty()) {
            canonical.description = Some(description.clone());
        }
    }

    for (key, value) in &absorbed.properties {
        if key != "aliases" {
            canonical
                .properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    let mut aliases = string_list(canonical.properties.get("aliases"));
    let incoming = std::iter::once(absorbed.name.clone())
        .chain(string_list(absorbed.properties.get("aliases")));
    for alias in incoming {
        let normalized = normalize_name(&alias);
        if normalized.is_empty() || normalized == canonical.normalized_name {
            continue;
        }
        if !aliases.iter().any(|a| normalize_name(a) == normalized) {
            aliases.push(alias);
        }
    }
    if !aliases.is_empty() {
        canonical.properties.insert(
            "aliases".into(),
            Value::Array(aliases.into_iter().map(Value::String).collect()),
        );
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Follow `canonical_id` redirects to the surviving entity.
async fn resolve_live(storage: &Storage, id: EntityId) -> Result<ExtractedEntity> {
    let mut current = id;
    for _ in 0..MAX_REDIRECT_HOPS {
        let entity = storage
            .get_entity(current)
            .await?
            .ok_or_else(|| PipelineError::not_found("entity", current))?;
        match entity.canonical_id {
            Some(next) if next != entity.id => current = next,
            _ => return Ok(entity),
        }
    }
    Err(PipelineError::Consolidation(format!(
        "redirect chain from entity {id} is too long"
    )))
}

/// Confirm a pending candidate and merge its pair, wherever their
/// redirects now lead.
///
/// The candidate flips to `confirmed` in the merge's own transaction, so a
/// failed merge leaves it pending. Returns `false` when it was no longer
/// pending.
pub async fn confirm_candidate(
    storage: &Storage,
    candidate: &ConsolidationCandidate,
) -> Result<bool> {
    let a = resolve_live(storage, candidate.entity_a).await?;
    let b = resolve_live(storage, candidate.entity_b).await?;
    if a.id == b.id {
        warn!(canonical = %a.id, "candidate pair already resolves to one entity");
        return storage
            .resolve_candidate(candidate.id, CandidateResolution::Confirmed)
            .await;
    }

    let (canonical, absorbed) = choose_canonical(&a, &b);
    let mut merged = canonical.clone();
    absorb(&mut merged, absorbed);
    let Some(stats) = storage
        .confirm_candidate_merge(candidate.id, absorbed.id, &merged)
        .await?
    else {
        return Ok(false);
    };
    info!(
        canonical = %merged.id,
        absorbed = %absorbed.id,
        repointed = stats.relationships_repointed,
        dropped = stats.relationships_dropped,
        "merged entity pair"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use graphloom_shared::{EntityType, PageId};

    use super::*;
    use crate::similarity::fixtures::entity;

    #[test]
    fn higher_confidence_is_canonical() {
        let page = PageId::new();
        let mut a = entity("Acme", EntityType::Organization, page);
        let b = entity("ACME", EntityType::Organization, page);
        a.confidence_score = 0.95;
        let (canonical, absorbed) = choose_canonical(&b, &a);
        assert_eq!(canonical.id, a.id);
        assert_eq!(absorbed.id, b.id);
    }

    #[test]
    fn ties_go_to_the_lower_id() {
        let page = PageId::new();
        let a = entity("Acme", EntityType::Organization, page);
        let b = entity("ACME", EntityType::Organization, page);
        let lower = a.id.min(b.id);
        assert_eq!(choose_canonical(&a, &b).0.id, lower);
        assert_eq!(choose_canonical(&b, &a).0.id, lower);
    }

    #[test]
    fn absorb_fills_gaps_and_records_aliases() {
        let page = PageId::new();
        let mut canonical = entity("Acme Corporation", EntityType::Organization, page);
        canonical
            .properties
            .insert("url".into(), Value::String("https://acme.example".into()));

        let mut absorbed = entity("Acme Corp", EntityType::Organization, page);
        absorbed.description = Some("Maker of anvils".into());
        absorbed
            .properties
            .insert("url".into(), Value::String("https://other.example".into()));
        absorbed
            .properties
            .insert("founded".into(), Value::String("1949".into()));
        absorbed.properties.insert(
            "aliases".into(),
            serde_json::json!(["ACME Inc", "acme corporation"]),
        );

        absorb(&mut canonical, &absorbed);

        assert_eq!(canonical.description.as_deref(), Some("Maker of anvils"));
        assert_eq!(canonical.properties["url"], "https://acme.example");
        assert_eq!(canonical.properties["founded"], "1949");
        assert_eq!(
            canonical.properties["aliases"],
            serde_json::json!(["Acme Corp", "ACME Inc"])
        );

        // A second absorb of the same names adds nothing.
        absorb(&mut canonical, &absorbed);
        assert_eq!(
            canonical.properties["aliases"],
            serde_json::json!(["Acme Corp", "ACME Inc"])
        );
    }
}
