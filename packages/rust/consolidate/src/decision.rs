//! Weighted confidence and merge thresholds.

use graphloom_shared::{ConsolidationConfig, EntityType, SimilarityBreakdown};

use crate::similarity::types_compatible;

/// What to do with a scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoMerge,
    Candidate,
    Discard,
}

/// Combine the present signals into one confidence in `[0, 1]`.
///
/// Weights of absent signals are dropped and the rest renormalized. The
/// phonetic signal is the mean of whichever Soundex/Metaphone flags exist.
pub fn combined_confidence(
    breakdown: &SimilarityBreakdown,
    types: (EntityType, EntityType),
    config: &ConsolidationConfig,
) -> f64 {
    if !types_compatible(types.0, types.1) {
        return 0.0;
    }

    let flags: Vec<f64> = [breakdown.soundex_match, breakdown.metaphone_match]
        .into_iter()
        .flatten()
        .map(|m| if m { 1.0 } else { 0.0 })
        .collect();
    let phonetic = (!flags.is_empty()).then(|| flags.iter().sum::<f64>() / flags.len() as f64);

    let w = &config.weights;
    let signals = [
        (breakdown.jaro_winkler, w.jaro_winkler),
        (breakdown.levenshtein, w.levenshtein),
        (breakdown.trigram, w.trigram),
        (phonetic, w.phonetic),
        (breakdown.embedding_cosine.map(|c| c.clamp(0.0, 1.0)), w.embedding),
        (breakdown.graph_neighborhood, w.graph),
    ];

    let (mut sum, mut weight) = (0.0, 0.0);
    for (value, w) in signals {
        if let Some(value) = value {
            sum += value * w;
            weight += w;
        }
    }
    if weight <= 0.0 {
        return 0.0;
    }

    let mut confidence = sum / weight;
    if breakdown.same_page == Some(true) {
        confidence -= config.same_page_penalty;
    }
    confidence.clamp(0.0, 1.0)
}

pub fn decide(confidence: f64, config: &ConsolidationConfig) -> Decision {
    if confidence >= config.auto_merge_threshold {
        Decision::AutoMerge
    } else if confidence >= config.candidate_threshold {
        Decision::Candidate
    } else {
        Decision::Discard
    }
}
