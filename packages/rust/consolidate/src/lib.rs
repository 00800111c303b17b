//! Entity consolidation: similarity scoring, merge decisions, and merges.
//!
//! This crate provides:
//! - [`similarity`]: the per-pair [`SimilarityBreakdown`](graphloom_shared::SimilarityBreakdown)
//! - [`phonetic`]: Soundex and Metaphone keys
//! - [`blocking`]: candidate pair generation
//! - [`decision`]: weighted confidence and thresholds
//! - [`merge`]: canonical choice and property absorption
//! - [`engine`]: the sharded scoring pass and sequential merge application

pub mod blocking;
pub mod decision;
pub mod engine;
pub mod merge;
pub mod phonetic;
pub mod similarity;

pub use blocking::{blocked_pairs, first_trigram};
pub use decision::{Decision, combined_confidence, decide};
pub use engine::{ApplyEvent, ConsolidationPass, PassOutcome, ScoredPair};
pub use merge::{absorb, choose_canonical, confirm_candidate};
pub use phonetic::{metaphone, soundex};
pub use similarity::{NeighborIndex, score, trigrams};
