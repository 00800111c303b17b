//! Entity extraction for scraped pages.
//!
//! This crate provides:
//! - [`coordinator`]: per-page strategy dispatch, hybrid merging, and the
//!   bounded extraction worker pool
//! - [`structured`]: JSON-LD, microdata, and OpenGraph readers
//! - [`pattern`]: regex detection of dates, titled persons, and legal names
//! - [`ner`]: capitalized-span recogniser with gazetteer classification
//! - [`llm`]: Anthropic Messages API extraction
//! - [`embedding`]: OpenAI-compatible embedding client
//! - [`text`]: visible-text rendering of HTML
//! - [`draft`]: strategy output before ids are assigned

pub mod coordinator;
pub mod draft;
pub mod embedding;
pub mod llm;
pub mod ner;
pub mod pattern;
pub mod structured;
pub mod text;

pub use coordinator::{ExtractionCoordinator, ExtractionSummary, PageExtraction};
pub use draft::{DraftKey, EntityDraft, MergedEntity, RelationshipDraft, StrategyOutput, merge_outputs};
pub use embedding::EmbeddingClient;
pub use llm::LlmExtractor;
pub use pattern::PatternSet;
pub use text::{truncate_chars, visible_text};
