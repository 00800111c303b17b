//! Shared types, error model, and configuration for graphloom.
//!
//! This crate is the foundation depended on by all other graphloom crates.
//! It provides:
//! - [`PipelineError`] — the unified error type
//! - Domain types ([`ScrapingJob`], [`ScrapedPage`], [`ExtractedEntity`],
//!   [`EntityRelationship`], [`ConsolidationCandidate`])
//! - Configuration ([`AppConfig`], [`JobConfig`], config loading)
//! - Job control signalling shared by every pipeline stage

pub mod config;
pub mod control;
pub mod error;
pub mod normalize;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ConsolidationConfig, CrawlSettings, DefaultsConfig, EmbeddingConfig,
    ExtractionConfig, JobConfig, LlmConfig, MethodConfidence, SignalWeights, StorageConfig,
    WorkerConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use control::{Checkpoint, JobControl, checkpoint};
pub use error::{PipelineError, Result};
pub use normalize::normalize_name;
pub use types::{
    CandidateId, CandidateResolution, CandidateScope, ConsolidationCandidate, EntityId,
    EntityRelationship, EntityType, ExtractedEntity, ExtractionMethod, ExtractionStatus, JobId,
    JobStage, JobStatus, JobStatusView, PageId, RelationshipId, ReviewDecision, ScrapedPage,
    ScrapingJob, SimilarityBreakdown, TenantId,
};
