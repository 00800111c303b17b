//! Core domain types for graphloom jobs, pages, entities, and candidates.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Declares a UUID v7 identifier newtype (time-sortable).
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Scraping job identifier.
    JobId
);
uuid_id!(
    /// Scraped page identifier.
    PageId
);
uuid_id!(
    /// Extracted entity identifier. Ordering breaks canonical ties.
    EntityId
);
uuid_id!(
    /// Entity relationship identifier.
    RelationshipId
);
uuid_id!(
    /// Consolidation candidate identifier.
    CandidateId
);

/// Owning tenant, supplied by the caller's tenant context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// String-backed enums
// ---------------------------------------------------------------------------

/// Implements `as_str`, `Display`, and `FromStr` for a fieldless enum whose
/// storage representation is a fixed string.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Storage/wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(PipelineError::validation(format!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Job status & stage
// ---------------------------------------------------------------------------

/// Lifecycle status of a scraping job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

str_enum!(JobStatus {
    Pending => "pending",
    Queued => "queued",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl JobStatus {
    /// Terminal jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Running) => true,
            (Running, Paused | Completed) => true,
            (Paused, Running) => true,
            // Failure and cancellation are reachable from every live state.
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Pipeline stage of a running job, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Crawling,
    Extracting,
    Consolidating,
    Done,
}

str_enum!(JobStage {
    Crawling => "crawling",
    Extracting => "extracting",
    Consolidating => "consolidating",
    Done => "done",
});

impl JobStage {
    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<JobStage> {
        match self {
            Self::Crawling => Some(Self::Extracting),
            Self::Extracting => Some(Self::Consolidating),
            Self::Consolidating => Some(Self::Done),
            Self::Done => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ScrapingJob
// ---------------------------------------------------------------------------

/// A scraping job and its authoritative counters.
///
/// Progress fractions are not stored here; they are derived from the counters
/// on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub config: JobConfig,
    pub status: JobStatus,
    /// Visible stage; non-null only while `status == running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<JobStage>,
    /// Furthest stage entered so far (retained across pause/resume).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_reached: Option<JobStage>,
    pub pages_crawled: u64,
    pub pages_extracted: u64,
    pub entities_extracted: u64,
    pub errors_count: u64,
    pub consolidation_pairs_total: u64,
    pub consolidation_pairs_evaluated: u64,
    pub consolidation_candidates_found: u64,
    pub consolidation_auto_merged: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ScrapingJob {
    /// Create a pending job for an already-validated config.
    pub fn new(tenant_id: TenantId, config: JobConfig) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            config,
            status: JobStatus::Pending,
            stage: None,
            stage_reached: None,
            pages_crawled: 0,
            pages_extracted: 0,
            entities_extracted: 0,
            errors_count: 0,
            consolidation_pairs_total: 0,
            consolidation_pairs_evaluated: 0,
            consolidation_candidates_found: 0,
            consolidation_auto_merged: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    ///
    /// Leaving `running` hides the stage; returning from `paused` restores it.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::validation(format!(
                "job {} cannot move from {} to {next}",
                self.id, self.status
            )));
        }

        match next {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.stage = self.stage_reached;
            }
            _ => self.stage = None,
        }

        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }

        self.status = next;
        Ok(())
    }

    /// Enter the next pipeline stage. Stages never skip or move backward.
    pub fn enter_stage(&mut self, stage: JobStage) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(PipelineError::validation(format!(
                "job {} is {}, stages only advance while running",
                self.id, self.status
            )));
        }

        let expected = match self.stage_reached {
            None => Some(JobStage::Crawling),
            Some(current) => current.next(),
        };

        if expected != Some(stage) {
            return Err(PipelineError::validation(format!(
                "job {} cannot enter stage {stage} after {:?}",
                self.id, self.stage_reached
            )));
        }

        self.stage = Some(stage);
        self.stage_reached = Some(stage);
        Ok(())
    }

    /// Mark the job failed with an error message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }
}

/// Externally-visible job status, as returned by `GetJobStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub pages_crawled: u64,
    pub entities_extracted: u64,
    pub errors_count: u64,
    pub crawl_progress: f64,
    pub extraction_progress: f64,
    pub consolidation_progress: f64,
    pub consolidation_candidates_found: u64,
    pub consolidation_auto_merged: u64,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// ScrapedPage
// ---------------------------------------------------------------------------

/// Extraction state of a scraped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Completed,
    Failed,
}

str_enum!(ExtractionStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

/// A page fetched (or permanently failed) during a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub id: PageId,
    pub job_id: JobId,
    pub url: String,
    pub canonical_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Link hops from the start URL.
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
    /// SHA-256 of the raw body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub fetch_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    pub extraction_status: ExtractionStatus,
    pub fetched_at: DateTime<Utc>,
}

impl ScrapedPage {
    /// Whether extraction has settled and the page is now immutable.
    pub fn is_settled(&self) -> bool {
        self.extraction_status != ExtractionStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Kind of real-world thing an entity refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Product,
    Concept,
    Document,
    Date,
    Custom,
}

str_enum!(EntityType {
    Person => "person",
    Organization => "organization",
    Location => "location",
    Event => "event",
    Product => "product",
    Concept => "concept",
    Document => "document",
    Date => "date",
    Custom => "custom",
});

impl EntityType {
    /// Lenient parse used for model output; unknown labels become `Custom`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "person" | "people" | "per" => Self::Person,
            "organization" | "organisation" | "org" | "company" => Self::Organization,
            "location" | "place" | "loc" | "gpe" => Self::Location,
            "event" => Self::Event,
            "product" => Self::Product,
            "concept" | "topic" => Self::Concept,
            "document" | "article" | "work" => Self::Document,
            "date" | "time" => Self::Date,
            _ => Self::Custom,
        }
    }
}

/// Strategy that produced an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    SchemaOrg,
    OpenGraph,
    LlmClaude,
    Pattern,
    Spacy,
    Hybrid,
}

str_enum!(ExtractionMethod {
    SchemaOrg => "schema_org",
    OpenGraph => "open_graph",
    LlmClaude => "llm_claude",
    Pattern => "pattern",
    Spacy => "spacy",
    Hybrid => "hybrid",
});

/// An entity extracted from a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub source_page_id: PageId,
    pub entity_type: EntityType,
    pub name: String,
    pub normalized_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub extraction_method: ExtractionMethod,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub synced_to_graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    /// Surviving entity this one was merged into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
}

impl ExtractedEntity {
    /// Whether this entity has been absorbed by another.
    pub fn is_merged(&self) -> bool {
        self.canonical_id.is_some()
    }
}

/// Directed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub id: RelationshipId,
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub source_entity_id: EntityId,
    pub target_entity_id: EntityId,
    pub relationship_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub confidence_score: f64,
}

impl EntityRelationship {
    /// Whether either endpoint is `entity`.
    pub fn touches(&self, entity: EntityId) -> bool {
        self.source_entity_id == entity || self.target_entity_id == entity
    }
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

/// Per-signal similarity scores; `None` means the signal was inapplicable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityBreakdown {
    pub jaro_winkler: Option<f64>,
    pub levenshtein: Option<f64>,
    pub trigram: Option<f64>,
    pub soundex_match: Option<bool>,
    pub metaphone_match: Option<bool>,
    pub embedding_cosine: Option<f64>,
    pub graph_neighborhood: Option<f64>,
    pub type_match: Option<bool>,
    pub same_page: Option<bool>,
}

/// Outcome of a consolidation candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateResolution {
    Pending,
    AutoMerged,
    Confirmed,
    Rejected,
}

str_enum!(CandidateResolution {
    Pending => "pending",
    AutoMerged => "auto_merged",
    Confirmed => "confirmed",
    Rejected => "rejected",
});

/// A scored pair of entities awaiting or past review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationCandidate {
    pub id: CandidateId,
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub entity_a: EntityId,
    pub entity_b: EntityId,
    pub breakdown: SimilarityBreakdown,
    pub confidence_score: f64,
    pub resolution: CandidateResolution,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConsolidationCandidate {
    /// The pair as an unordered key (smaller id first).
    pub fn pair_key(&self) -> (EntityId, EntityId) {
        ordered_pair(self.entity_a, self.entity_b)
    }
}

/// Order two entity ids so that the smaller comes first.
pub fn ordered_pair(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Reviewer decision on a pending candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Confirm,
    Reject,
}

str_enum!(ReviewDecision {
    Confirm => "confirm",
    Reject => "reject",
});

/// Scope for listing candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateScope {
    Job(JobId),
    Tenant(TenantId),
}

/// Collect the distinct entity ids referenced by a set of relationships.
pub fn referenced_entities(relationships: &[EntityRelationship]) -> HashSet<EntityId> {
    relationships
        .iter()
        .flat_map(|r| [r.source_entity_id, r.target_entity_id])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn sample_job() -> ScrapingJob {
        let config = JobConfig::new(Url::parse("https://example.com/").unwrap());
        ScrapingJob::new(TenantId::new("tenant-a"), config)
    }

    #[test]
    fn id_roundtrip() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().expect("parse EntityId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_time_ordered() {
        let first = EntityId::new();
        let second = EntityId::new();
        assert!(first < second);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("sleeping".parse::<JobStatus>().is_err());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut job = sample_job();
        assert!(job.transition(JobStatus::Running).is_err());
        job.transition(JobStatus::Queued).unwrap();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.transition(JobStatus::Cancelled).is_err());
    }

    #[test]
    fn cancel_allowed_from_every_live_state() {
        for steps in [
            vec![],
            vec![JobStatus::Queued],
            vec![JobStatus::Queued, JobStatus::Running],
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Paused],
        ] {
            let mut job = sample_job();
            for s in steps {
                job.transition(s).unwrap();
            }
            job.transition(JobStatus::Cancelled).unwrap();
            assert_eq!(job.status, JobStatus::Cancelled);
        }
    }

    #[test]
    fn stages_advance_strictly_in_order() {
        let mut job = sample_job();
        job.transition(JobStatus::Queued).unwrap();
        assert!(job.enter_stage(JobStage::Crawling).is_err());

        job.transition(JobStatus::Running).unwrap();
        assert!(job.enter_stage(JobStage::Extracting).is_err());
        job.enter_stage(JobStage::Crawling).unwrap();
        assert!(job.enter_stage(JobStage::Crawling).is_err());
        assert!(job.enter_stage(JobStage::Consolidating).is_err());
        job.enter_stage(JobStage::Extracting).unwrap();
        job.enter_stage(JobStage::Consolidating).unwrap();
        job.enter_stage(JobStage::Done).unwrap();
        assert!(job.enter_stage(JobStage::Crawling).is_err());
    }

    #[test]
    fn stage_hidden_while_paused_and_restored_on_resume() {
        let mut job = sample_job();
        job.transition(JobStatus::Queued).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.enter_stage(JobStage::Crawling).unwrap();
        job.enter_stage(JobStage::Extracting).unwrap();

        job.transition(JobStatus::Paused).unwrap();
        assert_eq!(job.stage, None);

        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.stage, Some(JobStage::Extracting));
    }

    #[test]
    fn terminal_status_clears_stage() {
        let mut job = sample_job();
        job.transition(JobStatus::Queued).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.enter_stage(JobStage::Crawling).unwrap();
        job.fail("storage unavailable").unwrap();
        assert_eq!(job.stage, None);
        assert_eq!(job.error_message.as_deref(), Some("storage unavailable"));
    }

    #[test]
    fn entity_type_labels() {
        assert_eq!(EntityType::from_label("Organisation"), EntityType::Organization);
        assert_eq!(EntityType::from_label("GPE"), EntityType::Location);
        assert_eq!(EntityType::from_label("spaceship"), EntityType::Custom);
    }

    #[test]
    fn ordered_pair_is_unordered_key() {
        let a = EntityId::new();
        let b = EntityId::new();
        assert_eq!(ordered_pair(a, b), ordered_pair(b, a));
    }

    #[test]
    fn job_serialization() {
        let job = sample_job();
        let json = serde_json::to_string(&job).expect("serialize");
        let parsed: ScrapingJob = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.status, JobStatus::Pending);
        assert_eq!(parsed.config.max_pages, job.config.max_pages);
    }
}
