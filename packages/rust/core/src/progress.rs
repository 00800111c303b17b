//! Progress fractions and job observers.

use graphloom_shared::{JobId, JobStage, JobStatus, JobStatusView, ScrapingJob};

/// Build the externally visible status of a job from its counters.
///
/// Fractions are recomputed on every call; a stage that has been left
/// reports 1.
pub fn status_view(job: &ScrapingJob) -> JobStatusView {
    let past = |stage: JobStage| job.stage_reached.is_some_and(|reached| reached > stage);

    let crawl_progress = if past(JobStage::Crawling) {
        1.0
    } else {
        ratio(job.pages_crawled, u64::from(job.config.max_pages))
    };

    let extraction_progress = if past(JobStage::Extracting) {
        1.0
    } else {
        ratio(job.pages_extracted, job.pages_crawled)
    };

    let consolidation_progress = if past(JobStage::Consolidating) {
        1.0
    } else {
        ratio(
            job.consolidation_pairs_evaluated,
            job.consolidation_pairs_total,
        )
    };

    JobStatusView {
        job_id: job.id,
        status: job.status,
        stage: job.stage,
        pages_crawled: job.pages_crawled,
        entities_extracted: job.entities_extracted,
        errors_count: job.errors_count,
        crawl_progress,
        extraction_progress,
        consolidation_progress,
        consolidation_candidates_found: job.consolidation_candidates_found,
        consolidation_auto_merged: job.consolidation_auto_merged,
        error_message: job.error_message.clone(),
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).min(1.0)
}

/// Callbacks for job lifecycle updates.
pub trait JobObserver: Send + Sync {
    /// Called when a job enters a pipeline stage.
    fn stage_entered(&self, job_id: JobId, stage: JobStage);
    /// Called when a job's status changes.
    fn status_changed(&self, job_id: JobId, status: JobStatus);
    /// Called after every counter update.
    fn counters_updated(&self, view: &JobStatusView);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl JobObserver for SilentObserver {
    fn stage_entered(&self, _job_id: JobId, _stage: JobStage) {}
    fn status_changed(&self, _job_id: JobId, _status: JobStatus) {}
    fn counters_updated(&self, _view: &JobStatusView) {}
}
