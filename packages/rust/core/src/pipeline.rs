//! The [`Pipeline`]: job submission, control, status, and candidate review.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore, watch};
use tracing::{info, instrument};

use graphloom_consolidate::confirm_candidate;
use graphloom_extract::{EmbeddingClient, LlmExtractor};
use graphloom_shared::{
    AppConfig, CandidateId, CandidateResolution, CandidateScope, ConsolidationCandidate, JobConfig,
    JobControl, JobId, JobStage, JobStatus, JobStatusView, PipelineError, Result, ReviewDecision,
    ScrapingJob, TenantId,
};
use graphloom_storage::Storage;

use crate::progress::{JobObserver, SilentObserver, status_view};
use crate::runner::JobRunner;

/// Registry entry for a live job; removed once the job is terminal.
struct JobEntry {
    control: watch::Sender<JobControl>,
    status: watch::Receiver<ScrapingJob>,
}

struct Shared {
    storage: Arc<Storage>,
    config: Arc<AppConfig>,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    slots: Arc<Semaphore>,
    llm: Option<Arc<LlmExtractor>>,
    embedder: Option<Arc<EmbeddingClient>>,
    observer: Arc<dyn JobObserver>,
}

/// Entry point for running and reviewing scraping jobs.
///
/// Cheap to clone; clones share the job registry and the job-slot pool.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Open the configured database and build a pipeline around it.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let path = config.storage.resolved_path()?;
        let storage = Storage::open(&path).await?;
        Self::new(Arc::new(storage), config)
    }

    pub fn new(storage: Arc<Storage>, config: AppConfig) -> Result<Self> {
        Self::with_observer(storage, config, Arc::new(SilentObserver))
    }

    pub fn with_observer(
        storage: Arc<Storage>,
        config: AppConfig,
        observer: Arc<dyn JobObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let llm = LlmExtractor::from_config(&config.llm)?.map(Arc::new);
        let embedder = EmbeddingClient::from_config(&config.embedding)?.map(Arc::new);
        let slots = Arc::new(Semaphore::new(config.workers.max_concurrent_jobs));

        Ok(Self {
            shared: Arc::new(Shared {
                storage,
                config: Arc::new(config),
                jobs: RwLock::new(HashMap::new()),
                slots,
                llm,
                embedder,
                observer,
            }),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.shared.storage
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Validate `config`, persist a new job, and queue it for a worker slot.
    ///
    /// An invalid config is a `Validation` error and creates nothing.
    #[instrument(skip_all, fields(tenant = %tenant_id, start_url = %config.start_url))]
    pub async fn create_job(&self, tenant_id: TenantId, config: JobConfig) -> Result<ScrapingJob> {
        config.validate()?;

        let mut job = ScrapingJob::new(tenant_id, config);
        self.shared.storage.insert_job(&job).await?;
        job.transition(JobStatus::Queued)?;
        self.shared.storage.update_job(&job).await?;

        let (control_tx, control_rx) = watch::channel(JobControl::Run);
        let (status_tx, status_rx) = watch::channel(job.clone());
        let runner = JobRunner::new(
            job.clone(),
            Arc::clone(&self.shared.storage),
            Arc::clone(&self.shared.config),
            self.shared.llm.clone(),
            self.shared.embedder.clone(),
            control_rx,
            status_tx,
            Arc::clone(&self.shared.observer),
        );

        // Register before spawning so teardown always follows registration.
        let mut jobs = self.shared.jobs.write().await;
        let shared = Arc::clone(&self.shared);
        let slots = Arc::clone(&self.shared.slots);
        let job_id = job.id;
        tokio::spawn(async move {
            runner.run(slots).await;
            shared.jobs.write().await.remove(&job_id);
        });
        jobs.insert(
            job_id,
            JobEntry {
                control: control_tx,
                status: status_rx,
            },
        );

        info!(%job_id, "job queued");
        Ok(job)
    }

    /// Current status of a job, live or finished.
    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        Ok(status_view(&self.snapshot(job_id).await?))
    }

    pub async fn list_jobs(&self, tenant_id: &TenantId) -> Result<Vec<ScrapingJob>> {
        self.shared.storage.list_jobs(tenant_id).await
    }

    /// Live snapshots of a job. A finished job yields a receiver holding its
    /// final state.
    pub async fn subscribe(&self, job_id: JobId) -> Result<watch::Receiver<ScrapingJob>> {
        if let Some(entry) = self.shared.jobs.read().await.get(&job_id) {
            return Ok(entry.status.clone());
        }
        let job = self.stored_job(job_id).await?;
        let (_tx, rx) = watch::channel(job);
        Ok(rx)
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: JobId) -> Result<JobStatusView> {
        let mut rx = self.subscribe(job_id).await?;
        let finished = rx
            .wait_for(|job| job.status.is_terminal())
            .await
            .map(|job| job.clone());
        match finished {
            Ok(job) => Ok(status_view(&job)),
            // The runner went away without publishing; storage has the rest.
            Err(_) => Ok(status_view(&self.stored_job(job_id).await?)),
        }
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        self.signal(job_id, JobControl::Cancel, |status| !status.is_terminal())
            .await
    }

    /// Pause a running job. Only `running` jobs can be paused.
    pub async fn pause_job(&self, job_id: JobId) -> Result<()> {
        self.signal(job_id, JobControl::Pause, |status| {
            status == JobStatus::Running
        })
        .await
    }

    /// Resume a paused job.
    pub async fn resume_job(&self, job_id: JobId) -> Result<()> {
        self.signal(job_id, JobControl::Run, |status| status == JobStatus::Paused)
            .await
    }

    async fn signal(
        &self,
        job_id: JobId,
        control: JobControl,
        allowed: impl Fn(JobStatus) -> bool,
    ) -> Result<()> {
        let jobs = self.shared.jobs.read().await;
        let status = match jobs.get(&job_id) {
            Some(entry) => entry.status.borrow().status,
            None => self.stored_job(job_id).await?.status,
        };
        let entry = jobs.get(&job_id).filter(|_| allowed(status));
        let Some(entry) = entry else {
            return Err(PipelineError::validation(format!(
                "job {job_id} is {status}, cannot {}",
                match control {
                    JobControl::Run => "resume",
                    JobControl::Pause => "pause",
                    JobControl::Cancel => "cancel",
                }
            )));
        };
        entry.control.send_replace(control);
        info!(%job_id, ?control, "job control sent");
        Ok(())
    }

    async fn snapshot(&self, job_id: JobId) -> Result<ScrapingJob> {
        if let Some(entry) = self.shared.jobs.read().await.get(&job_id) {
            return Ok(entry.status.borrow().clone());
        }
        self.stored_job(job_id).await
    }

    async fn stored_job(&self, job_id: JobId) -> Result<ScrapingJob> {
        self.shared
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))
    }

    // -----------------------------------------------------------------------
    // Candidate review
    // -----------------------------------------------------------------------

    pub async fn list_consolidation_candidates(
        &self,
        scope: &CandidateScope,
        filter: Option<CandidateResolution>,
    ) -> Result<Vec<ConsolidationCandidate>> {
        self.shared.storage.list_candidates(scope, filter).await
    }

    /// Confirm or reject a pending candidate.
    ///
    /// Confirming merges the pair exactly as an auto-merge would; rejecting
    /// only records the decision. A candidate can be resolved once.
    #[instrument(skip(self), fields(candidate_id = %candidate_id))]
    pub async fn resolve_consolidation_candidate(
        &self,
        candidate_id: CandidateId,
        decision: ReviewDecision,
    ) -> Result<ConsolidationCandidate> {
        let storage = &self.shared.storage;
        let candidate = storage
            .get_candidate(candidate_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("candidate", candidate_id))?;
        if candidate.resolution != CandidateResolution::Pending {
            return Err(already_resolved(&candidate));
        }
        if self.consolidating(candidate.job_id).await {
            return Err(PipelineError::validation(format!(
                "job {} is still consolidating; review its candidates once it finishes",
                candidate.job_id
            )));
        }

        let resolved = match decision {
            ReviewDecision::Confirm => confirm_candidate(storage, &candidate).await?,
            ReviewDecision::Reject => {
                storage
                    .resolve_candidate(candidate_id, CandidateResolution::Rejected)
                    .await?
            }
        };
        if !resolved {
            return Err(already_resolved(&candidate));
        }
        info!(%decision, "candidate resolved");

        storage
            .get_candidate(candidate_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("candidate", candidate_id))
    }

    async fn consolidating(&self, job_id: JobId) -> bool {
        self.shared
            .jobs
            .read()
            .await
            .get(&job_id)
            .is_some_and(|entry| {
                let job = entry.status.borrow();
                !job.status.is_terminal() && job.stage_reached == Some(JobStage::Consolidating)
            })
    }
}

fn already_resolved(candidate: &ConsolidationCandidate) -> PipelineError {
    PipelineError::validation(format!(
        "candidate {} is already {}",
        candidate.id, candidate.resolution
    ))
}
