//! Per-job orchestrator task.
//!
//! The runner owns the job record and every counter on it. The crawl
//! scheduler and the extraction coordinator run as their own tasks and
//! report back over channels; consolidation runs last, once both have
//! closed. Each counter change is persisted and published as a snapshot.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use graphloom_consolidate::{ApplyEvent, ConsolidationPass, PassOutcome};
use graphloom_crawler::{CrawlEvent, CrawlScheduler};
use graphloom_extract::{EmbeddingClient, ExtractionCoordinator, LlmExtractor, PageExtraction};
use graphloom_shared::{
    AppConfig, JobControl, JobStage, JobStatus, PipelineError, Result, ScrapedPage, ScrapingJob,
};
use graphloom_storage::Storage;

use crate::progress::{JobObserver, status_view};

/// Capacity of the extraction-result channel.
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// How a stage loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

enum PassEvent {
    Evaluated(u64),
    Applied(ApplyEvent),
}

pub(crate) struct JobRunner {
    job: ScrapingJob,
    storage: Arc<Storage>,
    config: Arc<AppConfig>,
    llm: Option<Arc<LlmExtractor>>,
    embedder: Option<Arc<EmbeddingClient>>,
    control: watch::Receiver<JobControl>,
    status: watch::Sender<ScrapingJob>,
    observer: Arc<dyn JobObserver>,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: ScrapingJob,
        storage: Arc<Storage>,
        config: Arc<AppConfig>,
        llm: Option<Arc<LlmExtractor>>,
        embedder: Option<Arc<EmbeddingClient>>,
        control: watch::Receiver<JobControl>,
        status: watch::Sender<ScrapingJob>,
        observer: Arc<dyn JobObserver>,
    ) -> Self {
        Self {
            job,
            storage,
            config,
            llm,
            embedder,
            control,
            status,
            observer,
        }
    }

    /// Wait for a job slot, then drive the job to a terminal status.
    #[instrument(skip_all, fields(job_id = %self.job.id, tenant = %self.job.tenant_id))]
    pub(crate) async fn run(mut self, slots: Arc<Semaphore>) {
        let permit = tokio::select! {
            permit = slots.acquire_owned() => permit,
            _ = cancel_requested(self.control.clone()) => {
                self.finish(Ok(Flow::Cancelled)).await;
                return;
            }
        };
        let Ok(_permit) = permit else {
            self.finish(Err(PipelineError::FatalJob("job slots closed".into())))
                .await;
            return;
        };

        let outcome = match self.set_status(JobStatus::Running).await {
            Ok(()) => self.drive().await,
            Err(e) => Err(e),
        };
        self.finish(outcome).await;
    }

    async fn drive(&mut self) -> Result<Flow> {
        info!(start_url = %self.job.config.start_url, "job started");

        if self.enter_stage(JobStage::Crawling).await? == Flow::Cancelled
            || self.crawl_and_extract().await? == Flow::Cancelled
            || self.enter_stage(JobStage::Consolidating).await? == Flow::Cancelled
            || self.consolidate().await? == Flow::Cancelled
        {
            return Ok(Flow::Cancelled);
        }
        self.enter_stage(JobStage::Done).await
    }

    /// Record the terminal status. Storage failures here are only logged.
    async fn finish(&mut self, outcome: Result<Flow>) {
        let next = match outcome {
            Ok(Flow::Continue) => self.job.transition(JobStatus::Completed),
            Ok(Flow::Cancelled) => self.job.transition(JobStatus::Cancelled),
            Err(e) => {
                let e = e.into_fatal();
                error!(error = %e, "job failed");
                self.job.fail(e.to_string())
            }
        };
        if let Err(e) = next {
            warn!(error = %e, "could not record terminal status");
            return;
        }

        if let Err(e) = self.storage.update_job(&self.job).await {
            warn!(error = %e, "failed to persist terminal job state");
        }
        self.publish();
        self.observer.status_changed(self.job.id, self.job.status);
        info!(
            status = %self.job.status,
            pages_crawled = self.job.pages_crawled,
            entities = self.job.entities_extracted,
            errors = self.job.errors_count,
            "job finished"
        );
    }

    // -----------------------------------------------------------------------
    // Crawl + extract
    // -----------------------------------------------------------------------

    async fn crawl_and_extract(&mut self) -> Result<Flow> {
        let workers = &self.config.workers;
        let crawler = CrawlScheduler::new(
            self.job.id,
            self.job.config.clone(),
            &self.config.crawl,
            workers.fetch_concurrency,
        )?;
        let coordinator = ExtractionCoordinator::new(
            self.job.tenant_id.clone(),
            self.job.id,
            self.job.config.use_llm_extraction,
            self.config.extraction.clone(),
            workers.extraction_concurrency,
        )?
        .with_llm(self.llm.clone())
        .with_embedder(self.embedder.clone());

        // Sized so forwarding a crawled page never waits on extraction.
        let page_capacity = (self.job.config.max_pages as usize).max(1);
        let (crawl_tx, mut crawl_rx) = mpsc::channel::<CrawlEvent>(page_capacity);
        let (page_tx, page_rx) = mpsc::channel::<ScrapedPage>(page_capacity);
        let (result_tx, mut result_rx) = mpsc::channel::<PageExtraction>(RESULT_CHANNEL_CAPACITY);

        let crawl_task = tokio::spawn(crawler.run(self.control.clone(), crawl_tx));
        let extract_task = tokio::spawn(coordinator.run(page_rx, self.control.clone(), result_tx));
        let abort = || {
            crawl_task.abort();
            extract_task.abort();
        };

        let mut page_tx = Some(page_tx);
        let mut crawl_open = true;
        let mut extract_open = true;

        while crawl_open || extract_open {
            let step = tokio::select! {
                changed = self.control.changed() => {
                    if changed.is_err() {
                        Ok(Flow::Cancelled)
                    } else {
                        self.on_control().await
                    }
                }
                event = crawl_rx.recv(), if crawl_open => match event {
                    Some(event) => self.on_crawl_event(event, page_tx.as_ref()).await,
                    None => {
                        crawl_open = false;
                        // Closing the page channel lets extraction drain and stop.
                        page_tx = None;
                        self.enter_stage(JobStage::Extracting).await
                    }
                },
                result = result_rx.recv(), if extract_open => match result {
                    Some(result) => self.on_page_extracted(result).await,
                    None => {
                        extract_open = false;
                        Ok(Flow::Continue)
                    }
                },
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Cancelled) => {
                    abort();
                    return Ok(Flow::Cancelled);
                }
                Err(e) => {
                    abort();
                    return Err(e);
                }
            }
        }

        match (crawl_task.await, extract_task.await) {
            (Ok(crawl), Ok(extraction)) => {
                info!(
                    pages_crawled = crawl.pages_crawled,
                    pages_failed = crawl.pages_failed,
                    skipped_robots = crawl.skipped_robots,
                    skipped_out_of_scope = crawl.skipped_out_of_scope,
                    frontier_remaining = crawl.frontier_remaining,
                    pages_extracted = extraction.pages_extracted,
                    "crawl and extraction finished"
                );
                Ok(Flow::Continue)
            }
            (Err(e), _) | (_, Err(e)) => Err(PipelineError::FatalJob(format!(
                "stage task panicked: {e}"
            ))),
        }
    }

    async fn on_crawl_event(
        &mut self,
        event: CrawlEvent,
        pages: Option<&mpsc::Sender<ScrapedPage>>,
    ) -> Result<Flow> {
        match event {
            CrawlEvent::Fetched(page) => {
                self.storage.upsert_page(&page).await?;
                self.job.pages_crawled += 1;
                self.commit().await?;
                if let Some(pages) = pages {
                    if pages.send(page).await.is_err() {
                        debug!("extraction input closed, page not forwarded");
                    }
                }
            }
            CrawlEvent::Failed(page) => {
                warn!(
                    url = %page.url,
                    error = page.fetch_error.as_deref().unwrap_or("unknown"),
                    "page fetch failed"
                );
                self.storage.upsert_page(&page).await?;
                self.job.errors_count += 1;
                self.commit().await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_page_extracted(&mut self, result: PageExtraction) -> Result<Flow> {
        self.storage
            .update_page_extraction(result.page_id, result.status, result.extracted_content.as_deref())
            .await?;
        for entity in &result.entities {
            self.storage.insert_entity(entity).await?;
        }
        for rel in &result.relationships {
            self.storage.insert_relationship(rel).await?;
        }
        for e in &result.errors {
            warn!(page_id = %result.page_id, error = %e, "extraction error");
        }

        self.job.pages_extracted += 1;
        self.job.entities_extracted += result.entities.len() as u64;
        self.job.errors_count += result.errors.len() as u64;
        self.commit().await?;
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Consolidation
    // -----------------------------------------------------------------------

    async fn consolidate(&mut self) -> Result<Flow> {
        let storage = Arc::clone(&self.storage);
        let entities = storage.list_active_entities(self.job.id).await?;
        let relationships = storage.list_relationships(self.job.id).await?;
        let mut pass = ConsolidationPass::new(
            self.job.tenant_id.clone(),
            self.job.id,
            entities,
            &relationships,
            self.config.consolidation.clone(),
        );
        self.job.consolidation_pairs_total = pass.pairs_total();
        self.commit().await?;

        let shards = self.config.workers.consolidation_shards;
        let mut pass_control = self.control.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let scoring = pass.score(shards, &mut pass_control, move |n| {
            let _ = tx.send(PassEvent::Evaluated(n));
        });
        match self.follow(scoring, &mut rx).await? {
            Some(PassOutcome::Completed) => {}
            Some(PassOutcome::Cancelled) | None => return Ok(Flow::Cancelled),
        }

        let pair_errors = pass.pair_errors();
        if pair_errors > 0 {
            warn!(pair_errors, "pairs skipped during scoring");
            self.job.errors_count += pair_errors;
            self.commit().await?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let applying = pass.apply(&storage, &mut pass_control, move |event| {
            let _ = tx.send(PassEvent::Applied(event));
        });
        match self.follow(applying, &mut rx).await? {
            Some(outcome) => {
                if outcome? == PassOutcome::Cancelled {
                    return Ok(Flow::Cancelled);
                }
            }
            None => return Ok(Flow::Cancelled),
        }

        let inferred = pass.infer_cooccurrence(&storage).await?;
        info!(
            pairs = self.job.consolidation_pairs_total,
            auto_merged = self.job.consolidation_auto_merged,
            candidates = self.job.consolidation_candidates_found,
            cooccurrence = inferred,
            "consolidation finished"
        );
        Ok(Flow::Continue)
    }

    /// Drive a consolidation step while applying its progress events and
    /// control changes. `None` means the job was cancelled mid-step.
    async fn follow<F: Future>(
        &mut self,
        step: F,
        events: &mut mpsc::UnboundedReceiver<PassEvent>,
    ) -> Result<Option<F::Output>> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_pass_event(event).await?,
                changed = self.control.changed() => {
                    let flow = if changed.is_err() {
                        Flow::Cancelled
                    } else {
                        self.on_control().await?
                    };
                    if flow == Flow::Cancelled {
                        return Ok(None);
                    }
                }
                output = &mut step => {
                    while let Ok(event) = events.try_recv() {
                        self.on_pass_event(event).await?;
                    }
                    return Ok(Some(output));
                }
            }
        }
    }

    async fn on_pass_event(&mut self, event: PassEvent) -> Result<()> {
        match event {
            PassEvent::Evaluated(n) => self.job.consolidation_pairs_evaluated += n,
            PassEvent::Applied(ApplyEvent::AutoMerged { .. }) => {
                self.job.consolidation_auto_merged += 1;
            }
            PassEvent::Applied(ApplyEvent::CandidateFound(_)) => {
                self.job.consolidation_candidates_found += 1;
            }
        }
        self.commit().await
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    /// React to a control change: pause, resume, or report cancellation.
    async fn on_control(&mut self) -> Result<Flow> {
        let control = *self.control.borrow_and_update();
        match control {
            JobControl::Cancel => return Ok(Flow::Cancelled),
            JobControl::Pause if self.job.status == JobStatus::Running => {
                self.set_status(JobStatus::Paused).await?;
                info!("job paused");
            }
            JobControl::Run if self.job.status == JobStatus::Paused => {
                self.set_status(JobStatus::Running).await?;
                info!("job resumed");
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    async fn set_status(&mut self, status: JobStatus) -> Result<()> {
        self.job.transition(status)?;
        self.storage.update_job(&self.job).await?;
        self.publish();
        self.observer.status_changed(self.job.id, status);
        Ok(())
    }

    /// Enter `stage`, first waiting out a pause.
    async fn enter_stage(&mut self, stage: JobStage) -> Result<Flow> {
        while self.job.status == JobStatus::Paused {
            if self.control.changed().await.is_err() || self.on_control().await? == Flow::Cancelled
            {
                return Ok(Flow::Cancelled);
            }
        }
        self.job.enter_stage(stage)?;
        self.storage.update_job(&self.job).await?;
        self.publish();
        self.observer.stage_entered(self.job.id, stage);
        debug!(%stage, "stage entered");
        Ok(Flow::Continue)
    }

    /// Persist and publish the current counters.
    async fn commit(&mut self) -> Result<()> {
        self.storage.update_job(&self.job).await?;
        self.publish();
        self.observer.counters_updated(&status_view(&self.job));
        Ok(())
    }

    fn publish(&self) {
        self.status.send_replace(self.job.clone());
    }
}

/// Resolves once cancellation is requested or the controller goes away.
async fn cancel_requested(mut control: watch::Receiver<JobControl>) {
    loop {
        if *control.borrow_and_update() == JobControl::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}
