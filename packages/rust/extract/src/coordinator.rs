//! Per-page strategy dispatch and the extraction worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use scraper::Html;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use graphloom_shared::{
    Checkpoint, EntityId, EntityRelationship, ExtractedEntity, ExtractionConfig, ExtractionMethod,
    ExtractionStatus, JobControl, JobId, PageId, PipelineError, RelationshipId, Result,
    ScrapedPage, TenantId, checkpoint,
};

use crate::draft::{DraftKey, MergedPage, StrategyOutput, merge_outputs};
use crate::embedding::EmbeddingClient;
use crate::llm::LlmExtractor;
use crate::pattern::PatternSet;
use crate::text::visible_text;
use crate::{ner, structured};

/// Markup strategies, always attempted.
const MARKUP_STRATEGIES: [ExtractionMethod; 2] =
    [ExtractionMethod::SchemaOrg, ExtractionMethod::OpenGraph];

/// Free-text strategies used when the LLM pass is off or fails.
const FALLBACK_STRATEGIES: [ExtractionMethod; 2] =
    [ExtractionMethod::Pattern, ExtractionMethod::Spacy];

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Everything extraction produced for one page.
#[derive(Debug)]
pub struct PageExtraction {
    pub page_id: PageId,
    /// `completed` or `failed`.
    pub status: ExtractionStatus,
    /// Visible text the free-text strategies read.
    pub extracted_content: Option<String>,
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<EntityRelationship>,
    /// One entry per failed strategy (or the page-level failure).
    pub errors: Vec<PipelineError>,
}

impl PageExtraction {
    fn failed(page_id: PageId, error: PipelineError) -> Self {
        Self {
            page_id,
            status: ExtractionStatus::Failed,
            extracted_content: None,
            entities: Vec::new(),
            relationships: Vec::new(),
            errors: vec![error],
        }
    }
}

/// Summary of a finished extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub pages_extracted: u64,
    pub pages_failed: u64,
    pub entities_extracted: u64,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// ExtractionCoordinator
// ---------------------------------------------------------------------------

/// Extraction coordinator for a single job.
pub struct ExtractionCoordinator {
    tenant_id: TenantId,
    job_id: JobId,
    use_llm: bool,
    settings: ExtractionConfig,
    patterns: PatternSet,
    llm: Option<Arc<LlmExtractor>>,
    embedder: Option<Arc<EmbeddingClient>>,
    concurrency: usize,
}

impl ExtractionCoordinator {
    pub fn new(
        tenant_id: TenantId,
        job_id: JobId,
        use_llm: bool,
        settings: ExtractionConfig,
        concurrency: usize,
    ) -> Result<Self> {
        Ok(Self {
            tenant_id,
            job_id,
            use_llm,
            settings,
            patterns: PatternSet::new()?,
            llm: None,
            embedder: None,
            concurrency: concurrency.max(1),
        })
    }

    pub fn with_llm(mut self, llm: Option<Arc<LlmExtractor>>) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<EmbeddingClient>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Extract pages from `pages` until the channel closes or the job is
    /// cancelled, running at most `concurrency` pages at once.
    ///
    /// Control is checked before every dequeue; cancellation aborts in-flight
    /// extractions and nothing further is sent.
    #[instrument(skip_all, fields(job_id = %self.job_id))]
    pub async fn run(
        self,
        mut pages: mpsc::Receiver<ScrapedPage>,
        mut control: watch::Receiver<JobControl>,
        events: mpsc::Sender<PageExtraction>,
    ) -> ExtractionSummary {
        if self.use_llm && self.llm.is_none() {
            warn!("LLM extraction requested but no API key is configured, using fallbacks");
        }

        let concurrency = self.concurrency;
        let this = Arc::new(self);
        let mut in_flight: JoinSet<PageExtraction> = JoinSet::new();
        let mut input_open = true;
        let mut summary = ExtractionSummary::default();

        loop {
            if checkpoint(&mut control).await == Checkpoint::Cancelled {
                return cancelled(in_flight, summary);
            }
            if !input_open && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow() == JobControl::Cancel {
                        return cancelled(in_flight, summary);
                    }
                }
                page = pages.recv(), if input_open && in_flight.len() < concurrency => {
                    match page {
                        Some(page) => {
                            let worker = Arc::clone(&this);
                            in_flight.spawn(async move { worker.extract_page(&page).await });
                        }
                        None => input_open = false,
                    }
                }
                Some(joined) = in_flight.join_next() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "extraction task failed");
                            continue;
                        }
                    };
                    match result.status {
                        ExtractionStatus::Failed => summary.pages_failed += 1,
                        _ => summary.pages_extracted += 1,
                    }
                    summary.entities_extracted += result.entities.len() as u64;
                    if events.send(result).await.is_err() {
                        return cancelled(in_flight, summary);
                    }
                }
            }
        }

        info!(
            pages_extracted = summary.pages_extracted,
            pages_failed = summary.pages_failed,
            entities = summary.entities_extracted,
            "extraction completed"
        );
        summary
    }

    /// Run every applicable strategy on one page and merge the results.
    pub async fn extract_page(&self, page: &ScrapedPage) -> PageExtraction {
        let Some(raw) = page.raw_content.as_deref().filter(|r| !r.trim().is_empty()) else {
            return PageExtraction::failed(
                page.id,
                PipelineError::Extraction(format!("page {} has no content", page.url)),
            );
        };

        let llm = self.llm.as_ref().filter(|_| self.use_llm);
        let mut outputs: Vec<StrategyOutput> = Vec::new();
        let mut errors = Vec::new();
        let mut attempted = 0usize;

        let mut record = |method: ExtractionMethod, result: Result<StrategyOutput>| {
            attempted += 1;
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    debug!(url = %page.url, %method, error = %e, "strategy failed");
                    errors.push(e);
                }
            }
        };

        // `Html` is not `Send`; keep it out of any await.
        let text = {
            let doc = Html::parse_document(raw);
            for method in MARKUP_STRATEGIES {
                record(method, self.run_markup(method, &doc));
            }
            visible_text(&doc)
        };

        let mut fallback = llm.is_none();
        if let Some(llm) = llm {
            let result = llm.extract(&text, self.settings.confidence.llm_claude).await;
            fallback = result.is_err();
            record(ExtractionMethod::LlmClaude, result);
        }
        if fallback {
            for method in FALLBACK_STRATEGIES {
                record(method, self.run_text(method, &text));
            }
        }

        if errors.len() == attempted {
            warn!(url = %page.url, errors = errors.len(), "every strategy failed");
            return PageExtraction {
                page_id: page.id,
                status: ExtractionStatus::Failed,
                extracted_content: Some(text),
                entities: Vec::new(),
                relationships: Vec::new(),
                errors,
            };
        }

        let merged = merge_outputs(
            outputs,
            self.settings.hybrid_boost,
            self.settings.max_entities_per_page,
        );
        let (mut entities, relationships) = self.materialize(page.id, merged);
        self.embed(&mut entities).await;

        debug!(
            url = %page.url,
            entities = entities.len(),
            relationships = relationships.len(),
            errors = errors.len(),
            "page extracted"
        );
        PageExtraction {
            page_id: page.id,
            status: ExtractionStatus::Completed,
            extracted_content: Some(text),
            entities,
            relationships,
            errors,
        }
    }

    fn run_markup(&self, method: ExtractionMethod, doc: &Html) -> Result<StrategyOutput> {
        let confidence = &self.settings.confidence;
        match method {
            ExtractionMethod::SchemaOrg => structured::schema_org(doc, confidence.schema_org),
            ExtractionMethod::OpenGraph => Ok(structured::open_graph(doc, confidence.open_graph)),
            other => Err(PipelineError::Extraction(format!(
                "{other} does not read markup"
            ))),
        }
    }

    fn run_text(&self, method: ExtractionMethod, text: &str) -> Result<StrategyOutput> {
        let confidence = &self.settings.confidence;
        match method {
            ExtractionMethod::Pattern => Ok(self.patterns.extract(text, confidence.pattern)),
            ExtractionMethod::Spacy => Ok(ner::recognise(text, confidence.spacy)),
            other => Err(PipelineError::Extraction(format!(
                "{other} does not read plain text"
            ))),
        }
    }

    /// Assign ids and attach tenant/job/page provenance.
    fn materialize(
        &self,
        page_id: PageId,
        merged: MergedPage,
    ) -> (Vec<ExtractedEntity>, Vec<EntityRelationship>) {
        let now = Utc::now();
        let mut ids: HashMap<DraftKey, EntityId> = HashMap::new();

        let entities: Vec<ExtractedEntity> = merged
            .entities
            .into_iter()
            .map(|m| {
                let id = EntityId::new();
                ids.insert(m.key.clone(), id);
                ExtractedEntity {
                    id,
                    tenant_id: self.tenant_id.clone(),
                    job_id: self.job_id,
                    source_page_id: page_id,
                    entity_type: m.key.entity_type,
                    name: m.name,
                    normalized_name: m.key.normalized_name,
                    description: m.description,
                    properties: m.properties,
                    extraction_method: m.method,
                    confidence_score: m.confidence,
                    embedding: None,
                    synced_to_graph: false,
                    sync_error: None,
                    canonical_id: None,
                    created_at: now,
                }
            })
            .collect();

        let relationships = merged
            .relationships
            .into_iter()
            .filter_map(|r| {
                Some(EntityRelationship {
                    id: RelationshipId::new(),
                    tenant_id: self.tenant_id.clone(),
                    job_id: self.job_id,
                    source_entity_id: *ids.get(&r.source)?,
                    target_entity_id: *ids.get(&r.target)?,
                    relationship_type: r.relationship_type,
                    properties: serde_json::Map::new(),
                    confidence_score: r.confidence,
                })
            })
            .collect();

        (entities, relationships)
    }

    /// Attach embeddings in one batch. Failures leave them unset.
    async fn embed(&self, entities: &mut [ExtractedEntity]) {
        let Some(embedder) = &self.embedder else { return };
        if entities.is_empty() {
            return;
        }
        let texts: Vec<String> = entities
            .iter()
            .map(|e| format!("{} ({})", e.name, e.entity_type))
            .collect();
        match embedder.embed(&texts).await {
            Ok(vectors) => {
                for (entity, vector) in entities.iter_mut().zip(vectors) {
                    entity.embedding = Some(vector);
                }
            }
            Err(e) => warn!(job_id = %self.job_id, error = %e, "embedding failed, continuing without"),
        }
    }
}

fn cancelled(
    mut in_flight: JoinSet<PageExtraction>,
    mut summary: ExtractionSummary,
) -> ExtractionSummary {
    in_flight.abort_all();
    summary.cancelled = true;
    info!(pages_extracted = summary.pages_extracted, "extraction cancelled");
    summary
}

#[cfg(test)]
mod tests {
    use graphloom_shared::{EmbeddingConfig, EntityType, LlmConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;

    const PAGE: &str = r#"<html><head>
        <title>Jane Doe | Acme</title>
        <script type="application/ld+json">
          {"@type": "Person", "name": "Jane Doe",
           "worksFor": {"@type": "Organization", "name": "Acme Corp"}}
        </script>
      </head><body><main>
        <p>Dr. Jane Doe leads research at Acme Corp in Salt Lake City.</p>
        <p>She joined on March 1, 2021.</p>
      </main></body></html>"#;

    fn page(body: Option<&str>) -> ScrapedPage {
        ScrapedPage {
            id: PageId::new(),
            job_id: JobId::new(),
            url: "https://acme.example/jane".into(),
            canonical_url: "https://acme.example/jane".into(),
            http_status: Some(200),
            content_type: Some("text/html".into()),
            depth: 0,
            raw_content: body.map(str::to_string),
            extracted_content: None,
            content_hash: None,
            fetch_attempts: 1,
            fetch_error: None,
            extraction_status: ExtractionStatus::Pending,
            fetched_at: Utc::now(),
        }
    }

    fn coordinator(use_llm: bool) -> ExtractionCoordinator {
        ExtractionCoordinator::new(
            TenantId::new("t1"),
            JobId::new(),
            use_llm,
            ExtractionConfig::default(),
            2,
        )
        .unwrap()
    }

    fn entity<'a>(result: &'a PageExtraction, name: &str) -> &'a ExtractedEntity {
        result
            .entities
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("missing {name}"))
    }

    #[tokio::test]
    async fn markup_and_fallbacks_merge_into_hybrid_entities() {
        let result = coordinator(false).extract_page(&page(Some(PAGE))).await;
        assert_eq!(result.status, ExtractionStatus::Completed);
        assert!(result.errors.is_empty());

        let jane = entity(&result, "Jane Doe");
        assert_eq!(jane.entity_type, EntityType::Person);
        assert_eq!(jane.extraction_method, ExtractionMethod::Hybrid);
        assert!((jane.confidence_score - 1.0).abs() < 1e-9);

        let city = entity(&result, "Salt Lake City");
        assert_eq!(city.extraction_method, ExtractionMethod::Spacy);
        assert_eq!(entity(&result, "2021-03-01").entity_type, EntityType::Date);

        assert!(
            result
                .relationships
                .iter()
                .any(|r| r.relationship_type == "works_for" && r.source_entity_id == jane.id)
        );
        assert!(result.extracted_content.unwrap().contains("leads research"));
    }

    #[tokio::test]
    async fn empty_page_fails_with_one_error() {
        let result = coordinator(false).extract_page(&page(Some("  \n "))).await;
        assert_eq!(result.status, ExtractionStatus::Failed);
        assert_eq!(result.errors.len(), 1);

        let result = coordinator(false).extract_page(&page(None)).await;
        assert_eq!(result.status, ExtractionStatus::Failed);
    }

    #[tokio::test]
    async fn llm_failure_falls_back_and_counts_one_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let llm = LlmConfig {
            endpoint: format!("{}/v1/messages", server.uri()),
            ..LlmConfig::default()
        };
        let coordinator = coordinator(true)
            .with_llm(Some(Arc::new(LlmExtractor::new(&llm, "k").unwrap())));

        let result = coordinator.extract_page(&page(Some(PAGE))).await;
        assert_eq!(result.status, ExtractionStatus::Completed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            entity(&result, "Salt Lake City").extraction_method,
            ExtractionMethod::Spacy
        );
    }

    #[tokio::test]
    async fn llm_success_skips_fallbacks() {
        let server = MockServer::start().await;
        let text = r#"{"entities": [{"name": "Jane Doe", "type": "person"}], "relationships": []}"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": text}]
            })))
            .mount(&server)
            .await;
        let llm = LlmConfig {
            endpoint: format!("{}/v1/messages", server.uri()),
            ..LlmConfig::default()
        };
        let coordinator = coordinator(true)
            .with_llm(Some(Arc::new(LlmExtractor::new(&llm, "k").unwrap())));

        let result = coordinator.extract_page(&page(Some(PAGE))).await;
        assert!(result.errors.is_empty());
        assert!(result.entities.iter().all(|e| !matches!(
            e.extraction_method,
            ExtractionMethod::Pattern | ExtractionMethod::Spacy
        )));
        assert_eq!(
            entity(&result, "Jane Doe").extraction_method,
            ExtractionMethod::Hybrid
        );
    }

    /// Answers an embeddings request with one 3-d vector per input.
    struct EchoEmbeddings;

    impl Respond for EchoEmbeddings {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            let data: Vec<serde_json::Value> = body["input"]
                .as_array()
                .unwrap()
                .iter()
                .enumerate()
                .map(|(i, _)| serde_json::json!({"index": i, "embedding": [i as f32, 1.0, 0.0]}))
                .collect();
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data }))
        }
    }

    #[tokio::test]
    async fn entities_get_embeddings_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(EchoEmbeddings)
            .expect(1)
            .mount(&server)
            .await;
        let config = EmbeddingConfig {
            endpoint: Some(server.uri()),
            ..EmbeddingConfig::default()
        };
        let embedder = EmbeddingClient::from_config(&config).unwrap().map(Arc::new);
        let result = coordinator(false)
            .with_embedder(embedder)
            .extract_page(&page(Some(PAGE)))
            .await;
        assert!(result.entities.iter().all(|e| e.embedding.as_ref().map(Vec::len) == Some(3)));
    }

    #[tokio::test]
    async fn worker_pool_drains_the_queue() {
        let (page_tx, page_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_control_tx, control_rx) = watch::channel(JobControl::Run);

        for _ in 0..5 {
            page_tx.send(page(Some(PAGE))).await.unwrap();
        }
        page_tx.send(page(None)).await.unwrap();
        drop(page_tx);

        let summary = coordinator(false).run(page_rx, control_rx, event_tx).await;
        assert_eq!(summary.pages_extracted, 5);
        assert_eq!(summary.pages_failed, 1);
        assert!(!summary.cancelled);

        let mut received = 0;
        while event_rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 6);
    }

    #[tokio::test]
    async fn cancelled_job_extracts_nothing() {
        let (page_tx, page_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let (_control_tx, control_rx) = watch::channel(JobControl::Cancel);
        page_tx.send(page(Some(PAGE))).await.unwrap();

        let summary = coordinator(false).run(page_rx, control_rx, event_tx).await;
        assert!(summary.cancelled);
        assert_eq!(summary.pages_extracted, 0);
        assert!(event_rx.recv().await.is_none());
    }
}
