//! Crawl scheduler: rate-limited, depth- and page-bounded BFS over one site.
//!
//! The scheduler task owns the frontier and runs a bounded pool of fetch
//! workers. Every fetched or permanently failed page is handed to the job's
//! orchestrator as a [`CrawlEvent`].

use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use graphloom_shared::{
    Checkpoint, CrawlSettings, ExtractionStatus, JobConfig, JobControl, JobId, PageId,
    PipelineError, Result, ScrapedPage, checkpoint,
};

use crate::fetcher::{FetchFailure, FetchedDocument, Fetcher};
use crate::frontier::{Frontier, canonical_url};
use crate::limiter::HostLimiter;
use crate::robots::RobotsCache;
use crate::scope::CrawlScope;

// ---------------------------------------------------------------------------
// Events & summary
// ---------------------------------------------------------------------------

/// Page-level outcome reported to the orchestrator.
#[derive(Debug, Clone)]
pub enum CrawlEvent {
    /// Fetched successfully; `extraction_status` is pending.
    Fetched(ScrapedPage),
    /// Permanent fetch failure; recorded with `extraction_status = failed`.
    Failed(ScrapedPage),
}

/// Summary of a finished crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub pages_crawled: u64,
    pub pages_failed: u64,
    pub skipped_out_of_scope: u64,
    pub skipped_robots: u64,
    /// URLs still queued at exit. Non-zero when the page cap stopped the crawl.
    pub frontier_remaining: usize,
    pub cancelled: bool,
}

type FetchOutcome = (Url, u32, std::result::Result<FetchedDocument, FetchFailure>);

// ---------------------------------------------------------------------------
// CrawlScheduler
// ---------------------------------------------------------------------------

/// Crawl scheduler for a single job.
pub struct CrawlScheduler {
    job_id: JobId,
    config: JobConfig,
    scope: CrawlScope,
    fetcher: Fetcher,
    robots: Option<RobotsCache>,
    concurrency: usize,
}

impl CrawlScheduler {
    /// Prepare a scheduler. `config` must already be validated.
    pub fn new(
        job_id: JobId,
        config: JobConfig,
        settings: &CrawlSettings,
        concurrency: usize,
    ) -> Result<Self> {
        let scope = CrawlScope::new(&config, settings.allow_private_hosts)?;
        let client = Fetcher::build_scoped_client(settings, scope)?;
        Self::with_client(job_id, config, settings, concurrency, client)
    }

    /// Prepare a scheduler around an existing HTTP client.
    ///
    /// Pages whose final URL lands outside the crawl scope are reported as
    /// failures whatever redirect policy `client` uses.
    pub fn with_client(
        job_id: JobId,
        config: JobConfig,
        settings: &CrawlSettings,
        concurrency: usize,
        client: Client,
    ) -> Result<Self> {
        let scope = CrawlScope::new(&config, settings.allow_private_hosts)?;
        let limiter = Arc::new(HostLimiter::new(config.crawl_speed)?);
        let robots = config
            .respect_robots_txt
            .then(|| RobotsCache::new(client.clone(), settings.user_agent.clone()));

        Ok(Self {
            job_id,
            scope,
            fetcher: Fetcher::new(client, limiter, settings),
            robots,
            concurrency: concurrency.max(1),
            config,
        })
    }

    /// Crawl until the frontier empties, the page cap is reached, or the job
    /// is cancelled.
    ///
    /// In-flight + crawled never exceeds `max_pages`. Control is checked at
    /// every dequeue; cancellation aborts in-flight fetches.
    #[instrument(skip_all, fields(job_id = %self.job_id, start_url = %self.config.start_url))]
    pub async fn run(
        self,
        mut control: watch::Receiver<JobControl>,
        events: mpsc::Sender<CrawlEvent>,
    ) -> CrawlSummary {
        let max_pages = u64::from(self.config.max_pages);
        let mut frontier = Frontier::new(self.config.start_url.clone(), self.config.crawl_depth);
        let mut in_flight: JoinSet<FetchOutcome> = JoinSet::new();
        let mut summary = CrawlSummary::default();

        info!(
            depth = self.config.crawl_depth,
            max_pages,
            speed = self.config.crawl_speed,
            concurrency = self.concurrency,
            "starting crawl"
        );

        loop {
            // Dispatch while there is capacity under both the worker and page caps.
            while in_flight.len() < self.concurrency
                && summary.pages_crawled + (in_flight.len() as u64) < max_pages
            {
                if checkpoint(&mut control).await == Checkpoint::Cancelled {
                    return self.cancelled(in_flight, summary, &frontier);
                }
                let Some((url, depth)) = frontier.pop() else {
                    break;
                };

                if let Err(reason) = self.scope.check(&url) {
                    debug!(%url, ?reason, "out of scope, skipping");
                    summary.skipped_out_of_scope += 1;
                    continue;
                }
                if let Some(robots) = &self.robots {
                    if !robots.is_allowed(&url).await {
                        debug!(%url, "disallowed by robots.txt");
                        summary.skipped_robots += 1;
                        continue;
                    }
                }

                let fetcher = self.fetcher.clone();
                in_flight.spawn(async move {
                    let result = fetcher.fetch(&url).await;
                    (url, depth, result)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow() == JobControl::Cancel {
                        return self.cancelled(in_flight, summary, &frontier);
                    }
                }
                Some(joined) = in_flight.join_next() => {
                    let (url, depth, outcome) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            warn!(error = %e, "fetch task failed");
                            continue;
                        }
                    };
                    let outcome = outcome.and_then(|doc| self.check_final_url(&url, doc));
                    let event = match outcome {
                        Ok(doc) => {
                            summary.pages_crawled += 1;
                            CrawlEvent::Fetched(self.accept(&mut frontier, url, depth, doc))
                        }
                        Err(failure) => {
                            summary.pages_failed += 1;
                            CrawlEvent::Failed(self.failed_page(url, depth, failure))
                        }
                    };
                    if events.send(event).await.is_err() {
                        // Orchestrator is gone.
                        return self.cancelled(in_flight, summary, &frontier);
                    }
                }
            }
        }

        summary.frontier_remaining = frontier.len();
        info!(
            pages_crawled = summary.pages_crawled,
            pages_failed = summary.pages_failed,
            skipped_robots = summary.skipped_robots,
            frontier_remaining = summary.frontier_remaining,
            "crawl completed"
        );
        summary
    }

    fn cancelled(
        &self,
        mut in_flight: JoinSet<FetchOutcome>,
        mut summary: CrawlSummary,
        frontier: &Frontier,
    ) -> CrawlSummary {
        in_flight.abort_all();
        summary.cancelled = true;
        summary.frontier_remaining = frontier.len();
        info!(pages_crawled = summary.pages_crawled, "crawl cancelled");
        summary
    }

    /// Refuse a document that redirects ended outside the crawl scope.
    fn check_final_url(
        &self,
        url: &Url,
        doc: FetchedDocument,
    ) -> std::result::Result<FetchedDocument, FetchFailure> {
        match self.scope.check(&doc.final_url) {
            Ok(()) => Ok(doc),
            Err(reason) => {
                warn!(%url, final_url = %doc.final_url, ?reason, "redirected out of scope");
                Err(FetchFailure {
                    error: PipelineError::fetch(
                        url.as_str(),
                        format!("redirected out of scope to {}", doc.final_url),
                    ),
                    status: Some(doc.status),
                    attempts: doc.attempts,
                })
            }
        }
    }

    /// Record a fetched page and enqueue its links one level deeper.
    fn accept(
        &self,
        frontier: &mut Frontier,
        url: Url,
        depth: u32,
        doc: FetchedDocument,
    ) -> ScrapedPage {
        frontier.mark_seen(&doc.final_url);

        if depth < self.config.crawl_depth {
            let parsed = Html::parse_document(&doc.body);
            for link in extract_links(&parsed, &doc.final_url) {
                frontier.push(link, depth + 1);
            }
        }

        debug!(%url, depth, status = doc.status, "page fetched");
        ScrapedPage {
            id: PageId::new(),
            job_id: self.job_id,
            canonical_url: canonical_url(&doc.final_url),
            url: url.to_string(),
            http_status: Some(doc.status),
            content_type: doc.content_type,
            depth,
            content_hash: Some(compute_hash(&doc.body)),
            raw_content: Some(doc.body),
            extracted_content: None,
            fetch_attempts: doc.attempts,
            fetch_error: None,
            extraction_status: ExtractionStatus::Pending,
            fetched_at: Utc::now(),
        }
    }

    fn failed_page(&self, url: Url, depth: u32, failure: FetchFailure) -> ScrapedPage {
        ScrapedPage {
            id: PageId::new(),
            job_id: self.job_id,
            canonical_url: canonical_url(&url),
            url: url.to_string(),
            http_status: failure.status,
            content_type: None,
            depth,
            raw_content: None,
            extracted_content: None,
            content_hash: None,
            fetch_attempts: failure.attempts,
            fetch_error: Some(failure.error.to_string()),
            extraction_status: ExtractionStatus::Failed,
            fetched_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Link & hash helpers
// ---------------------------------------------------------------------------

/// Extract all links from a document, resolved against the base URL.
pub fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if let Some(href) = el.value().attr("href") {
            let href = href.trim();
            // Skip anchors, javascript:, mailto:
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
            {
                continue;
            }

            if let Ok(mut resolved) = base_url.join(href) {
                resolved.set_fragment(None);
                links.push(resolved);
            }
        }
    }

    links
}

/// Compute SHA-256 hash of content.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod crawler_tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;

    fn settings() -> CrawlSettings {
        CrawlSettings {
            backoff_base_ms: 5,
            allow_private_hosts: true,
            ..CrawlSettings::default()
        }
    }

    fn job_config(server: &MockServer, depth: u32, max_pages: u32) -> JobConfig {
        let mut config = JobConfig::new(Url::parse(&server.uri()).unwrap());
        config.crawl_depth = depth;
        config.max_pages = max_pages;
        config.crawl_speed = 10.0;
        config.respect_robots_txt = false;
        config
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
    }

    async fn mount_page(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(html(body))
            .mount(server)
            .await;
    }

    async fn crawl(config: JobConfig, concurrency: usize) -> (CrawlSummary, Vec<CrawlEvent>) {
        let scheduler =
            CrawlScheduler::new(JobId::new(), config, &settings(), concurrency).unwrap();
        let (_control_tx, control_rx) = watch::channel(JobControl::Run);
        let (tx, mut rx) = mpsc::channel(1024);
        let summary = scheduler.run(control_rx, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (summary, events)
    }

    fn fetched_paths(events: &[CrawlEvent]) -> Vec<String> {
        let mut paths: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                CrawlEvent::Fetched(p) => Some(Url::parse(&p.url).unwrap().path().to_string()),
                CrawlEvent::Failed(_) => None,
            })
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash("hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_extract_links() {
        let html = r##"<html><body><a href="/page2">Page 2</a><a href="https://external.com">External</a><a href="#section">Anchor</a><a href="relative/path#frag">Relative</a><a href="mailto:a@b.c">Mail</a></body></html>"##;

        let doc = Html::parse_document(html);
        let base = Url::parse("https://docs.example.com/page1").unwrap();
        let links: Vec<String> = extract_links(&doc, &base)
            .into_iter()
            .map(|u| u.to_string())
            .collect();

        assert!(links.contains(&"https://docs.example.com/page2".to_string()));
        assert!(links.contains(&"https://external.com/".to_string()));
        assert!(links.contains(&"https://docs.example.com/relative/path".to_string()));
        assert!(!links.iter().any(|l| l.contains('#') || l.starts_with("mailto")));
    }

    #[tokio::test]
    async fn test_crawl_with_mock_server() {
        let server = MockServer::start().await;
        mount_page(&server, "/", r#"<h1>One</h1><a href="/page2">2</a>"#).await;
        mount_page(&server, "/page2", r#"<h1>Two</h1><a href="/page3">3</a><a href="/">home</a>"#).await;
        mount_page(&server, "/page3", "<h1>Three</h1>").await;

        let (summary, events) = crawl(job_config(&server, 3, 50), 2).await;

        assert_eq!(summary.pages_crawled, 3);
        assert_eq!(summary.pages_failed, 0);
        assert!(!summary.cancelled);
        assert_eq!(fetched_paths(&events), vec!["/", "/page2", "/page3"]);

        let CrawlEvent::Fetched(page) = &events[0] else {
            panic!("first event should be the seed");
        };
        assert_eq!(page.depth, 0);
        assert_eq!(page.extraction_status, ExtractionStatus::Pending);
        assert!(page.content_hash.is_some());
    }

    #[tokio::test]
    async fn test_crawl_respects_depth() {
        let server = MockServer::start().await;
        mount_page(&server, "/", r#"<a href="/page2">2</a>"#).await;
        mount_page(&server, "/page2", r#"<a href="/page3">3</a>"#).await;
        Mock::given(method("GET"))
            .and(path("/page3"))
            .respond_with(html("<p>too deep</p>"))
            .expect(0)
            .mount(&server)
            .await;

        let (summary, events) = crawl(job_config(&server, 1, 50), 2).await;
        assert_eq!(summary.pages_crawled, 2);
        assert_eq!(fetched_paths(&events), vec!["/", "/page2"]);
    }

    #[tokio::test]
    async fn failed_pages_are_reported_and_crawl_continues() {
        let server = MockServer::start().await;
        mount_page(&server, "/", r#"<a href="/gone">x</a><a href="/ok">y</a>"#).await;
        mount_page(&server, "/ok", "<p>fine</p>").await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let (summary, events) = crawl(job_config(&server, 2, 50), 2).await;
        assert_eq!(summary.pages_crawled, 2);
        assert_eq!(summary.pages_failed, 1);

        let failed: Vec<&ScrapedPage> = events
            .iter()
            .filter_map(|e| match e {
                CrawlEvent::Failed(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fetch_attempts, 3);
        assert_eq!(failed[0].http_status, Some(503));
        assert_eq!(failed[0].extraction_status, ExtractionStatus::Failed);
        assert!(failed[0].fetch_error.is_some());
    }

    /// A seed on 127.0.0.1 that redirects to a page on another host.
    async fn redirecting_seed() -> (MockServer, MockServer) {
        let offsite = MockServer::start().await;
        let server = MockServer::start().await;
        let target = format!("http://localhost:{}/offsite", offsite.address().port());
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", target.as_str()))
            .mount(&server)
            .await;
        (server, offsite)
    }

    fn only_failure(events: &[CrawlEvent]) -> &ScrapedPage {
        assert_eq!(events.len(), 1);
        match &events[0] {
            CrawlEvent::Failed(page) => page,
            CrawlEvent::Fetched(page) => panic!("unexpected fetch of {}", page.url),
        }
    }

    #[tokio::test]
    async fn redirects_leaving_scope_are_not_followed() {
        let (server, offsite) = redirecting_seed().await;
        Mock::given(method("GET"))
            .and(path("/offsite"))
            .respond_with(html("<p>internal</p>"))
            .expect(0)
            .mount(&offsite)
            .await;

        let (summary, events) = crawl(job_config(&server, 2, 10), 1).await;
        assert_eq!(summary.pages_crawled, 0);
        assert_eq!(summary.pages_failed, 1);

        let page = only_failure(&events);
        assert_eq!(page.http_status, Some(302));
        assert_eq!(page.fetch_attempts, 1);
        assert!(page.canonical_url.starts_with(&server.uri()));
    }

    #[tokio::test]
    async fn off_scope_final_url_is_a_failure_with_any_client() {
        let (server, offsite) = redirecting_seed().await;
        mount_page(&offsite, "/offsite", "<p>internal</p>").await;

        // A client that follows every redirect.
        let client = Fetcher::build_client(&settings()).unwrap();
        let scheduler = CrawlScheduler::with_client(
            JobId::new(),
            job_config(&server, 2, 10),
            &settings(),
            1,
            client,
        )
        .unwrap();
        let (_control_tx, control_rx) = watch::channel(JobControl::Run);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = scheduler.run(control_rx, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(summary.pages_crawled, 0);
        assert_eq!(summary.pages_failed, 1);
        let page = only_failure(&events);
        assert!(page.raw_content.is_none());
        assert!(page.fetch_error.as_deref().unwrap().contains("out of scope"));
    }

    #[tokio::test]
    async fn in_scope_redirects_are_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/home"))
            .mount(&server)
            .await;
        mount_page(&server, "/home", "<p>welcome</p>").await;

        let (summary, events) = crawl(job_config(&server, 2, 10), 1).await;
        assert_eq!(summary.pages_crawled, 1);
        let CrawlEvent::Fetched(page) = &events[0] else {
            panic!("redirected seed should be fetched");
        };
        assert!(page.canonical_url.ends_with("/home"));
    }

    #[tokio::test]
    async fn robots_disallowed_pages_are_never_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("User-agent: *\nDisallow: /private\n", "text/plain"),
            )
            .mount(&server)
            .await;
        mount_page(&server, "/", r#"<a href="/private/a">p</a><a href="/public">q</a>"#).await;
        mount_page(&server, "/public", "<p>public</p>").await;
        Mock::given(method("GET"))
            .and(path("/private/a"))
            .respond_with(html("<p>secret</p>"))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = job_config(&server, 2, 50);
        config.respect_robots_txt = true;
        let (summary, events) = crawl(config, 2).await;

        assert_eq!(summary.skipped_robots, 1);
        assert_eq!(fetched_paths(&events), vec!["/", "/public"]);
    }

    /// Generates a site: `/` links to 25 sections, each section to 20 leaves.
    struct GeneratedSite;

    impl Respond for GeneratedSite {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let route = request.url.path();
            let body = if route == "/" {
                (0..25)
                    .map(|s| format!(r#"<a href="/s{s}">s{s}</a>"#))
                    .collect::<String>()
            } else if route.matches('/').count() == 1 {
                (0..20)
                    .map(|p| format!(r#"<a href="{route}/p{p}">p{p}</a>"#))
                    .collect::<String>()
            } else {
                format!("<p>leaf {route}</p>")
            };
            html(&body)
        }
    }

    #[tokio::test]
    async fn page_cap_stops_crawl_before_frontier_is_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(GeneratedSite)
            .mount(&server)
            .await;

        let (summary, events) = crawl(job_config(&server, 2, 100), 8).await;

        assert_eq!(summary.pages_crawled, 100);
        assert!(summary.frontier_remaining > 0);
        assert_eq!(fetched_paths(&events).len(), 100);
        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 100);
    }

    #[tokio::test]
    async fn cancel_stops_dispatch_and_aborts_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(GeneratedSite)
            .mount(&server)
            .await;

        let scheduler =
            CrawlScheduler::new(JobId::new(), job_config(&server, 2, 500), &settings(), 4)
                .unwrap();
        let (control_tx, control_rx) = watch::channel(JobControl::Run);
        let (tx, mut rx) = mpsc::channel(1024);
        let handle = tokio::spawn(scheduler.run(control_rx, tx));

        // Let a few pages through, then cancel.
        for _ in 0..3 {
            rx.recv().await.expect("event");
        }
        control_tx.send(JobControl::Cancel).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler stops promptly")
            .unwrap();
        assert!(summary.cancelled);
        assert!(summary.pages_crawled < 500);
    }
}
