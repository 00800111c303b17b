//! Single-page HTTP fetch with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use graphloom_shared::{CrawlSettings, PipelineError, Result};

use crate::limiter::HostLimiter;
use crate::scope::CrawlScope;

const MAX_REDIRECTS: usize = 5;

/// A successfully fetched HTML document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// URL after redirects.
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub attempts: u32,
}

/// A fetch that will not be retried further.
#[derive(Debug)]
pub struct FetchFailure {
    pub error: PipelineError,
    pub status: Option<u16>,
    pub attempts: u32,
}

/// One attempt's failure, classified for the retry loop.
struct AttemptError {
    message: String,
    status: Option<u16>,
    transient: bool,
}

/// HTTP fetcher shared by a job's fetch workers.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    limiter: Arc<HostLimiter>,
    max_retries: u32,
    backoff_base: Duration,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(client: Client, limiter: Arc<HostLimiter>, settings: &CrawlSettings) -> Self {
        Self {
            client,
            limiter,
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            max_body_bytes: settings.max_body_bytes,
        }
    }

    /// Build the shared HTTP client from crawl settings.
    pub fn build_client(settings: &CrawlSettings) -> Result<Client> {
        client_with_policy(settings, Policy::limited(MAX_REDIRECTS))
    }

    /// Build a client that only follows redirects staying inside `scope`.
    ///
    /// A hop to an out-of-scope or private target is not requested; the
    /// redirect response itself comes back and fails the fetch.
    pub fn build_scoped_client(settings: &CrawlSettings, scope: CrawlScope) -> Result<Client> {
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match scope.check(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(reason) => {
                    debug!(target_url = %attempt.url(), ?reason, "redirect leaves crawl scope");
                    attempt.stop()
                }
            }
        });
        client_with_policy(settings, policy)
    }

    /// Fetch `url`, retrying timeouts, connection errors, 429, and 5xx.
    ///
    /// Each attempt waits for the host's rate-limit token. Retry `n` (0-based)
    /// first sleeps `backoff_base * 2^n`.
    pub async fn fetch(&self, url: &Url) -> std::result::Result<FetchedDocument, FetchFailure> {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.until_ready(url).await;
            attempt += 1;

            match self.attempt(url).await {
                Ok((final_url, status, content_type, body)) => {
                    return Ok(FetchedDocument {
                        final_url,
                        status,
                        content_type,
                        body,
                        attempts: attempt,
                    });
                }
                Err(err) if err.transient && attempt <= self.max_retries => {
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    debug!(%url, attempt, error = %err.message, ?delay, "retrying fetch");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(%url, attempts = attempt, error = %err.message, "fetch failed");
                    return Err(FetchFailure {
                        error: PipelineError::fetch(url.as_str(), err.message),
                        status: err.status,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        url: &Url,
    ) -> std::result::Result<(Url, u16, Option<String>, String), AttemptError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| AttemptError {
                transient: e.is_timeout() || e.is_connect() || e.is_request(),
                message: e.to_string(),
                status: None,
            })?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<none>");
            return Err(permanent(
                status,
                format!("redirect to {location} not followed"),
            ));
        }
        if !status.is_success() {
            return Err(AttemptError {
                message: format!("HTTP {status}"),
                status: Some(status.as_u16()),
                transient: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ct) = &content_type {
            if !is_html(ct) {
                return Err(permanent(status, format!("unsupported content type {ct}")));
            }
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(permanent(status, "body exceeds size limit"));
        }

        let final_url = response.url().clone();
        let bytes = response.bytes().await.map_err(|e| AttemptError {
            transient: e.is_timeout(),
            message: format!("body read failed: {e}"),
            status: Some(status.as_u16()),
        })?;

        if bytes.len() > self.max_body_bytes {
            return Err(permanent(status, "body exceeds size limit"));
        }
        let body = String::from_utf8_lossy(&bytes).into_owned();
        if body.trim().is_empty() {
            return Err(permanent(status, "empty body"));
        }

        Ok((final_url, status.as_u16(), content_type, body))
    }
}

fn client_with_policy(settings: &CrawlSettings, policy: Policy) -> Result<Client> {
    Client::builder()
        .user_agent(settings.user_agent.as_str())
        .redirect(policy)
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .build()
        .map_err(|e| PipelineError::config(format!("failed to build HTTP client: {e}")))
}

fn permanent(status: StatusCode, message: impl Into<String>) -> AttemptError {
    AttemptError {
        message: message.into(),
        status: Some(status.as_u16()),
        transient: false,
    }
}

fn is_html(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(essence.as_str(), "text/html" | "application/xhtml+xml")
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fetcher() -> Fetcher {
        let settings = CrawlSettings {
            backoff_base_ms: 5,
            ..CrawlSettings::default()
        };
        let client = Fetcher::build_client(&settings).unwrap();
        Fetcher::new(client, Arc::new(HostLimiter::new(10.0).unwrap()), &settings)
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html; charset=utf-8")
    }

    #[test]
    fn html_content_types() {
        assert!(is_html("text/html"));
        assert!(is_html("Text/HTML; charset=UTF-8"));
        assert!(is_html("application/xhtml+xml"));
        assert!(!is_html("application/pdf"));
        assert!(!is_html("application/json"));
    }

    #[tokio::test]
    async fn fetches_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html("<html><body>hi</body></html>"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let doc = fetcher().fetch(&url).await.unwrap();
        assert_eq!(doc.status, 200);
        assert_eq!(doc.attempts, 1);
        assert!(doc.body.contains("hi"));
    }

    #[tokio::test]
    async fn server_errors_retry_twice_then_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();
        let failure = fetcher().fetch(&url).await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.status, Some(503));
        assert!(matches!(failure.error, PipelineError::Fetch { .. }));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let failure = fetcher().fetch(&url).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.status, Some(404));
    }

    #[tokio::test]
    async fn rate_limited_then_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(html("<p>ok</p>"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/busy", server.uri())).unwrap();
        let doc = fetcher().fetch(&url).await.unwrap();
        assert_eq!(doc.attempts, 2);
    }

    #[tokio::test]
    async fn rejects_non_html_and_empty_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.pdf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(vec![1u8, 2, 3], "application/pdf"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(html("   "))
            .mount(&server)
            .await;

        let f = fetcher();
        let pdf = Url::parse(&format!("{}/doc.pdf", server.uri())).unwrap();
        assert!(f.fetch(&pdf).await.is_err());
        let empty = Url::parse(&format!("{}/empty", server.uri())).unwrap();
        let failure = f.fetch(&empty).await.unwrap_err();
        assert!(failure.error.to_string().contains("empty body"));
    }
}
