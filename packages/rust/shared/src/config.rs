//! Application and job configuration for graphloom.
//!
//! User config lives at `~/.graphloom/graphloom.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "graphloom.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".graphloom";

/// Bounds on `crawl_depth`.
pub const CRAWL_DEPTH_RANGE: (u32, u32) = (1, 10);
/// Bounds on `max_pages`.
pub const MAX_PAGES_RANGE: (u32, u32) = (1, 10_000);
/// Bounds on `crawl_speed` (requests per second per host).
pub const CRAWL_SPEED_RANGE: (f64, f64) = (0.1, 10.0);

// ---------------------------------------------------------------------------
// Job config (per job, validated once at submission)
// ---------------------------------------------------------------------------

/// Configuration for a single scraping job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Seed URL; must be http or https.
    pub start_url: Url,

    /// Hostnames the crawl may visit. Empty means the start URL's host only.
    #[serde(default)]
    pub allowed_domains: BTreeSet<String>,

    /// When non-empty, only URLs matching at least one regex are followed.
    /// The start URL is exempt.
    #[serde(default)]
    pub url_patterns: Vec<String>,

    /// URLs matching any of these regexes are never fetched.
    #[serde(default)]
    pub excluded_patterns: Vec<String>,

    /// Maximum link hops from the start URL, 1–10.
    pub crawl_depth: u32,

    /// Page cap, 1–10,000.
    pub max_pages: u32,

    /// Requests per second per host, 0.1–10.0.
    pub crawl_speed: f64,

    pub respect_robots_txt: bool,

    pub use_llm_extraction: bool,
}

impl JobConfig {
    /// A job config with built-in defaults for everything but the seed.
    pub fn new(start_url: Url) -> Self {
        Self::with_defaults(start_url, &DefaultsConfig::default())
    }

    /// A job config seeded from the `[defaults]` section.
    pub fn with_defaults(start_url: Url, defaults: &DefaultsConfig) -> Self {
        Self {
            start_url,
            allowed_domains: BTreeSet::new(),
            url_patterns: Vec::new(),
            excluded_patterns: Vec::new(),
            crawl_depth: defaults.crawl_depth,
            max_pages: defaults.max_pages,
            crawl_speed: defaults.crawl_speed,
            respect_robots_txt: defaults.respect_robots_txt,
            use_llm_extraction: defaults.use_llm_extraction,
        }
    }

    /// Check every bound and pattern. Returns the first violation.
    pub fn validate(&self) -> Result<()> {
        match self.start_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(PipelineError::validation(format!(
                    "start_url must be http or https, got {other}"
                )));
            }
        }
        if self.start_url.host_str().is_none_or(str::is_empty) {
            return Err(PipelineError::validation("start_url has no host"));
        }

        let (lo, hi) = CRAWL_DEPTH_RANGE;
        if !(lo..=hi).contains(&self.crawl_depth) {
            return Err(PipelineError::validation(format!(
                "crawl_depth must be between {lo} and {hi}, got {}",
                self.crawl_depth
            )));
        }

        let (lo, hi) = MAX_PAGES_RANGE;
        if !(lo..=hi).contains(&self.max_pages) {
            return Err(PipelineError::validation(format!(
                "max_pages must be between {lo} and {hi}, got {}",
                self.max_pages
            )));
        }

        let (lo, hi) = CRAWL_SPEED_RANGE;
        if !self.crawl_speed.is_finite() || !(lo..=hi).contains(&self.crawl_speed) {
            return Err(PipelineError::validation(format!(
                "crawl_speed must be between {lo} and {hi} requests/s, got {}",
                self.crawl_speed
            )));
        }

        for domain in &self.allowed_domains {
            if domain.trim().is_empty() || domain.contains('/') {
                return Err(PipelineError::validation(format!(
                    "allowed_domains entry is not a hostname: {domain:?}"
                )));
            }
        }

        for pattern in self.url_patterns.iter().chain(&self.excluded_patterns) {
            Regex::new(pattern).map_err(|e| {
                PipelineError::validation(format!("invalid URL pattern {pattern:?}: {e}"))
            })?;
        }

        Ok(())
    }

    /// Allowed hostnames, defaulting to the start URL's host.
    pub fn effective_domains(&self) -> BTreeSet<String> {
        if !self.allowed_domains.is_empty() {
            return self
                .allowed_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect();
        }
        self.start_url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .into_iter()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Config structs (matching graphloom.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Defaults for new jobs.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Worker pool sizes.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// HTTP fetch behavior.
    #[serde(default)]
    pub crawl: CrawlSettings,

    /// Anthropic Messages API settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Optional embedding endpoint.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Strategy confidences.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Similarity weights and thresholds.
    #[serde(default)]
    pub consolidation: ConsolidationConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Validate sections whose values interact.
    pub fn validate(&self) -> Result<()> {
        self.workers.validate()?;
        self.consolidation.validate()?;
        Ok(())
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_crawl_depth")]
    pub crawl_depth: u32,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_crawl_speed")]
    pub crawl_speed: f64,

    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    #[serde(default)]
    pub use_llm_extraction: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            crawl_depth: default_crawl_depth(),
            max_pages: default_max_pages(),
            crawl_speed: default_crawl_speed(),
            respect_robots_txt: true,
            use_llm_extraction: false,
        }
    }
}

fn default_crawl_depth() -> u32 {
    3
}
fn default_max_pages() -> u32 {
    100
}
fn default_crawl_speed() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}

/// `[workers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs running at once; further jobs wait as `queued`.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Concurrent fetches per job.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Concurrent page extractions per job.
    #[serde(default = "default_extraction_concurrency")]
    pub extraction_concurrency: usize,

    /// Blocking-pool shards used when scoring pairs.
    #[serde(default = "default_consolidation_shards")]
    pub consolidation_shards: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            fetch_concurrency: default_fetch_concurrency(),
            extraction_concurrency: default_extraction_concurrency(),
            consolidation_shards: default_consolidation_shards(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_concurrent_jobs", self.max_concurrent_jobs),
            ("fetch_concurrency", self.fetch_concurrency),
            ("extraction_concurrency", self.extraction_concurrency),
            ("consolidation_shards", self.consolidation_shards),
        ] {
            if value == 0 {
                return Err(PipelineError::config(format!(
                    "workers.{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_extraction_concurrency() -> usize {
    2
}
fn default_consolidation_shards() -> usize {
    4
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before retry `n` is `backoff_base_ms * 2^n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Bodies larger than this are refused.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Permit loopback and private-range hosts. Off outside tests and
    /// trusted deployments.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_body_bytes: default_max_body_bytes(),
            allow_private_hosts: false,
        }
    }
}

fn default_user_agent() -> String {
    format!("graphloom/{}", env!("CARGO_PKG_VERSION"))
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Visible text is truncated to this many characters before sending.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_api_key_env(),
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            requests_per_minute: default_requests_per_minute(),
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    /// Read the API key from the configured env var, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
    }
}

fn default_llm_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_llm_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".into()
}
fn default_llm_model() -> String {
    "claude-3-5-haiku-latest".into()
}
fn default_llm_max_tokens() -> u32 {
    2048
}
fn default_requests_per_minute() -> u32 {
    50
}
fn default_max_input_chars() -> usize {
    12_000
}
fn default_llm_timeout_secs() -> u64 {
    60
}

/// `[embedding]` section. Embeddings are skipped when `endpoint` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_embedding_model(),
            api_key_env: default_embedding_api_key_env(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

/// Base confidence per extraction strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodConfidence {
    #[serde(default = "default_conf_schema_org")]
    pub schema_org: f64,
    #[serde(default = "default_conf_open_graph")]
    pub open_graph: f64,
    #[serde(default = "default_conf_llm")]
    pub llm_claude: f64,
    #[serde(default = "default_conf_pattern")]
    pub pattern: f64,
    #[serde(default = "default_conf_spacy")]
    pub spacy: f64,
}

impl Default for MethodConfidence {
    fn default() -> Self {
        Self {
            schema_org: default_conf_schema_org(),
            open_graph: default_conf_open_graph(),
            llm_claude: default_conf_llm(),
            pattern: default_conf_pattern(),
            spacy: default_conf_spacy(),
        }
    }
}

fn default_conf_schema_org() -> f64 {
    0.95
}
fn default_conf_open_graph() -> f64 {
    0.95
}
fn default_conf_llm() -> f64 {
    0.80
}
fn default_conf_pattern() -> f64 {
    0.60
}
fn default_conf_spacy() -> f64 {
    0.55
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub confidence: MethodConfidence,

    /// Added to the best confidence when several strategies agree.
    #[serde(default = "default_hybrid_boost")]
    pub hybrid_boost: f64,

    /// Entities kept per page after merging.
    #[serde(default = "default_max_entities_per_page")]
    pub max_entities_per_page: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            confidence: MethodConfidence::default(),
            hybrid_boost: default_hybrid_boost(),
            max_entities_per_page: default_max_entities_per_page(),
        }
    }
}

fn default_hybrid_boost() -> f64 {
    0.05
}
fn default_max_entities_per_page() -> usize {
    200
}

/// Relative weight of each similarity signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalWeights {
    #[serde(default = "default_w_jaro_winkler")]
    pub jaro_winkler: f64,
    #[serde(default = "default_w_levenshtein")]
    pub levenshtein: f64,
    #[serde(default = "default_w_trigram")]
    pub trigram: f64,
    #[serde(default = "default_w_phonetic")]
    pub phonetic: f64,
    #[serde(default = "default_w_embedding")]
    pub embedding: f64,
    #[serde(default = "default_w_graph")]
    pub graph: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            jaro_winkler: default_w_jaro_winkler(),
            levenshtein: default_w_levenshtein(),
            trigram: default_w_trigram(),
            phonetic: default_w_phonetic(),
            embedding: default_w_embedding(),
            graph: default_w_graph(),
        }
    }
}

fn default_w_jaro_winkler() -> f64 {
    0.25
}
fn default_w_levenshtein() -> f64 {
    0.15
}
fn default_w_trigram() -> f64 {
    0.15
}
fn default_w_phonetic() -> f64 {
    0.10
}
fn default_w_embedding() -> f64 {
    0.20
}
fn default_w_graph() -> f64 {
    0.10
}

/// `[consolidation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default)]
    pub weights: SignalWeights,

    /// Pairs at or above this score merge without review.
    #[serde(default = "default_auto_merge_threshold")]
    pub auto_merge_threshold: f64,

    /// Pairs at or above this score (and below auto-merge) await review.
    #[serde(default = "default_candidate_threshold")]
    pub candidate_threshold: f64,

    /// Subtracted when both entities come from the same page.
    #[serde(default = "default_same_page_penalty")]
    pub same_page_penalty: f64,

    /// Max `same_page` relationships inferred per page. 0 disables.
    #[serde(default = "default_cooccurrence_max_per_page")]
    pub cooccurrence_max_per_page: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            auto_merge_threshold: default_auto_merge_threshold(),
            candidate_threshold: default_candidate_threshold(),
            same_page_penalty: default_same_page_penalty(),
            cooccurrence_max_per_page: default_cooccurrence_max_per_page(),
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        let weights = [
            w.jaro_winkler,
            w.levenshtein,
            w.trigram,
            w.phonetic,
            w.embedding,
            w.graph,
        ];
        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(PipelineError::config(
                "consolidation weights must be finite and non-negative",
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(PipelineError::config(
                "at least one consolidation weight must be positive",
            ));
        }
        let (cand, auto) = (self.candidate_threshold, self.auto_merge_threshold);
        if !(0.0..=1.0).contains(&cand) || !(0.0..=1.0).contains(&auto) || cand > auto {
            return Err(PipelineError::config(format!(
                "thresholds must satisfy 0 <= candidate ({cand}) <= auto_merge ({auto}) <= 1"
            )));
        }
        Ok(())
    }
}

fn default_auto_merge_threshold() -> f64 {
    0.92
}
fn default_candidate_threshold() -> f64 {
    0.65
}
fn default_same_page_penalty() -> f64 {
    0.05
}
fn default_cooccurrence_max_per_page() -> usize {
    25
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file. A leading `~/` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl StorageConfig {
    /// Database path with `~/` expanded.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.database_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.database_path)),
        }
    }
}

fn default_database_path() -> String {
    format!("~/{CONFIG_DIR_NAME}/graphloom.db")
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.graphloom/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.graphloom/graphloom.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the Anthropic API key env var is set when LLM extraction is requested.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    match config.llm.api_key() {
        Some(_) => Ok(()),
        None => Err(PipelineError::config(format!(
            "Anthropic API key not found. Set the {} environment variable \
             or run without --llm.",
            config.llm.api_key_env
        ))),
    }
}
