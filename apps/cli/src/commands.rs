//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use graphloom_core::{JobObserver, Pipeline};
use graphloom_shared::{
    AppConfig, CandidateId, CandidateResolution, CandidateScope, EntityId, JobConfig, JobId,
    JobStage, JobStatus, JobStatusView, ReviewDecision, TenantId, init_config, load_config,
    load_config_from, validate_api_key,
};
use graphloom_storage::Storage;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// graphloom: turn a website into a consolidated knowledge graph.
#[derive(Parser)]
#[command(
    name = "graphloom",
    version,
    about = "Crawl a website, extract entities, and consolidate duplicates.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.graphloom/graphloom.toml.
    #[arg(long, global = true, env = "GRAPHLOOM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Tenant that owns created and listed records.
    #[arg(long, global = true, env = "GRAPHLOOM_TENANT", default_value = "default")]
    pub tenant: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a scraping job to completion, showing progress.
    Run(RunArgs),

    /// Show the status of a job.
    Status {
        job_id: JobId,
    },

    /// List the tenant's jobs.
    Jobs,

    /// Review consolidation candidates.
    Candidates {
        #[command(subcommand)]
        action: CandidateAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Options for `graphloom run`. Unset values come from `[defaults]`.
#[derive(Args)]
pub(crate) struct RunArgs {
    /// Seed URL (http or https).
    url: String,

    /// Maximum link hops from the seed.
    #[arg(short, long)]
    depth: Option<u32>,

    /// Page cap.
    #[arg(short, long)]
    max_pages: Option<u32>,

    /// Requests per second per host.
    #[arg(short, long)]
    speed: Option<f64>,

    /// Additional hostname the crawl may visit (repeatable).
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Only follow URLs matching this regex (repeatable).
    #[arg(long = "include")]
    url_patterns: Vec<String>,

    /// Never fetch URLs matching this regex (repeatable).
    #[arg(long = "exclude")]
    excluded_patterns: Vec<String>,

    /// Ignore robots.txt.
    #[arg(long)]
    ignore_robots: bool,

    /// Use the LLM extraction strategy.
    #[arg(long)]
    llm: bool,
}

#[derive(Subcommand)]
pub(crate) enum CandidateAction {
    /// List candidates for a job, or for the whole tenant.
    List {
        #[arg(long)]
        job: Option<JobId>,

        /// pending, auto_merged, confirmed, or rejected.
        #[arg(long)]
        resolution: Option<CandidateResolution>,
    },
    /// Confirm or reject a pending candidate.
    Resolve {
        candidate_id: CandidateId,

        /// confirm or reject.
        decision: ReviewDecision,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. `RUST_LOG` overrides `-v`.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "graphloom=info",
        1 => "graphloom=debug",
        _ => "graphloom=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let tenant = TenantId::new(cli.tenant);
    let config_path = cli.config;

    match cli.command {
        Command::Run(args) => cmd_run(resolve_config(config_path)?, tenant, args).await,
        Command::Status { job_id } => cmd_status(resolve_config(config_path)?, job_id).await,
        Command::Jobs => cmd_jobs(resolve_config(config_path)?, &tenant).await,
        Command::Candidates { action } => {
            let config = resolve_config(config_path)?;
            match action {
                CandidateAction::List { job, resolution } => {
                    let scope = match job {
                        Some(id) => CandidateScope::Job(id),
                        None => CandidateScope::Tenant(tenant),
                    };
                    cmd_candidates_list(config, &scope, resolution).await
                }
                CandidateAction::Resolve {
                    candidate_id,
                    decision,
                } => cmd_candidates_resolve(config, candidate_id, decision).await,
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: AppConfig, tenant: TenantId, args: RunArgs) -> Result<()> {
    let start_url =
        Url::parse(&args.url).map_err(|e| eyre!("invalid URL '{}': {e}", args.url))?;

    let mut job_config = JobConfig::with_defaults(start_url, &config.defaults);
    if let Some(depth) = args.depth {
        job_config.crawl_depth = depth;
    }
    if let Some(max_pages) = args.max_pages {
        job_config.max_pages = max_pages;
    }
    if let Some(speed) = args.speed {
        job_config.crawl_speed = speed;
    }
    job_config.allowed_domains.extend(args.domains);
    job_config.url_patterns = args.url_patterns;
    job_config.excluded_patterns = args.excluded_patterns;
    if args.ignore_robots {
        job_config.respect_robots_txt = false;
    }
    if args.llm {
        job_config.use_llm_extraction = true;
    }
    if job_config.use_llm_extraction {
        validate_api_key(&config)?;
    }

    let storage = Storage::open(&config.storage.resolved_path()?).await?;
    let progress = Arc::new(CliProgress::new(job_config.max_pages));
    let pipeline = Pipeline::with_observer(Arc::new(storage), config, progress.clone())?;

    let started = Instant::now();
    let job = pipeline.create_job(tenant, job_config).await?;
    info!(job_id = %job.id, url = %job.config.start_url, "job submitted");

    let view = tokio::select! {
        view = pipeline.wait_for_terminal(job.id) => view?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job.id, "interrupt received, cancelling job");
            pipeline.cancel_job(job.id).await?;
            pipeline.wait_for_terminal(job.id).await?
        }
    };
    progress.finish();

    print_summary(&view, started.elapsed());
    match view.status {
        JobStatus::Failed => Err(eyre!(
            "job {} failed: {}",
            view.job_id,
            view.error_message.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

fn print_summary(view: &JobStatusView, elapsed: Duration) {
    println!();
    println!("  Job:          {}", view.job_id);
    println!("  Status:       {}", view.status);
    println!("  Pages:        {}", view.pages_crawled);
    println!("  Entities:     {}", view.entities_extracted);
    println!("  Auto-merged:  {}", view.consolidation_auto_merged);
    println!("  Candidates:   {}", view.consolidation_candidates_found);
    println!("  Errors:       {}", view.errors_count);
    println!("  Time:         {:.1}s", elapsed.as_secs_f64());
    if view.consolidation_candidates_found > 0 {
        println!();
        println!("  Review with: graphloom candidates list --job {}", view.job_id);
    }
    println!();
}

async fn cmd_status(config: AppConfig, job_id: JobId) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let view = pipeline.get_job_status(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn cmd_jobs(config: AppConfig, tenant: &TenantId) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let jobs = pipeline.list_jobs(tenant).await?;
    if jobs.is_empty() {
        println!("No jobs for tenant {tenant}.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:>5} pages  {:>6} entities  {}",
            job.id,
            job.status.as_str(),
            job.pages_crawled,
            job.entities_extracted,
            job.config.start_url
        );
    }
    Ok(())
}

async fn cmd_candidates_list(
    config: AppConfig,
    scope: &CandidateScope,
    resolution: Option<CandidateResolution>,
) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let candidates = pipeline
        .list_consolidation_candidates(scope, resolution)
        .await?;
    if candidates.is_empty() {
        println!("No candidates.");
        return Ok(());
    }

    for c in candidates {
        println!(
            "{}  {:.3}  {:<11} {} <-> {}",
            c.id,
            c.confidence_score,
            c.resolution.as_str(),
            entity_name(&pipeline, c.entity_a).await?,
            entity_name(&pipeline, c.entity_b).await?
        );
    }
    Ok(())
}

async fn entity_name(pipeline: &Pipeline, id: EntityId) -> Result<String> {
    Ok(match pipeline.storage().get_entity(id).await? {
        Some(entity) => entity.name,
        None => id.to_string(),
    })
}

async fn cmd_candidates_resolve(
    config: AppConfig,
    candidate_id: CandidateId,
    decision: ReviewDecision,
) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let candidate = pipeline
        .resolve_consolidation_candidate(candidate_id, decision)
        .await?;
    println!("Candidate {} is now {}.", candidate.id, candidate.resolution);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress observer
// ---------------------------------------------------------------------------

/// Three indicatif bars, one per pipeline stage.
struct CliProgress {
    bars: MultiProgress,
    crawl: ProgressBar,
    extract: ProgressBar,
    consolidate: ProgressBar,
}

impl CliProgress {
    fn new(max_pages: u32) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix:>13.cyan} [{bar:30}] {pos:>5}/{len:<5} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        let bars = MultiProgress::new();
        let bar = |prefix: &'static str, len: u64| {
            let bar = bars.add(ProgressBar::new(len));
            bar.set_style(style.clone());
            bar.set_prefix(prefix);
            bar
        };
        let crawl = bar("crawling", u64::from(max_pages));
        let extract = bar("extracting", 0);
        let consolidate = bar("consolidating", 0);
        crawl.enable_steady_tick(Duration::from_millis(120));

        Self {
            bars,
            crawl,
            extract,
            consolidate,
        }
    }

    fn finish(&self) {
        for bar in [&self.crawl, &self.extract, &self.consolidate] {
            bar.finish();
        }
        // Best effort: a failed clear only leaves stale bars on screen.
        let _ = self.bars.clear();
    }
}

impl JobObserver for CliProgress {
    fn stage_entered(&self, _job_id: JobId, stage: JobStage) {
        match stage {
            JobStage::Extracting => self.crawl.set_message("done"),
            JobStage::Consolidating => self.extract.set_message("done"),
            JobStage::Done => self.consolidate.set_message("done"),
            JobStage::Crawling => {}
        }
    }

    fn status_changed(&self, _job_id: JobId, status: JobStatus) {
        let message = match status {
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
            _ => "",
        };
        self.crawl.set_message(message);
    }

    fn counters_updated(&self, view: &JobStatusView) {
        self.crawl.set_position(view.pages_crawled);
        self.extract.set_length(view.pages_crawled);
        self.extract
            .set_position((view.extraction_progress * view.pages_crawled as f64).round() as u64);
        self.consolidate.set_length(100);
        self.consolidate
            .set_position((view.consolidation_progress * 100.0).round() as u64);
        if view.errors_count > 0 {
            self.crawl
                .set_message(format!("{} errors", view.errors_count));
        }
    }
}
