//! Politeness-aware crawl scheduler for graphloom jobs.
//!
//! This crate provides:
//! - [`engine`]: the [`CrawlScheduler`] BFS loop and its [`CrawlEvent`]s
//! - [`frontier`]: per-depth FIFO queues with canonical-URL dedup
//! - [`scope`]: domain/pattern rules and the SSRF guard
//! - [`robots`]: robots.txt parsing and a per-job cache
//! - [`limiter`]: per-host token buckets
//! - [`fetcher`]: HTTP fetch with bounded retries

pub mod engine;
pub mod fetcher;
pub mod frontier;
pub mod limiter;
pub mod robots;
pub mod scope;

pub use engine::{CrawlEvent, CrawlScheduler, CrawlSummary, compute_hash, extract_links};
pub use fetcher::{FetchFailure, FetchedDocument, Fetcher};
pub use frontier::{Frontier, canonical_url};
pub use limiter::HostLimiter;
pub use robots::{RobotsCache, RobotsRules};
pub use scope::{CrawlScope, SkipReason, is_ssrf_target};
