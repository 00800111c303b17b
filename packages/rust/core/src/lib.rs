//! Job orchestration for graphloom.
//!
//! This crate ties the crawler, the extraction coordinator, and the
//! consolidation engine into scraping jobs behind the [`Pipeline`] API.

pub mod pipeline;
pub mod progress;
mod runner;

pub use pipeline::Pipeline;
pub use progress::{JobObserver, SilentObserver, status_view};
