//! Job control signal shared by the crawl, extraction, and merge loops.

use tokio::sync::watch;

/// Desired run state broadcast to a job's tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    Run,
    Pause,
    Cancel,
}

/// Outcome of a [`checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Cancelled,
}

/// Block while paused; report cancellation.
///
/// A dropped sender counts as cancellation.
pub async fn checkpoint(rx: &mut watch::Receiver<JobControl>) -> Checkpoint {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            JobControl::Run => return Checkpoint::Proceed,
            JobControl::Cancel => return Checkpoint::Cancelled,
            JobControl::Pause => {
                if rx.changed().await.is_err() {
                    return Checkpoint::Cancelled;
                }
            }
        }
    }
}
