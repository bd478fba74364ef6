//! Fetcher. Pulls raw documents from an external source and offers them to
//! the work queue. Two implementations: `soap` talks to the clearing-house's
//! SOAP API, `localfs` watches a directory — both honor the same
//! pause/resume contract the Orchestrator drives from queue occupancy.

pub mod localfs;
pub mod soap;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ErrorKind;
use crate::message::WorkItem;
use crate::queue::BoundedQueue;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Run the poll loop until cancelled, offering `WorkItem`s to `queue`.
    async fn run(&self, queue: Arc<BoundedQueue<WorkItem>>) -> Result<(), ErrorKind>;

    /// Stop pulling new work without tearing the fetcher down. Called once
    /// queue occupancy rises above the pause threshold.
    async fn pause(&self);

    /// Resume pulling new work once queue occupancy falls back below the
    /// resume threshold.
    async fn resume(&self);
}

/// Bounded exponential backoff with full jitter: delay doubles per attempt,
/// capped, then jittered down to avoid a thundering herd of retries all
/// landing on the same tick.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(cap_ms);
    let jittered = if capped == 0 { 0 } else { rand::random::<u64>() % (capped + 1) };
    Duration::from_millis(jittered)
}

/// Fans a single `Fetcher` handle out over several independent pollers, one
/// per facility, while presenting the Orchestrator with the one-`Fetcher`
/// interface it expects. `pause`/`resume` broadcast to every member, since
/// queue backpressure is global.
pub struct MultiFetcher {
    members: Vec<Arc<dyn Fetcher>>,
}

impl MultiFetcher {
    pub fn new(members: Vec<Arc<dyn Fetcher>>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl Fetcher for MultiFetcher {
    async fn run(&self, queue: Arc<BoundedQueue<WorkItem>>) -> Result<(), ErrorKind> {
        let mut handles = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let member = member.clone();
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { member.run(queue).await }));
        }
        for handle in handles {
            if let Ok(Err(e)) = handle.await {
                tracing::error!(error = %e, "facility poller exited");
            }
        }
        Ok(())
    }

    async fn pause(&self) {
        for member in &self.members {
            member.pause().await;
        }
    }

    async fn resume(&self) {
        for member in &self.members {
            member.resume().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..10 {
            let d = backoff_delay(attempt, 50, 2000);
            assert!(d.as_millis() <= 2000);
        }
    }
}
