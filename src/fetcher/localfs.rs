//! Local-filesystem Fetcher: watches a `ready/` directory,
//! offering each new file to the queue once. Restart-safe by construction —
//! the in-memory `seen` set is only an optimization to avoid re-reading a
//! file every scan tick; if the process restarts and re-offers a file it
//! already ingested, Persist's file-level idempotency check (`ALREADY`)
//! makes that a no-op rather than a duplicate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::domain::RootType;
use crate::errors::ErrorKind;
use crate::message::{SourceMetadata, WorkItem};
use crate::queue::{offer_or_drop, BoundedQueue};

use super::Fetcher;

pub struct LocalFsFetcher {
    ready_dir: PathBuf,
    scan_interval: Duration,
    seen: Mutex<HashSet<String>>,
    paused: AtomicBool,
}

impl LocalFsFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            ready_dir: config.localfs_ready_dir.clone(),
            scan_interval: Duration::from_millis(config.localfs_scan_interval_ms),
            seen: Mutex::new(HashSet::new()),
            paused: AtomicBool::new(false),
        }
    }

    async fn scan_once(&self, queue: &Arc<BoundedQueue<WorkItem>>) -> Result<(), ErrorKind> {
        let mut entries = tokio::fs::read_dir(&self.ready_dir)
            .await
            .map_err(|e| ErrorKind::FetchTransient(format!("reading {}: {e}", self.ready_dir.display())))?;

        while let Some(entry) =
            entries.next_entry().await.map_err(|e| ErrorKind::FetchTransient(e.to_string()))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_id = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
            if file_id.is_empty() {
                continue;
            }
            {
                let mut seen = self.seen.lock().await;
                if seen.contains(&file_id) {
                    continue;
                }
                seen.insert(file_id.clone());
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(file_id, error = %e, "failed to read ready file");
                    continue;
                }
            };

            let item = WorkItem {
                file_id,
                bytes,
                source: SourceMetadata::LocalFs { ready_path: path },
                root_type_hint: None::<RootType>,
                discovered_at: Utc::now(),
            };
            offer_or_drop(queue, item, Duration::from_millis(200)).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Fetcher for LocalFsFetcher {
    async fn run(&self, queue: Arc<BoundedQueue<WorkItem>>) -> Result<(), ErrorKind> {
        loop {
            if !self.paused.load(Ordering::Relaxed) {
                if let Err(e) = self.scan_once(&queue).await {
                    tracing::error!(error = %e, "ready directory scan failed");
                }
            }
            tokio::time::sleep(self.scan_interval).await;
        }
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OfferOutcome;
    use clap::Parser;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scan_offers_each_new_file_once() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("f1.xml"), b"<Claim.Submission/>").await.unwrap();

        let mut config = Config::parse_from(["ingestion-engine"]);
        config.localfs_ready_dir = dir.path().to_path_buf();
        let fetcher = LocalFsFetcher::new(&config);
        let queue = Arc::new(BoundedQueue::new(8));

        fetcher.scan_once(&queue).await.unwrap();
        assert_eq!(queue.len().await, 1);

        // Second scan should not re-offer the same file.
        fetcher.scan_once(&queue).await.unwrap();
        assert_eq!(queue.len().await, 1);

        let item = queue.take().await;
        assert_eq!(item.file_id, "f1.xml");
    }

    #[test]
    fn offer_outcome_is_comparable() {
        assert_ne!(OfferOutcome::Accepted, OfferOutcome::RejectedFull);
    }
}
