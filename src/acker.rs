//! Acker. Tells the source a file has been dealt with, so it isn't
//! redelivered. Runs after Verify succeeds, or after a file is given up on
//! as terminally failed — never on a retryable failure, since that file
//! should come back around.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::ErrorKind;
use crate::fetcher::soap::SoapFetcher;
use crate::message::SourceMetadata;

#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledge `file_id`. `terminal_failure` is true when the file is
    /// being acked despite failing, false on a clean success.
    async fn ack(&self, file_id: &str, source: &SourceMetadata, terminal_failure: bool) -> Result<(), ErrorKind>;
}

/// Routes an ack to the `SoapFetcher` for the `WorkItem`'s originating
/// facility — each poller keeps its own credentials/session, so
/// `SetTransactionDownloaded` must go out on the same facility's connection
/// the file was downloaded on.
pub struct SoapAcker {
    fetchers: HashMap<String, Arc<SoapFetcher>>,
}

impl SoapAcker {
    pub fn new(fetchers: HashMap<String, Arc<SoapFetcher>>) -> Self {
        Self { fetchers }
    }
}

#[async_trait]
impl Acker for SoapAcker {
    async fn ack(&self, file_id: &str, source: &SourceMetadata, _terminal_failure: bool) -> Result<(), ErrorKind> {
        let SourceMetadata::Soap { facility_id } = source else {
            return Err(ErrorKind::AckFailed(format!("{file_id} was not sourced from SOAP")));
        };
        let fetcher = self
            .fetchers
            .get(facility_id)
            .ok_or_else(|| ErrorKind::AckFailed(format!("no SOAP fetcher registered for facility {facility_id}")))?;
        fetcher.mark_downloaded(file_id).await
    }
}

pub struct LocalFsAcker {
    done_dir: PathBuf,
    error_dir: PathBuf,
}

impl LocalFsAcker {
    pub fn new(config: &Config) -> Self {
        Self { done_dir: config.localfs_done_dir.clone(), error_dir: config.localfs_error_dir.clone() }
    }
}

#[async_trait]
impl Acker for LocalFsAcker {
    async fn ack(&self, file_id: &str, source: &SourceMetadata, terminal_failure: bool) -> Result<(), ErrorKind> {
        let SourceMetadata::LocalFs { ready_path } = source else {
            return Err(ErrorKind::AckFailed(format!("{file_id} was not sourced from localfs")));
        };
        let target_dir = if terminal_failure { &self.error_dir } else { &self.done_dir };
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| ErrorKind::AckFailed(format!("creating {}: {e}", target_dir.display())))?;
        let target = target_dir.join(file_id);
        tokio::fs::rename(ready_path, &target)
            .await
            .map_err(|e| ErrorKind::AckFailed(format!("moving {file_id} to {}: {e}", target.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moves_file_to_done_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let done = dir.path().join("done");
        let error = dir.path().join("error");
        tokio::fs::create_dir_all(&ready).await.unwrap();
        let file_path = ready.join("f1.xml");
        tokio::fs::write(&file_path, b"data").await.unwrap();

        let acker = LocalFsAcker { done_dir: done.clone(), error_dir: error.clone() };
        let source = SourceMetadata::LocalFs { ready_path: file_path.clone() };
        acker.ack("f1.xml", &source, false).await.unwrap();

        assert!(done.join("f1.xml").exists());
        assert!(!file_path.exists());
    }

    #[tokio::test]
    async fn moves_file_to_error_on_terminal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let done = dir.path().join("done");
        let error = dir.path().join("error");
        tokio::fs::create_dir_all(&ready).await.unwrap();
        let file_path = ready.join("f2.xml");
        tokio::fs::write(&file_path, b"data").await.unwrap();

        let acker = LocalFsAcker { done_dir: done.clone(), error_dir: error.clone() };
        let source = SourceMetadata::LocalFs { ready_path: file_path.clone() };
        acker.ack("f2.xml", &source, true).await.unwrap();

        assert!(error.join("f2.xml").exists());
    }
}
