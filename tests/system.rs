//! Full-system test: a `LocalFsFetcher` watching a directory, an `Orchestrator`
//! driving the worker pool against a `MemoryStore`, and a `LocalFsAcker`
//! moving files into `done/` once the run has converged.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ingestion_engine::acker::LocalFsAcker;
use ingestion_engine::config::Config;
use ingestion_engine::fetcher::localfs::LocalFsFetcher;
use ingestion_engine::fetcher::Fetcher;
use ingestion_engine::fixtures::write_fake_submissions;
use ingestion_engine::mapper::RefResolver;
use ingestion_engine::orchestrator::Orchestrator;
use ingestion_engine::persist::{MemoryStore, PersistStore};
use tokio::sync::Notify;

#[tokio::test]
async fn local_fs_source_ingests_every_ready_file_and_acks_to_done() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let done = dir.path().join("done");
    let error = dir.path().join("error");

    write_fake_submissions(&ready, 4, 2).await.unwrap();

    let config = Arc::new(Config::parse_from([
        "ingestion-engine",
        "--source",
        "local-fs",
        "--localfs-ready-dir",
        ready.to_str().unwrap(),
        "--localfs-done-dir",
        done.to_str().unwrap(),
        "--localfs-error-dir",
        error.to_str().unwrap(),
        "--localfs-scan-interval-ms",
        "20",
        "--workers",
        "2",
        "--queue-capacity",
        "16",
        "--refdata-auto-insert",
    ]));

    let store = Arc::new(MemoryStore::new());
    let persist_store: Arc<dyn PersistStore> = store.clone();
    let resolver: Arc<dyn RefResolver> = store.clone();

    let fetcher: Arc<dyn Fetcher> = Arc::new(LocalFsFetcher::new(&config));
    let acker = Arc::new(LocalFsAcker::new(&config));

    let orchestrator = Orchestrator::new(config, persist_store, resolver);
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();

    let run_handle = tokio::spawn(async move { orchestrator.run(fetcher, acker, shutdown).await });

    // Give the scan loop and worker pool time to drain all 4 ready files,
    // then ask the orchestrator to stop pulling new work.
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown_signal.notify_one();

    let run = tokio::time::timeout(Duration::from_secs(10), run_handle)
        .await
        .expect("orchestrator run must finish after shutdown is signaled")
        .expect("orchestrator task must not panic")
        .expect("orchestrator run must not error");

    assert_eq!(run.files_ok, 4, "all four ready files should have ingested cleanly");
    assert_eq!(run.files_failed, 0);

    let mut remaining_ready = tokio::fs::read_dir(&ready).await.unwrap();
    assert!(remaining_ready.next_entry().await.unwrap().is_none(), "ready/ should be empty after acking");

    let mut done_entries = 0;
    let mut entries = tokio::fs::read_dir(&done).await.unwrap();
    while entries.next_entry().await.unwrap().is_some() {
        done_entries += 1;
    }
    assert_eq!(done_entries, 4, "every ingested file should have been moved to done/");
}
