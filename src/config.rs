//! Recognized configuration options, loaded via `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Which Fetcher/Acker pair the orchestrator wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    Soap,
    LocalFs,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ingestion-engine", about = "eClaimLink/DHPO ingestion engine")]
pub struct Config {
    /// Which source to poll.
    #[arg(long, env = "INGESTION_SOURCE", value_enum, default_value = "local-fs")]
    pub source: SourceKind,

    /// Size of the worker pool.
    #[arg(long, env = "INGESTION_WORKERS", default_value_t = num_cpus())]
    pub workers: usize,

    /// Bound of the work queue.
    #[arg(long, env = "INGESTION_QUEUE_CAPACITY", default_value_t = 512)]
    pub queue_capacity: usize,

    /// Pause fetcher below this remaining-capacity percentage.
    #[arg(long, env = "INGESTION_QUEUE_PAUSE_PCT", default_value_t = 0.05)]
    pub queue_pause_threshold_pct: f64,

    /// Resume fetcher above this remaining-capacity percentage.
    #[arg(long, env = "INGESTION_QUEUE_RESUME_PCT", default_value_t = 0.30)]
    pub queue_resume_threshold_pct: f64,

    /// Per-file soft deadline in milliseconds.
    #[arg(long, env = "INGESTION_FILE_TIMEOUT_MS", default_value_t = 120_000)]
    pub file_timeout_ms: u64,

    /// Clearing-house SOAP endpoint.
    #[arg(long, env = "SOAP_ENDPOINT", default_value = "")]
    pub soap_endpoint: String,

    /// Comma-separated facility IDs to poll, one poller task each.
    #[arg(long, env = "SOAP_FACILITY_IDS", value_delimiter = ',', default_value = "")]
    pub soap_facility_ids: Vec<String>,

    /// Connect timeout in milliseconds.
    #[arg(long, env = "SOAP_CONNECT_TIMEOUT_MS", default_value_t = 15_000)]
    pub soap_connect_timeout_ms: u64,

    /// Read timeout in milliseconds.
    #[arg(long, env = "SOAP_READ_TIMEOUT_MS", default_value_t = 45_000)]
    pub soap_read_timeout_ms: u64,

    /// Max retry attempts on connection/5xx.
    #[arg(long, env = "SOAP_RETRIES_MAX", default_value_t = 5)]
    pub soap_retries_max: u32,

    /// Backoff base delay in milliseconds.
    #[arg(long, env = "SOAP_RETRIES_BASE_MS", default_value_t = 50)]
    pub soap_retries_base_ms: u64,

    /// Backoff cap in milliseconds.
    #[arg(long, env = "SOAP_RETRIES_CAP_MS", default_value_t = 2_000)]
    pub soap_retries_cap_ms: u64,

    /// Per-facility concurrent downloads.
    #[arg(long, env = "SOAP_DOWNLOAD_CONCURRENCY", default_value_t = 4)]
    pub soap_download_concurrency: usize,

    /// Look-back window in days.
    #[arg(long, env = "SOAP_SEARCH_DAYS", default_value_t = 7)]
    pub soap_search_days: u32,

    /// Poll cadence in milliseconds.
    #[arg(long, env = "SOAP_POLL_INTERVAL_MS", default_value_t = 60_000)]
    pub soap_poll_interval_ms: u64,

    /// Local filesystem `ready/` directory.
    #[arg(long, env = "LOCALFS_READY_DIR", default_value = "./ready")]
    pub localfs_ready_dir: PathBuf,

    /// Local filesystem `done/` directory.
    #[arg(long, env = "LOCALFS_DONE_DIR", default_value = "./done")]
    pub localfs_done_dir: PathBuf,

    /// Local filesystem `error/` directory.
    #[arg(long, env = "LOCALFS_ERROR_DIR", default_value = "./error")]
    pub localfs_error_dir: PathBuf,

    /// Periodic rescan cadence in milliseconds.
    #[arg(long, env = "LOCALFS_SCAN_INTERVAL_MS", default_value_t = 5_000)]
    pub localfs_scan_interval_ms: u64,

    /// Auto-insert missing reference-data rows.
    #[arg(long, env = "REFDATA_AUTO_INSERT", default_value_t = false)]
    pub refdata_auto_insert: bool,

    /// Whether aggregate recalculation runs inline with Persist or as a
    /// follow-up transaction.
    #[arg(long, env = "AGGREGATES_RECALC_MODE", value_enum, default_value = "inline")]
    pub aggregates_recalc_mode: RecalcMode,

    /// Verbose (debug-level) logging.
    #[arg(long, short, env = "INGESTION_VERBOSE", default_value_t = false)]
    pub verbose: bool,

    /// Postgres connection string used by `persist::postgres`.
    #[arg(long, env = "DATABASE_URL", default_value = "")]
    pub database_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecalcMode {
    Inline,
    Followup,
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl Config {
    /// Queue items remaining before the fetcher should be paused.
    pub fn pause_below(&self) -> usize {
        (self.queue_capacity as f64 * self.queue_pause_threshold_pct).round() as usize
    }

    /// Queue items remaining above which a paused fetcher should resume.
    pub fn resume_above(&self) -> usize {
        (self.queue_capacity as f64 * self.queue_resume_threshold_pct).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::parse_from(["ingestion-engine"]);
        assert_eq!(cfg.queue_capacity, 512);
        assert_eq!(cfg.file_timeout_ms, 120_000);
        assert_eq!(cfg.soap_retries_max, 5);
        assert_eq!(cfg.soap_retries_base_ms, 50);
        assert_eq!(cfg.soap_retries_cap_ms, 2_000);
        assert_eq!(cfg.localfs_scan_interval_ms, 5_000);
    }

    #[test]
    fn thresholds_compute_from_capacity() {
        let mut cfg = Config::parse_from(["ingestion-engine"]);
        cfg.queue_capacity = 512;
        cfg.queue_pause_threshold_pct = 0.05;
        cfg.queue_resume_threshold_pct = 0.30;
        assert_eq!(cfg.pause_below(), 26);
        assert_eq!(cfg.resume_above(), 154);
    }
}
