//! Cross-stage message types carried along the Fetcher→Queue→Worker edge.

use chrono::{DateTime, Utc};

use crate::domain::RootType;

/// Where a `WorkItem` came from, carried through to the Acker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMetadata {
    Soap { facility_id: String },
    LocalFs { ready_path: std::path::PathBuf },
}

/// One unit of fetched work handed from a Fetcher to the worker pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub file_id: String,
    pub bytes: Vec<u8>,
    pub source: SourceMetadata,
    pub root_type_hint: Option<RootType>,
    pub discovered_at: DateTime<Utc>,
}

/// Outcome of offering an item to the bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    RejectedFull,
}

/// Per-file sub-state machine tracked while a worker processes one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Discovered,
    Queued,
    Parsing,
    Persisting,
    Aggregating,
    Verifying,
    Acking,
    Done,
    Failed,
}
