//! Run and per-file audit entities.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Orchestrator run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Draining,
    Ended,
}

/// Why a run ended, recorded on `IngestionRun` for operational visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    Completed,
    Cancelled,
    FetcherExhausted,
}

/// One orchestrator activation.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionRun {
    pub id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<RunReason>,
    pub files_discovered: u64,
    pub files_pulled: u64,
    pub files_ok: u64,
    pub files_failed: u64,
    pub files_already: u64,
    pub acks_sent: u64,
}

impl IngestionRun {
    pub fn new(id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: RunState::Starting,
            started_at,
            ended_at: None,
            reason: None,
            files_discovered: 0,
            files_pulled: 0,
            files_ok: 0,
            files_failed: 0,
            files_already: 0,
            acks_sent: 0,
        }
    }
}

/// Final per-file audit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAuditStatus {
    Already = 0,
    Ok = 1,
    Failed = 2,
    FailedTerminal = 3,
}

/// Per-file record within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionFileAudit {
    pub id: i64,
    pub run_id: Uuid,
    pub ingestion_file_id: Option<i64>,
    pub file_id: String,
    pub status: FileAuditStatus,
    pub reason: Option<String>,
    pub parsed_claims: u32,
    pub parsed_activities: u32,
    pub persisted_claims: u32,
    pub persisted_activities: u32,
    pub verification_ok: bool,
    pub duration_ms: u64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub total_gross: Decimal,
    pub total_net: Decimal,
    pub total_patient_share: Decimal,
    pub unique_payers: u32,
    pub unique_providers: u32,
}

/// `ingestion_error` row.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionError {
    pub id: i64,
    pub run_id: Uuid,
    pub file_id: Option<String>,
    pub stage: String,
    pub object_type: String,
    pub error_code: String,
    pub message: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

/// `code_discovery_audit` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeDiscoveryAudit {
    pub id: i64,
    pub code: String,
    pub kind: String,
    pub auto_inserted: bool,
    pub discovered_at: DateTime<Utc>,
}
