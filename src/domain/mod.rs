//! Canonical entities and derived aggregates.
//!
//! These types are the DAO contract's row shapes: what the Parser/Mapper produce
//! and what `PersistStore` reads back. They carry no behavior beyond small,
//! side-effect-free helpers (status classification, totals) — the pipeline logic
//! that moves rows between stages lives in `mapper`, `persist`, `aggregates`.

pub mod aggregate_rows;
pub mod audit;
pub mod claim;
pub mod remittance;

pub use aggregate_rows::{ActivityStatus, ClaimActivitySummary, ClaimPayment};
pub use audit::{
    FileAuditStatus, IngestionFileAudit, IngestionRun, RunReason, RunState,
};
pub use claim::{
    Claim, ClaimEvent, ClaimEventType, ClaimKey, ClaimResubmission, ClaimStatusTimeline,
    Diagnosis, Encounter, Observation, Submission,
};
pub use remittance::{Remittance, RemittanceActivity, RemittanceClaim};

/// Which of the two recognized XML dialects a document root was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootType {
    Submission = 1,
    Remittance = 2,
}

/// One decoded source document row.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionFile {
    pub id: i64,
    pub file_id: String,
    pub root_type: RootType,
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: chrono::DateTime<chrono::Utc>,
    pub record_count: u32,
    pub byte_hash: Option<String>,
}
