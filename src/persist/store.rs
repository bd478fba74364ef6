//! Persist contract. `PersistStore` is the DAO seam the rest of the core
//! depends on; `memory` backs tests, `postgres` backs production.
//!
//! Every write path here must be safe to call twice with the same input: the
//! file/claim-key/event upsert rules in the method docs are what make
//! `ALREADY` and claim convergence (submission-before-remittance or the
//! reverse) work without double-counting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::aggregate_rows::{ClaimActivitySummary, ClaimPayment};
use crate::domain::audit::{IngestionError, IngestionFileAudit, IngestionRun};
use crate::domain::claim::{Activity, Claim, ClaimEvent};
use crate::domain::remittance::{RemittanceActivity, RemittanceClaim};
use crate::domain::RootType;
use crate::errors::ErrorKind;
use crate::mapper::{MappedRemittance, MappedSubmission};

/// Input to `upsert_ingestion_file`: an `IngestionFile` row not yet assigned
/// a surrogate id.
#[derive(Debug, Clone)]
pub struct NewIngestionFile {
    pub file_id: String,
    pub root_type: RootType,
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: DateTime<Utc>,
    pub record_count: u32,
    pub byte_hash: Option<String>,
}

/// Result of the file-level idempotency check.
#[derive(Debug, Clone, Copy)]
pub struct UpsertFileOutcome {
    pub ingestion_file_id: i64,
    pub already_existed: bool,
}

/// Row counts a persist or verify pass produced, keyed by the claim keys it
/// touched.
#[derive(Debug, Clone, Default)]
pub struct PersistCounts {
    pub claim_key_ids: Vec<i64>,
    pub claims: u32,
    pub activities: u32,
}

/// Orphan child-row counts, a Verify-time integrity check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanCounts {
    pub orphan_activities: u32,
    pub orphan_observations: u32,
}

#[async_trait]
pub trait PersistStore: Send + Sync {
    /// Idempotent file registration keyed on `file_id`.
    /// A second call with the same `file_id` must return
    /// `already_existed: true` and must not touch any other table.
    async fn upsert_ingestion_file(&self, file: NewIngestionFile) -> Result<UpsertFileOutcome, ErrorKind>;

    /// Write a submission document transactionally: upsert the `ClaimKey`
    /// for every claim, upsert `Claim`/`Encounter`/`Activity`/`Observation`/
    /// `Diagnosis` rows, append a `SUBMISSION` or `RESUBMISSION` `ClaimEvent`
    /// per claim, and refresh `ClaimStatusTimeline`.
    async fn persist_submission(
        &self,
        ingestion_file_id: i64,
        mapped: MappedSubmission,
        event_time: DateTime<Utc>,
    ) -> Result<PersistCounts, ErrorKind>;

    /// Write a remittance document transactionally: upsert the `ClaimKey`
    /// for every claim (remittance may arrive before submission), insert
    /// `RemittanceClaim`/`RemittanceActivity` rows,
    /// append one `REMITTANCE` `ClaimEvent` per remittance claim, and
    /// refresh `ClaimStatusTimeline`.
    async fn persist_remittance(
        &self,
        ingestion_file_id: i64,
        mapped: MappedRemittance,
        event_time: DateTime<Utc>,
    ) -> Result<PersistCounts, ErrorKind>;

    async fn claim_key_id_for(&self, claim_id: &str) -> Result<Option<i64>, ErrorKind>;

    async fn claim_for_key(&self, claim_key_id: i64) -> Result<Option<Claim>, ErrorKind>;

    async fn activities_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<Activity>, ErrorKind>;

    /// Every remittance line against any `activity_id` belonging to
    /// `claim_key_id`, across every remittance claim received so far — a
    /// join on (claim_key_id, activity_id), not on a single remittance
    /// document.
    async fn remittance_activities_for_claim_key(
        &self,
        claim_key_id: i64,
    ) -> Result<Vec<(RemittanceClaim, RemittanceActivity)>, ErrorKind>;

    async fn events_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<ClaimEvent>, ErrorKind>;

    /// Overwrite the derived per-activity summary row. Aggregates
    /// recomputes the whole row from source rows every time; this is a
    /// blind upsert, not a delta.
    async fn upsert_activity_summary(&self, row: ClaimActivitySummary) -> Result<(), ErrorKind>;

    /// Overwrite the derived per-claim payment rollup row.
    async fn upsert_claim_payment(&self, row: ClaimPayment) -> Result<(), ErrorKind>;

    async fn activity_summaries_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<ClaimActivitySummary>, ErrorKind>;

    async fn claim_payment_for_claim_key(&self, claim_key_id: i64) -> Result<Option<ClaimPayment>, ErrorKind>;

    /// Read back what landed for `ingestion_file_id`, for Verify to compare
    /// against parse-time counts.
    async fn persisted_counts_for_file(&self, ingestion_file_id: i64) -> Result<PersistCounts, ErrorKind>;

    /// Of the given `claim_key_id`s, return the subset with zero `ClaimEvent`
    /// rows. Used by Verify to catch a claim persisted with no event ever
    /// recorded against it.
    async fn claim_keys_missing_events(&self, claim_key_ids: &[i64]) -> Result<Vec<i64>, ErrorKind>;

    /// Count of `Activity` rows whose `claim_id` has no matching `Claim` row,
    /// and `Observation` rows whose `activity_id` has no matching `Activity`
    /// row. Used by Verify to catch orphaned child rows.
    async fn orphan_row_counts(&self) -> Result<OrphanCounts, ErrorKind>;

    async fn create_run(&self, run: IngestionRun) -> Result<(), ErrorKind>;

    async fn update_run(&self, run: IngestionRun) -> Result<(), ErrorKind>;

    async fn write_file_audit(&self, audit: IngestionFileAudit) -> Result<i64, ErrorKind>;

    async fn write_ingestion_error(&self, err: IngestionError) -> Result<i64, ErrorKind>;
}
