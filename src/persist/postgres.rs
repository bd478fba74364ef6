//! Postgres-backed `PersistStore`.
//!
//! A repository-over-`PgPool` shape: explicit `pool.begin()` transactions,
//! upserts via `INSERT ... ON CONFLICT`, and a custom error type translating
//! `sqlx::Error` at the boundary rather than leaking it. Queries are bound at
//! runtime instead of through the compile-time-checked `query_as!` macro
//! family, since this crate must build without a live database reachable at
//! compile time.
//!
//! Lock ordering: acquire the `ClaimKey` row lock first, then `Claim`, then
//! `Activity` children, in that order, on every writer, so two connections
//! racing to persist the same claim key never deadlock.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::aggregate_rows::{ActivityStatus, ClaimActivitySummary, ClaimPayment};
use crate::domain::audit::{FileAuditStatus, IngestionError, IngestionFileAudit, IngestionRun, RunReason, RunState};
use crate::domain::claim::{Activity, Claim, ClaimEvent, ClaimEventType};
use crate::domain::remittance::{RemittanceActivity, RemittanceClaim};
use crate::domain::RootType;
use crate::errors::ErrorKind;
use crate::mapper::{MappedRemittance, MappedSubmission, RefKind, RefResolver};

use super::store::{NewIngestionFile, PersistCounts, PersistStore, UpsertFileOutcome};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, ErrorKind> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| ErrorKind::PersistFatal(format!("connect: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> ErrorKind {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ErrorKind::PersistTransient(e.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
            // serialization_failure: safe to retry.
            ErrorKind::PersistTransient(e.to_string())
        }
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("23502") | Some("23514")) => {
            ErrorKind::PersistValidation(e.to_string())
        }
        _ => ErrorKind::PersistFatal(e.to_string()),
    }
}

/// Retries a persist attempt with bounded exponential backoff: transient
/// deadlocks and serialization failures are retried up to N=5 attempts, base
/// 50ms, cap 2s. Only `ErrorKind::retryable()` errors are retried; everything
/// else returns immediately on the first attempt.
async fn with_transient_retry<F, Fut, T>(mut op: F) -> Result<T, ErrorKind>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ErrorKind>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    const BASE_MS: u64 = 50;
    const CAP_MS: u64 = 2000;

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable() && attempt + 1 < MAX_ATTEMPTS => {
                tokio::time::sleep(crate::fetcher::backoff_delay(attempt, BASE_MS, CAP_MS)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn ref_kind_code(kind: RefKind) -> i16 {
    match kind {
        RefKind::Payer => 1,
        RefKind::Provider => 2,
        RefKind::Facility => 3,
        RefKind::Clinician => 4,
        RefKind::ActivityCode => 5,
        RefKind::DiagnosisCode => 6,
        RefKind::DenialCode => 7,
    }
}

fn root_type_code(rt: RootType) -> i16 {
    match rt {
        RootType::Submission => 1,
        RootType::Remittance => 2,
    }
}

fn event_type_code(t: ClaimEventType) -> i16 {
    match t {
        ClaimEventType::Submission => 1,
        ClaimEventType::Resubmission => 2,
        ClaimEventType::Remittance => 3,
    }
}

fn event_type_from_code(code: i16) -> ClaimEventType {
    match code {
        2 => ClaimEventType::Resubmission,
        3 => ClaimEventType::Remittance,
        _ => ClaimEventType::Submission,
    }
}

fn status_code(s: ActivityStatus) -> i16 {
    match s {
        ActivityStatus::FullyPaid => 1,
        ActivityStatus::PartiallyPaid => 2,
        ActivityStatus::Rejected => 3,
        ActivityStatus::Pending => 4,
        ActivityStatus::TakenBack => 5,
        ActivityStatus::PartiallyTakenBack => 6,
    }
}

fn status_from_code(code: i16) -> ActivityStatus {
    match code {
        1 => ActivityStatus::FullyPaid,
        2 => ActivityStatus::PartiallyPaid,
        3 => ActivityStatus::Rejected,
        5 => ActivityStatus::TakenBack,
        6 => ActivityStatus::PartiallyTakenBack,
        _ => ActivityStatus::Pending,
    }
}

/// Fetch (or, under `ClaimKey` row-lock, create) the surrogate id for
/// `claim_id` within an open transaction. Always the first lock taken in a
/// writer's transaction.
async fn claim_key_id_for_tx(tx: &mut sqlx::PgConnection, claim_id: &str) -> Result<i64, ErrorKind> {
    if let Some(row) = sqlx::query("SELECT id FROM claim_key WHERE claim_id = $1 FOR UPDATE")
        .bind(claim_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
    {
        return Ok(row.try_get::<i64, _>("id").map_err(db_err)?);
    }
    let row = sqlx::query(
        "INSERT INTO claim_key (claim_id) VALUES ($1) \
         ON CONFLICT (claim_id) DO UPDATE SET claim_id = EXCLUDED.claim_id \
         RETURNING id",
    )
    .bind(claim_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err)?;
    row.try_get::<i64, _>("id").map_err(db_err)
}

#[async_trait]
impl PersistStore for PostgresStore {
    async fn upsert_ingestion_file(&self, file: NewIngestionFile) -> Result<UpsertFileOutcome, ErrorKind> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if let Some(row) = sqlx::query("SELECT id FROM ingestion_file WHERE file_id = $1")
            .bind(&file.file_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
        {
            let ingestion_file_id: i64 = row.try_get("id").map_err(db_err)?;
            // Only a prior OK audit makes this ALREADY; a prior failed audit
            // allows reprocessing under the same file row.
            let had_ok_audit = sqlx::query(
                "SELECT 1 FROM ingestion_file_audit WHERE file_id = $1 AND status = $2 LIMIT 1",
            )
            .bind(&file.file_id)
            .bind(file_audit_status_code(FileAuditStatus::Ok))
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();
            tx.commit().await.map_err(db_err)?;
            return Ok(UpsertFileOutcome { ingestion_file_id, already_existed: had_ok_audit });
        }
        let row = sqlx::query(
            "INSERT INTO ingestion_file \
             (file_id, root_type, sender_id, receiver_id, transaction_date, record_count, byte_hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (file_id) DO UPDATE SET file_id = EXCLUDED.file_id \
             RETURNING id",
        )
        .bind(&file.file_id)
        .bind(root_type_code(file.root_type))
        .bind(&file.sender_id)
        .bind(&file.receiver_id)
        .bind(file.transaction_date)
        .bind(file.record_count as i32)
        .bind(&file.byte_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(UpsertFileOutcome { ingestion_file_id: row.try_get("id").map_err(db_err)?, already_existed: false })
    }

    async fn persist_submission(
        &self,
        ingestion_file_id: i64,
        mapped: MappedSubmission,
        event_time: DateTime<Utc>,
    ) -> Result<PersistCounts, ErrorKind> {
        with_transient_retry(|| persist_submission_once(self, ingestion_file_id, &mapped, event_time)).await
    }

    async fn persist_remittance(
        &self,
        ingestion_file_id: i64,
        mapped: MappedRemittance,
        event_time: DateTime<Utc>,
    ) -> Result<PersistCounts, ErrorKind> {
        with_transient_retry(|| persist_remittance_once(self, ingestion_file_id, &mapped, event_time)).await
    }

    async fn claim_key_id_for(&self, claim_id: &str) -> Result<Option<i64>, ErrorKind> {
        let row = sqlx::query("SELECT id FROM claim_key WHERE claim_id = $1")
            .bind(claim_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get("id").map_err(db_err)).transpose()
    }

    async fn claim_for_key(&self, claim_key_id: i64) -> Result<Option<Claim>, ErrorKind> {
        let row = sqlx::query(
            "SELECT id, claim_key_id, submission_id, claim_id, id_payer, payer_ref_id, provider_id, \
                    provider_ref_id, member_id, emirates_id_number, gross, patient_share, net, tx_at \
             FROM claim WHERE claim_key_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(claim_key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| {
            Ok(Claim {
                id: r.try_get("id").map_err(db_err)?,
                claim_key_id: r.try_get("claim_key_id").map_err(db_err)?,
                submission_id: r.try_get("submission_id").map_err(db_err)?,
                claim_id: r.try_get("claim_id").map_err(db_err)?,
                id_payer: r.try_get("id_payer").map_err(db_err)?,
                payer_ref_id: r.try_get("payer_ref_id").map_err(db_err)?,
                provider_id: r.try_get("provider_id").map_err(db_err)?,
                provider_ref_id: r.try_get("provider_ref_id").map_err(db_err)?,
                member_id: r.try_get("member_id").map_err(db_err)?,
                emirates_id_number: r.try_get("emirates_id_number").map_err(db_err)?,
                gross: r.try_get("gross").map_err(db_err)?,
                patient_share: r.try_get("patient_share").map_err(db_err)?,
                net: r.try_get("net").map_err(db_err)?,
                tx_at: r.try_get("tx_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn activities_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<Activity>, ErrorKind> {
        let rows = sqlx::query(
            "SELECT a.id, a.claim_id, a.activity_id, a.start_at, a.activity_type, a.code, a.code_ref_id, \
                    a.quantity, a.net, a.clinician, a.clinician_ref_id \
             FROM activity a JOIN claim c ON c.id = a.claim_id WHERE c.claim_key_id = $1",
        )
        .bind(claim_key_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| {
                Ok(Activity {
                    id: r.try_get("id").map_err(db_err)?,
                    claim_id: r.try_get("claim_id").map_err(db_err)?,
                    activity_id: r.try_get("activity_id").map_err(db_err)?,
                    start_at: r.try_get("start_at").map_err(db_err)?,
                    activity_type: r.try_get("activity_type").map_err(db_err)?,
                    code: r.try_get("code").map_err(db_err)?,
                    code_ref_id: r.try_get("code_ref_id").map_err(db_err)?,
                    quantity: r.try_get("quantity").map_err(db_err)?,
                    net: r.try_get("net").map_err(db_err)?,
                    clinician: r.try_get("clinician").map_err(db_err)?,
                    clinician_ref_id: r.try_get("clinician_ref_id").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn remittance_activities_for_claim_key(
        &self,
        claim_key_id: i64,
    ) -> Result<Vec<(RemittanceClaim, RemittanceActivity)>, ErrorKind> {
        let rows = sqlx::query(
            "SELECT rc.id as rc_id, rc.claim_key_id, rc.remittance_id, rc.id_payer, rc.payer_ref_id, \
                    rc.provider_id, rc.provider_ref_id, rc.date_settlement, rc.payment_reference, \
                    ra.id as ra_id, ra.activity_id, ra.net, ra.payment_amount, ra.denial_code, ra.denial_code_ref_id \
             FROM remittance_activity ra JOIN remittance_claim rc ON rc.id = ra.remittance_claim_id \
             WHERE rc.claim_key_id = $1 ORDER BY rc.date_settlement, ra.id",
        )
        .bind(claim_key_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| {
                let rc = RemittanceClaim {
                    id: r.try_get("rc_id").map_err(db_err)?,
                    claim_key_id: r.try_get("claim_key_id").map_err(db_err)?,
                    remittance_id: r.try_get("remittance_id").map_err(db_err)?,
                    id_payer: r.try_get("id_payer").map_err(db_err)?,
                    payer_ref_id: r.try_get("payer_ref_id").map_err(db_err)?,
                    provider_id: r.try_get("provider_id").map_err(db_err)?,
                    provider_ref_id: r.try_get("provider_ref_id").map_err(db_err)?,
                    date_settlement: r.try_get("date_settlement").map_err(db_err)?,
                    payment_reference: r.try_get("payment_reference").map_err(db_err)?,
                };
                let ra = RemittanceActivity {
                    id: r.try_get("ra_id").map_err(db_err)?,
                    remittance_claim_id: rc.id,
                    activity_id: r.try_get("activity_id").map_err(db_err)?,
                    net: r.try_get("net").map_err(db_err)?,
                    payment_amount: r.try_get("payment_amount").map_err(db_err)?,
                    denial_code: r.try_get("denial_code").map_err(db_err)?,
                    denial_code_ref_id: r.try_get("denial_code_ref_id").map_err(db_err)?,
                };
                Ok((rc, ra))
            })
            .collect()
    }

    async fn events_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<ClaimEvent>, ErrorKind> {
        let rows = sqlx::query(
            "SELECT id, claim_key_id, event_time, event_type, source_submission_id, source_remittance_claim_id \
             FROM claim_event WHERE claim_key_id = $1 ORDER BY event_time, id",
        )
        .bind(claim_key_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| {
                Ok(ClaimEvent {
                    id: r.try_get("id").map_err(db_err)?,
                    claim_key_id: r.try_get("claim_key_id").map_err(db_err)?,
                    event_time: r.try_get("event_time").map_err(db_err)?,
                    event_type: event_type_from_code(r.try_get("event_type").map_err(db_err)?),
                    source_submission_id: r.try_get("source_submission_id").map_err(db_err)?,
                    source_remittance_claim_id: r.try_get("source_remittance_claim_id").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn upsert_activity_summary(&self, row: ClaimActivitySummary) -> Result<(), ErrorKind> {
        sqlx::query(
            "INSERT INTO claim_activity_summary \
             (claim_key_id, activity_id, submitted_amount, paid_amount, taken_back_amount, net_paid_amount, \
              rejected_amount, denied_amount, latest_denial_code, remittance_count, first_payment_date, \
              last_payment_date, activity_status, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14) \
             ON CONFLICT (claim_key_id, activity_id) DO UPDATE SET \
               submitted_amount = EXCLUDED.submitted_amount, paid_amount = EXCLUDED.paid_amount, \
               taken_back_amount = EXCLUDED.taken_back_amount, net_paid_amount = EXCLUDED.net_paid_amount, \
               rejected_amount = EXCLUDED.rejected_amount, denied_amount = EXCLUDED.denied_amount, \
               latest_denial_code = EXCLUDED.latest_denial_code, remittance_count = EXCLUDED.remittance_count, \
               first_payment_date = EXCLUDED.first_payment_date, last_payment_date = EXCLUDED.last_payment_date, \
               activity_status = EXCLUDED.activity_status, updated_at = EXCLUDED.updated_at",
        )
        .bind(row.claim_key_id)
        .bind(&row.activity_id)
        .bind(row.submitted_amount)
        .bind(row.paid_amount)
        .bind(row.taken_back_amount)
        .bind(row.net_paid_amount)
        .bind(row.rejected_amount)
        .bind(row.denied_amount)
        .bind(&row.latest_denial_code)
        .bind(row.remittance_count as i32)
        .bind(row.first_payment_date)
        .bind(row.last_payment_date)
        .bind(status_code(row.activity_status))
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_claim_payment(&self, row: ClaimPayment) -> Result<(), ErrorKind> {
        sqlx::query(
            "INSERT INTO claim_payment \
             (claim_key_id, total_submitted_amount, total_paid_amount, total_taken_back_amount, \
              total_net_paid_amount, total_rejected_amount, total_denied_amount, total_remitted_amount, \
              fully_paid_count, partially_paid_count, rejected_count, pending_count, taken_back_count, \
              partially_taken_back_count, first_submission_date, last_submission_date, first_settlement_date, \
              last_settlement_date, days_to_first_payment, processing_cycles, resubmission_count, \
              payment_status, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23) \
             ON CONFLICT (claim_key_id) DO UPDATE SET \
               total_submitted_amount = EXCLUDED.total_submitted_amount, \
               total_paid_amount = EXCLUDED.total_paid_amount, \
               total_taken_back_amount = EXCLUDED.total_taken_back_amount, \
               total_net_paid_amount = EXCLUDED.total_net_paid_amount, \
               total_rejected_amount = EXCLUDED.total_rejected_amount, \
               total_denied_amount = EXCLUDED.total_denied_amount, \
               total_remitted_amount = EXCLUDED.total_remitted_amount, \
               fully_paid_count = EXCLUDED.fully_paid_count, partially_paid_count = EXCLUDED.partially_paid_count, \
               rejected_count = EXCLUDED.rejected_count, pending_count = EXCLUDED.pending_count, \
               taken_back_count = EXCLUDED.taken_back_count, \
               partially_taken_back_count = EXCLUDED.partially_taken_back_count, \
               first_submission_date = EXCLUDED.first_submission_date, \
               last_submission_date = EXCLUDED.last_submission_date, \
               first_settlement_date = EXCLUDED.first_settlement_date, \
               last_settlement_date = EXCLUDED.last_settlement_date, \
               days_to_first_payment = EXCLUDED.days_to_first_payment, \
               processing_cycles = EXCLUDED.processing_cycles, resubmission_count = EXCLUDED.resubmission_count, \
               payment_status = EXCLUDED.payment_status, updated_at = EXCLUDED.updated_at",
        )
        .bind(row.claim_key_id)
        .bind(row.total_submitted_amount)
        .bind(row.total_paid_amount)
        .bind(row.total_taken_back_amount)
        .bind(row.total_net_paid_amount)
        .bind(row.total_rejected_amount)
        .bind(row.total_denied_amount)
        .bind(row.total_remitted_amount)
        .bind(row.fully_paid_count as i32)
        .bind(row.partially_paid_count as i32)
        .bind(row.rejected_count as i32)
        .bind(row.pending_count as i32)
        .bind(row.taken_back_count as i32)
        .bind(row.partially_taken_back_count as i32)
        .bind(row.first_submission_date)
        .bind(row.last_submission_date)
        .bind(row.first_settlement_date)
        .bind(row.last_settlement_date)
        .bind(row.days_to_first_payment)
        .bind(row.processing_cycles as i32)
        .bind(row.resubmission_count as i32)
        .bind(status_code(row.payment_status))
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn activity_summaries_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<ClaimActivitySummary>, ErrorKind> {
        let rows = sqlx::query(
            "SELECT claim_key_id, activity_id, submitted_amount, paid_amount, taken_back_amount, net_paid_amount, \
                    rejected_amount, denied_amount, latest_denial_code, remittance_count, first_payment_date, \
                    last_payment_date, activity_status, updated_at \
             FROM claim_activity_summary WHERE claim_key_id = $1",
        )
        .bind(claim_key_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| {
                Ok(ClaimActivitySummary {
                    claim_key_id: r.try_get("claim_key_id").map_err(db_err)?,
                    activity_id: r.try_get("activity_id").map_err(db_err)?,
                    submitted_amount: r.try_get("submitted_amount").map_err(db_err)?,
                    paid_amount: r.try_get("paid_amount").map_err(db_err)?,
                    taken_back_amount: r.try_get("taken_back_amount").map_err(db_err)?,
                    net_paid_amount: r.try_get("net_paid_amount").map_err(db_err)?,
                    rejected_amount: r.try_get("rejected_amount").map_err(db_err)?,
                    denied_amount: r.try_get("denied_amount").map_err(db_err)?,
                    latest_denial_code: r.try_get("latest_denial_code").map_err(db_err)?,
                    remittance_count: r.try_get::<i32, _>("remittance_count").map_err(db_err)? as u32,
                    first_payment_date: r.try_get("first_payment_date").map_err(db_err)?,
                    last_payment_date: r.try_get("last_payment_date").map_err(db_err)?,
                    activity_status: status_from_code(r.try_get("activity_status").map_err(db_err)?),
                    updated_at: r.try_get("updated_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn claim_payment_for_claim_key(&self, claim_key_id: i64) -> Result<Option<ClaimPayment>, ErrorKind> {
        let row = sqlx::query(
            "SELECT claim_key_id, total_submitted_amount, total_paid_amount, total_taken_back_amount, \
                    total_net_paid_amount, total_rejected_amount, total_denied_amount, total_remitted_amount, \
                    fully_paid_count, partially_paid_count, rejected_count, pending_count, taken_back_count, \
                    partially_taken_back_count, first_submission_date, last_submission_date, first_settlement_date, \
                    last_settlement_date, days_to_first_payment, processing_cycles, resubmission_count, \
                    payment_status, updated_at \
             FROM claim_payment WHERE claim_key_id = $1",
        )
        .bind(claim_key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| {
            Ok(ClaimPayment {
                claim_key_id: r.try_get("claim_key_id").map_err(db_err)?,
                total_submitted_amount: r.try_get("total_submitted_amount").map_err(db_err)?,
                total_paid_amount: r.try_get("total_paid_amount").map_err(db_err)?,
                total_taken_back_amount: r.try_get("total_taken_back_amount").map_err(db_err)?,
                total_net_paid_amount: r.try_get("total_net_paid_amount").map_err(db_err)?,
                total_rejected_amount: r.try_get("total_rejected_amount").map_err(db_err)?,
                total_denied_amount: r.try_get("total_denied_amount").map_err(db_err)?,
                total_remitted_amount: r.try_get("total_remitted_amount").map_err(db_err)?,
                fully_paid_count: r.try_get::<i32, _>("fully_paid_count").map_err(db_err)? as u32,
                partially_paid_count: r.try_get::<i32, _>("partially_paid_count").map_err(db_err)? as u32,
                rejected_count: r.try_get::<i32, _>("rejected_count").map_err(db_err)? as u32,
                pending_count: r.try_get::<i32, _>("pending_count").map_err(db_err)? as u32,
                taken_back_count: r.try_get::<i32, _>("taken_back_count").map_err(db_err)? as u32,
                partially_taken_back_count: r.try_get::<i32, _>("partially_taken_back_count").map_err(db_err)? as u32,
                first_submission_date: r.try_get("first_submission_date").map_err(db_err)?,
                last_submission_date: r.try_get("last_submission_date").map_err(db_err)?,
                first_settlement_date: r.try_get("first_settlement_date").map_err(db_err)?,
                last_settlement_date: r.try_get("last_settlement_date").map_err(db_err)?,
                days_to_first_payment: r.try_get("days_to_first_payment").map_err(db_err)?,
                processing_cycles: r.try_get::<i32, _>("processing_cycles").map_err(db_err)? as u32,
                resubmission_count: r.try_get::<i32, _>("resubmission_count").map_err(db_err)? as u32,
                payment_status: status_from_code(r.try_get("payment_status").map_err(db_err)?),
                updated_at: r.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn persisted_counts_for_file(&self, ingestion_file_id: i64) -> Result<PersistCounts, ErrorKind> {
        let mut counts = PersistCounts::default();
        let claim_rows = sqlx::query(
            "SELECT c.claim_key_id, COUNT(a.id) as activity_count \
             FROM claim c JOIN submission s ON s.id = c.submission_id \
             LEFT JOIN activity a ON a.claim_id = c.id \
             WHERE s.ingestion_file_id = $1 GROUP BY c.claim_key_id",
        )
        .bind(ingestion_file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for row in claim_rows {
            counts.claims += 1;
            counts.claim_key_ids.push(row.try_get("claim_key_id").map_err(db_err)?);
            counts.activities += row.try_get::<i64, _>("activity_count").map_err(db_err)? as u32;
        }

        let rem_rows = sqlx::query(
            "SELECT rc.claim_key_id, COUNT(ra.id) as activity_count \
             FROM remittance_claim rc JOIN remittance r ON r.id = rc.remittance_id \
             LEFT JOIN remittance_activity ra ON ra.remittance_claim_id = rc.id \
             WHERE r.ingestion_file_id = $1 GROUP BY rc.claim_key_id",
        )
        .bind(ingestion_file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for row in rem_rows {
            counts.claims += 1;
            counts.claim_key_ids.push(row.try_get("claim_key_id").map_err(db_err)?);
            counts.activities += row.try_get::<i64, _>("activity_count").map_err(db_err)? as u32;
        }

        Ok(counts)
    }

    async fn claim_keys_missing_events(&self, claim_key_ids: &[i64]) -> Result<Vec<i64>, ErrorKind> {
        if claim_key_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT ck.id FROM claim_key ck \
             WHERE ck.id = ANY($1) \
               AND NOT EXISTS (SELECT 1 FROM claim_event ce WHERE ce.claim_key_id = ck.id)",
        )
        .bind(claim_key_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| r.try_get("id").map_err(db_err)).collect()
    }

    async fn orphan_row_counts(&self) -> Result<super::store::OrphanCounts, ErrorKind> {
        let orphan_activities: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM activity a WHERE NOT EXISTS (SELECT 1 FROM claim c WHERE c.id = a.claim_id)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let orphan_observations: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM observation o WHERE NOT EXISTS (SELECT 1 FROM activity a WHERE a.id = o.activity_id)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(super::store::OrphanCounts {
            orphan_activities: orphan_activities as u32,
            orphan_observations: orphan_observations as u32,
        })
    }

    async fn create_run(&self, run: IngestionRun) -> Result<(), ErrorKind> {
        sqlx::query(
            "INSERT INTO ingestion_run (id, state, started_at, ended_at, reason, files_discovered, files_pulled, \
                                         files_ok, files_failed, files_already, acks_sent) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(run.id)
        .bind(run_state_code(run.state))
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.reason.map(run_reason_code))
        .bind(run.files_discovered as i64)
        .bind(run.files_pulled as i64)
        .bind(run.files_ok as i64)
        .bind(run.files_failed as i64)
        .bind(run.files_already as i64)
        .bind(run.acks_sent as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_run(&self, run: IngestionRun) -> Result<(), ErrorKind> {
        sqlx::query(
            "UPDATE ingestion_run SET state=$2, ended_at=$3, reason=$4, files_discovered=$5, files_pulled=$6, \
             files_ok=$7, files_failed=$8, files_already=$9, acks_sent=$10 WHERE id=$1",
        )
        .bind(run.id)
        .bind(run_state_code(run.state))
        .bind(run.ended_at)
        .bind(run.reason.map(run_reason_code))
        .bind(run.files_discovered as i64)
        .bind(run.files_pulled as i64)
        .bind(run.files_ok as i64)
        .bind(run.files_failed as i64)
        .bind(run.files_already as i64)
        .bind(run.acks_sent as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_file_audit(&self, audit: IngestionFileAudit) -> Result<i64, ErrorKind> {
        let row = sqlx::query(
            "INSERT INTO ingestion_file_audit \
             (run_id, ingestion_file_id, file_id, status, reason, parsed_claims, parsed_activities, \
              persisted_claims, persisted_activities, verification_ok, duration_ms, error_class, error_message, \
              total_gross, total_net, total_patient_share, unique_payers, unique_providers) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18) RETURNING id",
        )
        .bind(audit.run_id)
        .bind(audit.ingestion_file_id)
        .bind(&audit.file_id)
        .bind(file_audit_status_code(audit.status))
        .bind(&audit.reason)
        .bind(audit.parsed_claims as i32)
        .bind(audit.parsed_activities as i32)
        .bind(audit.persisted_claims as i32)
        .bind(audit.persisted_activities as i32)
        .bind(audit.verification_ok)
        .bind(audit.duration_ms as i64)
        .bind(&audit.error_class)
        .bind(&audit.error_message)
        .bind(audit.total_gross)
        .bind(audit.total_net)
        .bind(audit.total_patient_share)
        .bind(audit.unique_payers as i32)
        .bind(audit.unique_providers as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("id").map_err(db_err)
    }

    async fn write_ingestion_error(&self, err: IngestionError) -> Result<i64, ErrorKind> {
        let row = sqlx::query(
            "INSERT INTO ingestion_error (run_id, file_id, stage, object_type, error_code, message, retryable, occurred_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8) RETURNING id",
        )
        .bind(err.run_id)
        .bind(&err.file_id)
        .bind(&err.stage)
        .bind(&err.object_type)
        .bind(&err.error_code)
        .bind(&err.message)
        .bind(err.retryable)
        .bind(err.occurred_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("id").map_err(db_err)
    }
}

/// One attempt at persisting a submission file in a single transaction.
/// `persist_submission` wraps this with bounded backoff retry.
async fn persist_submission_once(
    store: &PostgresStore,
    ingestion_file_id: i64,
    mapped: &MappedSubmission,
    event_time: DateTime<Utc>,
) -> Result<PersistCounts, ErrorKind> {
    let mut tx = store.pool.begin().await.map_err(db_err)?;
    let submission_row = sqlx::query(
        "INSERT INTO submission (ingestion_file_id, sender_id, receiver_id, transaction_date, record_count) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(ingestion_file_id)
    .bind(&mapped.sender_id)
    .bind(&mapped.receiver_id)
    .bind(mapped.transaction_date)
    .bind(mapped.record_count as i32)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err)?;
    let submission_id: i64 = submission_row.try_get("id").map_err(db_err)?;

    let mut counts = PersistCounts::default();
    for c in &mapped.claims {
        let claim_key_id = claim_key_id_for_tx(&mut tx, &c.claim_id).await?;
        let is_resubmission = c.resubmission.is_some();

        let claim_row = sqlx::query(
            "INSERT INTO claim \
             (claim_key_id, submission_id, claim_id, id_payer, payer_ref_id, provider_id, provider_ref_id, \
              member_id, emirates_id_number, gross, patient_share, net, tx_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) \
             ON CONFLICT (submission_id, claim_key_id) DO UPDATE SET \
               id_payer = EXCLUDED.id_payer, payer_ref_id = EXCLUDED.payer_ref_id, \
               provider_id = EXCLUDED.provider_id, provider_ref_id = EXCLUDED.provider_ref_id, \
               member_id = EXCLUDED.member_id, emirates_id_number = EXCLUDED.emirates_id_number, \
               gross = EXCLUDED.gross, patient_share = EXCLUDED.patient_share, net = EXCLUDED.net, \
               tx_at = EXCLUDED.tx_at \
             RETURNING id",
        )
        .bind(claim_key_id)
        .bind(submission_id)
        .bind(&c.claim_id)
        .bind(&c.id_payer)
        .bind(c.payer_ref_id)
        .bind(&c.provider_id)
        .bind(c.provider_ref_id)
        .bind(&c.member_id)
        .bind(&c.emirates_id_number)
        .bind(c.gross)
        .bind(c.patient_share)
        .bind(c.net)
        .bind(c.tx_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let claim_row_id: i64 = claim_row.try_get("id").map_err(db_err)?;

        sqlx::query(
            "INSERT INTO encounter (claim_id, facility_id, facility_ref_id, encounter_type, start_at, end_at) \
             VALUES ($1,$2,$3,$4,$5,$6) \
             ON CONFLICT (claim_id) DO UPDATE SET \
               facility_id = EXCLUDED.facility_id, facility_ref_id = EXCLUDED.facility_ref_id, \
               encounter_type = EXCLUDED.encounter_type, start_at = EXCLUDED.start_at, end_at = EXCLUDED.end_at",
        )
        .bind(claim_row_id)
        .bind(&c.encounter.facility_id)
        .bind(c.encounter.facility_ref_id)
        .bind(&c.encounter.encounter_type)
        .bind(c.encounter.start_at)
        .bind(c.encounter.end_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for a in &c.activities {
            sqlx::query(
                "INSERT INTO activity \
                 (claim_id, activity_id, start_at, activity_type, code, code_ref_id, quantity, net, clinician, clinician_ref_id) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
                 ON CONFLICT (claim_id, activity_id) DO UPDATE SET \
                   start_at = EXCLUDED.start_at, activity_type = EXCLUDED.activity_type, code = EXCLUDED.code, \
                   code_ref_id = EXCLUDED.code_ref_id, quantity = EXCLUDED.quantity, net = EXCLUDED.net, \
                   clinician = EXCLUDED.clinician, clinician_ref_id = EXCLUDED.clinician_ref_id",
            )
            .bind(claim_row_id)
            .bind(&a.activity_id)
            .bind(a.start_at)
            .bind(&a.activity_type)
            .bind(&a.code)
            .bind(a.code_ref_id)
            .bind(a.quantity)
            .bind(a.net)
            .bind(&a.clinician)
            .bind(a.clinician_ref_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            counts.activities += 1;

            for o in &a.observations {
                sqlx::query(
                    "INSERT INTO observation (claim_id, activity_id, obs_type, code, value, value_type) \
                     VALUES ($1, (SELECT id FROM activity WHERE claim_id = $1 AND activity_id = $2), $3, $4, $5, $6)",
                )
                .bind(claim_row_id)
                .bind(&a.activity_id)
                .bind(&o.obs_type)
                .bind(&o.code)
                .bind(&o.value)
                .bind(&o.value_type)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        for d in &c.diagnoses {
            sqlx::query(
                "INSERT INTO diagnosis (claim_id, diagnosis_type, code, code_ref_id) VALUES ($1,$2,$3,$4)",
            )
            .bind(claim_row_id)
            .bind(&d.diagnosis_type)
            .bind(&d.code)
            .bind(d.code_ref_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        // Spec §4.3 step 6: exactly one SUBMISSION event per claim_key
        // (invariant 3) — a plain resubmission of the same claim with no
        // Resubmission block reuses the existing SUBMISSION event instead of
        // appending another one. RESUBMISSION events always append.
        let should_append_event = is_resubmission
            || sqlx::query(
                "SELECT 1 FROM claim_event WHERE claim_key_id = $1 AND event_type = $2 LIMIT 1",
            )
            .bind(claim_key_id)
            .bind(event_type_code(ClaimEventType::Submission))
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_none();

        if should_append_event {
            let event_type = if is_resubmission { ClaimEventType::Resubmission } else { ClaimEventType::Submission };
            let event_row = sqlx::query(
                "INSERT INTO claim_event (claim_key_id, event_time, event_type, source_submission_id) \
                 VALUES ($1,$2,$3,$4) RETURNING id",
            )
            .bind(claim_key_id)
            .bind(event_time)
            .bind(event_type_code(event_type))
            .bind(submission_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let event_id: i64 = event_row.try_get("id").map_err(db_err)?;

            if let Some(r) = &c.resubmission {
                sqlx::query(
                    "INSERT INTO claim_resubmission (claim_event_id, resubmission_type, comment) VALUES ($1,$2,$3)",
                )
                .bind(event_id)
                .bind(&r.resubmission_type)
                .bind(&r.comment)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            sqlx::query(
                "INSERT INTO claim_status_timeline (claim_key_id, last_event_type, last_event_time, last_event_id) \
                 VALUES ($1,$2,$3,$4) \
                 ON CONFLICT (claim_key_id) DO UPDATE SET \
                   last_event_type = EXCLUDED.last_event_type, last_event_time = EXCLUDED.last_event_time, \
                   last_event_id = EXCLUDED.last_event_id",
            )
            .bind(claim_key_id)
            .bind(event_type_code(event_type))
            .bind(event_time)
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        counts.claim_key_ids.push(claim_key_id);
        counts.claims += 1;
    }

    tx.commit().await.map_err(db_err)?;
    Ok(counts)
}

/// One attempt at persisting a remittance advice file in a single
/// transaction. `persist_remittance` wraps this with the same bounded
/// backoff retry as submissions.
async fn persist_remittance_once(
    store: &PostgresStore,
    ingestion_file_id: i64,
    mapped: &MappedRemittance,
    event_time: DateTime<Utc>,
) -> Result<PersistCounts, ErrorKind> {
    let mut tx = store.pool.begin().await.map_err(db_err)?;
    let remittance_row = sqlx::query(
        "INSERT INTO remittance (ingestion_file_id, sender_id, receiver_id, transaction_date, record_count) \
         VALUES ($1,$2,$3,$4,$5) RETURNING id",
    )
    .bind(ingestion_file_id)
    .bind(&mapped.sender_id)
    .bind(&mapped.receiver_id)
    .bind(mapped.transaction_date)
    .bind(mapped.record_count as i32)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err)?;
    let remittance_id: i64 = remittance_row.try_get("id").map_err(db_err)?;

    let mut counts = PersistCounts::default();
    for c in &mapped.claims {
        let claim_key_id = claim_key_id_for_tx(&mut tx, &c.claim_id).await?;

        let rc_row = sqlx::query(
            "INSERT INTO remittance_claim \
             (claim_key_id, remittance_id, id_payer, payer_ref_id, provider_id, provider_ref_id, date_settlement, payment_reference) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
             ON CONFLICT (remittance_id, claim_key_id) DO UPDATE SET \
               id_payer = EXCLUDED.id_payer, payer_ref_id = EXCLUDED.payer_ref_id, \
               provider_id = EXCLUDED.provider_id, provider_ref_id = EXCLUDED.provider_ref_id, \
               date_settlement = EXCLUDED.date_settlement, payment_reference = EXCLUDED.payment_reference \
             RETURNING id",
        )
        .bind(claim_key_id)
        .bind(remittance_id)
        .bind(&c.id_payer)
        .bind(c.payer_ref_id)
        .bind(&c.provider_id)
        .bind(c.provider_ref_id)
        .bind(c.date_settlement)
        .bind(&c.payment_reference)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let remittance_claim_id: i64 = rc_row.try_get("id").map_err(db_err)?;

        for a in &c.activities {
            sqlx::query(
                "INSERT INTO remittance_activity \
                 (remittance_claim_id, activity_id, net, payment_amount, denial_code, denial_code_ref_id) \
                 VALUES ($1,$2,$3,$4,$5,$6)",
            )
            .bind(remittance_claim_id)
            .bind(&a.activity_id)
            .bind(a.net)
            .bind(a.payment_amount)
            .bind(&a.denial_code)
            .bind(a.denial_code_ref_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            counts.activities += 1;
        }

        let event_row = sqlx::query(
            "INSERT INTO claim_event (claim_key_id, event_time, event_type, source_remittance_claim_id) \
             VALUES ($1,$2,$3,$4) RETURNING id",
        )
        .bind(claim_key_id)
        .bind(event_time)
        .bind(event_type_code(ClaimEventType::Remittance))
        .bind(remittance_claim_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let event_id: i64 = event_row.try_get("id").map_err(db_err)?;

        sqlx::query(
            "INSERT INTO claim_status_timeline (claim_key_id, last_event_type, last_event_time, last_event_id) \
             VALUES ($1,$2,$3,$4) \
             ON CONFLICT (claim_key_id) DO UPDATE SET \
               last_event_type = EXCLUDED.last_event_type, last_event_time = EXCLUDED.last_event_time, \
               last_event_id = EXCLUDED.last_event_id",
        )
        .bind(claim_key_id)
        .bind(event_type_code(ClaimEventType::Remittance))
        .bind(event_time)
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        counts.claim_key_ids.push(claim_key_id);
        counts.claims += 1;
    }

    tx.commit().await.map_err(db_err)?;
    Ok(counts)
}

fn run_state_code(s: RunState) -> i16 {
    match s {
        RunState::Starting => 1,
        RunState::Running => 2,
        RunState::Draining => 3,
        RunState::Ended => 4,
    }
}

fn run_reason_code(r: RunReason) -> i16 {
    match r {
        RunReason::Completed => 1,
        RunReason::Cancelled => 2,
        RunReason::FetcherExhausted => 3,
    }
}

fn file_audit_status_code(s: FileAuditStatus) -> i16 {
    s as i16
}

/// Reference-data lookups back onto a single `reference_code (kind, code, id)`
/// table, shared across all seven `RefKind`s rather than one table per kind —
/// the Mapper only ever needs id-by-(kind, code), so one narrow table with a
/// `(kind, code)` unique index covers every case uniformly.
#[async_trait]
impl RefResolver for PostgresStore {
    async fn resolve(&self, kind: RefKind, code: &str) -> Result<Option<i64>, ErrorKind> {
        let row = sqlx::query("SELECT id FROM reference_code WHERE kind = $1 AND code = $2")
            .bind(ref_kind_code(kind))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get("id").map_err(db_err)).transpose()
    }

    async fn insert(&self, kind: RefKind, code: &str) -> Result<i64, ErrorKind> {
        let row = sqlx::query(
            "INSERT INTO reference_code (kind, code) VALUES ($1, $2) \
             ON CONFLICT (kind, code) DO UPDATE SET code = EXCLUDED.code \
             RETURNING id",
        )
        .bind(ref_kind_code(kind))
        .bind(code)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("id").map_err(db_err)
    }

    async fn record_discovery(&self, kind: RefKind, code: &str, auto_inserted: bool) -> Result<(), ErrorKind> {
        sqlx::query(
            "INSERT INTO code_discovery_audit (code, kind, auto_inserted, discovered_at) VALUES ($1,$2,$3,$4)",
        )
        .bind(code)
        .bind(format!("{kind:?}"))
        .bind(auto_inserted)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
