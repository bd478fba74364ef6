//! Worker pool. Each worker pulls one `WorkItem` at a time from the queue
//! and drives it through the full per-file pipeline: Parse → Map → Persist →
//! Aggregate → Verify → Ack.
//!
//! The decision points a worker makes follow the `FileState` sub-state
//! transitions: an `ALREADY` file short-circuits straight to acking, a
//! verification mismatch skips acking so the source redelivers the file,
//! and a terminal failure still gets acked (with the terminal flag) so a
//! document that can never succeed doesn't wedge the source's retry queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::acker::Acker;
use crate::aggregates::{recalculate_activity_summary, recalculate_claim_payment};
use crate::config::Config;
use crate::domain::audit::{FileAuditStatus, IngestionError, IngestionFileAudit};
use crate::domain::RootType;
use crate::errors::ErrorKind;
use crate::mapper::{self, Mapped, RefResolver};
use crate::message::WorkItem;
use crate::parser;
use crate::persist::{NewIngestionFile, PersistStore};
use crate::queue::BoundedQueue;
use crate::verify;

pub struct PipelineOutcome {
    pub file_id: String,
    pub status: FileAuditStatus,
    pub duration: Duration,
    pub claim_key_ids: Vec<i64>,
    pub acked: bool,
}

#[derive(Default, Clone, Copy)]
struct RowCounts {
    parsed_claims: u32,
    parsed_activities: u32,
    persisted_claims: u32,
    persisted_activities: u32,
}

/// Drive one `WorkItem` through the full pipeline.
pub async fn process_item(
    item: WorkItem,
    store: &dyn PersistStore,
    resolver: &dyn RefResolver,
    acker: &dyn Acker,
    config: &Config,
    run_id: Uuid,
) -> PipelineOutcome {
    let start = Instant::now();
    let file_id = item.file_id.clone();
    let now = Utc::now();

    let parsed = match parser::parse(&item.bytes) {
        Ok(p) => p,
        Err(e) => {
            let error_kind: ErrorKind = e.into();
            record_error(store, run_id, &file_id, "parse", &error_kind, now).await;
            let acked = acker.ack(&file_id, &item.source, true).await.is_ok();
            write_audit(store, run_id, &file_id, None, FileAuditStatus::FailedTerminal, Some(error_kind.code()), now, start, Default::default(), Default::default()).await;
            return PipelineOutcome { file_id, status: FileAuditStatus::FailedTerminal, duration: start.elapsed(), claim_key_ids: vec![], acked };
        }
    };

    let (root_type, sender_id, receiver_id, transaction_date, record_count) = match &parsed.root {
        parser::ParsedRoot::Submission(s) => (RootType::Submission, s.header.sender_id.clone(), s.header.receiver_id.clone(), s.header.transaction_date, s.header.record_count),
        parser::ParsedRoot::Remittance(r) => (RootType::Remittance, r.header.sender_id.clone(), r.header.receiver_id.clone(), r.header.transaction_date, r.header.record_count),
    };

    let row_counts = RowCounts {
        parsed_claims: parsed.counts.claims,
        parsed_activities: parsed.counts.activities,
        ..Default::default()
    };

    let upsert_outcome = match store
        .upsert_ingestion_file(NewIngestionFile {
            file_id: file_id.clone(),
            root_type,
            sender_id,
            receiver_id,
            transaction_date,
            record_count,
            byte_hash: None,
        })
        .await
    {
        Ok(o) => o,
        Err(e) => {
            record_error(store, run_id, &file_id, "persist.upsert_ingestion_file", &e, now).await;
            write_audit(store, run_id, &file_id, None, FileAuditStatus::Failed, Some(e.code()), now, start, Default::default(), row_counts).await;
            return PipelineOutcome { file_id, status: FileAuditStatus::Failed, duration: start.elapsed(), claim_key_ids: vec![], acked: false };
        }
    };

    if upsert_outcome.already_existed {
        let acked = acker.ack(&file_id, &item.source, false).await.is_ok();
        write_audit(store, run_id, &file_id, Some(upsert_outcome.ingestion_file_id), FileAuditStatus::Already, None, now, start, Default::default(), row_counts).await;
        return PipelineOutcome { file_id, status: FileAuditStatus::Already, duration: start.elapsed(), claim_key_ids: vec![], acked };
    }

    let mapped = match mapper::map(&parsed, resolver, config.refdata_auto_insert).await {
        Ok(m) => m,
        Err(e) => {
            record_error(store, run_id, &file_id, "mapper", &e, now).await;
            let terminal = e.terminal();
            // Only a terminal failure is acked (so the source stops re-offering a
            // document that can never succeed); a retryable one is left unacked
            // so it comes back around next run.
            let acked = terminal && acker.ack(&file_id, &item.source, true).await.is_ok();
            let status = if terminal { FileAuditStatus::FailedTerminal } else { FileAuditStatus::Failed };
            write_audit(store, run_id, &file_id, Some(upsert_outcome.ingestion_file_id), status, Some(e.code()), now, start, Default::default(), row_counts).await;
            return PipelineOutcome { file_id, status, duration: start.elapsed(), claim_key_ids: vec![], acked };
        }
    };

    let financials = summarize_financials(&mapped);

    let persist_result = match &mapped {
        Mapped::Submission(s) => store.persist_submission(upsert_outcome.ingestion_file_id, s.clone(), now).await,
        Mapped::Remittance(r) => store.persist_remittance(upsert_outcome.ingestion_file_id, r.clone(), now).await,
    };
    let persist_counts = match persist_result {
        Ok(c) => c,
        Err(e) => {
            record_error(store, run_id, &file_id, "persist", &e, now).await;
            let terminal = e.terminal();
            let acked = terminal && acker.ack(&file_id, &item.source, true).await.is_ok();
            let status = if terminal { FileAuditStatus::FailedTerminal } else { FileAuditStatus::Failed };
            write_audit(store, run_id, &file_id, Some(upsert_outcome.ingestion_file_id), status, Some(e.code()), now, start, Default::default(), row_counts).await;
            return PipelineOutcome { file_id, status, duration: start.elapsed(), claim_key_ids: vec![], acked };
        }
    };

    let row_counts = RowCounts {
        persisted_claims: persist_counts.claims,
        persisted_activities: persist_counts.activities,
        ..row_counts
    };

    let distinct_claim_keys: Vec<i64> = persist_counts.claim_key_ids.iter().copied().collect::<HashSet<_>>().into_iter().collect();
    for claim_key_id in &distinct_claim_keys {
        if let Err(e) = recalculate_activity_summary(store, *claim_key_id, now).await {
            record_error(store, run_id, &file_id, "aggregates.activity_summary", &e, now).await;
        }
        if let Err(e) = recalculate_claim_payment(store, *claim_key_id, now).await {
            record_error(store, run_id, &file_id, "aggregates.claim_payment", &e, now).await;
        }
    }

    let verify_outcome = match verify::verify(store, upsert_outcome.ingestion_file_id, parsed.counts).await {
        Ok(v) => v,
        Err(e) => {
            record_error(store, run_id, &file_id, "verify", &e, now).await;
            write_audit(store, run_id, &file_id, Some(upsert_outcome.ingestion_file_id), FileAuditStatus::Failed, Some(e.code()), now, start, financials, row_counts).await;
            return PipelineOutcome { file_id, status: FileAuditStatus::Failed, duration: start.elapsed(), claim_key_ids: distinct_claim_keys, acked: false };
        }
    };

    if !verify_outcome.ok {
        tracing::error!(file_id = %file_id, mismatches = ?verify_outcome.mismatches, "verification mismatch, skipping ack");
        write_audit(store, run_id, &file_id, Some(upsert_outcome.ingestion_file_id), FileAuditStatus::Failed, Some("VERIFICATION_MISMATCH"), now, start, financials, row_counts).await;
        return PipelineOutcome { file_id, status: FileAuditStatus::Failed, duration: start.elapsed(), claim_key_ids: distinct_claim_keys, acked: false };
    }

    let acked = acker.ack(&file_id, &item.source, false).await.is_ok();
    write_audit(store, run_id, &file_id, Some(upsert_outcome.ingestion_file_id), FileAuditStatus::Ok, None, now, start, financials, row_counts).await;
    PipelineOutcome { file_id, status: FileAuditStatus::Ok, duration: start.elapsed(), claim_key_ids: distinct_claim_keys, acked }
}

/// Worker pool: `worker_count` tasks pulling from the same queue until the
/// queue is dropped. Each finished item's outcome is sent down
/// `results` for the Orchestrator to fold into run-level counters.
pub async fn run_pool(
    worker_count: usize,
    queue: Arc<BoundedQueue<WorkItem>>,
    store: Arc<dyn PersistStore>,
    resolver: Arc<dyn RefResolver>,
    acker: Arc<dyn Acker>,
    config: Arc<Config>,
    run_id: Uuid,
    results: tokio::sync::mpsc::Sender<PipelineOutcome>,
) {
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = queue.clone();
        let store = store.clone();
        let resolver = resolver.clone();
        let acker = acker.clone();
        let config = config.clone();
        let results = results.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = queue.take().await;
                let file_id = item.file_id.clone();
                let start = Instant::now();
                let now = Utc::now();
                let deadline = Duration::from_millis(config.file_timeout_ms);
                let outcome = match tokio::time::timeout(
                    deadline,
                    process_item(item, store.as_ref(), resolver.as_ref(), acker.as_ref(), &config, run_id),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let error_kind = ErrorKind::Timeout(format!("processing {file_id} exceeded {}ms", config.file_timeout_ms));
                        record_error(store.as_ref(), run_id, &file_id, "worker.deadline", &error_kind, now).await;
                        write_audit(
                            store.as_ref(),
                            run_id,
                            &file_id,
                            None,
                            FileAuditStatus::Failed,
                            Some(error_kind.code()),
                            now,
                            start,
                            Default::default(),
                            Default::default(),
                        )
                        .await;
                        PipelineOutcome { file_id, status: FileAuditStatus::Failed, duration: start.elapsed(), claim_key_ids: vec![], acked: false }
                    }
                };
                if results.send(outcome).await.is_err() {
                    break;
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

#[derive(Default, Clone, Copy)]
struct FinancialTotals {
    gross: Decimal,
    net: Decimal,
    patient_share: Decimal,
    unique_payers: u32,
    unique_providers: u32,
}

fn summarize_financials(mapped: &Mapped) -> FinancialTotals {
    match mapped {
        Mapped::Submission(s) => {
            let mut payers = HashSet::new();
            let mut providers = HashSet::new();
            let mut totals = FinancialTotals::default();
            for c in &s.claims {
                totals.gross += c.gross;
                totals.net += c.net;
                totals.patient_share += c.patient_share;
                payers.insert(c.id_payer.clone());
                providers.insert(c.provider_id.clone());
            }
            totals.unique_payers = payers.len() as u32;
            totals.unique_providers = providers.len() as u32;
            totals
        }
        Mapped::Remittance(r) => {
            let mut payers = HashSet::new();
            let mut providers = HashSet::new();
            let mut totals = FinancialTotals::default();
            for c in &r.claims {
                payers.insert(c.id_payer.clone());
                providers.insert(c.provider_id.clone());
                for a in &c.activities {
                    totals.net += a.payment_amount;
                }
            }
            totals.unique_payers = payers.len() as u32;
            totals.unique_providers = providers.len() as u32;
            totals
        }
    }
}

async fn record_error(store: &dyn PersistStore, run_id: Uuid, file_id: &str, stage: &str, error: &ErrorKind, occurred_at: chrono::DateTime<Utc>) {
    let _ = store
        .write_ingestion_error(IngestionError {
            id: 0,
            run_id,
            file_id: Some(file_id.to_string()),
            stage: stage.to_string(),
            object_type: "ingestion_file".to_string(),
            error_code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.retryable(),
            occurred_at,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn write_audit(
    store: &dyn PersistStore,
    run_id: Uuid,
    file_id: &str,
    ingestion_file_id: Option<i64>,
    status: FileAuditStatus,
    error_class: Option<&str>,
    now: chrono::DateTime<Utc>,
    start: Instant,
    financials: FinancialTotals,
    row_counts: RowCounts,
) {
    let _ = store
        .write_file_audit(IngestionFileAudit {
            id: 0,
            run_id,
            ingestion_file_id,
            file_id: file_id.to_string(),
            status,
            reason: None,
            parsed_claims: row_counts.parsed_claims,
            parsed_activities: row_counts.parsed_activities,
            persisted_claims: row_counts.persisted_claims,
            persisted_activities: row_counts.persisted_activities,
            verification_ok: matches!(status, FileAuditStatus::Ok | FileAuditStatus::Already),
            duration_ms: start.elapsed().as_millis() as u64,
            error_class: error_class.map(|s| s.to_string()),
            error_message: None,
            total_gross: financials.gross,
            total_net: financials.net,
            total_patient_share: financials.patient_share,
            unique_payers: financials.unique_payers,
            unique_providers: financials.unique_providers,
        })
        .await;
    let _ = now;
}
