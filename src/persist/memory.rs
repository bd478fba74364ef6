//! In-memory `PersistStore`, used by unit/integration tests. Correctness
//! matters here as much as it does in `postgres`: this is what the scenario
//! tests in `tests/` exercise.
//!
//! Concurrency model is deliberately simpler than Postgres's row-level
//! locking: one `tokio::sync::Mutex` around the whole table set.
//! This backend exists to make tests fast and deterministic, not to model
//! production throughput, so coarse locking is the right tradeoff — the
//! claim-key lock ordering Postgres uses is about avoiding deadlocks between
//! concurrent connections, which a single in-process mutex can't deadlock on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::aggregate_rows::{ClaimActivitySummary, ClaimPayment};
use crate::domain::audit::{FileAuditStatus, IngestionError, IngestionFileAudit, IngestionRun};
use crate::domain::claim::{
    Activity, Claim, ClaimEvent, ClaimEventType, ClaimKey, ClaimResubmission, ClaimStatusTimeline, Diagnosis,
    Encounter, Observation, Submission,
};
use crate::domain::audit::CodeDiscoveryAudit;
use crate::domain::remittance::{Remittance, RemittanceActivity, RemittanceClaim};
use crate::domain::IngestionFile;
use crate::errors::ErrorKind;
use crate::mapper::{MappedRemittance, MappedSubmission, RefKind, RefResolver};

use super::store::{NewIngestionFile, PersistCounts, PersistStore, UpsertFileOutcome};

#[derive(Default)]
struct Tables {
    next_id: i64,
    ingestion_files: Vec<IngestionFile>,
    claim_key_by_claim_id: HashMap<String, i64>,
    claim_keys: HashMap<i64, ClaimKey>,
    submissions: Vec<Submission>,
    remittances: Vec<Remittance>,
    claims: Vec<Claim>,
    encounters: Vec<Encounter>,
    activities: Vec<Activity>,
    observations: Vec<Observation>,
    diagnoses: Vec<Diagnosis>,
    resubmissions: Vec<ClaimResubmission>,
    remittance_claims: Vec<RemittanceClaim>,
    remittance_activities: Vec<RemittanceActivity>,
    claim_events: Vec<ClaimEvent>,
    status_timelines: HashMap<i64, ClaimStatusTimeline>,
    activity_summaries: HashMap<(i64, String), ClaimActivitySummary>,
    claim_payments: HashMap<i64, ClaimPayment>,
    runs: HashMap<Uuid, IngestionRun>,
    file_audits: Vec<IngestionFileAudit>,
    ingestion_errors: Vec<IngestionError>,
    ref_ids: HashMap<(RefKind, String), i64>,
    discoveries: Vec<CodeDiscoveryAudit>,
}

impl Tables {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn claim_key_id_for(&mut self, claim_id: &str) -> i64 {
        if let Some(id) = self.claim_key_by_claim_id.get(claim_id) {
            return *id;
        }
        let id = self.alloc_id();
        self.claim_key_by_claim_id.insert(claim_id.to_string(), id);
        self.claim_keys.insert(id, ClaimKey { id, claim_id: claim_id.to_string() });
        id
    }

    fn upsert_claim(&mut self, mut claim: Claim) -> i64 {
        if let Some(existing) = self
            .claims
            .iter_mut()
            .find(|c| c.submission_id == claim.submission_id && c.claim_key_id == claim.claim_key_id)
        {
            claim.id = existing.id;
            *existing = claim;
            existing.id
        } else {
            claim.id = self.alloc_id();
            let id = claim.id;
            self.claims.push(claim);
            id
        }
    }

    fn upsert_encounter(&mut self, mut enc: Encounter) {
        if let Some(existing) = self.encounters.iter_mut().find(|e| e.claim_id == enc.claim_id) {
            enc.id = existing.id;
            *existing = enc;
        } else {
            enc.id = self.alloc_id();
            self.encounters.push(enc);
        }
    }

    fn upsert_activity(&mut self, mut act: Activity) -> i64 {
        if let Some(existing) = self
            .activities
            .iter_mut()
            .find(|a| a.claim_id == act.claim_id && a.activity_id == act.activity_id)
        {
            act.id = existing.id;
            *existing = act;
            existing.id
        } else {
            act.id = self.alloc_id();
            let id = act.id;
            self.activities.push(act);
            id
        }
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Test-only fault injection: strip every `ClaimEvent` for `claim_key_id`,
    /// simulating a bug in the event-insert path so Verify's integrity check
    /// can be exercised.
    pub async fn delete_events_for_claim_key(&self, claim_key_id: i64) {
        let mut t = self.tables.lock().await;
        t.claim_events.retain(|e| e.claim_key_id != claim_key_id);
    }
}

#[async_trait]
impl PersistStore for MemoryStore {
    async fn upsert_ingestion_file(&self, file: NewIngestionFile) -> Result<UpsertFileOutcome, ErrorKind> {
        let mut t = self.tables.lock().await;
        if let Some(existing) = t.ingestion_files.iter().find(|f| f.file_id == file.file_id) {
            let existing_id = existing.id;
            // A prior OK audit makes this a no-op (ALREADY); a prior
            // FAILED/FAILED_TERMINAL audit allows reprocessing under the same
            // IngestionFile row instead of permanently wedging the file.
            let had_ok_audit = t
                .file_audits
                .iter()
                .any(|a| a.file_id == file.file_id && a.status == FileAuditStatus::Ok);
            return Ok(UpsertFileOutcome { ingestion_file_id: existing_id, already_existed: had_ok_audit });
        }
        let id = t.alloc_id();
        t.ingestion_files.push(IngestionFile {
            id,
            file_id: file.file_id,
            root_type: file.root_type,
            sender_id: file.sender_id,
            receiver_id: file.receiver_id,
            transaction_date: file.transaction_date,
            record_count: file.record_count,
            byte_hash: file.byte_hash,
        });
        Ok(UpsertFileOutcome { ingestion_file_id: id, already_existed: false })
    }

    async fn persist_submission(
        &self,
        ingestion_file_id: i64,
        mapped: MappedSubmission,
        event_time: DateTime<Utc>,
    ) -> Result<PersistCounts, ErrorKind> {
        let mut t = self.tables.lock().await;
        let submission_id = t.alloc_id();
        t.submissions.push(Submission {
            id: submission_id,
            ingestion_file_id,
            sender_id: mapped.sender_id,
            receiver_id: mapped.receiver_id,
            transaction_date: mapped.transaction_date,
            record_count: mapped.record_count,
        });

        let mut counts = PersistCounts::default();
        for new_claim in mapped.claims {
            let claim_key_id = t.claim_key_id_for(&new_claim.claim_id);
            let is_resubmission = new_claim.resubmission.is_some();

            let claim_id = t.upsert_claim(Claim {
                id: 0,
                claim_key_id,
                submission_id,
                claim_id: new_claim.claim_id.clone(),
                id_payer: new_claim.id_payer,
                payer_ref_id: new_claim.payer_ref_id,
                provider_id: new_claim.provider_id,
                provider_ref_id: new_claim.provider_ref_id,
                member_id: new_claim.member_id,
                emirates_id_number: new_claim.emirates_id_number,
                gross: new_claim.gross,
                patient_share: new_claim.patient_share,
                net: new_claim.net,
                tx_at: new_claim.tx_at,
            });

            t.upsert_encounter(Encounter {
                id: 0,
                claim_id,
                facility_id: new_claim.encounter.facility_id,
                facility_ref_id: new_claim.encounter.facility_ref_id,
                encounter_type: new_claim.encounter.encounter_type,
                start_at: new_claim.encounter.start_at,
                end_at: new_claim.encounter.end_at,
            });

            for new_activity in new_claim.activities {
                let activity_row_id = t.upsert_activity(Activity {
                    id: 0,
                    claim_id,
                    activity_id: new_activity.activity_id,
                    start_at: new_activity.start_at,
                    activity_type: new_activity.activity_type,
                    code: new_activity.code,
                    code_ref_id: new_activity.code_ref_id,
                    quantity: new_activity.quantity,
                    net: new_activity.net,
                    clinician: new_activity.clinician,
                    clinician_ref_id: new_activity.clinician_ref_id,
                });
                t.observations.retain(|o| o.activity_id != activity_row_id);
                for obs in new_activity.observations {
                    let obs_id = t.alloc_id();
                    t.observations.push(Observation {
                        id: obs_id,
                        activity_id: activity_row_id,
                        obs_type: obs.obs_type,
                        code: obs.code,
                        value: obs.value,
                        value_type: obs.value_type,
                    });
                }
                counts.activities += 1;
            }

            t.diagnoses.retain(|d| d.claim_id != claim_id);
            for diag in new_claim.diagnoses {
                let diag_id = t.alloc_id();
                t.diagnoses.push(Diagnosis {
                    id: diag_id,
                    claim_id,
                    diagnosis_type: diag.diagnosis_type,
                    code: diag.code,
                    code_ref_id: diag.code_ref_id,
                });
            }

            // Exactly one SUBMISSION event per claim_key: a plain resubmission of
            // the same claim with no Resubmission block reuses the existing
            // SUBMISSION event rather than appending another one. RESUBMISSION
            // events always append.
            let already_has_submission_event = t
                .claim_events
                .iter()
                .any(|e| e.claim_key_id == claim_key_id && e.event_type == ClaimEventType::Submission);
            if is_resubmission || !already_has_submission_event {
                let event_id = t.alloc_id();
                let event_type = if is_resubmission { ClaimEventType::Resubmission } else { ClaimEventType::Submission };
                t.claim_events.push(ClaimEvent {
                    id: event_id,
                    claim_key_id,
                    event_time,
                    event_type,
                    source_submission_id: Some(submission_id),
                    source_remittance_claim_id: None,
                });
                if let Some(resub) = new_claim.resubmission {
                    let resub_id = t.alloc_id();
                    t.resubmissions.push(ClaimResubmission {
                        id: resub_id,
                        claim_event_id: event_id,
                        resubmission_type: resub.resubmission_type,
                        comment: resub.comment,
                    });
                }
                t.status_timelines.insert(
                    claim_key_id,
                    ClaimStatusTimeline { claim_key_id, last_event_type: event_type, last_event_time: event_time, last_event_id: event_id },
                );
            }

            counts.claim_key_ids.push(claim_key_id);
            counts.claims += 1;
        }

        Ok(counts)
    }

    async fn persist_remittance(
        &self,
        ingestion_file_id: i64,
        mapped: MappedRemittance,
        event_time: DateTime<Utc>,
    ) -> Result<PersistCounts, ErrorKind> {
        let mut t = self.tables.lock().await;
        let remittance_id = t.alloc_id();
        t.remittances.push(Remittance {
            id: remittance_id,
            ingestion_file_id,
            sender_id: mapped.sender_id,
            receiver_id: mapped.receiver_id,
            transaction_date: mapped.transaction_date,
            record_count: mapped.record_count,
        });

        let mut counts = PersistCounts::default();
        for new_claim in mapped.claims {
            let claim_key_id = t.claim_key_id_for(&new_claim.claim_id);

            let remittance_claim_id = if let Some(existing) = t
                .remittance_claims
                .iter()
                .find(|rc| rc.remittance_id == remittance_id && rc.claim_key_id == claim_key_id)
            {
                existing.id
            } else {
                let id = t.alloc_id();
                t.remittance_claims.push(RemittanceClaim {
                    id,
                    claim_key_id,
                    remittance_id,
                    id_payer: new_claim.id_payer,
                    payer_ref_id: new_claim.payer_ref_id,
                    provider_id: new_claim.provider_id,
                    provider_ref_id: new_claim.provider_ref_id,
                    date_settlement: new_claim.date_settlement,
                    payment_reference: new_claim.payment_reference,
                });
                id
            };

            for activity in new_claim.activities {
                let id = t.alloc_id();
                t.remittance_activities.push(RemittanceActivity {
                    id,
                    remittance_claim_id,
                    activity_id: activity.activity_id,
                    net: activity.net,
                    payment_amount: activity.payment_amount,
                    denial_code: activity.denial_code,
                    denial_code_ref_id: activity.denial_code_ref_id,
                });
                counts.activities += 1;
            }

            let event_id = t.alloc_id();
            t.claim_events.push(ClaimEvent {
                id: event_id,
                claim_key_id,
                event_time,
                event_type: ClaimEventType::Remittance,
                source_submission_id: None,
                source_remittance_claim_id: Some(remittance_claim_id),
            });
            t.status_timelines.insert(
                claim_key_id,
                ClaimStatusTimeline {
                    claim_key_id,
                    last_event_type: ClaimEventType::Remittance,
                    last_event_time: event_time,
                    last_event_id: event_id,
                },
            );

            counts.claim_key_ids.push(claim_key_id);
            counts.claims += 1;
        }

        Ok(counts)
    }

    async fn claim_key_id_for(&self, claim_id: &str) -> Result<Option<i64>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(t.claim_key_by_claim_id.get(claim_id).copied())
    }

    async fn claim_for_key(&self, claim_key_id: i64) -> Result<Option<Claim>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(t.claims
            .iter()
            .filter(|c| c.claim_key_id == claim_key_id)
            .max_by_key(|c| c.id)
            .cloned())
    }

    async fn activities_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<Activity>, ErrorKind> {
        let t = self.tables.lock().await;
        let claim_ids: Vec<i64> = t.claims.iter().filter(|c| c.claim_key_id == claim_key_id).map(|c| c.id).collect();
        Ok(t.activities.iter().filter(|a| claim_ids.contains(&a.claim_id)).cloned().collect())
    }

    async fn remittance_activities_for_claim_key(
        &self,
        claim_key_id: i64,
    ) -> Result<Vec<(RemittanceClaim, RemittanceActivity)>, ErrorKind> {
        let t = self.tables.lock().await;
        let rc_ids: Vec<i64> =
            t.remittance_claims.iter().filter(|rc| rc.claim_key_id == claim_key_id).map(|rc| rc.id).collect();
        let mut out = Vec::new();
        for ra in t.remittance_activities.iter().filter(|ra| rc_ids.contains(&ra.remittance_claim_id)) {
            let rc = t.remittance_claims.iter().find(|rc| rc.id == ra.remittance_claim_id).unwrap().clone();
            out.push((rc, ra.clone()));
        }
        Ok(out)
    }

    async fn events_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<ClaimEvent>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(t.claim_events.iter().filter(|e| e.claim_key_id == claim_key_id).cloned().collect())
    }

    async fn upsert_activity_summary(&self, row: ClaimActivitySummary) -> Result<(), ErrorKind> {
        let mut t = self.tables.lock().await;
        t.activity_summaries.insert((row.claim_key_id, row.activity_id.clone()), row);
        Ok(())
    }

    async fn upsert_claim_payment(&self, row: ClaimPayment) -> Result<(), ErrorKind> {
        let mut t = self.tables.lock().await;
        t.claim_payments.insert(row.claim_key_id, row);
        Ok(())
    }

    async fn activity_summaries_for_claim_key(&self, claim_key_id: i64) -> Result<Vec<ClaimActivitySummary>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(t.activity_summaries.values().filter(|s| s.claim_key_id == claim_key_id).cloned().collect())
    }

    async fn claim_payment_for_claim_key(&self, claim_key_id: i64) -> Result<Option<ClaimPayment>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(t.claim_payments.get(&claim_key_id).cloned())
    }

    async fn persisted_counts_for_file(&self, ingestion_file_id: i64) -> Result<PersistCounts, ErrorKind> {
        let t = self.tables.lock().await;
        let mut counts = PersistCounts::default();
        if let Some(sub) = t.submissions.iter().find(|s| s.ingestion_file_id == ingestion_file_id) {
            for claim in t.claims.iter().filter(|c| c.submission_id == sub.id) {
                counts.claims += 1;
                counts.claim_key_ids.push(claim.claim_key_id);
                counts.activities += t.activities.iter().filter(|a| a.claim_id == claim.id).count() as u32;
            }
        }
        if let Some(rem) = t.remittances.iter().find(|r| r.ingestion_file_id == ingestion_file_id) {
            for rc in t.remittance_claims.iter().filter(|rc| rc.remittance_id == rem.id) {
                counts.claims += 1;
                counts.claim_key_ids.push(rc.claim_key_id);
                counts.activities += t.remittance_activities.iter().filter(|ra| ra.remittance_claim_id == rc.id).count() as u32;
            }
        }
        Ok(counts)
    }

    async fn claim_keys_missing_events(&self, claim_key_ids: &[i64]) -> Result<Vec<i64>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(claim_key_ids
            .iter()
            .copied()
            .filter(|id| !t.claim_events.iter().any(|e| e.claim_key_id == *id))
            .collect())
    }

    async fn orphan_row_counts(&self) -> Result<super::store::OrphanCounts, ErrorKind> {
        let t = self.tables.lock().await;
        let claim_ids: std::collections::HashSet<i64> = t.claims.iter().map(|c| c.id).collect();
        let orphan_activities = t.activities.iter().filter(|a| !claim_ids.contains(&a.claim_id)).count() as u32;
        let activity_ids: std::collections::HashSet<i64> = t.activities.iter().map(|a| a.id).collect();
        let orphan_observations = t.observations.iter().filter(|o| !activity_ids.contains(&o.activity_id)).count() as u32;
        Ok(super::store::OrphanCounts { orphan_activities, orphan_observations })
    }

    async fn create_run(&self, run: IngestionRun) -> Result<(), ErrorKind> {
        let mut t = self.tables.lock().await;
        t.runs.insert(run.id, run);
        Ok(())
    }

    async fn update_run(&self, run: IngestionRun) -> Result<(), ErrorKind> {
        let mut t = self.tables.lock().await;
        t.runs.insert(run.id, run);
        Ok(())
    }

    async fn write_file_audit(&self, mut audit: IngestionFileAudit) -> Result<i64, ErrorKind> {
        let mut t = self.tables.lock().await;
        audit.id = t.alloc_id();
        let id = audit.id;
        t.file_audits.push(audit);
        Ok(id)
    }

    async fn write_ingestion_error(&self, mut err: IngestionError) -> Result<i64, ErrorKind> {
        let mut t = self.tables.lock().await;
        err.id = t.alloc_id();
        let id = err.id;
        t.ingestion_errors.push(err);
        Ok(id)
    }
}

#[async_trait]
impl RefResolver for MemoryStore {
    async fn resolve(&self, kind: RefKind, code: &str) -> Result<Option<i64>, ErrorKind> {
        let t = self.tables.lock().await;
        Ok(t.ref_ids.get(&(kind, code.to_string())).copied())
    }

    async fn insert(&self, kind: RefKind, code: &str) -> Result<i64, ErrorKind> {
        let mut t = self.tables.lock().await;
        if let Some(id) = t.ref_ids.get(&(kind, code.to_string())) {
            return Ok(*id);
        }
        let id = t.alloc_id();
        t.ref_ids.insert((kind, code.to_string()), id);
        Ok(id)
    }

    async fn record_discovery(&self, kind: RefKind, code: &str, auto_inserted: bool) -> Result<(), ErrorKind> {
        let mut t = self.tables.lock().await;
        let id = t.alloc_id();
        t.discoveries.push(CodeDiscoveryAudit {
            id,
            code: code.to_string(),
            kind: format!("{kind:?}"),
            auto_inserted,
            discovered_at: Utc::now(),
        });
        Ok(())
    }
}
