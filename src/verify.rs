//! Side-effect-free post-commit check that what persistence wrote matches
//! what the parser counted, the last line of defense against a silent
//! partial write.

use crate::errors::ErrorKind;
use crate::parser::ParsedCounts;
use crate::persist::PersistStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyMismatch {
    pub field: &'static str,
    pub expected: u32,
    pub actual: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub mismatches: Vec<VerifyMismatch>,
}

/// Compare parse-time counts against what was actually read back from the
/// store for `ingestion_file_id`, then check two structural invariants: every
/// persisted claim has at least one `ClaimEvent`, and no orphaned child rows
/// exist (`Activity` without `Claim`, `Observation` without `Activity`).
/// Never mutates anything.
pub async fn verify(
    store: &dyn PersistStore,
    ingestion_file_id: i64,
    parsed_counts: ParsedCounts,
) -> Result<VerifyOutcome, ErrorKind> {
    let persisted = store.persisted_counts_for_file(ingestion_file_id).await?;

    let mut mismatches = Vec::new();
    if persisted.claims != parsed_counts.claims {
        mismatches.push(VerifyMismatch { field: "claims", expected: parsed_counts.claims, actual: persisted.claims });
    }
    if persisted.activities != parsed_counts.activities {
        mismatches.push(VerifyMismatch {
            field: "activities",
            expected: parsed_counts.activities,
            actual: persisted.activities,
        });
    }

    let missing_events = store.claim_keys_missing_events(&persisted.claim_key_ids).await?;
    if !missing_events.is_empty() {
        mismatches.push(VerifyMismatch {
            field: "claims_missing_events",
            expected: 0,
            actual: missing_events.len() as u32,
        });
    }

    let orphans = store.orphan_row_counts().await?;
    if orphans.orphan_activities > 0 {
        mismatches.push(VerifyMismatch { field: "orphan_activities", expected: 0, actual: orphans.orphan_activities });
    }
    if orphans.orphan_observations > 0 {
        mismatches.push(VerifyMismatch {
            field: "orphan_observations",
            expected: 0,
            actual: orphans.orphan_observations,
        });
    }

    Ok(VerifyOutcome { ok: mismatches.is_empty(), mismatches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RootType;
    use crate::mapper::{MappedSubmission, NewActivity, NewClaim, NewEncounter};
    use crate::persist::{MemoryStore, NewIngestionFile};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn matching_counts_verify_ok() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(NewIngestionFile {
                file_id: "f1".into(),
                root_type: RootType::Submission,
                sender_id: "S".into(),
                receiver_id: "R".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        let mapped = MappedSubmission {
            sender_id: "S".into(),
            receiver_id: "R".into(),
            transaction_date: now,
            record_count: 1,
            claims: vec![NewClaim {
                claim_id: "C1".into(),
                id_payer: "P".into(),
                payer_ref_id: None,
                provider_id: "PR".into(),
                provider_ref_id: None,
                member_id: "M".into(),
                emirates_id_number: None,
                gross: dec!(100),
                patient_share: dec!(0),
                net: dec!(100),
                tx_at: now,
                encounter: NewEncounter {
                    facility_id: "F".into(),
                    facility_ref_id: None,
                    encounter_type: "1".into(),
                    start_at: now,
                    end_at: None,
                },
                activities: vec![NewActivity {
                    claim_id: "C1".into(),
                    activity_id: "A1".into(),
                    start_at: now,
                    activity_type: "3".into(),
                    code: "1".into(),
                    code_ref_id: None,
                    quantity: dec!(1),
                    net: dec!(100),
                    clinician: "CL".into(),
                    clinician_ref_id: None,
                    observations: vec![],
                }],
                diagnoses: vec![],
                resubmission: None,
            }],
        };
        store.persist_submission(file.ingestion_file_id, mapped, now).await.unwrap();

        let parsed_counts = ParsedCounts { claims: 1, activities: 1, observations: 0, diagnoses: 0, encounters: 1, events: 1 };
        let outcome = verify(&store, file.ingestion_file_id, parsed_counts).await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.mismatches.is_empty());
    }

    #[tokio::test]
    async fn claim_with_no_events_fails_verification() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(NewIngestionFile {
                file_id: "f3".into(),
                root_type: RootType::Submission,
                sender_id: "S".into(),
                receiver_id: "R".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        let mapped = MappedSubmission {
            sender_id: "S".into(),
            receiver_id: "R".into(),
            transaction_date: now,
            record_count: 1,
            claims: vec![NewClaim {
                claim_id: "C1".into(),
                id_payer: "P".into(),
                payer_ref_id: None,
                provider_id: "PR".into(),
                provider_ref_id: None,
                member_id: "M".into(),
                emirates_id_number: None,
                gross: dec!(100),
                patient_share: dec!(0),
                net: dec!(100),
                tx_at: now,
                encounter: NewEncounter {
                    facility_id: "F".into(),
                    facility_ref_id: None,
                    encounter_type: "1".into(),
                    start_at: now,
                    end_at: None,
                },
                activities: vec![NewActivity {
                    claim_id: "C1".into(),
                    activity_id: "A1".into(),
                    start_at: now,
                    activity_type: "3".into(),
                    code: "1".into(),
                    code_ref_id: None,
                    quantity: dec!(1),
                    net: dec!(100),
                    clinician: "CL".into(),
                    clinician_ref_id: None,
                    observations: vec![],
                }],
                diagnoses: vec![],
                resubmission: None,
            }],
        };
        store.persist_submission(file.ingestion_file_id, mapped, now).await.unwrap();
        let claim_key_id = store.claim_key_id_for("C1").await.unwrap().unwrap();
        store.delete_events_for_claim_key(claim_key_id).await;

        let parsed_counts = ParsedCounts { claims: 1, activities: 1, observations: 0, diagnoses: 0, encounters: 1, events: 1 };
        let outcome = verify(&store, file.ingestion_file_id, parsed_counts).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.mismatches.iter().any(|m| m.field == "claims_missing_events"));
    }

    #[tokio::test]
    async fn mismatched_activity_count_fails_verification() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(NewIngestionFile {
                file_id: "f2".into(),
                root_type: RootType::Submission,
                sender_id: "S".into(),
                receiver_id: "R".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        // Nothing persisted for this file, but parser claims it saw a claim.
        let parsed_counts = ParsedCounts { claims: 1, activities: 2, observations: 0, diagnoses: 0, encounters: 1, events: 1 };
        let outcome = verify(&store, file.ingestion_file_id, parsed_counts).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.mismatches.len(), 2);
    }
}
