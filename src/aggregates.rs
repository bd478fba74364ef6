//! Aggregates. Recomputes the two derived rollup tables from source rows
//! every time, rather than applying deltas, so replays and out-of-order
//! arrival always converge to the same answer.
//!
//! Both functions are pure with respect to their `&dyn PersistStore`
//! argument: same stored rows in, same aggregate rows out, no matter how
//! many times or in what order they're called for a given `claim_key_id`.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::domain::aggregate_rows::{ActivityStatus, ClaimActivitySummary, ClaimPayment};
use crate::domain::claim::ClaimEventType;
use crate::errors::ErrorKind;
use crate::persist::PersistStore;

struct ActivityTally {
    submission_known: bool,
    submitted_amount: Decimal,
    positive_payments: Decimal,
    taken_back_amount: Decimal,
    latest_denial_code: Option<String>,
    latest_denial_date: Option<NaiveDate>,
    latest_denial_activity_id: i64,
    remittance_count: u32,
    first_payment_date: Option<NaiveDate>,
    last_payment_date: Option<NaiveDate>,
}

/// Recompute every `ClaimActivitySummary` row for `claim_key_id` from the
/// submitted activities and all remittance lines seen so far, and write them
/// back.
pub async fn recalculate_activity_summary(
    store: &dyn PersistStore,
    claim_key_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<ClaimActivitySummary>, ErrorKind> {
    let activities = store.activities_for_claim_key(claim_key_id).await?;
    let remittance_lines = store.remittance_activities_for_claim_key(claim_key_id).await?;

    let mut tallies: HashMap<String, ActivityTally> = HashMap::new();
    for activity in &activities {
        tallies.entry(activity.activity_id.clone()).or_insert(ActivityTally {
            submission_known: true,
            submitted_amount: activity.net,
            positive_payments: Decimal::ZERO,
            taken_back_amount: Decimal::ZERO,
            latest_denial_code: None,
            latest_denial_date: None,
            latest_denial_activity_id: 0,
            remittance_count: 0,
            first_payment_date: None,
            last_payment_date: None,
        });
    }

    for (remittance_claim, line) in &remittance_lines {
        let tally = tallies.entry(line.activity_id.clone()).or_insert(ActivityTally {
            submission_known: false,
            submitted_amount: Decimal::ZERO,
            positive_payments: Decimal::ZERO,
            taken_back_amount: Decimal::ZERO,
            latest_denial_code: None,
            latest_denial_date: None,
            latest_denial_activity_id: 0,
            remittance_count: 0,
            first_payment_date: None,
            last_payment_date: None,
        });

        tally.remittance_count += 1;
        if line.payment_amount > Decimal::ZERO {
            tally.positive_payments += line.payment_amount;
            tally.first_payment_date = Some(match tally.first_payment_date {
                Some(d) if d <= remittance_claim.date_settlement => d,
                _ => remittance_claim.date_settlement,
            });
            tally.last_payment_date = Some(match tally.last_payment_date {
                Some(d) if d >= remittance_claim.date_settlement => d,
                _ => remittance_claim.date_settlement,
            });
        } else if line.payment_amount < Decimal::ZERO {
            tally.taken_back_amount += -line.payment_amount;
        }

        if line.denial_code.is_some() {
            let is_newer = match tally.latest_denial_date {
                Some(d) => (remittance_claim.date_settlement, line.id) >= (d, tally.latest_denial_activity_id),
                None => true,
            };
            if is_newer {
                tally.latest_denial_code = line.denial_code.clone();
                tally.latest_denial_date = Some(remittance_claim.date_settlement);
                tally.latest_denial_activity_id = line.id;
            }
        }
    }

    let mut rows = Vec::with_capacity(tallies.len());
    for (activity_id, tally) in tallies {
        // Remittance arrived before the submission that owns this activity_id:
        // no aggregate row is written until the submission lands.
        if !tally.submission_known {
            continue;
        }
        let paid_amount = tally.positive_payments.min(tally.submitted_amount);
        let net_paid_amount = (paid_amount - tally.taken_back_amount).max(Decimal::ZERO);
        // rejected_amount is submitted_amount when a denial code is on record and
        // nothing was paid; denied_amount mirrors it exactly.
        let rejected_amount = if tally.latest_denial_code.is_some() && paid_amount == Decimal::ZERO {
            tally.submitted_amount
        } else {
            Decimal::ZERO
        };
        let denied_amount = rejected_amount;

        let status = ActivityStatus::classify(tally.submitted_amount, paid_amount, tally.taken_back_amount, net_paid_amount, rejected_amount);

        rows.push(ClaimActivitySummary {
            claim_key_id,
            activity_id,
            submitted_amount: tally.submitted_amount,
            paid_amount,
            taken_back_amount: tally.taken_back_amount,
            net_paid_amount,
            rejected_amount,
            denied_amount,
            latest_denial_code: tally.latest_denial_code,
            remittance_count: tally.remittance_count,
            first_payment_date: tally.first_payment_date,
            last_payment_date: tally.last_payment_date,
            activity_status: status,
            updated_at: now,
        });
    }

    for row in &rows {
        store.upsert_activity_summary(row.clone()).await?;
    }
    Ok(rows)
}

/// Recompute the single `ClaimPayment` rollup row for `claim_key_id` from its
/// activity summaries and event history, and write it back.
pub async fn recalculate_claim_payment(
    store: &dyn PersistStore,
    claim_key_id: i64,
    now: DateTime<Utc>,
) -> Result<ClaimPayment, ErrorKind> {
    let summaries = store.activity_summaries_for_claim_key(claim_key_id).await?;
    let events = store.events_for_claim_key(claim_key_id).await?;
    let remittance_lines = store.remittance_activities_for_claim_key(claim_key_id).await?;

    let mut total_submitted_amount = Decimal::ZERO;
    let mut total_paid_amount = Decimal::ZERO;
    let mut total_taken_back_amount = Decimal::ZERO;
    let mut total_net_paid_amount = Decimal::ZERO;
    let mut total_rejected_amount = Decimal::ZERO;
    let mut total_denied_amount = Decimal::ZERO;
    let mut fully_paid_count = 0u32;
    let mut partially_paid_count = 0u32;
    let mut rejected_count = 0u32;
    let mut pending_count = 0u32;
    let mut taken_back_count = 0u32;
    let mut partially_taken_back_count = 0u32;
    let mut first_payment_date: Option<NaiveDate> = None;

    for s in &summaries {
        total_submitted_amount += s.submitted_amount;
        total_paid_amount += s.paid_amount;
        total_taken_back_amount += s.taken_back_amount;
        total_net_paid_amount += s.net_paid_amount;
        total_rejected_amount += s.rejected_amount;
        total_denied_amount += s.denied_amount;
        match s.activity_status {
            ActivityStatus::FullyPaid => fully_paid_count += 1,
            ActivityStatus::PartiallyPaid => partially_paid_count += 1,
            ActivityStatus::Rejected => rejected_count += 1,
            ActivityStatus::Pending => pending_count += 1,
            ActivityStatus::TakenBack => taken_back_count += 1,
            ActivityStatus::PartiallyTakenBack => partially_taken_back_count += 1,
        }
        if let Some(d) = s.first_payment_date {
            first_payment_date = Some(match first_payment_date {
                Some(existing) if existing <= d => existing,
                _ => d,
            });
        }
    }

    let mut first_submission_date: Option<DateTime<Utc>> = None;
    let mut last_submission_date: Option<DateTime<Utc>> = None;
    let mut resubmission_count = 0u32;
    for e in &events {
        if matches!(e.event_type, ClaimEventType::Submission | ClaimEventType::Resubmission) {
            first_submission_date = Some(match first_submission_date {
                Some(d) if d <= e.event_time => d,
                _ => e.event_time,
            });
            last_submission_date = Some(match last_submission_date {
                Some(d) if d >= e.event_time => d,
                _ => e.event_time,
            });
        }
        if matches!(e.event_type, ClaimEventType::Resubmission) {
            resubmission_count += 1;
        }
    }

    let mut first_settlement_date: Option<NaiveDate> = None;
    let mut last_settlement_date: Option<NaiveDate> = None;
    let mut distinct_remittances = std::collections::HashSet::new();
    for (rc, _) in &remittance_lines {
        distinct_remittances.insert(rc.remittance_id);
        first_settlement_date = Some(match first_settlement_date {
            Some(d) if d <= rc.date_settlement => d,
            _ => rc.date_settlement,
        });
        last_settlement_date = Some(match last_settlement_date {
            Some(d) if d >= rc.date_settlement => d,
            _ => rc.date_settlement,
        });
    }

    let days_to_first_payment = match (first_submission_date, first_payment_date) {
        (Some(sub), Some(pay)) => Some((pay - sub.date_naive()).num_days()),
        _ => None,
    };

    let payment_status = ActivityStatus::classify(
        total_submitted_amount,
        total_paid_amount,
        total_taken_back_amount,
        total_net_paid_amount,
        total_rejected_amount,
    );

    let row = ClaimPayment {
        claim_key_id,
        total_submitted_amount,
        total_paid_amount,
        total_taken_back_amount,
        total_net_paid_amount,
        total_rejected_amount,
        total_denied_amount,
        total_remitted_amount: total_paid_amount,
        fully_paid_count,
        partially_paid_count,
        rejected_count,
        pending_count,
        taken_back_count,
        partially_taken_back_count,
        first_submission_date,
        last_submission_date,
        first_settlement_date,
        last_settlement_date,
        days_to_first_payment,
        processing_cycles: distinct_remittances.len() as u32,
        resubmission_count,
        payment_status,
        updated_at: now,
    };

    store.upsert_claim_payment(row.clone()).await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{MappedRemittance, MappedSubmission, NewActivity, NewClaim, NewEncounter, NewRemittanceActivity, NewRemittanceClaim};
    use crate::persist::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn submission_with_one_activity(claim_id: &str, activity_id: &str, net: Decimal) -> MappedSubmission {
        MappedSubmission {
            sender_id: "S".into(),
            receiver_id: "R".into(),
            transaction_date: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            record_count: 1,
            claims: vec![NewClaim {
                claim_id: claim_id.into(),
                id_payer: "PAYER".into(),
                payer_ref_id: None,
                provider_id: "PROV".into(),
                provider_ref_id: None,
                member_id: "M1".into(),
                emirates_id_number: None,
                gross: net,
                patient_share: dec!(0),
                net,
                tx_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                encounter: NewEncounter {
                    facility_id: "F1".into(),
                    facility_ref_id: None,
                    encounter_type: "1".into(),
                    start_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                    end_at: None,
                },
                activities: vec![NewActivity {
                    claim_id: claim_id.into(),
                    activity_id: activity_id.into(),
                    start_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                    activity_type: "3".into(),
                    code: "99213".into(),
                    code_ref_id: None,
                    quantity: dec!(1),
                    net,
                    clinician: "CLIN1".into(),
                    clinician_ref_id: None,
                    observations: vec![],
                }],
                diagnoses: vec![],
                resubmission: None,
            }],
        }
    }

    fn remittance_with_payment(claim_id: &str, activity_id: &str, net: Decimal, payment: Decimal, denial: Option<&str>) -> MappedRemittance {
        MappedRemittance {
            sender_id: "PAYER".into(),
            receiver_id: "PROV".into(),
            transaction_date: Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
            record_count: 1,
            claims: vec![NewRemittanceClaim {
                claim_id: claim_id.into(),
                id_payer: "PAYER".into(),
                payer_ref_id: None,
                provider_id: "PROV".into(),
                provider_ref_id: None,
                date_settlement: chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
                payment_reference: "REF1".into(),
                activities: vec![NewRemittanceActivity {
                    activity_id: activity_id.into(),
                    net,
                    payment_amount: payment,
                    denial_code: denial.map(|s| s.to_string()),
                    denial_code_ref_id: None,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn fully_paid_claim_rolls_up_correctly() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f1".into(),
                root_type: crate::domain::RootType::Submission,
                sender_id: "S".into(),
                receiver_id: "R".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_submission(file.ingestion_file_id, submission_with_one_activity("C1", "A1", dec!(100)), now)
            .await
            .unwrap();
        let claim_key_id = store.claim_key_id_for("C1").await.unwrap().unwrap();

        let file2 = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f2".into(),
                root_type: crate::domain::RootType::Remittance,
                sender_id: "PAYER".into(),
                receiver_id: "PROV".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_remittance(file2.ingestion_file_id, remittance_with_payment("C1", "A1", dec!(100), dec!(100), None), now)
            .await
            .unwrap();

        recalculate_activity_summary(&store, claim_key_id, now).await.unwrap();
        let claim_payment = recalculate_claim_payment(&store, claim_key_id, now).await.unwrap();

        assert_eq!(claim_payment.total_submitted_amount, dec!(100));
        assert_eq!(claim_payment.total_net_paid_amount, dec!(100));
        assert_eq!(claim_payment.payment_status, ActivityStatus::FullyPaid);
        assert_eq!(claim_payment.fully_paid_count, 1);
    }

    #[tokio::test]
    async fn overpayment_is_capped_at_submitted_amount() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f1".into(),
                root_type: crate::domain::RootType::Submission,
                sender_id: "S".into(),
                receiver_id: "R".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_submission(file.ingestion_file_id, submission_with_one_activity("C2", "A1", dec!(100)), now)
            .await
            .unwrap();
        let claim_key_id = store.claim_key_id_for("C2").await.unwrap().unwrap();

        let file2 = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f2".into(),
                root_type: crate::domain::RootType::Remittance,
                sender_id: "PAYER".into(),
                receiver_id: "PROV".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        // Two remittance lines totalling 150 against a 100 submission.
        store
            .persist_remittance(file2.ingestion_file_id, remittance_with_payment("C2", "A1", dec!(100), dec!(80), None), now)
            .await
            .unwrap();
        let file3 = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f3".into(),
                root_type: crate::domain::RootType::Remittance,
                sender_id: "PAYER".into(),
                receiver_id: "PROV".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_remittance(file3.ingestion_file_id, remittance_with_payment("C2", "A1", dec!(100), dec!(70), None), now)
            .await
            .unwrap();

        let summaries = recalculate_activity_summary(&store, claim_key_id, now).await.unwrap();
        assert_eq!(summaries[0].paid_amount, dec!(100));
    }

    #[tokio::test]
    async fn takeback_reduces_net_paid_below_submitted() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f1".into(),
                root_type: crate::domain::RootType::Submission,
                sender_id: "S".into(),
                receiver_id: "R".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_submission(file.ingestion_file_id, submission_with_one_activity("C3", "A1", dec!(200)), now)
            .await
            .unwrap();
        let claim_key_id = store.claim_key_id_for("C3").await.unwrap().unwrap();

        let file2 = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f2".into(),
                root_type: crate::domain::RootType::Remittance,
                sender_id: "PAYER".into(),
                receiver_id: "PROV".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_remittance(file2.ingestion_file_id, remittance_with_payment("C3", "A1", dec!(200), dec!(150), None), now)
            .await
            .unwrap();
        let file3 = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f3".into(),
                root_type: crate::domain::RootType::Remittance,
                sender_id: "PAYER".into(),
                receiver_id: "PROV".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_remittance(file3.ingestion_file_id, remittance_with_payment("C3", "A1", dec!(200), dec!(-50), None), now)
            .await
            .unwrap();

        let summaries = recalculate_activity_summary(&store, claim_key_id, now).await.unwrap();
        assert_eq!(summaries[0].paid_amount, dec!(150));
        assert_eq!(summaries[0].taken_back_amount, dec!(50));
        assert_eq!(summaries[0].net_paid_amount, dec!(100));
        assert_eq!(summaries[0].activity_status, ActivityStatus::PartiallyTakenBack);
    }

    #[tokio::test]
    async fn remittance_only_activity_writes_no_summary_row() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let file = store
            .upsert_ingestion_file(crate::persist::NewIngestionFile {
                file_id: "f1".into(),
                root_type: crate::domain::RootType::Remittance,
                sender_id: "PAYER".into(),
                receiver_id: "PROV".into(),
                transaction_date: now,
                record_count: 1,
                byte_hash: None,
            })
            .await
            .unwrap();
        store
            .persist_remittance(file.ingestion_file_id, remittance_with_payment("C4", "A1", dec!(100), dec!(50), None), now)
            .await
            .unwrap();
        let claim_key_id = store.claim_key_id_for("C4").await.unwrap().unwrap();

        let summaries = recalculate_activity_summary(&store, claim_key_id, now).await.unwrap();
        assert!(summaries.is_empty());

        let persisted = store.activity_summaries_for_claim_key(claim_key_id).await.unwrap();
        assert!(persisted.is_empty());
    }
}
