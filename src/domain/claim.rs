//! Submission-side entities: ClaimKey, Submission, Claim and its children, and
//! the append-only event/timeline rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// The canonical identity spine of a claim. Shared by Claim and
/// RemittanceClaim; never deleted by the core while any dependent row exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub id: i64,
    pub claim_id: String,
}

/// One submission document; one-to-one with an `IngestionFile` of root_type=1.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: i64,
    pub ingestion_file_id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: DateTime<Utc>,
    pub record_count: u32,
}

/// One claim within a submission. Unique `(submission_id, claim_key_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub id: i64,
    pub claim_key_id: i64,
    pub submission_id: i64,
    pub claim_id: String,
    pub id_payer: String,
    pub payer_ref_id: Option<i64>,
    pub provider_id: String,
    pub provider_ref_id: Option<i64>,
    pub member_id: String,
    pub emirates_id_number: Option<String>,
    pub gross: Decimal,
    pub patient_share: Decimal,
    pub net: Decimal,
    pub tx_at: DateTime<Utc>,
}

/// Encounter child of Claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Encounter {
    pub id: i64,
    pub claim_id: i64,
    pub facility_id: String,
    pub facility_ref_id: Option<i64>,
    pub encounter_type: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

/// Activity child of Claim, uniquely identified within a claim by
/// `activity_id`. `net` is always non-negative.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: i64,
    pub claim_id: i64,
    pub activity_id: String,
    pub start_at: DateTime<Utc>,
    pub activity_type: String,
    pub code: String,
    pub code_ref_id: Option<i64>,
    pub quantity: Decimal,
    pub net: Decimal,
    pub clinician: String,
    pub clinician_ref_id: Option<i64>,
}

/// Observation child of Activity.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id: i64,
    pub activity_id: i64,
    pub obs_type: String,
    pub code: String,
    pub value: Option<String>,
    pub value_type: Option<String>,
}

/// Diagnosis child of Claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub id: i64,
    pub claim_id: i64,
    pub diagnosis_type: String,
    pub code: String,
    pub code_ref_id: Option<i64>,
}

/// Lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimEventType {
    Submission = 1,
    Resubmission = 2,
    Remittance = 3,
}

/// Append-only lifecycle record: exactly one SUBMISSION event per claim_key,
/// a RESUBMISSION event for every genuine resubmission, and a REMITTANCE
/// event per settled remittance line.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimEvent {
    pub id: i64,
    pub claim_key_id: i64,
    pub event_time: DateTime<Utc>,
    pub event_type: ClaimEventType,
    pub source_submission_id: Option<i64>,
    pub source_remittance_claim_id: Option<i64>,
}

/// Attached to a RESUBMISSION event.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimResubmission {
    pub id: i64,
    pub claim_event_id: i64,
    pub resubmission_type: String,
    pub comment: String,
}

/// Derived current status per claim_key, updated on every ClaimEvent insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimStatusTimeline {
    pub claim_key_id: i64,
    pub last_event_type: ClaimEventType,
    pub last_event_time: DateTime<Utc>,
    pub last_event_id: i64,
}

/// A parsed submission claim's resubmission block, carried through the DTO/RowSet
/// boundary before it becomes a `ClaimResubmission` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResubmissionInfo {
    pub resubmission_type: String,
    pub comment: String,
}
