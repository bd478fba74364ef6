//! Parser output DTOs. A tagged `Parsed` tree dispatched on root element —
//! no subtype hierarchy, Mapper/Persist branch once on the tag.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeader {
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: DateTime<Utc>,
    pub record_count: u32,
    pub disposition_flag: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedObservation {
    pub obs_type: String,
    pub code: String,
    pub value: Option<String>,
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedActivity {
    pub id: String,
    pub start: DateTime<Utc>,
    pub activity_type: String,
    pub code: String,
    pub quantity: Decimal,
    pub net: Decimal,
    pub clinician: String,
    pub observations: Vec<ParsedObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDiagnosis {
    pub diagnosis_type: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEncounter {
    pub facility_id: String,
    pub encounter_type: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResubmission {
    pub resubmission_type: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSubmissionClaim {
    pub id: String,
    pub id_payer: String,
    pub provider_id: String,
    pub member_id: String,
    pub emirates_id_number: Option<String>,
    pub gross: Decimal,
    pub patient_share: Decimal,
    pub net: Decimal,
    pub encounter: ParsedEncounter,
    pub activities: Vec<ParsedActivity>,
    pub diagnoses: Vec<ParsedDiagnosis>,
    pub resubmission: Option<ParsedResubmission>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSubmission {
    pub header: ParsedHeader,
    pub claims: Vec<ParsedSubmissionClaim>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRemittanceActivity {
    pub id: String,
    pub net: Decimal,
    pub payment_amount: Decimal,
    pub denial_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRemittanceClaim {
    pub id: String,
    pub id_payer: String,
    pub provider_id: String,
    pub date_settlement: NaiveDate,
    pub payment_reference: String,
    pub activities: Vec<ParsedRemittanceActivity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRemittance {
    pub header: ParsedHeader,
    pub claims: Vec<ParsedRemittanceClaim>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRoot {
    Submission(ParsedSubmission),
    Remittance(ParsedRemittance),
}

/// Parse-time counts, used by Verify and the audit row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedCounts {
    pub claims: u32,
    pub activities: u32,
    pub observations: u32,
    pub diagnoses: u32,
    pub encounters: u32,
    pub events: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub root: ParsedRoot,
    pub counts: ParsedCounts,
}

impl ParsedSubmission {
    pub fn counts(&self) -> ParsedCounts {
        let mut c = ParsedCounts {
            claims: self.claims.len() as u32,
            encounters: self.claims.len() as u32,
            ..Default::default()
        };
        for claim in &self.claims {
            c.activities += claim.activities.len() as u32;
            c.diagnoses += claim.diagnoses.len() as u32;
            c.observations += claim.activities.iter().map(|a| a.observations.len() as u32).sum::<u32>();
            // One SUBMISSION event per claim, plus one RESUBMISSION if present.
            c.events += 1 + claim.resubmission.is_some() as u32;
        }
        c
    }
}

impl ParsedRemittance {
    pub fn counts(&self) -> ParsedCounts {
        let mut c = ParsedCounts {
            claims: self.claims.len() as u32,
            ..Default::default()
        };
        for claim in &self.claims {
            c.activities += claim.activities.len() as u32;
            // One REMITTANCE event per remittance claim.
            c.events += 1;
        }
        c
    }
}
