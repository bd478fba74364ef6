//! Remittance-side entities.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

/// One remittance document; one-to-one with an `IngestionFile` of root_type=2.
#[derive(Debug, Clone, PartialEq)]
pub struct Remittance {
    pub id: i64,
    pub ingestion_file_id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: DateTime<Utc>,
    pub record_count: u32,
}

/// Remittance for one claim_key. Unique `(remittance_id, claim_key_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemittanceClaim {
    pub id: i64,
    pub claim_key_id: i64,
    pub remittance_id: i64,
    pub id_payer: String,
    pub payer_ref_id: Option<i64>,
    pub provider_id: String,
    pub provider_ref_id: Option<i64>,
    pub date_settlement: NaiveDate,
    pub payment_reference: String,
}

/// Remittance line against a specific `activity_id` within a RemittanceClaim.
/// `payment_amount` is signed; negative values are take-backs.
#[derive(Debug, Clone, PartialEq)]
pub struct RemittanceActivity {
    pub id: i64,
    pub remittance_claim_id: i64,
    pub activity_id: String,
    pub net: Decimal,
    pub payment_amount: Decimal,
    pub denial_code: Option<String>,
    pub denial_code_ref_id: Option<i64>,
}
