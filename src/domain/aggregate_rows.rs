//! Derived aggregate row shapes. The six-state status classification lives
//! here as a pure function so both `ClaimActivitySummary` and `ClaimPayment`
//! share one implementation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// The six-state activity/claim status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    FullyPaid,
    PartiallyPaid,
    Rejected,
    Pending,
    TakenBack,
    PartiallyTakenBack,
}

impl ActivityStatus {
    /// First-match decision list, parameterized so the same logic serves
    /// both activity-level and claim-level rollups.
    pub fn classify(
        submitted_amount: Decimal,
        paid_amount: Decimal,
        taken_back_amount: Decimal,
        net_paid_amount: Decimal,
        rejected_amount: Decimal,
    ) -> ActivityStatus {
        if taken_back_amount > Decimal::ZERO && net_paid_amount == Decimal::ZERO {
            ActivityStatus::TakenBack
        } else if taken_back_amount > Decimal::ZERO
            && net_paid_amount > Decimal::ZERO
            && net_paid_amount < submitted_amount
        {
            ActivityStatus::PartiallyTakenBack
        } else if net_paid_amount == submitted_amount && submitted_amount > Decimal::ZERO {
            ActivityStatus::FullyPaid
        } else if net_paid_amount > Decimal::ZERO {
            ActivityStatus::PartiallyPaid
        } else if rejected_amount > Decimal::ZERO {
            ActivityStatus::Rejected
        } else {
            ActivityStatus::Pending
        }
    }
}

/// One row per `(claim_key_id, activity_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimActivitySummary {
    pub claim_key_id: i64,
    pub activity_id: String,
    pub submitted_amount: Decimal,
    pub paid_amount: Decimal,
    pub taken_back_amount: Decimal,
    pub net_paid_amount: Decimal,
    pub rejected_amount: Decimal,
    pub denied_amount: Decimal,
    pub latest_denial_code: Option<String>,
    pub remittance_count: u32,
    pub first_payment_date: Option<chrono::NaiveDate>,
    pub last_payment_date: Option<chrono::NaiveDate>,
    pub activity_status: ActivityStatus,
    pub updated_at: DateTime<Utc>,
}

/// One row per `claim_key_id`: the claim-level rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimPayment {
    pub claim_key_id: i64,
    pub total_submitted_amount: Decimal,
    pub total_paid_amount: Decimal,
    pub total_taken_back_amount: Decimal,
    pub total_net_paid_amount: Decimal,
    pub total_rejected_amount: Decimal,
    pub total_denied_amount: Decimal,
    /// Spec §9 open question: defined here as equal to `total_paid_amount`.
    pub total_remitted_amount: Decimal,
    pub fully_paid_count: u32,
    pub partially_paid_count: u32,
    pub rejected_count: u32,
    pub pending_count: u32,
    pub taken_back_count: u32,
    pub partially_taken_back_count: u32,
    pub first_submission_date: Option<DateTime<Utc>>,
    pub last_submission_date: Option<DateTime<Utc>>,
    pub first_settlement_date: Option<chrono::NaiveDate>,
    pub last_settlement_date: Option<chrono::NaiveDate>,
    pub days_to_first_payment: Option<i64>,
    pub processing_cycles: u32,
    pub resubmission_count: u32,
    pub payment_status: ActivityStatus,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fully_paid_requires_positive_submitted() {
        // net=0 submitted, net_paid=0 -> Pending, not FullyPaid (boundary behavior).
        let status = ActivityStatus::classify(dec!(0), dec!(0), dec!(0), dec!(0), dec!(0));
        assert_eq!(status, ActivityStatus::Pending);
    }

    #[test]
    fn taken_back_to_zero() {
        let status = ActivityStatus::classify(dec!(100), dec!(0), dec!(50), dec!(0), dec!(0));
        assert_eq!(status, ActivityStatus::TakenBack);
    }

    #[test]
    fn partially_taken_back() {
        let status = ActivityStatus::classify(dec!(200), dec!(150), dec!(50), dec!(100), dec!(0));
        assert_eq!(status, ActivityStatus::PartiallyTakenBack);
    }

    #[test]
    fn rejected_when_denied_and_unpaid() {
        let status = ActivityStatus::classify(dec!(80), dec!(0), dec!(0), dec!(0), dec!(80));
        assert_eq!(status, ActivityStatus::Rejected);
    }
}
