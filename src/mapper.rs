//! Mapper. Resolves parser DTOs against reference data (payers, providers,
//! facilities, clinicians, codes) and reshapes them into the per-table row
//! sets Persist writes. Reference resolution is the one place the Mapper
//! talks to the outside world; everything else here is a pure reshape.
//!
//! Unknown codes are handled per `auto_insert`: when true, a new reference
//! row is created and the code is usable immediately; when false, the row
//! maps through with `*_ref_id = None` and a `code_discovery_audit` entry is
//! recorded so the gap is visible without blocking ingestion. Resolutions
//! are memoized per file — a code repeated across fifty activities costs one
//! lookup, not fifty.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::errors::ErrorKind;
use crate::parser::{Parsed, ParsedRoot};

/// Which reference-data table a code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Payer,
    Provider,
    Facility,
    Clinician,
    ActivityCode,
    DiagnosisCode,
    DenialCode,
}

/// Reference-data lookup/insert contract Persist backs for the Mapper.
#[async_trait]
pub trait RefResolver: Send + Sync {
    /// Look up an existing reference id for `code`, or `None` if unknown.
    async fn resolve(&self, kind: RefKind, code: &str) -> Result<Option<i64>, ErrorKind>;

    /// Insert a brand-new reference row for `code` and return its id. Only
    /// called when `auto_insert` is enabled and `resolve` returned `None`.
    async fn insert(&self, kind: RefKind, code: &str) -> Result<i64, ErrorKind>;

    /// Record a `code_discovery_audit` row for a code seen for the first time
    /// this run, whether or not it was auto-inserted.
    async fn record_discovery(&self, kind: RefKind, code: &str, auto_inserted: bool) -> Result<(), ErrorKind>;
}

#[derive(Debug, Clone)]
pub struct NewObservation {
    pub obs_type: String,
    pub code: String,
    pub value: Option<String>,
    pub value_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub claim_id: String,
    pub activity_id: String,
    pub start_at: DateTime<Utc>,
    pub activity_type: String,
    pub code: String,
    pub code_ref_id: Option<i64>,
    pub quantity: Decimal,
    pub net: Decimal,
    pub clinician: String,
    pub clinician_ref_id: Option<i64>,
    pub observations: Vec<NewObservation>,
}

#[derive(Debug, Clone)]
pub struct NewEncounter {
    pub facility_id: String,
    pub facility_ref_id: Option<i64>,
    pub encounter_type: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDiagnosis {
    pub diagnosis_type: String,
    pub code: String,
    pub code_ref_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewResubmission {
    pub resubmission_type: String,
    pub comment: String,
}

/// One submission claim and all of its children, addressed by the claim's
/// external `claim_id` — Persist resolves that to a `claim_key_id`/`id` inside
/// its own transaction, so the Mapper never has to know a surrogate key.
#[derive(Debug, Clone)]
pub struct NewClaim {
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
    pub encounter: NewEncounter,
    pub activities: Vec<NewActivity>,
    pub diagnoses: Vec<NewDiagnosis>,
    pub resubmission: Option<NewResubmission>,
}

#[derive(Debug, Clone)]
pub struct MappedSubmission {
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: DateTime<Utc>,
    pub record_count: u32,
    pub claims: Vec<NewClaim>,
}

#[derive(Debug, Clone)]
pub struct NewRemittanceActivity {
    pub activity_id: String,
    pub net: Decimal,
    pub payment_amount: Decimal,
    pub denial_code: Option<String>,
    pub denial_code_ref_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewRemittanceClaim {
    pub claim_id: String,
    pub id_payer: String,
    pub payer_ref_id: Option<i64>,
    pub provider_id: String,
    pub provider_ref_id: Option<i64>,
    pub date_settlement: NaiveDate,
    pub payment_reference: String,
    pub activities: Vec<NewRemittanceActivity>,
}

#[derive(Debug, Clone)]
pub struct MappedRemittance {
    pub sender_id: String,
    pub receiver_id: String,
    pub transaction_date: DateTime<Utc>,
    pub record_count: u32,
    pub claims: Vec<NewRemittanceClaim>,
}

#[derive(Debug, Clone)]
pub enum Mapped {
    Submission(MappedSubmission),
    Remittance(MappedRemittance),
}

type RefCache = HashMap<(RefKind, String), Option<i64>>;

async fn resolve_cached(
    cache: &mut RefCache,
    resolver: &dyn RefResolver,
    kind: RefKind,
    code: &str,
    auto_insert: bool,
) -> Result<Option<i64>, ErrorKind> {
    if let Some(hit) = cache.get(&(kind, code.to_string())) {
        return Ok(*hit);
    }

    let resolved = match resolver.resolve(kind, code).await? {
        Some(id) => Some(id),
        None if auto_insert => {
            let id = resolver.insert(kind, code).await?;
            resolver.record_discovery(kind, code, true).await?;
            Some(id)
        }
        None => {
            resolver.record_discovery(kind, code, false).await?;
            None
        }
    };

    cache.insert((kind, code.to_string()), resolved);
    Ok(resolved)
}

/// Resolve `parsed` against reference data and reshape it for Persist.
pub async fn map(parsed: &Parsed, resolver: &dyn RefResolver, auto_insert: bool) -> Result<Mapped, ErrorKind> {
    let mut cache = RefCache::new();
    match &parsed.root {
        ParsedRoot::Submission(s) => map_submission(s, resolver, auto_insert, &mut cache).await.map(Mapped::Submission),
        ParsedRoot::Remittance(r) => map_remittance(r, resolver, auto_insert, &mut cache).await.map(Mapped::Remittance),
    }
}

async fn map_submission(
    parsed: &crate::parser::ParsedSubmission,
    resolver: &dyn RefResolver,
    auto_insert: bool,
    cache: &mut RefCache,
) -> Result<MappedSubmission, ErrorKind> {
    let mut claims = Vec::with_capacity(parsed.claims.len());
    for c in &parsed.claims {
        let payer_ref_id = resolve_cached(cache, resolver, RefKind::Payer, &c.id_payer, auto_insert).await?;
        let provider_ref_id = resolve_cached(cache, resolver, RefKind::Provider, &c.provider_id, auto_insert).await?;
        let facility_ref_id =
            resolve_cached(cache, resolver, RefKind::Facility, &c.encounter.facility_id, auto_insert).await?;

        let mut activities = Vec::with_capacity(c.activities.len());
        for a in &c.activities {
            let code_ref_id = resolve_cached(cache, resolver, RefKind::ActivityCode, &a.code, auto_insert).await?;
            let clinician_ref_id =
                resolve_cached(cache, resolver, RefKind::Clinician, &a.clinician, auto_insert).await?;
            activities.push(NewActivity {
                claim_id: c.id.clone(),
                activity_id: a.id.clone(),
                start_at: a.start,
                activity_type: a.activity_type.clone(),
                code: a.code.clone(),
                code_ref_id,
                quantity: a.quantity,
                net: a.net,
                clinician: a.clinician.clone(),
                clinician_ref_id,
                observations: a
                    .observations
                    .iter()
                    .map(|o| NewObservation {
                        obs_type: o.obs_type.clone(),
                        code: o.code.clone(),
                        value: o.value.clone(),
                        value_type: o.value_type.clone(),
                    })
                    .collect(),
            });
        }

        let mut diagnoses = Vec::with_capacity(c.diagnoses.len());
        for d in &c.diagnoses {
            let code_ref_id = resolve_cached(cache, resolver, RefKind::DiagnosisCode, &d.code, auto_insert).await?;
            diagnoses.push(NewDiagnosis {
                diagnosis_type: d.diagnosis_type.clone(),
                code: d.code.clone(),
                code_ref_id,
            });
        }

        claims.push(NewClaim {
            claim_id: c.id.clone(),
            id_payer: c.id_payer.clone(),
            payer_ref_id,
            provider_id: c.provider_id.clone(),
            provider_ref_id,
            member_id: c.member_id.clone(),
            emirates_id_number: c.emirates_id_number.clone(),
            gross: c.gross,
            patient_share: c.patient_share,
            net: c.net,
            tx_at: parsed.header.transaction_date,
            encounter: NewEncounter {
                facility_id: c.encounter.facility_id.clone(),
                facility_ref_id,
                encounter_type: c.encounter.encounter_type.clone(),
                start_at: c.encounter.start_date,
                end_at: c.encounter.end_date,
            },
            activities,
            diagnoses,
            resubmission: c.resubmission.as_ref().map(|r| NewResubmission {
                resubmission_type: r.resubmission_type.clone(),
                comment: r.comment.clone(),
            }),
        });
    }

    Ok(MappedSubmission {
        sender_id: parsed.header.sender_id.clone(),
        receiver_id: parsed.header.receiver_id.clone(),
        transaction_date: parsed.header.transaction_date,
        record_count: parsed.header.record_count,
        claims,
    })
}

async fn map_remittance(
    parsed: &crate::parser::ParsedRemittance,
    resolver: &dyn RefResolver,
    auto_insert: bool,
    cache: &mut RefCache,
) -> Result<MappedRemittance, ErrorKind> {
    let mut claims = Vec::with_capacity(parsed.claims.len());
    for c in &parsed.claims {
        let payer_ref_id = resolve_cached(cache, resolver, RefKind::Payer, &c.id_payer, auto_insert).await?;
        let provider_ref_id = resolve_cached(cache, resolver, RefKind::Provider, &c.provider_id, auto_insert).await?;

        let mut activities = Vec::with_capacity(c.activities.len());
        for a in &c.activities {
            let denial_code_ref_id = match &a.denial_code {
                Some(code) => resolve_cached(cache, resolver, RefKind::DenialCode, code, auto_insert).await?,
                None => None,
            };
            activities.push(NewRemittanceActivity {
                activity_id: a.id.clone(),
                net: a.net,
                payment_amount: a.payment_amount,
                denial_code: a.denial_code.clone(),
                denial_code_ref_id,
            });
        }

        claims.push(NewRemittanceClaim {
            claim_id: c.id.clone(),
            id_payer: c.id_payer.clone(),
            payer_ref_id,
            provider_id: c.provider_id.clone(),
            provider_ref_id,
            date_settlement: c.date_settlement,
            payment_reference: c.payment_reference.clone(),
            activities,
        });
    }

    Ok(MappedRemittance {
        sender_id: parsed.header.sender_id.clone(),
        receiver_id: parsed.header.receiver_id.clone(),
        transaction_date: parsed.header.transaction_date,
        record_count: parsed.header.record_count,
        claims,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory resolver: payers/providers/facilities/clinicians pre-seeded
    /// as "known", activity codes always unknown so discovery/auto-insert
    /// behavior is exercised.
    struct FakeResolver {
        known: HashMap<(RefKind, String), i64>,
        discoveries: Mutex<Vec<(RefKind, String, bool)>>,
        next_id: Mutex<i64>,
    }

    impl FakeResolver {
        fn new(known: HashMap<(RefKind, String), i64>) -> Self {
            Self { known, discoveries: Mutex::new(Vec::new()), next_id: Mutex::new(1000) }
        }
    }

    #[async_trait]
    impl RefResolver for FakeResolver {
        async fn resolve(&self, kind: RefKind, code: &str) -> Result<Option<i64>, ErrorKind> {
            Ok(self.known.get(&(kind, code.to_string())).copied())
        }

        async fn insert(&self, _kind: RefKind, _code: &str) -> Result<i64, ErrorKind> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(*next)
        }

        async fn record_discovery(&self, kind: RefKind, code: &str, auto_inserted: bool) -> Result<(), ErrorKind> {
            self.discoveries.lock().unwrap().push((kind, code.to_string(), auto_inserted));
            Ok(())
        }
    }

    fn sample_parsed() -> Parsed {
        crate::parser::parse(SAMPLE_XML.as_bytes()).unwrap()
    }

    const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Claim.Submission>
  <Header>
    <SenderID>PROV1</SenderID>
    <ReceiverID>PAYER1</ReceiverID>
    <TransactionDate>2026-01-05T00:00:00Z</TransactionDate>
    <RecordCount>1</RecordCount>
  </Header>
  <Claim>
    <ID>C1</ID>
    <IDPayer>INS1</IDPayer>
    <ProviderID>PR1</ProviderID>
    <MemberID>M1</MemberID>
    <Gross>150</Gross>
    <PatientShare>0</PatientShare>
    <Net>150</Net>
    <Encounter>
      <FacilityID>FAC1</FacilityID>
      <Type>1</Type>
      <StartDate>2026-01-05T00:00:00Z</StartDate>
    </Encounter>
    <Activity>
      <ID>A1</ID>
      <Start>2026-01-05T00:00:00Z</Start>
      <Type>3</Type>
      <Code>99213</Code>
      <Quantity>1</Quantity>
      <Net>100</Net>
      <Clinician>CLIN1</Clinician>
    </Activity>
    <Activity>
      <ID>A2</ID>
      <Start>2026-01-05T00:00:00Z</Start>
      <Type>3</Type>
      <Code>99213</Code>
      <Quantity>1</Quantity>
      <Net>50</Net>
      <Clinician>CLIN1</Clinician>
    </Activity>
  </Claim>
</Claim.Submission>"#;

    #[tokio::test]
    async fn resolves_known_refs_and_leaves_unknown_codes_unresolved_without_auto_insert() {
        let mut known = HashMap::new();
        known.insert((RefKind::Payer, "INS1".to_string()), 1);
        known.insert((RefKind::Provider, "PR1".to_string()), 2);
        known.insert((RefKind::Facility, "FAC1".to_string()), 3);
        known.insert((RefKind::Clinician, "CLIN1".to_string()), 4);
        let resolver = FakeResolver::new(known);

        let mapped = map(&sample_parsed(), &resolver, false).await.unwrap();
        match mapped {
            Mapped::Submission(s) => {
                let claim = &s.claims[0];
                assert_eq!(claim.payer_ref_id, Some(1));
                assert_eq!(claim.provider_ref_id, Some(2));
                assert_eq!(claim.encounter.facility_ref_id, Some(3));
                // activity code 99213 was never seeded, so it stays unresolved
                assert_eq!(claim.activities[0].code_ref_id, None);
                assert_eq!(claim.activities[0].clinician_ref_id, Some(4));
            }
            _ => panic!("expected submission"),
        }

        let discoveries = resolver.discoveries.lock().unwrap();
        // Same unknown code appears on two activities but is only discovered once (memoized).
        assert_eq!(discoveries.iter().filter(|(k, c, _)| *k == RefKind::ActivityCode && c == "99213").count(), 1);
        assert!(discoveries.iter().all(|(_, _, inserted)| !inserted));
    }

    #[tokio::test]
    async fn auto_insert_assigns_a_ref_id_to_unknown_codes() {
        let resolver = FakeResolver::new(HashMap::new());
        let mapped = map(&sample_parsed(), &resolver, true).await.unwrap();
        match mapped {
            Mapped::Submission(s) => {
                assert!(s.claims[0].activities[0].code_ref_id.is_some());
                assert!(s.claims[0].payer_ref_id.is_some());
            }
            _ => panic!("expected submission"),
        }
        let discoveries = resolver.discoveries.lock().unwrap();
        assert!(discoveries.iter().all(|(_, _, inserted)| *inserted));
    }
}
