//! Streaming XML decode for the two recognized dialects.
//!
//! Wire-shape structs mirror the XML element names and are deserialized via
//! `quick_xml::de`, which walks the document once (SAX-driven) rather than
//! building a full DOM tree, satisfying "must accept documents up to tens of
//! MB without quadratic memory". Wire fields are permissive (`String`/`Option`)
//! so a structurally well-formed-but-business-invalid document still
//! deserializes; the conversion step below is where required-field and
//! numeric-range validation happens, which is what lets us tell
//! `MALFORMED_XML` (the bytes aren't XML at all) apart from `SCHEMA_VIOLATION`
//! (valid XML, missing a required element). Elements outside the documented
//! set are tolerated because serde structs ignore unrecognized fields by
//! default.

use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::de::from_str;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use super::dto::*;
use super::error::{ParseError, ParseErrorKind};

#[derive(Debug, Deserialize)]
struct XmlHeader {
    #[serde(rename = "SenderID")]
    sender_id: Option<String>,
    #[serde(rename = "ReceiverID")]
    receiver_id: Option<String>,
    #[serde(rename = "TransactionDate")]
    transaction_date: Option<String>,
    #[serde(rename = "RecordCount")]
    record_count: Option<u32>,
    #[serde(rename = "DispositionFlag")]
    disposition_flag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlEncounter {
    #[serde(rename = "FacilityID")]
    facility_id: Option<String>,
    #[serde(rename = "Type")]
    encounter_type: Option<String>,
    #[serde(rename = "StartDate")]
    start_date: Option<String>,
    #[serde(rename = "EndDate")]
    end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlObservation {
    #[serde(rename = "Type")]
    obs_type: Option<String>,
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ValueType")]
    value_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlActivity {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "Start")]
    start: Option<String>,
    #[serde(rename = "Type")]
    activity_type: Option<String>,
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Quantity")]
    quantity: Option<String>,
    #[serde(rename = "Net")]
    net: Option<String>,
    #[serde(rename = "Clinician")]
    clinician: Option<String>,
    #[serde(rename = "Observation", default)]
    observations: Vec<XmlObservation>,
}

#[derive(Debug, Deserialize)]
struct XmlDiagnosis {
    #[serde(rename = "Type")]
    diagnosis_type: Option<String>,
    #[serde(rename = "Code")]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlResubmission {
    #[serde(rename = "Type")]
    resubmission_type: Option<String>,
    #[serde(rename = "Comment")]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlSubmissionClaim {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "IDPayer")]
    id_payer: Option<String>,
    #[serde(rename = "ProviderID")]
    provider_id: Option<String>,
    #[serde(rename = "MemberID")]
    member_id: Option<String>,
    #[serde(rename = "EmiratesIDNumber")]
    emirates_id_number: Option<String>,
    #[serde(rename = "Gross")]
    gross: Option<String>,
    #[serde(rename = "PatientShare")]
    patient_share: Option<String>,
    #[serde(rename = "Net")]
    net: Option<String>,
    #[serde(rename = "Encounter")]
    encounter: Option<XmlEncounter>,
    #[serde(rename = "Activity", default)]
    activities: Vec<XmlActivity>,
    #[serde(rename = "Diagnosis", default)]
    diagnoses: Vec<XmlDiagnosis>,
    #[serde(rename = "Resubmission")]
    resubmission: Option<XmlResubmission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Claim.Submission")]
struct XmlClaimSubmission {
    #[serde(rename = "Header")]
    header: Option<XmlHeader>,
    #[serde(rename = "Claim", default)]
    claims: Vec<XmlSubmissionClaim>,
}

#[derive(Debug, Deserialize)]
struct XmlRemittanceActivity {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "Net")]
    net: Option<String>,
    #[serde(rename = "PaymentAmount")]
    payment_amount: Option<String>,
    #[serde(rename = "DenialCode")]
    denial_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlRemittanceClaim {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "IDPayer")]
    id_payer: Option<String>,
    #[serde(rename = "ProviderID")]
    provider_id: Option<String>,
    #[serde(rename = "DateSettlement")]
    date_settlement: Option<String>,
    #[serde(rename = "PaymentReference")]
    payment_reference: Option<String>,
    #[serde(rename = "Activity", default)]
    activities: Vec<XmlRemittanceActivity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Remittance.Advice")]
struct XmlRemittanceAdvice {
    #[serde(rename = "Header")]
    header: Option<XmlHeader>,
    #[serde(rename = "Claim", default)]
    claims: Vec<XmlRemittanceClaim>,
}

/// Recognized document roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Submission,
    Remittance,
}

/// Sniff the first start-element name without building a tree, so the
/// document dialect dispatches on the root element alone.
fn sniff_root(text: &str) -> Result<Root, ParseError> {
    let mut reader = quick_xml::Reader::from_str(text);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                return match e.local_name().as_ref() {
                    b"Claim.Submission" => Ok(Root::Submission),
                    b"Remittance.Advice" => Ok(Root::Remittance),
                    other => Err(ParseError::new(
                        ParseErrorKind::UnknownRoot,
                        reader.buffer_position() as usize,
                        "/",
                        format!("unrecognized root element {:?}", String::from_utf8_lossy(other)),
                    )),
                };
            }
            Ok(quick_xml::events::Event::Eof) => {
                return Err(ParseError::new(
                    ParseErrorKind::MalformedXml,
                    0,
                    "/",
                    "document has no root element",
                ));
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(ParseError::new(
                    ParseErrorKind::MalformedXml,
                    reader.buffer_position() as usize,
                    "/",
                    e.to_string(),
                ));
            }
        }
    }
}

fn parse_datetime(path: &str, field: &str, raw: &Option<String>) -> Result<DateTime<Utc>, ParseError> {
    let raw = require(path, field, raw)?;
    // Accept both full RFC3339 and the bare "dd/MM/yyyy HH:mm" style DHPO uses.
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%d/%m/%Y %H:%M") {
        return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    Err(ParseError::new(
        ParseErrorKind::FieldConstraint,
        0,
        path,
        format!("{field} is not a valid date/time: {raw:?}"),
    ))
}

fn parse_date(path: &str, field: &str, raw: &Option<String>) -> Result<NaiveDate, ParseError> {
    let raw = require(path, field, raw)?;
    NaiveDate::parse_from_str(raw, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| {
            ParseError::new(
                ParseErrorKind::FieldConstraint,
                0,
                path,
                format!("{field} is not a valid date: {raw:?}"),
            )
        })
}

fn parse_decimal(path: &str, field: &str, raw: &Option<String>) -> Result<Decimal, ParseError> {
    let raw = require(path, field, raw)?;
    Decimal::from_str(raw.trim()).map_err(|_| {
        ParseError::new(
            ParseErrorKind::FieldConstraint,
            0,
            path,
            format!("{field} is not a valid number: {raw:?}"),
        )
    })
}

fn require<'a>(path: &str, field: &str, raw: &'a Option<String>) -> Result<&'a String, ParseError> {
    raw.as_ref().ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::SchemaViolation,
            0,
            path,
            format!("missing required element {field}"),
        )
    })
}

fn require_non_negative(path: &str, field: &str, value: Decimal) -> Result<Decimal, ParseError> {
    if value < Decimal::ZERO {
        return Err(ParseError::new(
            ParseErrorKind::FieldConstraint,
            0,
            path,
            format!("{field} must be >= 0, got {value}"),
        ));
    }
    Ok(value)
}

fn convert_header(path: &str, h: Option<XmlHeader>) -> Result<ParsedHeader, ParseError> {
    let h = h.ok_or_else(|| {
        ParseError::new(ParseErrorKind::SchemaViolation, 0, path, "missing Header element")
    })?;
    Ok(ParsedHeader {
        sender_id: require(path, "SenderID", &h.sender_id)?.clone(),
        receiver_id: require(path, "ReceiverID", &h.receiver_id)?.clone(),
        transaction_date: parse_datetime(path, "TransactionDate", &h.transaction_date)?,
        record_count: h.record_count.unwrap_or(0),
        disposition_flag: h.disposition_flag,
    })
}

fn convert_submission_claim(idx: usize, c: XmlSubmissionClaim) -> Result<ParsedSubmissionClaim, ParseError> {
    let claim_id = require(&format!("/Claim[{idx}]"), "ID", &c.id)?.clone();
    let path = format!("/Claim[{claim_id}]");

    let net = require_non_negative(&path, "Net", parse_decimal(&path, "Net", &c.net)?)?;
    let gross = parse_decimal(&path, "Gross", &c.gross)?;
    let patient_share = parse_decimal(&path, "PatientShare", &c.patient_share)?;

    let enc_path = format!("{path}/Encounter");
    let xml_enc = c.encounter.ok_or_else(|| {
        ParseError::new(ParseErrorKind::SchemaViolation, 0, &path, "missing Encounter element")
    })?;
    let encounter = ParsedEncounter {
        facility_id: require(&enc_path, "FacilityID", &xml_enc.facility_id)?.clone(),
        encounter_type: require(&enc_path, "Type", &xml_enc.encounter_type)?.clone(),
        start_date: parse_datetime(&enc_path, "StartDate", &xml_enc.start_date)?,
        end_date: xml_enc
            .end_date
            .map(|_| parse_datetime(&enc_path, "EndDate", &xml_enc.end_date))
            .transpose()?,
    };

    if c.activities.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::SchemaViolation,
            0,
            &path,
            "claim has no Activity elements",
        ));
    }
    let mut activities = Vec::with_capacity(c.activities.len());
    for (ai, a) in c.activities.into_iter().enumerate() {
        let act_path = format!("{path}/Activity[{ai}]");
        let act_id = require(&act_path, "ID", &a.id)?.clone();
        let act_net = require_non_negative(&act_path, "Net", parse_decimal(&act_path, "Net", &a.net)?)?;
        let mut observations = Vec::with_capacity(a.observations.len());
        for o in a.observations {
            observations.push(ParsedObservation {
                obs_type: require(&act_path, "Observation.Type", &o.obs_type)?.clone(),
                code: require(&act_path, "Observation.Code", &o.code)?.clone(),
                value: o.value,
                value_type: o.value_type,
            });
        }
        activities.push(ParsedActivity {
            id: act_id,
            start: parse_datetime(&act_path, "Start", &a.start)?,
            activity_type: require(&act_path, "Type", &a.activity_type)?.clone(),
            code: require(&act_path, "Code", &a.code)?.clone(),
            quantity: parse_decimal(&act_path, "Quantity", &a.quantity)?,
            net: act_net,
            clinician: require(&act_path, "Clinician", &a.clinician)?.clone(),
            observations,
        });
    }

    let mut diagnoses = Vec::with_capacity(c.diagnoses.len());
    for d in c.diagnoses {
        diagnoses.push(ParsedDiagnosis {
            diagnosis_type: require(&path, "Diagnosis.Type", &d.diagnosis_type)?.clone(),
            code: require(&path, "Diagnosis.Code", &d.code)?.clone(),
        });
    }

    let resubmission = c
        .resubmission
        .map(|r| -> Result<_, ParseError> {
            Ok(ParsedResubmission {
                resubmission_type: require(&path, "Resubmission.Type", &r.resubmission_type)?.clone(),
                comment: r.comment.unwrap_or_default(),
            })
        })
        .transpose()?;

    Ok(ParsedSubmissionClaim {
        id: claim_id,
        id_payer: require(&path, "IDPayer", &c.id_payer)?.clone(),
        provider_id: require(&path, "ProviderID", &c.provider_id)?.clone(),
        member_id: require(&path, "MemberID", &c.member_id)?.clone(),
        emirates_id_number: c.emirates_id_number,
        gross,
        patient_share,
        net,
        encounter,
        activities,
        diagnoses,
        resubmission,
    })
}

fn convert_remittance_claim(idx: usize, c: XmlRemittanceClaim) -> Result<ParsedRemittanceClaim, ParseError> {
    let claim_id = require(&format!("/Claim[{idx}]"), "ID", &c.id)?.clone();
    let path = format!("/Claim[{claim_id}]");

    if c.activities.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::SchemaViolation,
            0,
            &path,
            "remittance claim has no Activity elements",
        ));
    }
    let mut activities = Vec::with_capacity(c.activities.len());
    for (ai, a) in c.activities.into_iter().enumerate() {
        let act_path = format!("{path}/Activity[{ai}]");
        activities.push(ParsedRemittanceActivity {
            id: require(&act_path, "ID", &a.id)?.clone(),
            net: parse_decimal(&act_path, "Net", &a.net)?,
            payment_amount: parse_decimal(&act_path, "PaymentAmount", &a.payment_amount)?,
            denial_code: a.denial_code,
        });
    }

    Ok(ParsedRemittanceClaim {
        id: claim_id,
        id_payer: require(&path, "IDPayer", &c.id_payer)?.clone(),
        provider_id: require(&path, "ProviderID", &c.provider_id)?.clone(),
        date_settlement: parse_date(&path, "DateSettlement", &c.date_settlement)?,
        payment_reference: c.payment_reference.unwrap_or_default(),
        activities,
    })
}

/// Decode raw bytes into a tagged `Parsed` DTO tree.
///
/// Pure and restartable: identical bytes always produce byte-identical
/// output, since `quick_xml::de` preserves document order and we never touch
/// wall-clock or randomness while converting.
pub fn parse(bytes: &[u8]) -> Result<Parsed, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        ParseError::new(ParseErrorKind::MalformedXml, e.valid_up_to(), "/", "input is not valid UTF-8")
    })?;

    match sniff_root(text)? {
        Root::Submission => {
            let wire: XmlClaimSubmission = from_str(text).map_err(|e| {
                ParseError::new(ParseErrorKind::MalformedXml, 0, "/", e.to_string())
            })?;
            let header = convert_header("/Header", wire.header)?;
            if wire.claims.is_empty() {
                return Err(ParseError::new(
                    ParseErrorKind::SchemaViolation,
                    0,
                    "/",
                    "submission has no Claim elements",
                ));
            }
            let mut claims = Vec::with_capacity(wire.claims.len());
            for (i, c) in wire.claims.into_iter().enumerate() {
                claims.push(convert_submission_claim(i, c)?);
            }
            let submission = ParsedSubmission { header, claims };
            let counts = submission.counts();
            Ok(Parsed { root: ParsedRoot::Submission(submission), counts })
        }
        Root::Remittance => {
            let wire: XmlRemittanceAdvice = from_str(text).map_err(|e| {
                ParseError::new(ParseErrorKind::MalformedXml, 0, "/", e.to_string())
            })?;
            let header = convert_header("/Header", wire.header)?;
            if wire.claims.is_empty() {
                return Err(ParseError::new(
                    ParseErrorKind::SchemaViolation,
                    0,
                    "/",
                    "remittance has no Claim elements",
                ));
            }
            let mut claims = Vec::with_capacity(wire.claims.len());
            for (i, c) in wire.claims.into_iter().enumerate() {
                claims.push(convert_remittance_claim(i, c)?);
            }
            let remittance = ParsedRemittance { header, claims };
            let counts = remittance.counts();
            Ok(Parsed { root: ParsedRoot::Remittance(remittance), counts })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBMISSION_OK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
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
    <ProviderID>PROV1</ProviderID>
    <MemberID>M1</MemberID>
    <Gross>150</Gross>
    <PatientShare>0</PatientShare>
    <Net>150</Net>
    <Encounter>
      <FacilityID>F1</FacilityID>
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
      <Code>99214</Code>
      <Quantity>1</Quantity>
      <Net>50</Net>
      <Clinician>CLIN1</Clinician>
    </Activity>
  </Claim>
</Claim.Submission>"#;

    #[test]
    fn parses_well_formed_submission() {
        let parsed = parse(SUBMISSION_OK.as_bytes()).expect("should parse");
        assert_eq!(parsed.counts.claims, 1);
        assert_eq!(parsed.counts.activities, 2);
        match parsed.root {
            ParsedRoot::Submission(s) => {
                assert_eq!(s.claims[0].id, "C1");
                assert_eq!(s.claims[0].activities[0].net, Decimal::from(100));
            }
            _ => panic!("expected submission root"),
        }
    }

    #[test]
    fn rejects_non_xml_bytes() {
        let err = parse(b"not xml at all").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedXml);
    }

    #[test]
    fn rejects_unknown_root() {
        let err = parse(b"<Something.Else><A/></Something.Else>").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownRoot);
    }

    #[test]
    fn rejects_missing_activity_id() {
        let bad = SUBMISSION_OK.replace("<ID>A1</ID>", "");
        let err = parse(bad.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::SchemaViolation);
    }

    #[test]
    fn rejects_negative_activity_net() {
        let bad = SUBMISSION_OK.replace("<Net>100</Net>", "<Net>-100</Net>");
        let err = parse(bad.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::FieldConstraint);
    }

    #[test]
    fn determinism_same_bytes_same_output() {
        let a = parse(SUBMISSION_OK.as_bytes()).unwrap();
        let b = parse(SUBMISSION_OK.as_bytes()).unwrap();
        assert_eq!(a, b);
    }

    const REMITTANCE_OK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Remittance.Advice>
  <Header>
    <SenderID>PAYER1</SenderID>
    <ReceiverID>PROV1</ReceiverID>
    <TransactionDate>2026-01-10T00:00:00Z</TransactionDate>
    <RecordCount>1</RecordCount>
  </Header>
  <Claim>
    <ID>C1</ID>
    <IDPayer>INS1</IDPayer>
    <ProviderID>PROV1</ProviderID>
    <DateSettlement>10/01/2026</DateSettlement>
    <PaymentReference>REF1</PaymentReference>
    <Activity>
      <ID>A1</ID>
      <Net>100</Net>
      <PaymentAmount>100</PaymentAmount>
    </Activity>
  </Claim>
</Remittance.Advice>"#;

    #[test]
    fn parses_well_formed_remittance() {
        let parsed = parse(REMITTANCE_OK.as_bytes()).expect("should parse");
        match parsed.root {
            ParsedRoot::Remittance(r) => {
                assert_eq!(r.claims[0].id, "C1");
                assert_eq!(r.claims[0].activities[0].payment_amount, Decimal::from(100));
            }
            _ => panic!("expected remittance root"),
        }
    }

    #[test]
    fn parses_negative_payment_amount_as_takeback() {
        let bad = REMITTANCE_OK.replace("<PaymentAmount>100</PaymentAmount>", "<PaymentAmount>-50</PaymentAmount>");
        let parsed = parse(bad.as_bytes()).expect("negative payment amounts are valid (take-backs)");
        match parsed.root {
            ParsedRoot::Remittance(r) => {
                assert_eq!(r.claims[0].activities[0].payment_amount, Decimal::from(-50));
            }
            _ => panic!("expected remittance root"),
        }
    }
}
