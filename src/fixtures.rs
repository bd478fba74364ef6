//! Test/demo document generation: `fake`-driven XML Submission and
//! Remittance Advice documents in the dialects the parser actually accepts.

use chrono::Utc;
use fake::faker::name::en::LastName;
use fake::faker::number::en::NumberWithFormat;
use fake::Fake;
use rand::seq::IndexedRandom;
use rand::Rng;
use rust_decimal::Decimal;

/// A faked Claim.Submission document's essential shape, before rendering to
/// XML text. Kept separate from the XML string so tests can assert on the
/// generated values directly.
pub struct FakeSubmissionClaim {
    pub claim_id: String,
    pub id_payer: String,
    pub provider_id: String,
    pub member_id: String,
    pub gross: Decimal,
    pub patient_share: Decimal,
    pub net: Decimal,
    pub activity_ids: Vec<String>,
    pub activity_net: Vec<Decimal>,
}

/// Generate one plausible submission claim with 1-3 activities.
pub fn fake_submission_claim(idx: usize) -> FakeSubmissionClaim {
    let mut rng = rand::rng();
    let activity_count = rng.random_range(1..=3);
    let activity_nets: Vec<Decimal> = (0..activity_count)
        .map(|_| Decimal::new(rng.random_range(2000..50000), 2))
        .collect();
    let gross: Decimal = activity_nets.iter().sum();
    let patient_share = Decimal::new(rng.random_range(0..1000), 2);
    FakeSubmissionClaim {
        claim_id: format!("CLM-{idx}-{}", NumberWithFormat("######").fake::<String>()),
        id_payer: ["INS1", "INS2", "INS3"].choose(&mut rng).unwrap().to_string(),
        provider_id: format!("PROV{}", NumberWithFormat("###").fake::<String>()),
        member_id: format!("MEM{}", NumberWithFormat("######").fake::<String>()),
        gross,
        patient_share,
        net: gross - patient_share,
        activity_ids: (0..activity_count).map(|i| format!("ACT-{idx}-{i}")).collect(),
        activity_net: activity_nets,
    }
}

/// Render a full `Claim.Submission` document containing `n` fake claims,
/// using the same element names `parser::xml` decodes.
pub fn fake_submission_xml(n: usize) -> String {
    let now = Utc::now().to_rfc3339();
    let mut body = String::new();
    for i in 0..n {
        let claim = fake_submission_claim(i);
        body.push_str(&format!(
            "  <Claim>\n    <ID>{}</ID>\n    <IDPayer>{}</IDPayer>\n    <ProviderID>{}</ProviderID>\n    <MemberID>{}</MemberID>\n    <Gross>{}</Gross>\n    <PatientShare>{}</PatientShare>\n    <Net>{}</Net>\n    <Encounter>\n      <FacilityID>FAC{}</FacilityID>\n      <Type>1</Type>\n      <StartDate>{}</StartDate>\n    </Encounter>\n",
            claim.claim_id, claim.id_payer, claim.provider_id, claim.member_id,
            claim.gross, claim.patient_share, claim.net,
            NumberWithFormat("##").fake::<String>(), now,
        ));
        for (aid, anet) in claim.activity_ids.iter().zip(claim.activity_net.iter()) {
            body.push_str(&format!(
                "    <Activity>\n      <ID>{aid}</ID>\n      <Start>{now}</Start>\n      <Type>3</Type>\n      <Code>{}</Code>\n      <Quantity>1</Quantity>\n      <Net>{anet}</Net>\n      <Clinician>CLIN-{}</Clinician>\n    </Activity>\n",
                NumberWithFormat("#####").fake::<String>(),
                LastName().fake::<String>(),
            ));
        }
        body.push_str("  </Claim>\n");
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Claim.Submission>\n  <Header>\n    <SenderID>PROV{}</SenderID>\n    <ReceiverID>PAYER1</ReceiverID>\n    <TransactionDate>{now}</TransactionDate>\n    <RecordCount>{n}</RecordCount>\n  </Header>\n{body}</Claim.Submission>",
        NumberWithFormat("###").fake::<String>(),
    )
}

/// Render a `Remittance.Advice` document that pays (or partially pays) each
/// claim in `claims` — pass the same `FakeSubmissionClaim`s a prior
/// `fake_submission_xml` call used, so IDs line up with a real `ClaimKey`.
pub fn fake_remittance_xml(claims: &[FakeSubmissionClaim]) -> String {
    let now = Utc::now();
    let mut rng = rand::rng();
    let mut body = String::new();
    for claim in claims {
        body.push_str(&format!(
            "  <Claim>\n    <ID>{}</ID>\n    <IDPayer>{}</IDPayer>\n    <ProviderID>{}</ProviderID>\n    <DateSettlement>{}</DateSettlement>\n    <PaymentReference>REF-{}</PaymentReference>\n",
            claim.claim_id, claim.id_payer, claim.provider_id,
            now.format("%d/%m/%Y"),
            NumberWithFormat("######").fake::<String>(),
        ));
        for (aid, anet) in claim.activity_ids.iter().zip(claim.activity_net.iter()) {
            // Pay in full most of the time, partially pay the rest.
            let paid = if rng.random_bool(0.8) { *anet } else { *anet * Decimal::new(6, 1) };
            body.push_str(&format!(
                "    <Activity>\n      <ID>{aid}</ID>\n      <Net>{anet}</Net>\n      <PaymentAmount>{paid}</PaymentAmount>\n    </Activity>\n",
            ));
        }
        body.push_str("  </Claim>\n");
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Remittance.Advice>\n  <Header>\n    <SenderID>PAYER1</SenderID>\n    <ReceiverID>PROV1</ReceiverID>\n    <TransactionDate>{}</TransactionDate>\n    <RecordCount>{}</RecordCount>\n  </Header>\n{body}</Remittance.Advice>",
        now.to_rfc3339(),
        claims.len(),
    )
}

/// Write `n` fake submission documents to `dir`, one file per document, named
/// so a `LocalFsFetcher` watching that directory will pick them up in order.
pub async fn write_fake_submissions(dir: &std::path::Path, n: usize, claims_per_doc: usize) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for i in 0..n {
        let xml = fake_submission_xml(claims_per_doc);
        let path = dir.join(format!("submission-{i:04}.xml"));
        tokio::fs::write(path, xml).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_submission_xml_parses_cleanly() {
        let xml = fake_submission_xml(3);
        let parsed = crate::parser::parse(xml.as_bytes()).expect("fixture must parse");
        assert_eq!(parsed.counts.claims, 3);
    }

    #[test]
    fn fake_remittance_xml_parses_cleanly() {
        let claims: Vec<_> = (0..2).map(fake_submission_claim).collect();
        let xml = fake_remittance_xml(&claims);
        let parsed = crate::parser::parse(xml.as_bytes()).expect("fixture must parse");
        assert_eq!(parsed.counts.claims, 2);
    }

    #[test]
    fn generated_claim_net_equals_gross_minus_patient_share() {
        let claim = fake_submission_claim(0);
        assert_eq!(claim.net, claim.gross - claim.patient_share);
    }

    #[tokio::test]
    async fn write_fake_submissions_creates_one_file_per_document() {
        let dir = tempfile::tempdir().unwrap();
        write_fake_submissions(dir.path(), 5, 2).await.unwrap();
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
