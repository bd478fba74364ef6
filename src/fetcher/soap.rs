//! SOAP-backed Fetcher for the clearing-house's
//! SearchTransactions / GetTransaction / SetTransactionDownloaded operations.
//! No mature SOAP crate exists in this ecosystem, so the envelope is
//! hand-assembled the way a `reqwest`-based integration typically does it:
//! build the XML body, POST with the SOAPAction header, and parse just the
//! fields needed out of the response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::domain::RootType;
use crate::errors::ErrorKind;
use crate::message::{SourceMetadata, WorkItem};
use crate::queue::{offer_or_drop, BoundedQueue};

use super::{backoff_delay, Fetcher};

pub struct SoapFetcher {
    client: reqwest::Client,
    endpoint: String,
    facility_id: String,
    search_days: u32,
    poll_interval: Duration,
    retries_max: u32,
    retries_base_ms: u64,
    retries_cap_ms: u64,
    download_concurrency: usize,
    paused: AtomicBool,
}

impl SoapFetcher {
    pub fn new(config: &Config, facility_id: String) -> Result<Self, ErrorKind> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.soap_connect_timeout_ms))
            .timeout(Duration::from_millis(config.soap_read_timeout_ms))
            .build()
            .map_err(|e| ErrorKind::FetchFatal(format!("building SOAP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.soap_endpoint.clone(),
            facility_id,
            search_days: config.soap_search_days,
            poll_interval: Duration::from_millis(config.soap_poll_interval_ms),
            retries_max: config.soap_retries_max,
            retries_base_ms: config.soap_retries_base_ms,
            retries_cap_ms: config.soap_retries_cap_ms,
            download_concurrency: config.soap_download_concurrency,
            paused: AtomicBool::new(false),
        })
    }

    fn search_envelope(&self) -> String {
        let to = Utc::now();
        let from = to - chrono::Duration::days(self.search_days as i64);
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <SearchTransactions xmlns="http://tempuri.org/">
      <FacilityID>{}</FacilityID>
      <FromDate>{}</FromDate>
      <ToDate>{}</ToDate>
    </SearchTransactions>
  </soap:Body>
</soap:Envelope>"#,
            self.facility_id,
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d"),
        )
    }

    fn get_transaction_envelope(&self, transaction_id: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <GetTransaction xmlns="http://tempuri.org/">
      <FacilityID>{}</FacilityID>
      <TransactionID>{}</TransactionID>
    </GetTransaction>
  </soap:Body>
</soap:Envelope>"#,
            self.facility_id, transaction_id,
        )
    }

    fn set_downloaded_envelope(&self, transaction_id: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <SetTransactionDownloaded xmlns="http://tempuri.org/">
      <FacilityID>{}</FacilityID>
      <TransactionID>{}</TransactionID>
    </SetTransactionDownloaded>
  </soap:Body>
</soap:Envelope>"#,
            self.facility_id, transaction_id,
        )
    }

    async fn post_with_retry(&self, soap_action: &str, body: String) -> Result<String, ErrorKind> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "text/xml; charset=utf-8")
                .header("SOAPAction", soap_action)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().await.map_err(|e| ErrorKind::FetchTransient(e.to_string()));
                }
                Ok(resp) if resp.status().is_server_error() && attempt < self.retries_max => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt, self.retries_base_ms, self.retries_cap_ms)).await;
                    continue;
                }
                Ok(resp) => {
                    return Err(ErrorKind::FetchFatal(format!("SOAP call returned status {}", resp.status())));
                }
                Err(e) if attempt < self.retries_max && (e.is_timeout() || e.is_connect()) => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt, self.retries_base_ms, self.retries_cap_ms)).await;
                    continue;
                }
                Err(e) => return Err(ErrorKind::FetchFatal(e.to_string())),
            }
        }
    }

    /// Extract `<TransactionID>` text nodes from a SearchTransactions response.
    fn extract_transaction_ids(xml: &str) -> Vec<String> {
        let mut ids = Vec::new();
        let mut reader = quick_xml::Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut in_id = false;
        loop {
            match reader.read_event() {
                Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == b"TransactionID" => {
                    in_id = true;
                }
                Ok(quick_xml::events::Event::Text(t)) if in_id => {
                    if let Ok(text) = t.unescape() {
                        ids.push(text.to_string());
                    }
                }
                Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == b"TransactionID" => {
                    in_id = false;
                }
                Ok(quick_xml::events::Event::Eof) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        ids
    }

    /// Extract the payload document nested inside a GetTransaction response
    /// body (the clearing-house wraps the `Claim.Submission`/
    /// `Remittance.Advice` document as escaped text inside the SOAP body).
    fn extract_payload(xml: &str) -> Option<Vec<u8>> {
        let mut reader = quick_xml::Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut in_payload = false;
        let mut buf = String::new();
        loop {
            match reader.read_event() {
                Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == b"TransactionFile" => {
                    in_payload = true;
                }
                Ok(quick_xml::events::Event::Text(t)) if in_payload => {
                    if let Ok(text) = t.unescape() {
                        buf.push_str(&text);
                    }
                }
                Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == b"TransactionFile" => {
                    break;
                }
                Ok(quick_xml::events::Event::Eof) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        if buf.is_empty() {
            None
        } else {
            Some(buf.into_bytes())
        }
    }

    pub async fn mark_downloaded(&self, transaction_id: &str) -> Result<(), ErrorKind> {
        self.post_with_retry("SetTransactionDownloaded", self.set_downloaded_envelope(transaction_id)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Fetcher for SoapFetcher {
    async fn run(&self, queue: Arc<BoundedQueue<WorkItem>>) -> Result<(), ErrorKind> {
        let semaphore = Arc::new(Semaphore::new(self.download_concurrency));
        loop {
            if self.paused.load(Ordering::Relaxed) {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let search_response = self.post_with_retry("SearchTransactions", self.search_envelope()).await?;
            let transaction_ids = Self::extract_transaction_ids(&search_response);

            for transaction_id in transaction_ids {
                if self.paused.load(Ordering::Relaxed) {
                    break;
                }
                let _permit = semaphore.clone().acquire_owned().await.ok();
                let body = self.get_transaction_envelope(&transaction_id);
                let response = match self.post_with_retry("GetTransaction", body).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(transaction_id, error = %e, "GetTransaction failed");
                        continue;
                    }
                };
                let Some(bytes) = Self::extract_payload(&response) else {
                    tracing::warn!(transaction_id, "GetTransaction response had no payload");
                    continue;
                };

                let item = WorkItem {
                    file_id: transaction_id.clone(),
                    bytes,
                    source: SourceMetadata::Soap { facility_id: self.facility_id.clone() },
                    root_type_hint: None::<RootType>,
                    discovered_at: Utc::now(),
                };
                offer_or_drop(&queue, item, Duration::from_millis(200)).await;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_transaction_ids_from_search_response() {
        let xml = r#"<Envelope><Body><SearchTransactionsResponse>
            <Transactions>
              <Transaction><TransactionID>T1</TransactionID></Transaction>
              <Transaction><TransactionID>T2</TransactionID></Transaction>
            </Transactions>
        </SearchTransactionsResponse></Body></Envelope>"#;
        let ids = SoapFetcher::extract_transaction_ids(xml);
        assert_eq!(ids, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[test]
    fn extracts_payload_bytes_from_get_transaction_response() {
        let xml = r#"<Envelope><Body><GetTransactionResponse>
            <TransactionFile>&lt;Claim.Submission&gt;&lt;/Claim.Submission&gt;</TransactionFile>
        </GetTransactionResponse></Body></Envelope>"#;
        let payload = SoapFetcher::extract_payload(xml).unwrap();
        assert_eq!(String::from_utf8(payload).unwrap(), "<Claim.Submission></Claim.Submission>");
    }
}
