//! Error kinds shared across the ingestion pipeline.
//!
//! Every stage returns a `Result<T, ErrorKind>` (or a type that carries one via
//! `#[from]`) so the orchestrator can pattern-match on kind to decide retry, ack,
//! or terminal failure without inspecting stringly-typed messages.

use thiserror::Error;

/// The closed set of error kinds an ingestion pipeline stage can produce.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("malformed XML: {0}")]
    ParseMalformed(String),

    #[error("XML schema violation: {0}")]
    ParseSchema(String),

    #[error("reference resolution failed: {0}")]
    MapRefResolution(String),

    #[error("persist validation failed: {0}")]
    PersistValidation(String),

    #[error("persist integrity violation: {0}")]
    PersistIntegrity(String),

    #[error("transient persistence failure: {0}")]
    PersistTransient(String),

    #[error("fatal persistence failure: {0}")]
    PersistFatal(String),

    #[error("aggregate recalculation failed: {0}")]
    AggregateFailed(String),

    #[error("verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("acknowledgement failed: {0}")]
    AckFailed(String),

    #[error("processing timed out: {0}")]
    Timeout(String),

    #[error("queue saturated: {0}")]
    QueueSaturated(String),

    #[error("transient fetch failure: {0}")]
    FetchTransient(String),

    #[error("fatal fetch failure: {0}")]
    FetchFatal(String),
}

impl ErrorKind {
    /// Short stable code recorded in `ingestion_error.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ParseMalformed(_) => "PARSE_MALFORMED",
            ErrorKind::ParseSchema(_) => "PARSE_SCHEMA",
            ErrorKind::MapRefResolution(_) => "MAP_REF_RESOLUTION",
            ErrorKind::PersistValidation(_) => "PERSIST_VALIDATION",
            ErrorKind::PersistIntegrity(_) => "PERSIST_INTEGRITY",
            ErrorKind::PersistTransient(_) => "PERSIST_TRANSIENT",
            ErrorKind::PersistFatal(_) => "PERSIST_FATAL",
            ErrorKind::AggregateFailed(_) => "AGGREGATE_FAILED",
            ErrorKind::VerificationMismatch(_) => "VERIFICATION_MISMATCH",
            ErrorKind::AckFailed(_) => "ACK_FAILED",
            ErrorKind::Timeout(_) => "TIMEOUT",
            ErrorKind::QueueSaturated(_) => "QUEUE_SATURATED",
            ErrorKind::FetchTransient(_) => "FETCH_TRANSIENT",
            ErrorKind::FetchFatal(_) => "FETCH_FATAL",
        }
    }

    /// Whether this kind is eligible for bounded local retry (§7 propagation rules).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PersistTransient(_)
                | ErrorKind::Timeout(_)
                | ErrorKind::QueueSaturated(_)
                | ErrorKind::FetchTransient(_)
        )
    }

    /// Whether a file failing with this kind should be treated as terminal
    /// (acked/moved to error sink so the source stops re-offering it).
    pub fn terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ParseMalformed(_)
                | ErrorKind::ParseSchema(_)
                | ErrorKind::PersistFatal(_)
                | ErrorKind::FetchFatal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec_table() {
        assert!(ErrorKind::PersistTransient("x".into()).retryable());
        assert!(ErrorKind::Timeout("x".into()).retryable());
        assert!(ErrorKind::QueueSaturated("x".into()).retryable());
        assert!(ErrorKind::FetchTransient("x".into()).retryable());
        assert!(!ErrorKind::ParseMalformed("x".into()).retryable());
        assert!(!ErrorKind::VerificationMismatch("x".into()).retryable());
    }

    #[test]
    fn terminal_kinds_match_spec_table() {
        assert!(ErrorKind::ParseMalformed("x".into()).terminal());
        assert!(ErrorKind::PersistFatal("x".into()).terminal());
        assert!(!ErrorKind::PersistTransient("x".into()).terminal());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::VerificationMismatch("x".into()).code(), "VERIFICATION_MISMATCH");
    }
}
