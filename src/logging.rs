//! Structured logging helpers: a small module of named functions components
//! call instead of formatting their own strings, backed by `tracing` so
//! ingestion runs produce leveled, field-structured, greppable logs.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Call once from `main`.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

pub fn log_claim_event(component: &str, claim_id: &str, event: &str, message: &str) {
    tracing::info!(component, claim_id, event, "{message}");
}

pub fn log_file_event(component: &str, file_id: &str, event: &str, message: &str) {
    tracing::info!(component, file_id, event, "{message}");
}

pub fn log_run_event(run_id: &str, event: &str, message: &str) {
    tracing::info!(run_id, event, "{message}");
}

pub fn log_error(component: &str, context_id: &str, error_code: &str, message: &str) {
    tracing::error!(component, context_id, error_code, "{message}");
}
