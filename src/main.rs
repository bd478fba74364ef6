//! Process entry point. Parses configuration, wires the Fetcher/Acker pair
//! for the configured source, and drives one `Orchestrator` run to
//! completion. Everything beyond argument parsing and wiring lives in the
//! library crate (`ingestion_engine::*`).

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;

use ingestion_engine::acker::{Acker, LocalFsAcker, SoapAcker};
use ingestion_engine::config::{Config, SourceKind};
use ingestion_engine::fetcher::localfs::LocalFsFetcher;
use ingestion_engine::fetcher::soap::SoapFetcher;
use ingestion_engine::fetcher::{Fetcher, MultiFetcher};
use ingestion_engine::logging;
use ingestion_engine::mapper::RefResolver;
use ingestion_engine::orchestrator::Orchestrator;
use ingestion_engine::persist::{MemoryStore, PersistStore, PostgresStore};
use ingestion_engine::reporter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::parse());
    logging::init_tracing(config.verbose);

    // TODO: a standing MemoryStore run has no durability across restarts —
    // fine for the localfs demo/dev path, not for a production deployment.
    let (store, resolver): (Arc<dyn PersistStore>, Arc<dyn RefResolver>) = if config.database_url.is_empty() {
        tracing::warn!("DATABASE_URL not set, running against an in-process MemoryStore");
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store)
    } else {
        let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
        (store.clone(), store)
    };

    let (fetcher, acker): (Arc<dyn Fetcher>, Arc<dyn Acker>) = match config.source {
        SourceKind::Soap => {
            let mut per_facility = HashMap::new();
            let mut members: Vec<Arc<dyn Fetcher>> = Vec::new();
            for facility_id in &config.soap_facility_ids {
                let soap_fetcher = Arc::new(SoapFetcher::new(&config, facility_id.clone())?);
                per_facility.insert(facility_id.clone(), soap_fetcher.clone());
                members.push(soap_fetcher);
            }
            let fetcher: Arc<dyn Fetcher> = Arc::new(MultiFetcher::new(members));
            let acker: Arc<dyn Acker> = Arc::new(SoapAcker::new(per_facility));
            (fetcher, acker)
        }
        SourceKind::LocalFs => {
            let fetcher: Arc<dyn Fetcher> = Arc::new(LocalFsFetcher::new(&config));
            let acker: Arc<dyn Acker> = Arc::new(LocalFsAcker::new(&config));
            (fetcher, acker)
        }
    };

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining in-flight work");
            shutdown_signal.notify_one();
        }
    });

    let orchestrator = Orchestrator::new(config, store, resolver);
    let run = orchestrator.run(fetcher, acker, shutdown).await?;

    reporter::print_run_summary(&run);
    Ok(())
}
