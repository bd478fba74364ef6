//! Persist. Idempotent relational writes behind a swappable DAO contract.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{NewIngestionFile, OrphanCounts, PersistCounts, PersistStore, UpsertFileOutcome};
