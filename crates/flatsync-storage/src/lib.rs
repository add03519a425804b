//! Listing persistence and the outbound HTTP plumbing shared by adapters.

mod fetch;
mod postgres;
mod records;

pub use fetch::{BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher};
pub use postgres::{connect_pool, run_migrations, PgRecordStore};
pub use records::{MemoryRecordStore, RecordStore};

pub const CRATE_NAME: &str = "flatsync-storage";
