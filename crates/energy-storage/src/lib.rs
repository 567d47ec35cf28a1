//! Persistence, upsert writing, raw-file archiving and HTTP fetch utilities.

mod archive;
mod http;
mod memory;
mod postgres;
mod store;
mod writer;

pub use archive::{ArchivedFile, KeptDownload, RawArchive};
pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use memory::{MemoryStore, StoredRow};
pub use postgres::{PgStore, PoolSettings};
pub use store::{JobLog, StoreError, TimeSeriesStore};
pub use writer::{UpsertWriter, WriteOutcome, WritePath};

pub const CRATE_NAME: &str = "energy-storage";
