//! Row store + HTTP fetch utilities for TFD.

mod fetch;
mod memory;
mod postgres;
mod store;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{check_batch, fetch_all_regions, FacilityStore, StoreError, MAX_BATCH_ROWS};

pub const CRATE_NAME: &str = "tfd-storage";
