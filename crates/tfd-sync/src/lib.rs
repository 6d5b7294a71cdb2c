//! Ingest orchestration: dedupe, batched persistence, rollups, change detection and scheduling.

mod aggregate;
mod change;
mod config;
mod dedup;
mod persist;
mod pipeline;
mod schedule;

pub use aggregate::{Aggregator, RollupReport};
pub use change::{needs_update, ChangeDetector, UpdateCheck};
pub use config::{region_table_from_yaml, SyncConfig, DEFAULT_CHANGE_THRESHOLD, DEFAULT_SOURCE_URL};
pub use dedup::{dedupe, dedupe_store, DedupOutcome, NaturalKey};
pub use persist::{BatchPersister, PersistReport};
pub use pipeline::{IngestOptions, IngestPipeline, IngestSummary};
pub use schedule::maybe_build_scheduler;

pub const CRATE_NAME: &str = "tfd-sync";
