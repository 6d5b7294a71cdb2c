use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tfd_adapters::{SourceClient, Transformer};
use tfd_core::Facility;
use tfd_storage::{FacilityStore, MemoryStore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::Aggregator;
use crate::config::SyncConfig;
use crate::dedup::dedupe;
use crate::persist::BatchPersister;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Run every stage against a throwaway in-memory store.
    pub dry_run: bool,
    /// Clear facilities and rollups before loading. Ignored on dry runs.
    pub truncate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub fetched: usize,
    pub transformed: usize,
    pub skipped: usize,
    pub deduped_out: usize,
    pub persisted: usize,
    pub failed: usize,
    pub pages_requested: u32,
    pub pages_skipped: u32,
    pub source_record_count: Option<u64>,
    pub regions: usize,
    pub sub_regions: usize,
    pub indexable: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}{}: fetched={} transformed={} skipped={} deduped_out={} persisted={} failed={} \
             pages_skipped={} regions={} sub_regions={} indexable={}",
            self.run_id,
            if self.dry_run { " (dry run)" } else { "" },
            self.fetched,
            self.transformed,
            self.skipped,
            self.deduped_out,
            self.persisted,
            self.failed,
            self.pages_skipped,
            self.regions,
            self.sub_regions,
            self.indexable,
        )
    }
}

/// fetch → transform → dedupe → persist → aggregate, in that order.
pub struct IngestPipeline {
    source: SourceClient,
    transformer: Transformer,
    persister: BatchPersister,
    aggregator: Aggregator,
    store: Arc<dyn FacilityStore>,
}

impl IngestPipeline {
    pub fn new(
        source: SourceClient,
        transformer: Transformer,
        persister: BatchPersister,
        aggregator: Aggregator,
        store: Arc<dyn FacilityStore>,
    ) -> Self {
        Self {
            source,
            transformer,
            persister,
            aggregator,
            store,
        }
    }

    pub async fn from_config(config: &SyncConfig, store: Arc<dyn FacilityStore>) -> Result<Self> {
        let batch = config.effective_batch_size();
        Ok(Self::new(
            config.source_client()?,
            config.transformer().await?,
            BatchPersister::new(batch),
            Aggregator::new(batch),
            store,
        ))
    }

    pub async fn run(&self, options: &IngestOptions) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, dry_run = options.dry_run);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: &IngestOptions) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let scratch;
        let target: &dyn FacilityStore = if options.dry_run {
            scratch = MemoryStore::new();
            &scratch
        } else {
            self.store.as_ref()
        };

        if options.truncate {
            if options.dry_run {
                warn!("--truncate ignored on a dry run");
            } else {
                target
                    .truncate_all()
                    .await
                    .context("truncating facilities and rollups")?;
                info!("store truncated");
            }
        }

        let mut fetched = 0usize;
        let mut skipped = 0usize;
        let mut facilities: Vec<Facility> = Vec::new();
        let mut cursor = self.source.pages();
        while let Some(page) = cursor.next_page().await {
            for raw in &page.rows {
                let ordinal = fetched;
                fetched += 1;
                match self.transformer.transform_at(raw, ordinal, started_at) {
                    Some(facility) => facilities.push(facility),
                    None => skipped += 1,
                }
            }
            info!(
                page = page.page,
                rows = page.rows.len(),
                fetched,
                skipped,
                "page processed"
            );
        }
        let stats = cursor.stats();
        let transformed = facilities.len();

        let outcome = dedupe(facilities);
        let deduped_out = outcome.removed.len();
        info!(
            survivors = outcome.survivors.len(),
            deduped_out, "dedupe complete"
        );

        let persisted = self.persister.upsert_all(target, &outcome.survivors).await;
        let rollups = self
            .aggregator
            .recompute_rollups(target)
            .await
            .context("recomputing rollups")?;

        if !options.dry_run {
            match stats.record_count {
                Some(record_count) => {
                    let mut state = target.sync_state().await.context("reading sync state")?;
                    state.last_record_count = Some(record_count);
                    state.last_ingested_at = Some(Utc::now());
                    target
                        .save_sync_state(&state)
                        .await
                        .context("saving sync state")?;
                }
                None => warn!("source reported no totals; sync state left unchanged"),
            }
        }

        let summary = IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            fetched,
            transformed,
            skipped,
            deduped_out,
            persisted: persisted.upserted,
            failed: persisted.failed,
            pages_requested: stats.pages_requested,
            pages_skipped: stats.pages_skipped,
            source_record_count: stats.record_count,
            regions: rollups.regions,
            sub_regions: rollups.sub_regions,
            indexable: rollups.indexable,
        };
        info!(%summary, "ingest finished");
        Ok(summary)
    }
}
