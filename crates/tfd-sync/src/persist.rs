use serde::Serialize;
use tfd_core::Facility;
use tfd_storage::{FacilityStore, MAX_BATCH_ROWS};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub upserted: usize,
    pub failed: usize,
    pub chunks: usize,
    /// Chunks that failed as a whole and were retried row by row.
    pub fallbacks: usize,
}

/// Writes facilities in chunks no larger than the backend allows.
#[derive(Debug, Clone, Copy)]
pub struct BatchPersister {
    chunk_size: usize,
}

impl Default for BatchPersister {
    fn default() -> Self {
        Self::new(MAX_BATCH_ROWS)
    }
}

impl BatchPersister {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, MAX_BATCH_ROWS),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn upsert_all(&self, store: &dyn FacilityStore, rows: &[Facility]) -> PersistReport {
        let mut report = PersistReport::default();

        for (idx, chunk) in rows.chunks(self.chunk_size).enumerate() {
            report.chunks += 1;
            match store.upsert_facilities(chunk).await {
                Ok(written) => {
                    report.upserted += written;
                    info!(chunk = idx, rows = written, "upserted facility chunk");
                }
                Err(err) => {
                    report.fallbacks += 1;
                    warn!(
                        chunk = idx,
                        rows = chunk.len(),
                        error = %err,
                        "chunk upsert failed; retrying row by row"
                    );
                    for row in chunk {
                        match store.upsert_facilities(std::slice::from_ref(row)).await {
                            Ok(written) => report.upserted += written,
                            Err(err) => {
                                report.failed += 1;
                                warn!(
                                    external_id = %row.external_id,
                                    slug = %row.slug,
                                    error = %err,
                                    "facility upsert failed"
                                );
                            }
                        }
                    }
                }
            }
        }

        report
    }
}
