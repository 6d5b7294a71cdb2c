use async_trait::async_trait;
use tfd_core::{Facility, RegionRollup, SubRegionRollup, SyncState};
use thiserror::Error;
use uuid::Uuid;

/// Hard per-call row limit enforced by the backend for inserts, selects and deletes.
pub const MAX_BATCH_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch of {rows} rows exceeds the backend limit of {limit}")]
    BatchTooLarge { rows: usize, limit: usize },
    #[error("row rejected by backend: {0}")]
    Rejected(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub fn check_batch(rows: usize) -> Result<(), StoreError> {
    if rows > MAX_BATCH_ROWS {
        return Err(StoreError::BatchTooLarge {
            rows,
            limit: MAX_BATCH_ROWS,
        });
    }
    Ok(())
}

/// Row-oriented backend. Every bulk call is capped at [`MAX_BATCH_ROWS`]; callers page with
/// `offset`/`limit` for anything larger.
#[async_trait]
pub trait FacilityStore: Send + Sync {
    /// Insert or overwrite by `external_id`. `created_at` of an existing row is kept.
    async fn upsert_facilities(&self, rows: &[Facility]) -> Result<usize, StoreError>;

    /// Facilities ordered by `id`.
    async fn facilities_page(&self, offset: usize, limit: usize)
        -> Result<Vec<Facility>, StoreError>;

    async fn delete_facilities(&self, ids: &[Uuid]) -> Result<usize, StoreError>;

    async fn upsert_regions(&self, rows: &[RegionRollup]) -> Result<usize, StoreError>;

    /// Region rollups ordered by `code`.
    async fn regions_page(&self, offset: usize, limit: usize)
        -> Result<Vec<RegionRollup>, StoreError>;

    async fn upsert_sub_regions(&self, rows: &[SubRegionRollup]) -> Result<usize, StoreError>;

    /// Sub-region rollups ordered by `(region_code, slug)`.
    async fn sub_regions_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SubRegionRollup>, StoreError>;

    /// Clears facilities and both rollup tables.
    async fn truncate_all(&self) -> Result<(), StoreError>;

    async fn sync_state(&self) -> Result<SyncState, StoreError>;

    async fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError>;

    async fn facility_by_slug(&self, slug: &str) -> Result<Option<Facility>, StoreError>;

    /// Indexable facilities of one city, best score first.
    async fn facilities_in_sub_region(
        &self,
        region_code: &str,
        sub_region_slug: &str,
        limit: usize,
    ) -> Result<Vec<Facility>, StoreError>;

    /// Ids of indexable facilities ordered by `id`.
    async fn indexable_ids_page(&self, offset: usize, limit: usize)
        -> Result<Vec<Uuid>, StoreError>;
}

/// All region rollups, read page by page and sorted by display name.
pub async fn fetch_all_regions(store: &dyn FacilityStore) -> Result<Vec<RegionRollup>, StoreError> {
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.regions_page(offset, MAX_BATCH_ROWS).await?;
        let len = page.len();
        out.extend(page);
        if len < MAX_BATCH_ROWS {
            break;
        }
        offset += len;
    }
    out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.code.cmp(&b.code)));
    Ok(out)
}
