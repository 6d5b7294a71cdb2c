use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tfd_core::{Facility, RegionRollup, SubRegionRollup, SyncState};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{check_batch, FacilityStore, StoreError};

/// In-process backend with the same batch limits and conflict rules as the Postgres store.
/// Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    facilities: BTreeMap<Uuid, Facility>,
    slugs: HashMap<String, Uuid>,
    regions: BTreeMap<String, RegionRollup>,
    sub_regions: BTreeMap<(String, String), SubRegionRollup>,
    sync_state: SyncState,
    rejected_external_ids: HashSet<String>,
    facility_write_calls: usize,
    largest_write: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any write touching one of these external ids fails, like a constraint violation would.
    pub fn with_rejected_external_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(MemoryState {
                rejected_external_ids: ids.into_iter().map(Into::into).collect(),
                ..MemoryState::default()
            }),
        }
    }

    pub async fn facility_count(&self) -> usize {
        self.state.lock().await.facilities.len()
    }

    pub async fn facility_write_calls(&self) -> usize {
        self.state.lock().await.facility_write_calls
    }

    /// Largest row count seen by any single write or delete call.
    pub async fn largest_write(&self) -> usize {
        self.state.lock().await.largest_write
    }

    pub async fn all_sub_regions(&self) -> Vec<SubRegionRollup> {
        self.state.lock().await.sub_regions.values().cloned().collect()
    }
}

impl MemoryState {
    fn note_write(&mut self, rows: usize) {
        self.largest_write = self.largest_write.max(rows);
    }

    fn validate_facilities(&self, rows: &[Facility]) -> Result<(), StoreError> {
        let mut seen_ids = HashSet::new();
        let mut seen_slugs = HashSet::new();
        for row in rows {
            if self.rejected_external_ids.contains(&row.external_id) {
                return Err(StoreError::Rejected(format!(
                    "external_id {} violates a constraint",
                    row.external_id
                )));
            }
            if !seen_ids.insert(row.external_id.as_str()) {
                return Err(StoreError::Rejected(format!(
                    "external_id {} appears twice in one batch",
                    row.external_id
                )));
            }
            if !seen_slugs.insert(row.slug.as_str()) {
                return Err(StoreError::Rejected(format!("duplicate slug {}", row.slug)));
            }
            if let Some(owner) = self.slugs.get(&row.slug) {
                if *owner != row.id {
                    return Err(StoreError::Rejected(format!("slug {} already taken", row.slug)));
                }
            }
        }
        Ok(())
    }
}

fn page<T>(items: impl Iterator<Item = T>, offset: usize, limit: usize) -> Vec<T> {
    items.skip(offset).take(limit).collect()
}

#[async_trait]
impl FacilityStore for MemoryStore {
    async fn upsert_facilities(&self, rows: &[Facility]) -> Result<usize, StoreError> {
        check_batch(rows.len())?;
        let mut state = self.state.lock().await;
        state.facility_write_calls += 1;
        state.note_write(rows.len());
        state.validate_facilities(rows)?;

        for row in rows {
            let mut row = row.clone();
            if let Some(existing) = state.facilities.get(&row.id) {
                row.created_at = existing.created_at;
                let old_slug = existing.slug.clone();
                state.slugs.remove(&old_slug);
            }
            state.slugs.insert(row.slug.clone(), row.id);
            state.facilities.insert(row.id, row);
        }
        Ok(rows.len())
    }

    async fn facilities_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Facility>, StoreError> {
        check_batch(limit)?;
        let state = self.state.lock().await;
        Ok(page(state.facilities.values().cloned(), offset, limit))
    }

    async fn delete_facilities(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        check_batch(ids.len())?;
        let mut state = self.state.lock().await;
        state.note_write(ids.len());
        let mut removed = 0;
        for id in ids {
            if let Some(row) = state.facilities.remove(id) {
                state.slugs.remove(&row.slug);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn upsert_regions(&self, rows: &[RegionRollup]) -> Result<usize, StoreError> {
        check_batch(rows.len())?;
        let mut state = self.state.lock().await;
        state.note_write(rows.len());
        for row in rows {
            state.regions.insert(row.code.clone(), row.clone());
        }
        Ok(rows.len())
    }

    async fn regions_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RegionRollup>, StoreError> {
        check_batch(limit)?;
        let state = self.state.lock().await;
        Ok(page(state.regions.values().cloned(), offset, limit))
    }

    async fn upsert_sub_regions(&self, rows: &[SubRegionRollup]) -> Result<usize, StoreError> {
        check_batch(rows.len())?;
        let mut state = self.state.lock().await;
        state.note_write(rows.len());
        for row in rows {
            state
                .sub_regions
                .insert((row.region_code.clone(), row.slug.clone()), row.clone());
        }
        Ok(rows.len())
    }

    async fn sub_regions_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SubRegionRollup>, StoreError> {
        check_batch(limit)?;
        let state = self.state.lock().await;
        Ok(page(state.sub_regions.values().cloned(), offset, limit))
    }

    async fn truncate_all(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.facilities.clear();
        state.slugs.clear();
        state.regions.clear();
        state.sub_regions.clear();
        Ok(())
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        Ok(self.state.lock().await.sync_state.clone())
    }

    async fn save_sync_state(&self, sync_state: &SyncState) -> Result<(), StoreError> {
        self.state.lock().await.sync_state = sync_state.clone();
        Ok(())
    }

    async fn facility_by_slug(&self, slug: &str) -> Result<Option<Facility>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .slugs
            .get(slug)
            .and_then(|id| state.facilities.get(id))
            .cloned())
    }

    async fn facilities_in_sub_region(
        &self,
        region_code: &str,
        sub_region_slug: &str,
        limit: usize,
    ) -> Result<Vec<Facility>, StoreError> {
        check_batch(limit)?;
        let state = self.state.lock().await;
        let mut rows = state
            .facilities
            .values()
            .filter(|f| {
                f.indexable && f.region_code == region_code && f.sub_region_slug == sub_region_slug
            })
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.quality_score
                .total_cmp(&a.quality_score)
                .then_with(|| a.name.cmp(&b.name))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn indexable_ids_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        check_batch(limit)?;
        let state = self.state.lock().await;
        Ok(page(
            state
                .facilities
                .values()
                .filter(|f| f.indexable)
                .map(|f| f.id),
            offset,
            limit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn facility(external_id: &str, slug: &str) -> Facility {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        Facility {
            id: Facility::id_for_external_id(external_id),
            external_id: external_id.to_string(),
            slug: slug.to_string(),
            name: "Harbor House".into(),
            alternate_name: None,
            street1: None,
            street2: None,
            city: "Austin".into(),
            sub_region_slug: "austin".into(),
            region_code: "TX".into(),
            region_name: "Texas".into(),
            zip: None,
            phone: None,
            intake_phone: None,
            hotline: None,
            website: None,
            latitude: None,
            longitude: None,
            facility_type: None,
            care_types: vec![],
            settings: vec![],
            payment_options: vec![],
            age_groups: vec![],
            special_programs: vec![],
            quality_score: 0.8,
            indexable: true,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn rejects_batches_over_the_row_limit() {
        let store = MemoryStore::new();
        let rows = (0..1001)
            .map(|i| facility(&i.to_string(), &format!("slug-{i}")))
            .collect::<Vec<_>>();
        let err = store.upsert_facilities(&rows).await.unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge { rows: 1001, .. }));
        assert_eq!(store.facility_count().await, 0);
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_replaces_slug() {
        let store = MemoryStore::new();
        let first = facility("1", "harbor-house-a");
        store.upsert_facilities(&[first.clone()]).await.unwrap();

        let mut second = facility("1", "harbor-house-b");
        second.created_at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().unwrap();
        store.upsert_facilities(&[second]).await.unwrap();

        assert_eq!(store.facility_count().await, 1);
        assert!(store.facility_by_slug("harbor-house-a").await.unwrap().is_none());
        let stored = store.facility_by_slug("harbor-house-b").await.unwrap().unwrap();
        assert_eq!(stored.created_at, first.created_at);
    }

    #[tokio::test]
    async fn rejected_ids_fail_the_whole_batch() {
        let store = MemoryStore::with_rejected_external_ids(["bad"]);
        let rows = vec![facility("good", "good"), facility("bad", "bad")];
        assert!(store.upsert_facilities(&rows).await.is_err());
        assert_eq!(store.facility_count().await, 0);
        store.upsert_facilities(&rows[..1]).await.unwrap();
        assert_eq!(store.facility_count().await, 1);
    }
}
