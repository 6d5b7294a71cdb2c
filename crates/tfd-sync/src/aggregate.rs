use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tfd_core::{slugify, Facility, RegionRollup, SubRegionRollup, SLUG_BODY_MAX_LEN};
use tfd_storage::{FacilityStore, StoreError, MAX_BATCH_ROWS};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub facilities: usize,
    pub indexable: usize,
    pub regions: usize,
    pub sub_regions: usize,
    /// Previously stored rollups no longer observed, rewritten with a zero count.
    pub stale_regions: usize,
    pub stale_sub_regions: usize,
}

/// Rebuilds region and sub-region counts from the persisted facilities.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    page_size: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(MAX_BATCH_ROWS)
    }
}

#[derive(Debug)]
struct SubRegionAcc {
    name: String,
    count: u64,
    coordinates: Option<(f64, f64)>,
}

impl Aggregator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.clamp(1, MAX_BATCH_ROWS),
        }
    }

    pub async fn recompute_rollups(
        &self,
        store: &dyn FacilityStore,
    ) -> Result<RollupReport, StoreError> {
        self.recompute_rollups_at(store, Utc::now()).await
    }

    pub async fn recompute_rollups_at(
        &self,
        store: &dyn FacilityStore,
        now: DateTime<Utc>,
    ) -> Result<RollupReport, StoreError> {
        let mut report = RollupReport::default();
        let mut regions: BTreeMap<String, (String, u64)> = BTreeMap::new();
        let mut sub_regions: BTreeMap<(String, String), SubRegionAcc> = BTreeMap::new();

        let mut offset = 0usize;
        loop {
            let page = store.facilities_page(offset, self.page_size).await?;
            let len = page.len();
            for facility in &page {
                report.facilities += 1;
                if facility.indexable {
                    report.indexable += 1;
                }
                observe(facility, &mut regions, &mut sub_regions);
            }
            if len < self.page_size {
                break;
            }
            offset += len;
        }

        let mut region_rows = regions
            .into_iter()
            .map(|(code, (name, count))| RegionRollup {
                slug: slugify(&name, SLUG_BODY_MAX_LEN),
                code,
                name,
                facility_count: count,
                updated_at: now,
            })
            .collect::<Vec<_>>();
        let mut sub_region_rows = sub_regions
            .into_iter()
            .map(|((region_code, slug), acc)| SubRegionRollup {
                name: acc.name,
                slug,
                region_code,
                facility_count: acc.count,
                latitude: acc.coordinates.map(|(lat, _)| lat),
                longitude: acc.coordinates.map(|(_, lon)| lon),
                updated_at: now,
            })
            .collect::<Vec<_>>();
        report.regions = region_rows.len();
        report.sub_regions = sub_region_rows.len();

        let stale_regions = self.stale_regions(store, &region_rows, now).await?;
        let stale_sub_regions = self.stale_sub_regions(store, &sub_region_rows, now).await?;
        report.stale_regions = stale_regions.len();
        report.stale_sub_regions = stale_sub_regions.len();
        region_rows.extend(stale_regions);
        sub_region_rows.extend(stale_sub_regions);

        for chunk in region_rows.chunks(self.page_size) {
            store.upsert_regions(chunk).await?;
        }
        for chunk in sub_region_rows.chunks(self.page_size) {
            store.upsert_sub_regions(chunk).await?;
        }

        info!(
            facilities = report.facilities,
            indexable = report.indexable,
            regions = report.regions,
            sub_regions = report.sub_regions,
            stale_regions = report.stale_regions,
            stale_sub_regions = report.stale_sub_regions,
            "rollups recomputed"
        );
        Ok(report)
    }

    async fn stale_regions(
        &self,
        store: &dyn FacilityStore,
        fresh: &[RegionRollup],
        now: DateTime<Utc>,
    ) -> Result<Vec<RegionRollup>, StoreError> {
        let fresh_codes = fresh.iter().map(|r| r.code.as_str()).collect::<HashSet<_>>();
        let mut stale = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = store.regions_page(offset, self.page_size).await?;
            let len = page.len();
            stale.extend(
                page.into_iter()
                    .filter(|r| r.facility_count > 0 && !fresh_codes.contains(&r.code.as_str()))
                    .map(|r| RegionRollup {
                        facility_count: 0,
                        updated_at: now,
                        ..r
                    }),
            );
            if len < self.page_size {
                break;
            }
            offset += len;
        }
        Ok(stale)
    }

    async fn stale_sub_regions(
        &self,
        store: &dyn FacilityStore,
        fresh: &[SubRegionRollup],
        now: DateTime<Utc>,
    ) -> Result<Vec<SubRegionRollup>, StoreError> {
        let fresh_keys = fresh
            .iter()
            .map(|r| (r.region_code.as_str(), r.slug.as_str()))
            .collect::<HashSet<_>>();
        let mut stale = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = store.sub_regions_page(offset, self.page_size).await?;
            let len = page.len();
            stale.extend(
                page.into_iter()
                    .filter(|r| {
                        r.facility_count > 0
                            && !fresh_keys.contains(&(r.region_code.as_str(), r.slug.as_str()))
                    })
                    .map(|r| SubRegionRollup {
                        facility_count: 0,
                        updated_at: now,
                        ..r
                    }),
            );
            if len < self.page_size {
                break;
            }
            offset += len;
        }
        Ok(stale)
    }
}

// Facilities arrive ordered by id, so the first one seen per key has the smallest id.
fn observe(
    facility: &Facility,
    regions: &mut BTreeMap<String, (String, u64)>,
    sub_regions: &mut BTreeMap<(String, String), SubRegionAcc>,
) {
    if facility.indexable {
        regions
            .entry(facility.region_code.clone())
            .or_insert_with(|| (facility.region_name.clone(), 0))
            .1 += 1;
    }

    let acc = sub_regions
        .entry((
            facility.region_code.clone(),
            facility.sub_region_slug.clone(),
        ))
        .or_insert_with(|| SubRegionAcc {
            name: facility.city.clone(),
            count: 0,
            coordinates: None,
        });
    if facility.indexable {
        acc.count += 1;
    }
    if acc.coordinates.is_none() {
        acc.coordinates = facility.coordinates();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::facility;
    use tfd_storage::{fetch_all_regions, MemoryStore};

    fn located(external_id: &str, city: &str, state: &str, score: f64) -> Facility {
        let mut f = facility(external_id, &format!("{city} Center {external_id}"), score);
        f.city = city.to_string();
        f.sub_region_slug = slugify(city, SLUG_BODY_MAX_LEN);
        f.region_code = state.to_string();
        f.region_name = match state {
            "TX" => "Texas".to_string(),
            "NV" => "Nevada".to_string(),
            other => other.to_string(),
        };
        f
    }

    #[tokio::test]
    async fn region_counts_sum_to_indexable_facilities() {
        let store = MemoryStore::new();
        let rows = vec![
            located("1", "Austin", "TX", 0.9),
            located("2", "Austin", "TX", 0.5),
            located("3", "El Paso", "TX", 0.75),
            located("4", "Reno", "NV", 0.8),
            located("5", "Elko", "NV", 0.3),
        ];
        store.upsert_facilities(&rows).await.unwrap();

        let report = Aggregator::default().recompute_rollups(&store).await.unwrap();
        assert_eq!(report.indexable, 3);
        assert_eq!(report.regions, 2);
        assert_eq!(report.sub_regions, 4);

        let regions = fetch_all_regions(&store).await.unwrap();
        let total: u64 = regions.iter().map(|r| r.facility_count).sum();
        assert_eq!(total, 3);
        assert_eq!(regions[0].name, "Nevada");
        assert_eq!(regions[1].slug, "texas");

        let subs = store.all_sub_regions().await;
        let elko = subs.iter().find(|s| s.slug == "elko").unwrap();
        assert_eq!(elko.facility_count, 0);
        let austin = subs.iter().find(|s| s.slug == "austin").unwrap();
        assert_eq!(austin.facility_count, 1);
    }

    #[tokio::test]
    async fn coordinates_come_from_smallest_id_with_both_values() {
        let store = MemoryStore::new();
        let mut a = located("a", "Reno", "NV", 0.9);
        let mut b = located("b", "Reno", "NV", 0.9);
        a.latitude = Some(39.5);
        a.longitude = Some(-119.8);
        b.latitude = Some(40.0);
        b.longitude = Some(-120.0);
        let (first, second) = if a.id < b.id { (a, b) } else { (b, a) };
        let mut first = first;
        first.longitude = None;
        let expected = second.coordinates();
        store.upsert_facilities(&[first, second]).await.unwrap();

        Aggregator::default().recompute_rollups(&store).await.unwrap();
        let subs = store.all_sub_regions().await;
        assert_eq!(subs.len(), 1);
        let reno = &subs[0];
        assert_eq!(reno.latitude.zip(reno.longitude), expected);
    }

    #[tokio::test]
    async fn vanished_regions_are_zeroed() {
        let store = MemoryStore::new();
        let reno = located("1", "Reno", "NV", 0.9);
        store.upsert_facilities(&[reno.clone()]).await.unwrap();
        Aggregator::default().recompute_rollups(&store).await.unwrap();

        store.delete_facilities(&[reno.id]).await.unwrap();
        store
            .upsert_facilities(&[located("2", "Austin", "TX", 0.9)])
            .await
            .unwrap();
        let report = Aggregator::default().recompute_rollups(&store).await.unwrap();
        assert_eq!(report.stale_regions, 1);
        assert_eq!(report.stale_sub_regions, 1);

        let regions = fetch_all_regions(&store).await.unwrap();
        let nevada = regions.iter().find(|r| r.code == "NV").unwrap();
        assert_eq!(nevada.facility_count, 0);
        let total: u64 = regions.iter().map(|r| r.facility_count).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn many_vanished_cities_are_zeroed_in_one_pass() {
        let store = MemoryStore::new();
        let before = (0..3000)
            .map(|i| located(&format!("old-{i}"), &format!("Town {i}"), "TX", 0.9))
            .collect::<Vec<_>>();
        for chunk in before.chunks(MAX_BATCH_ROWS) {
            store.upsert_facilities(chunk).await.unwrap();
        }
        Aggregator::default().recompute_rollups(&store).await.unwrap();

        let ids = before.iter().map(|f| f.id).collect::<Vec<_>>();
        for chunk in ids.chunks(MAX_BATCH_ROWS) {
            store.delete_facilities(chunk).await.unwrap();
        }
        let kept = (0..10)
            .map(|i| located(&format!("new-{i}"), &format!("Town {i}"), "TX", 0.9))
            .collect::<Vec<_>>();
        store.upsert_facilities(&kept).await.unwrap();

        let started = std::time::Instant::now();
        let report = Aggregator::default().recompute_rollups(&store).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(report.sub_regions, 10);
        assert_eq!(report.stale_sub_regions, 2990);

        let subs = store.all_sub_regions().await;
        let live: u64 = subs.iter().map(|s| s.facility_count).sum();
        assert_eq!(live, 10);
        assert_eq!(subs.len(), 3000);
    }

    #[tokio::test]
    async fn small_pages_cover_every_facility() {
        let store = MemoryStore::new();
        let rows = (0..7)
            .map(|i| located(&i.to_string(), "Austin", "TX", 0.9))
            .collect::<Vec<_>>();
        store.upsert_facilities(&rows).await.unwrap();

        let report = Aggregator::new(2).recompute_rollups(&store).await.unwrap();
        assert_eq!(report.facilities, 7);
        let regions = fetch_all_regions(&store).await.unwrap();
        assert_eq!(regions[0].facility_count, 7);
    }
}
