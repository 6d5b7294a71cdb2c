use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tfd_core::Facility;
use tfd_storage::{FacilityStore, StoreError, MAX_BATCH_ROWS};
use tracing::info;
use uuid::Uuid;

/// Exact-match identity of a facility: (name, street, city, state, phone), blanks as "".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub phone: String,
}

impl NaturalKey {
    pub fn of(facility: &Facility) -> Self {
        Self {
            name: facility.name.clone(),
            street: facility.street1.clone().unwrap_or_default(),
            city: facility.city.clone(),
            state: facility.region_code.clone(),
            phone: facility.phone.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// One facility per natural key, in first-seen key order.
    pub survivors: Vec<Facility>,
    pub removed: Vec<Facility>,
}

/// Keeps the highest-scored facility per natural key; ties keep the first seen.
pub fn dedupe(records: Vec<Facility>) -> DedupOutcome {
    let mut index: HashMap<NaturalKey, usize> = HashMap::with_capacity(records.len());
    let mut outcome = DedupOutcome::default();

    for record in records {
        match index.entry(NaturalKey::of(&record)) {
            Entry::Vacant(slot) => {
                slot.insert(outcome.survivors.len());
                outcome.survivors.push(record);
            }
            Entry::Occupied(slot) => {
                let current = &mut outcome.survivors[*slot.get()];
                if record.quality_score > current.quality_score {
                    let loser = std::mem::replace(current, record);
                    outcome.removed.push(loser);
                } else {
                    outcome.removed.push(record);
                }
            }
        }
    }

    outcome
}

/// Same rule against already-persisted rows: scan in id order, then delete the losers.
pub async fn dedupe_store(store: &dyn FacilityStore) -> Result<usize, StoreError> {
    let mut winners: HashMap<NaturalKey, (Uuid, f64)> = HashMap::new();
    let mut losers: Vec<Uuid> = Vec::new();
    let mut offset = 0usize;
    let mut scanned = 0usize;

    loop {
        let page = store.facilities_page(offset, MAX_BATCH_ROWS).await?;
        let len = page.len();
        for facility in page {
            scanned += 1;
            match winners.entry(NaturalKey::of(&facility)) {
                Entry::Vacant(slot) => {
                    slot.insert((facility.id, facility.quality_score));
                }
                Entry::Occupied(mut slot) => {
                    let (best_id, best_score) = *slot.get();
                    if facility.quality_score > best_score {
                        losers.push(best_id);
                        slot.insert((facility.id, facility.quality_score));
                    } else {
                        losers.push(facility.id);
                    }
                }
            }
        }
        if len < MAX_BATCH_ROWS {
            break;
        }
        offset += len;
    }

    let mut removed = 0usize;
    for chunk in losers.chunks(MAX_BATCH_ROWS) {
        removed += store.delete_facilities(chunk).await?;
    }
    info!(scanned, removed, "store dedupe pass complete");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::facility;
    use tfd_storage::MemoryStore;

    #[test]
    fn higher_score_wins_regardless_of_order() {
        let high = facility("a", "Harbor House", 0.9);
        let low = facility("b", "Harbor House", 0.6);

        let forward = dedupe(vec![high.clone(), low.clone()]);
        let backward = dedupe(vec![low.clone(), high.clone()]);

        for outcome in [forward, backward] {
            assert_eq!(outcome.survivors.len(), 1);
            assert_eq!(outcome.survivors[0].external_id, "a");
            assert_eq!(outcome.removed.len(), 1);
            assert_eq!(outcome.removed[0].external_id, "b");
        }
    }

    #[test]
    fn ties_keep_first_seen() {
        let first = facility("first", "Harbor House", 0.7);
        let second = facility("second", "Harbor House", 0.7);
        let outcome = dedupe(vec![first, second]);
        assert_eq!(outcome.survivors[0].external_id, "first");
    }

    #[test]
    fn missing_fields_compare_as_empty_and_other_keys_survive() {
        let mut a = facility("a", "Harbor House", 0.5);
        a.phone = None;
        let mut b = facility("b", "Harbor House", 0.8);
        b.phone = None;
        let mut c = facility("c", "Harbor House", 0.4);
        c.street1 = Some("1 Other Rd".into());
        let d = facility("d", "Lakeside", 0.3);

        let outcome = dedupe(vec![a, c, b, d]);
        let ids = outcome
            .survivors
            .iter()
            .map(|f| f.external_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "c", "d"]);
        assert_eq!(outcome.removed.len(), 1);
    }

    #[tokio::test]
    async fn store_pass_deletes_lower_scored_duplicates() {
        let store = MemoryStore::new();
        let mut rows = vec![
            facility("a", "Harbor House", 0.6),
            facility("b", "Harbor House", 0.9),
            facility("c", "Harbor House", 0.2),
            facility("d", "Lakeside", 0.5),
        ];
        for (i, row) in rows.iter_mut().enumerate() {
            row.slug = format!("slug-{i}");
        }
        store.upsert_facilities(&rows).await.unwrap();

        let removed = dedupe_store(&store).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.facility_count().await, 2);
        assert!(store.facility_by_slug("slug-1").await.unwrap().is_some());
        assert!(store.facility_by_slug("slug-3").await.unwrap().is_some());

        assert_eq!(dedupe_store(&store).await.unwrap(), 0);
    }
}
