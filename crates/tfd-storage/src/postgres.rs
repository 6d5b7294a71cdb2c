use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tfd_core::{Facility, RegionRollup, SubRegionRollup, SyncState};
use tracing::info;
use uuid::Uuid;

use crate::store::{check_batch, FacilityStore, StoreError};

const FACILITY_COLUMNS: &str = "id, external_id, slug, name, alternate_name, street1, street2, \
     city, sub_region_slug, region_code, region_name, zip, phone, intake_phone, hotline, \
     website, latitude, longitude, facility_type, care_types, settings, payment_options, \
     age_groups, special_programs, quality_score, indexable, created_at, updated_at";

/// Postgres-backed store. Applies the same per-call row limit as the hosted backend.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

fn facility_from_row(row: &PgRow) -> Result<Facility, sqlx::Error> {
    Ok(Facility {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        alternate_name: row.try_get("alternate_name")?,
        street1: row.try_get("street1")?,
        street2: row.try_get("street2")?,
        city: row.try_get("city")?,
        sub_region_slug: row.try_get("sub_region_slug")?,
        region_code: row.try_get("region_code")?,
        region_name: row.try_get("region_name")?,
        zip: row.try_get("zip")?,
        phone: row.try_get("phone")?,
        intake_phone: row.try_get("intake_phone")?,
        hotline: row.try_get("hotline")?,
        website: row.try_get("website")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        facility_type: row.try_get("facility_type")?,
        care_types: row.try_get("care_types")?,
        settings: row.try_get("settings")?,
        payment_options: row.try_get("payment_options")?,
        age_groups: row.try_get("age_groups")?,
        special_programs: row.try_get("special_programs")?,
        quality_score: row.try_get("quality_score")?,
        indexable: row.try_get("indexable")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn region_from_row(row: &PgRow) -> Result<RegionRollup, sqlx::Error> {
    let count: i64 = row.try_get("facility_count")?;
    Ok(RegionRollup {
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        facility_count: count.max(0) as u64,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sub_region_from_row(row: &PgRow) -> Result<SubRegionRollup, sqlx::Error> {
    let count: i64 = row.try_get("facility_count")?;
    Ok(SubRegionRollup {
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        region_code: row.try_get("region_code")?,
        facility_count: count.max(0) as u64,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl FacilityStore for PgStore {
    async fn upsert_facilities(&self, rows: &[Facility]) -> Result<usize, StoreError> {
        check_batch(rows.len())?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO facilities ({FACILITY_COLUMNS}) "));
        qb.push_values(rows, |mut b, f| {
            b.push_bind(f.id)
                .push_bind(&f.external_id)
                .push_bind(&f.slug)
                .push_bind(&f.name)
                .push_bind(&f.alternate_name)
                .push_bind(&f.street1)
                .push_bind(&f.street2)
                .push_bind(&f.city)
                .push_bind(&f.sub_region_slug)
                .push_bind(&f.region_code)
                .push_bind(&f.region_name)
                .push_bind(&f.zip)
                .push_bind(&f.phone)
                .push_bind(&f.intake_phone)
                .push_bind(&f.hotline)
                .push_bind(&f.website)
                .push_bind(f.latitude)
                .push_bind(f.longitude)
                .push_bind(&f.facility_type)
                .push_bind(&f.care_types)
                .push_bind(&f.settings)
                .push_bind(&f.payment_options)
                .push_bind(&f.age_groups)
                .push_bind(&f.special_programs)
                .push_bind(f.quality_score)
                .push_bind(f.indexable)
                .push_bind(f.created_at)
                .push_bind(f.updated_at);
        });
        qb.push(
            " ON CONFLICT (external_id) DO UPDATE SET \
             slug = EXCLUDED.slug, name = EXCLUDED.name, alternate_name = EXCLUDED.alternate_name, \
             street1 = EXCLUDED.street1, street2 = EXCLUDED.street2, city = EXCLUDED.city, \
             sub_region_slug = EXCLUDED.sub_region_slug, region_code = EXCLUDED.region_code, \
             region_name = EXCLUDED.region_name, zip = EXCLUDED.zip, phone = EXCLUDED.phone, \
             intake_phone = EXCLUDED.intake_phone, hotline = EXCLUDED.hotline, \
             website = EXCLUDED.website, latitude = EXCLUDED.latitude, \
             longitude = EXCLUDED.longitude, facility_type = EXCLUDED.facility_type, \
             care_types = EXCLUDED.care_types, settings = EXCLUDED.settings, \
             payment_options = EXCLUDED.payment_options, age_groups = EXCLUDED.age_groups, \
             special_programs = EXCLUDED.special_programs, \
             quality_score = EXCLUDED.quality_score, indexable = EXCLUDED.indexable, \
             updated_at = EXCLUDED.updated_at",
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn facilities_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Facility>, StoreError> {
        check_batch(limit)?;
        let rows = sqlx::query(&format!(
            "SELECT {FACILITY_COLUMNS} FROM facilities ORDER BY id OFFSET $1 LIMIT $2"
        ))
        .bind(as_i64(offset))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(facility_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn delete_facilities(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        check_batch(ids.len())?;
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM facilities WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_regions(&self, rows: &[RegionRollup]) -> Result<usize, StoreError> {
        check_batch(rows.len())?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO regions (code, name, slug, facility_count, updated_at) ");
        qb.push_values(rows, |mut b, r| {
            b.push_bind(&r.code)
                .push_bind(&r.name)
                .push_bind(&r.slug)
                .push_bind(as_i64(r.facility_count as usize))
                .push_bind(r.updated_at);
        });
        qb.push(
            " ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, slug = EXCLUDED.slug, \
             facility_count = EXCLUDED.facility_count, updated_at = EXCLUDED.updated_at",
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn regions_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RegionRollup>, StoreError> {
        check_batch(limit)?;
        let rows = sqlx::query(
            "SELECT code, name, slug, facility_count, updated_at FROM regions \
             ORDER BY code OFFSET $1 LIMIT $2",
        )
        .bind(as_i64(offset))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(region_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn upsert_sub_regions(&self, rows: &[SubRegionRollup]) -> Result<usize, StoreError> {
        check_batch(rows.len())?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sub_regions \
             (name, slug, region_code, facility_count, latitude, longitude, updated_at) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(&r.name)
                .push_bind(&r.slug)
                .push_bind(&r.region_code)
                .push_bind(as_i64(r.facility_count as usize))
                .push_bind(r.latitude)
                .push_bind(r.longitude)
                .push_bind(r.updated_at);
        });
        qb.push(
            " ON CONFLICT (slug, region_code) DO UPDATE SET name = EXCLUDED.name, \
             facility_count = EXCLUDED.facility_count, latitude = EXCLUDED.latitude, \
             longitude = EXCLUDED.longitude, updated_at = EXCLUDED.updated_at",
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn sub_regions_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SubRegionRollup>, StoreError> {
        check_batch(limit)?;
        let rows = sqlx::query(
            "SELECT name, slug, region_code, facility_count, latitude, longitude, updated_at \
             FROM sub_regions ORDER BY region_code, slug OFFSET $1 LIMIT $2",
        )
        .bind(as_i64(offset))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(sub_region_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn truncate_all(&self) -> Result<(), StoreError> {
        sqlx::query("TRUNCATE facilities, regions, sub_regions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        let row = sqlx::query(
            "SELECT last_record_count, last_ingested_at, last_checked_at \
             FROM sync_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(SyncState::default());
        };
        let count: Option<i64> = row.try_get("last_record_count")?;
        Ok(SyncState {
            last_record_count: count.map(|c| c.max(0) as u64),
            last_ingested_at: row.try_get("last_ingested_at")?,
            last_checked_at: row.try_get("last_checked_at")?,
        })
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (id, last_record_count, last_ingested_at, last_checked_at) \
             VALUES (1, $1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET last_record_count = EXCLUDED.last_record_count, \
             last_ingested_at = EXCLUDED.last_ingested_at, \
             last_checked_at = EXCLUDED.last_checked_at",
        )
        .bind(state.last_record_count.map(|c| as_i64(c as usize)))
        .bind(state.last_ingested_at)
        .bind(state.last_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn facility_by_slug(&self, slug: &str) -> Result<Option<Facility>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FACILITY_COLUMNS} FROM facilities WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(facility_from_row).transpose()?)
    }

    async fn facilities_in_sub_region(
        &self,
        region_code: &str,
        sub_region_slug: &str,
        limit: usize,
    ) -> Result<Vec<Facility>, StoreError> {
        check_batch(limit)?;
        let rows = sqlx::query(&format!(
            "SELECT {FACILITY_COLUMNS} FROM facilities \
             WHERE indexable AND region_code = $1 AND sub_region_slug = $2 \
             ORDER BY quality_score DESC, name LIMIT $3"
        ))
        .bind(region_code)
        .bind(sub_region_slug)
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(facility_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn indexable_ids_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        check_batch(limit)?;
        let rows = sqlx::query(
            "SELECT id FROM facilities WHERE indexable ORDER BY id OFFSET $1 LIMIT $2",
        )
        .bind(as_i64(offset))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?)
    }
}
