//! Core domain model for TFD: raw source rows, normalized facilities and rollups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

mod regions;

pub use regions::{normalize_code as normalize_region_code, RegionTable, BUILTIN_REGIONS};

pub const CRATE_NAME: &str = "tfd-core";

/// Score at or above which a facility is exposed to downstream consumers.
pub const DEFAULT_INDEXABLE_THRESHOLD: f64 = 0.70;

/// Maximum length of the readable part of a facility slug (before the id suffix).
pub const SLUG_BODY_MAX_LEN: usize = 80;

/// One page of the external provider's JSON export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePage {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub rows: Vec<RawRecord>,
}

/// Facility row exactly as the provider ships it. Transient: dropped after transformation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "_irow", deserialize_with = "lenient_string")]
    pub frid: Option<String>,
    #[serde(default)]
    pub name1: Option<String>,
    #[serde(default)]
    pub name2: Option<String>,
    #[serde(default)]
    pub street1: Option<String>,
    #[serde(default)]
    pub street2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub zip: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub intake1: Option<String>,
    #[serde(default)]
    pub hotline1: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub latitude: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub longitude: Option<String>,
    #[serde(default)]
    pub type_facility: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// Service-category entry: `f1` is the category label, `f2` its code, `f3` the delimited values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default, rename = "f1")]
    pub name: Option<String>,
    #[serde(default, rename = "f2")]
    pub code: String,
    #[serde(default, rename = "f3")]
    pub values: String,
}

/// Canonical persisted facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub external_id: String,
    pub slug: String,
    pub name: String,
    pub alternate_name: Option<String>,
    pub street1: Option<String>,
    pub street2: Option<String>,
    pub city: String,
    pub sub_region_slug: String,
    pub region_code: String,
    pub region_name: String,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub intake_phone: Option<String>,
    pub hotline: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub facility_type: Option<String>,
    pub care_types: Vec<String>,
    pub settings: Vec<String>,
    pub payment_options: Vec<String>,
    pub age_groups: Vec<String>,
    pub special_programs: Vec<String>,
    pub quality_score: f64,
    pub indexable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Facility {
    /// Stable surrogate id: the same external id always maps to the same UUID.
    pub fn id_for_external_id(external_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("tfd:facility:{external_id}").as_bytes(),
        )
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// State-level rollup, rebuilt from facilities on every aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRollup {
    pub code: String,
    pub name: String,
    pub slug: String,
    pub facility_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// City-level rollup. Unique per `(slug, region_code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRegionRollup {
    pub name: String,
    pub slug: String,
    pub region_code: String,
    pub facility_count: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Bookkeeping shared by the pipeline and the change detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_record_count: Option<u64>,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Lowercase ASCII-folded, hyphen-separated token string, truncated to `max_len`.
pub fn slugify(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.nfkd() {
        if !ch.is_ascii() {
            // combining marks and other non-ASCII residue from decomposition
            continue;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.len() > max_len {
        out.truncate(max_len);
    }
    out.trim_end_matches('-').to_string()
}

/// Trim, and map blank strings to `None`.
pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Text(s)) => Some(s),
        Some(Lenient::Int(i)) => Some(i.to_string()),
        Some(Lenient::Float(f)) => Some(f.to_string()),
        None => None,
    })
}
