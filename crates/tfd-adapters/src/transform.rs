use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tfd_core::{
    non_blank, normalize_region_code, slugify, Facility, RawRecord, RegionTable, ServiceEntry,
    DEFAULT_INDEXABLE_THRESHOLD, SLUG_BODY_MAX_LEN,
};

/// Hex characters of the external-id digest appended to every slug.
pub const SLUG_SUFFIX_LEN: usize = 8;

const COMPLETENESS_WEIGHT: f64 = 0.40;
const COMPLETENESS_FIELDS: f64 = 10.0;
const MANY_SERVICES_WEIGHT: f64 = 0.30;
const FEW_SERVICES_WEIGHT: f64 = 0.15;
const GEO_WEIGHT: f64 = 0.20;
const CONTACT_WEIGHT: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagField {
    CareTypes,
    Settings,
    PaymentOptions,
    AgeGroups,
    SpecialPrograms,
}

/// Service category code → output tag list. First entry per code wins.
pub const SERVICE_CODE_FIELDS: &[(&str, TagField)] = &[
    ("TC", TagField::CareTypes),
    ("SET", TagField::Settings),
    ("PAY", TagField::PaymentOptions),
    ("AGE", TagField::AgeGroups),
    ("SG", TagField::SpecialPrograms),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTags {
    pub care_types: Vec<String>,
    pub settings: Vec<String>,
    pub payment_options: Vec<String>,
    pub age_groups: Vec<String>,
    pub special_programs: Vec<String>,
}

impl ServiceTags {
    fn slot(&mut self, field: TagField) -> &mut Vec<String> {
        match field {
            TagField::CareTypes => &mut self.care_types,
            TagField::Settings => &mut self.settings,
            TagField::PaymentOptions => &mut self.payment_options,
            TagField::AgeGroups => &mut self.age_groups,
            TagField::SpecialPrograms => &mut self.special_programs,
        }
    }
}

/// One pass over the service array, routing each known code into its tag list.
pub fn extract_service_tags(services: &[ServiceEntry]) -> ServiceTags {
    let mut tags = ServiceTags::default();
    let mut filled: Vec<TagField> = Vec::with_capacity(SERVICE_CODE_FIELDS.len());

    for entry in services {
        let code = entry.code.trim();
        let Some((_, field)) = SERVICE_CODE_FIELDS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(code))
        else {
            continue;
        };
        if filled.contains(field) {
            continue;
        }
        filled.push(*field);
        *tags.slot(*field) = split_values(&entry.values);
    }
    tags
}

fn split_values(values: &str) -> Vec<String> {
    values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Numeric parse of a coordinate string; anything unparsable or non-finite is `None`.
pub fn parse_coordinate(value: Option<&str>) -> Option<f64> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

/// Weighted completeness score in [0, 1], rounded to two decimals.
pub fn quality_score(raw: &RawRecord) -> f64 {
    let has_services = !raw.services.is_empty();
    let completeness = [
        present(&raw.name1),
        present(&raw.street1),
        present(&raw.city),
        present(&raw.state),
        present(&raw.zip),
        present(&raw.phone),
        present(&raw.website),
        present(&raw.latitude),
        present(&raw.longitude),
        has_services,
    ]
    .iter()
    .filter(|p| **p)
    .count() as f64;

    let mut score = COMPLETENESS_WEIGHT * (completeness / COMPLETENESS_FIELDS);

    score += match raw.services.len() {
        0 => 0.0,
        1..=3 => FEW_SERVICES_WEIGHT,
        _ => MANY_SERVICES_WEIGHT,
    };

    let lat = parse_coordinate(raw.latitude.as_deref());
    let lon = parse_coordinate(raw.longitude.as_deref());
    if matches!((lat, lon), (Some(a), Some(b)) if a != 0.0 && b != 0.0) {
        score += GEO_WEIGHT;
    }

    if present(&raw.phone) || present(&raw.website) || present(&raw.intake1) {
        score += CONTACT_WEIGHT;
    }

    ((score * 100.0).round() / 100.0).clamp(0.0, 1.0)
}

/// `<name-city-state folded, truncated>-<8 hex of sha256(external id)>`.
pub fn facility_slug(name: &str, city: &str, state: &str, external_id: &str, max_len: usize) -> String {
    let body = slugify(&format!("{name} {city} {state}"), max_len);
    let digest = hex::encode(Sha256::digest(external_id.as_bytes()));
    let suffix = &digest[..SLUG_SUFFIX_LEN];
    if body.is_empty() {
        suffix.to_string()
    } else {
        format!("{body}-{suffix}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransformConfig {
    pub indexable_threshold: f64,
    pub slug_max_len: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            indexable_threshold: DEFAULT_INDEXABLE_THRESHOLD,
            slug_max_len: SLUG_BODY_MAX_LEN,
        }
    }
}

/// Maps provider rows into [`Facility`] values.
#[derive(Debug, Clone)]
pub struct Transformer {
    regions: RegionTable,
    config: TransformConfig,
}

impl Transformer {
    pub fn new(regions: RegionTable, config: TransformConfig) -> Self {
        Self { regions, config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    pub fn transform(&self, raw: &RawRecord, ordinal: usize) -> Option<Facility> {
        self.transform_at(raw, ordinal, Utc::now())
    }

    /// `None` when name, city or state is missing.
    pub fn transform_at(
        &self,
        raw: &RawRecord,
        ordinal: usize,
        now: DateTime<Utc>,
    ) -> Option<Facility> {
        let name = non_blank(raw.name1.as_deref())?;
        let city = non_blank(raw.city.as_deref())?;
        let state = non_blank(raw.state.as_deref())?;

        let external_id =
            non_blank(raw.frid.as_deref()).unwrap_or_else(|| format!("row-{ordinal}"));
        let region_code = normalize_region_code(&state);
        let slug = facility_slug(
            &name,
            &city,
            &region_code,
            &external_id,
            self.config.slug_max_len,
        );
        let sub_region_slug = match slugify(&city, SLUG_BODY_MAX_LEN) {
            s if s.is_empty() => "unknown".to_string(),
            s => s,
        };

        let quality_score = quality_score(raw);
        let tags = extract_service_tags(&raw.services);

        Some(Facility {
            id: Facility::id_for_external_id(&external_id),
            external_id,
            slug,
            name,
            alternate_name: non_blank(raw.name2.as_deref()),
            street1: non_blank(raw.street1.as_deref()),
            street2: non_blank(raw.street2.as_deref()),
            city,
            sub_region_slug,
            region_name: self.regions.resolve(&region_code),
            region_code,
            zip: non_blank(raw.zip.as_deref()),
            phone: non_blank(raw.phone.as_deref()),
            intake_phone: non_blank(raw.intake1.as_deref()),
            hotline: non_blank(raw.hotline1.as_deref()),
            website: non_blank(raw.website.as_deref()),
            latitude: parse_coordinate(raw.latitude.as_deref()),
            longitude: parse_coordinate(raw.longitude.as_deref()),
            facility_type: non_blank(raw.type_facility.as_deref()),
            care_types: tags.care_types,
            settings: tags.settings,
            payment_options: tags.payment_options,
            age_groups: tags.age_groups,
            special_programs: tags.special_programs,
            indexable: quality_score >= self.config.indexable_threshold,
            quality_score,
            created_at: now,
            updated_at: now,
        })
    }
}
