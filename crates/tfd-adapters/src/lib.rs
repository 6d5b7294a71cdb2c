//! Provider client and row transformation for the facility export.

mod source;
mod transform;

pub use source::{
    parse_base_query, FetchStats, HttpPageFetcher, PageCursor, PageFetcher, SourceClient,
    SourceClientConfig, SourceError,
};
pub use transform::{
    extract_service_tags, facility_slug, parse_coordinate, quality_score, ServiceTags, TagField,
    TransformConfig, Transformer, SERVICE_CODE_FIELDS, SLUG_SUFFIX_LEN,
};

pub const CRATE_NAME: &str = "tfd-adapters";
