use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tfd_adapters::{
    parse_base_query, HttpPageFetcher, SourceClient, SourceClientConfig, TransformConfig,
    Transformer,
};
use tfd_core::{RegionTable, DEFAULT_INDEXABLE_THRESHOLD, SLUG_BODY_MAX_LEN};
use tfd_storage::{FacilityStore, HttpClientConfig, HttpFetcher, PgStore, MAX_BATCH_ROWS};
use tokio::fs;

pub const DEFAULT_SOURCE_URL: &str = "https://findtreatment.gov/locator/exportsAsJson/v2";
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub source_url: String,
    pub source_query: Vec<(String, String)>,
    pub page_size: u32,
    pub page_delay_ms: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub indexable_threshold: f64,
    pub change_threshold: f64,
    pub batch_size: usize,
    pub regions_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub check_cron: String,
    pub bind_addr: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            source_url: DEFAULT_SOURCE_URL.to_string(),
            source_query: parse_base_query("sType=BOTH"),
            page_size: 2000,
            page_delay_ms: 250,
            user_agent: "tfd-ingest/0.1".to_string(),
            http_timeout_secs: 30,
            indexable_threshold: DEFAULT_INDEXABLE_THRESHOLD,
            change_threshold: DEFAULT_CHANGE_THRESHOLD,
            batch_size: MAX_BATCH_ROWS,
            regions_file: None,
            scheduler_enabled: false,
            check_cron: "0 0 */6 * * *".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            source_url: std::env::var("TFD_SOURCE_URL").unwrap_or(defaults.source_url),
            source_query: std::env::var("TFD_SOURCE_QUERY")
                .map(|q| parse_base_query(&q))
                .unwrap_or(defaults.source_query),
            page_size: env_parse("TFD_PAGE_SIZE").unwrap_or(defaults.page_size),
            page_delay_ms: env_parse("TFD_PAGE_DELAY_MS").unwrap_or(defaults.page_delay_ms),
            user_agent: std::env::var("TFD_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("TFD_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            indexable_threshold: env_parse("TFD_INDEXABLE_THRESHOLD")
                .unwrap_or(defaults.indexable_threshold),
            change_threshold: env_parse("TFD_CHANGE_THRESHOLD")
                .unwrap_or(defaults.change_threshold),
            batch_size: env_parse("TFD_BATCH_SIZE").unwrap_or(defaults.batch_size),
            regions_file: std::env::var("TFD_REGIONS_FILE").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("TFD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            check_cron: std::env::var("TFD_CHECK_CRON").unwrap_or(defaults.check_cron),
            bind_addr: std::env::var("TFD_BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.indexable_threshold) {
            bail!(
                "TFD_INDEXABLE_THRESHOLD must be within [0, 1], got {}",
                self.indexable_threshold
            );
        }
        if !self.change_threshold.is_finite() || self.change_threshold < 0.0 {
            bail!(
                "TFD_CHANGE_THRESHOLD must be a non-negative number, got {}",
                self.change_threshold
            );
        }
        if self.page_size == 0 {
            bail!("TFD_PAGE_SIZE must be positive");
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set; store credentials are required")
    }

    /// Chunk size actually used for writes, clamped to the backend limit.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_ROWS)
    }

    pub async fn load_region_table(&self) -> Result<RegionTable> {
        match &self.regions_file {
            Some(path) => region_table_from_yaml(path).await,
            None => Ok(RegionTable::default()),
        }
    }

    pub async fn transformer(&self) -> Result<Transformer> {
        Ok(Transformer::new(
            self.load_region_table().await?,
            TransformConfig {
                indexable_threshold: self.indexable_threshold,
                slug_max_len: SLUG_BODY_MAX_LEN,
            },
        ))
    }

    pub fn source_client(&self) -> Result<SourceClient> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })?;
        let fetcher = HttpPageFetcher::new(http, &self.source_url, self.source_query.clone())?;
        Ok(SourceClient::new(
            Arc::new(fetcher),
            SourceClientConfig {
                page_size: self.page_size,
                page_delay: Duration::from_millis(self.page_delay_ms),
                ..Default::default()
            },
        ))
    }

    pub async fn connect_store(&self) -> Result<PgStore> {
        let url = self.require_database_url()?;
        PgStore::connect(url)
            .await
            .context("connecting to the facility store")
    }

    pub async fn open_store(&self) -> Result<Arc<dyn FacilityStore>> {
        Ok(Arc::new(self.connect_store().await?))
    }
}

#[derive(Debug, Deserialize)]
struct RegionsFile {
    regions: BTreeMap<String, String>,
}

pub async fn region_table_from_yaml(path: &Path) -> Result<RegionTable> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: RegionsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if parsed.regions.is_empty() {
        bail!("{} defines no regions", path.display());
    }
    Ok(RegionTable::from_pairs(parsed.regions))
}
