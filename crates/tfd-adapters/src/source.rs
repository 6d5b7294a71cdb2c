use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use tfd_core::SourcePage;
use tfd_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding page {page}: {source}")]
    Decode {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Transport for one page of the provider's export.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, SourceError>;
}

/// `GET <endpoint>?<base query>&page=<n>&pageSize=<k>` over [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    http: HttpFetcher,
    endpoint: Url,
    base_query: Vec<(String, String)>,
    run_id: Uuid,
}

impl HttpPageFetcher {
    pub fn new(
        http: HttpFetcher,
        endpoint: &str,
        base_query: Vec<(String, String)>,
    ) -> anyhow::Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("parsing source url {endpoint}"))?;
        Ok(Self {
            http,
            endpoint,
            base_query,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn page_url(&self, page: u32, page_size: u32) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .extend_pairs(self.base_query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        url
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, SourceError> {
        let url = self.page_url(page, page_size);
        let body = self.http.fetch_bytes(self.run_id, url.as_str()).await?;
        serde_json::from_slice(&body).map_err(|source| SourceError::Decode { page, source })
    }
}

/// Parse `a=1&b=2` into ordered query pairs; blank segments are ignored.
pub fn parse_base_query(raw: &str) -> Vec<(String, String)> {
    raw.trim_start_matches('?')
        .split('&')
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (segment.trim().to_string(), String::new()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct SourceClientConfig {
    pub page_size: u32,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
    /// Give up after this many failures in a row while the page total is still unknown.
    pub max_blind_failures: u32,
}

impl Default for SourceClientConfig {
    fn default() -> Self {
        Self {
            page_size: 2000,
            page_delay: Duration::from_millis(250),
            max_blind_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub pages_requested: u32,
    pub pages_skipped: u32,
    pub rows: usize,
    /// Total page count reported by the provider, once seen.
    pub total_pages: Option<u32>,
    /// Total record count reported by the provider, once seen.
    pub record_count: Option<u64>,
}

#[derive(Clone)]
pub struct SourceClient {
    fetcher: Arc<dyn PageFetcher>,
    config: SourceClientConfig,
}

impl SourceClient {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: SourceClientConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn config(&self) -> &SourceClientConfig {
        &self.config
    }

    /// Lazily walks pages from 1. Not restartable: a new run starts a new cursor.
    pub fn pages(&self) -> PageCursor<'_> {
        PageCursor {
            fetcher: self.fetcher.as_ref(),
            config: self.config,
            next_page: 1,
            blind_failures: 0,
            finished: false,
            stats: FetchStats::default(),
        }
    }

    /// Cheap probe: page 1 with a single row, for its reported totals.
    pub async fn probe(&self) -> Result<SourcePage, SourceError> {
        self.fetcher.fetch_page(1, 1).await
    }
}

pub struct PageCursor<'a> {
    fetcher: &'a dyn PageFetcher,
    config: SourceClientConfig,
    next_page: u32,
    blind_failures: u32,
    finished: bool,
    stats: FetchStats,
}

impl PageCursor<'_> {
    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// Next non-empty page, or `None` once the reported total is reached or a page is empty.
    /// Failed pages are logged and skipped.
    pub async fn next_page(&mut self) -> Option<SourcePage> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(total) = self.stats.total_pages {
                if self.next_page > total {
                    self.finished = true;
                    return None;
                }
            }

            let page_no = self.next_page;
            if page_no > 1 && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
            self.next_page += 1;
            self.stats.pages_requested += 1;

            match self.fetcher.fetch_page(page_no, self.config.page_size).await {
                Ok(page) => {
                    self.blind_failures = 0;
                    if self.stats.total_pages.is_none() && page.total_pages > 0 {
                        self.stats.total_pages = Some(page.total_pages);
                        self.stats.record_count = Some(page.record_count);
                        info!(
                            total_pages = page.total_pages,
                            record_count = page.record_count,
                            "source reported totals"
                        );
                    }
                    if page.rows.is_empty() {
                        debug!(page = page_no, "empty page, stopping");
                        self.finished = true;
                        return None;
                    }
                    self.stats.rows += page.rows.len();
                    info!(page = page_no, rows = page.rows.len(), "fetched page");
                    return Some(page);
                }
                Err(err) => {
                    self.stats.pages_skipped += 1;
                    warn!(page = page_no, error = %err, "skipping page after fetch failure");
                    if self.stats.total_pages.is_none() {
                        self.blind_failures += 1;
                        if self.blind_failures >= self.config.max_blind_failures.max(1) {
                            warn!(
                                failures = self.blind_failures,
                                "giving up before any page reported totals"
                            );
                            self.finished = true;
                            return None;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tfd_core::RawRecord;

    struct ScriptedFetcher {
        pages: HashMap<u32, Result<SourcePage, String>>,
        requested: Mutex<Vec<(u32, u32)>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<(u32, Result<SourcePage, String>)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, SourceError> {
            self.requested.lock().unwrap().push((page, page_size));
            match self.pages.get(&page) {
                Some(Ok(p)) => Ok(p.clone()),
                Some(Err(msg)) => Err(SourceError::Message(msg.clone())),
                None => Ok(SourcePage {
                    page,
                    total_pages: 0,
                    record_count: 0,
                    rows: vec![],
                }),
            }
        }
    }

    fn page(page: u32, total_pages: u32, rows: usize) -> SourcePage {
        SourcePage {
            page,
            total_pages,
            record_count: 10,
            rows: (0..rows)
                .map(|i| RawRecord {
                    name1: Some(format!("Facility {page}-{i}")),
                    ..RawRecord::default()
                })
                .collect(),
        }
    }

    fn config() -> SourceClientConfig {
        SourceClientConfig {
            page_size: 50,
            page_delay: Duration::ZERO,
            max_blind_failures: 2,
        }
    }

    async fn drain(client: &SourceClient) -> (Vec<SourcePage>, FetchStats) {
        let mut cursor = client.pages();
        let mut out = Vec::new();
        while let Some(p) = cursor.next_page().await {
            out.push(p);
        }
        (out, cursor.stats())
    }

    #[tokio::test]
    async fn stops_at_reported_total() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            (1, Ok(page(1, 2, 3))),
            (2, Ok(page(2, 2, 1))),
            (3, Ok(page(3, 2, 5))),
        ]));
        let client = SourceClient::new(fetcher.clone(), config());
        let (pages, stats) = drain(&client).await;
        assert_eq!(pages.len(), 2);
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.total_pages, Some(2));
        assert_eq!(
            *fetcher.requested.lock().unwrap(),
            vec![(1, 50), (2, 50)]
        );
    }

    #[tokio::test]
    async fn stops_on_empty_page_before_total() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            (1, Ok(page(1, 9, 2))),
            (2, Ok(page(2, 9, 0))),
        ]));
        let client = SourceClient::new(fetcher, config());
        let (pages, stats) = drain(&client).await;
        assert_eq!(pages.len(), 1);
        assert_eq!(stats.pages_requested, 2);
    }

    #[tokio::test]
    async fn failed_page_is_skipped_not_fatal() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            (1, Ok(page(1, 3, 2))),
            (2, Err("http status 500".to_string())),
            (3, Ok(page(3, 3, 1))),
        ]));
        let client = SourceClient::new(fetcher, config());
        let (pages, stats) = drain(&client).await;
        assert_eq!(pages.len(), 2);
        assert_eq!(stats.pages_skipped, 1);
        assert_eq!(stats.rows, 3);
    }

    #[tokio::test]
    async fn blind_failures_are_bounded_when_totals_unknown() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            (1, Err("down".to_string())),
            (2, Err("down".to_string())),
            (3, Ok(page(3, 3, 1))),
        ]));
        let client = SourceClient::new(fetcher.clone(), config());
        let (pages, stats) = drain(&client).await;
        assert!(pages.is_empty());
        assert_eq!(stats.pages_skipped, 2);
        assert_eq!(fetcher.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn probe_requests_a_single_row() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![(1, Ok(page(1, 4, 1)))]));
        let client = SourceClient::new(fetcher.clone(), config());
        let probe = client.probe().await.unwrap();
        assert_eq!(probe.record_count, 10);
        assert_eq!(*fetcher.requested.lock().unwrap(), vec![(1, 1)]);
    }

    #[test]
    fn base_query_parsing_keeps_order() {
        assert_eq!(
            parse_base_query("?sType=BOTH&limitType=2&"),
            vec![
                ("sType".to_string(), "BOTH".to_string()),
                ("limitType".to_string(), "2".to_string())
            ]
        );
        assert!(parse_base_query("").is_empty());
    }
}
