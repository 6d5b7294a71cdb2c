use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tfd_adapters::SourceClient;
use tfd_storage::FacilityStore;
use tracing::info;

use crate::config::DEFAULT_CHANGE_THRESHOLD;

/// True when there is no usable prior count, or the relative change exceeds `threshold`.
pub fn needs_update(prior: Option<u64>, latest: u64, threshold: f64) -> bool {
    match prior {
        None | Some(0) => true,
        Some(prior) => {
            let diff = (latest as f64 - prior as f64).abs();
            diff / prior as f64 > threshold
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub has_update: bool,
    pub current_count: Option<u64>,
    pub latest_count: u64,
}

impl UpdateCheck {
    /// 0 when the stored data is current, 1 when a re-ingest is advised.
    pub fn status_code(&self) -> u8 {
        u8::from(self.has_update)
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.status_code())
    }
}

/// Compares the provider's reported record count with the one recorded by the last ingest.
pub struct ChangeDetector {
    client: SourceClient,
    threshold: f64,
}

impl ChangeDetector {
    pub fn new(client: SourceClient) -> Self {
        Self {
            client,
            threshold: DEFAULT_CHANGE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub async fn check_for_update(&self, store: &dyn FacilityStore) -> Result<UpdateCheck> {
        let probe = self
            .client
            .probe()
            .await
            .context("probing first page of the source")?;
        let mut state = store.sync_state().await.context("reading sync state")?;

        let check = UpdateCheck {
            has_update: needs_update(state.last_record_count, probe.record_count, self.threshold),
            current_count: state.last_record_count,
            latest_count: probe.record_count,
        };

        state.last_checked_at = Some(Utc::now());
        store
            .save_sync_state(&state)
            .await
            .context("recording last check time")?;

        info!(
            has_update = check.has_update,
            current = ?check.current_count,
            latest = check.latest_count,
            "update check complete"
        );
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedFetcher;
    use std::sync::Arc;
    use tfd_adapters::SourceClientConfig;
    use tfd_core::SyncState;
    use tfd_storage::MemoryStore;

    #[test]
    fn small_drift_is_not_an_update() {
        assert!(!needs_update(Some(1000), 1005, 0.01));
        assert!(!needs_update(Some(1000), 1010, 0.01));
        assert!(!needs_update(Some(1000), 995, 0.01));
    }

    #[test]
    fn large_drift_is_an_update() {
        assert!(needs_update(Some(1000), 1050, 0.01));
        assert!(needs_update(Some(1000), 900, 0.01));
    }

    #[test]
    fn missing_or_zero_prior_is_an_update() {
        assert!(needs_update(None, 10, 0.01));
        assert!(needs_update(Some(0), 0, 0.01));
    }

    #[tokio::test]
    async fn check_records_time_and_keeps_count() {
        let store = MemoryStore::new();
        store
            .save_sync_state(&SyncState {
                last_record_count: Some(1000),
                ..SyncState::default()
            })
            .await
            .unwrap();
        let fetcher = ScriptedFetcher::with_record_count(1050);
        let detector = ChangeDetector::new(SourceClient::new(
            Arc::new(fetcher),
            SourceClientConfig::default(),
        ));

        let check = detector.check_for_update(&store).await.unwrap();
        assert!(check.has_update);
        assert_eq!(check.current_count, Some(1000));
        assert_eq!(check.latest_count, 1050);
        assert_eq!(check.status_code(), 1);

        let state = store.sync_state().await.unwrap();
        assert!(state.last_checked_at.is_some());
        assert_eq!(state.last_record_count, Some(1000));
    }
}
