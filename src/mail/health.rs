//! 定期健全性チェック
//!
//! SyncStore の疎通と Radar の可用性を独立に確認し、統計を定期的にログへ出す。
//! Watcher 内の連続エラー判定とは別の、時間駆動の診断ループ。

use crate::radar::RadarSource;
use crate::shutdown::Shutdown;
use crate::sync_store::SyncStoreRepository;
use std::sync::Arc;
use std::time::Duration;

/// 健全性チェックループ
pub struct HealthChecker<R, S>
where
    R: RadarSource,
    S: SyncStoreRepository,
{
    radar: Arc<R>,
    store: Arc<S>,
    interval: Duration,
    shutdown: Shutdown,
}

impl<R, S> HealthChecker<R, S>
where
    R: RadarSource,
    S: SyncStoreRepository,
{
    pub fn new(radar: Arc<R>, store: Arc<S>, interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            radar,
            store,
            interval,
            shutdown,
        }
    }

    /// メインループ
    pub async fn run(&self) {
        log::info!(
            "Health checker started (interval={}s)",
            self.interval.as_secs()
        );
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            self.probe().await;
            if self.shutdown.sleep(self.interval).await {
                break;
            }
        }
        log::info!("Health checker stopped");
    }

    /// 1 回のプローブ
    ///
    /// # Returns
    /// SyncStore が応答すれば true。Radar の不達は警告のみ（任意コンポーネント）
    pub async fn probe(&self) -> bool {
        let store_ok = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Health check: SyncStore ping failed: {e}");
                false
            }
        };

        if self.radar.is_available().await {
            let counts = self.radar.email_count_by_mailbox().await;
            for (mailbox, count) in &counts {
                log::debug!("Health check: {} has {count} emails", mailbox.as_str());
            }
        } else {
            log::warn!("Health check: radar unavailable");
        }

        if store_ok {
            match self.store.stats().await {
                Ok(stats) => log::info!(
                    "Health check: total={}, retry_queue={}, last_max_row_id={}",
                    stats.total_emails,
                    stats.retry_queue,
                    stats.last_max_row_id
                ),
                Err(e) => log::warn!("Health check: failed to read stats: {e}"),
            }
        }

        store_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::MockRadarSource;
    use crate::sync_store::{MockSyncStoreRepository, StoreStats};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_probe_ok_when_store_responds() {
        let mut radar = MockRadarSource::new();
        radar.expect_is_available().returning(|| true);
        radar
            .expect_email_count_by_mailbox()
            .returning(HashMap::new);

        let mut store = MockSyncStoreRepository::new();
        store.expect_ping().returning(|| Ok(()));
        store.expect_stats().returning(|| Ok(StoreStats::default()));

        let checker = HealthChecker::new(
            Arc::new(radar),
            Arc::new(store),
            Duration::from_secs(3600),
            Shutdown::new(),
        );
        assert!(checker.probe().await);
    }

    #[tokio::test]
    async fn test_probe_fails_when_store_down() {
        let mut radar = MockRadarSource::new();
        radar.expect_is_available().returning(|| false);

        let mut store = MockSyncStoreRepository::new();
        store
            .expect_ping()
            .returning(|| Err("db locked".to_string()));

        let checker = HealthChecker::new(
            Arc::new(radar),
            Arc::new(store),
            Duration::from_secs(3600),
            Shutdown::new(),
        );
        assert!(!checker.probe().await);
    }
}
