//! シャットダウン制御
//!
//! 3つのループ（順方向・逆方向・健全性チェック）が1つのハンドルを共有する。
//! 要求はフラグで観測し、待機中のループは notify で起こす。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// シャットダウンハンドル
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// シャットダウンを要求する（冪等）
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// 指定時間スリープする。シャットダウン要求で早期に戻る
    ///
    /// # Returns
    /// シャットダウンが要求されていたら true
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = self.inner.notify.notified() => true,
            _ = tokio::time::sleep(duration) => self.is_requested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_observable_from_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_requested());
        shutdown.request();
        assert!(clone.is_requested());
    }

    #[tokio::test]
    async fn test_sleep_returns_early_on_request() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move {
            // 長い待機でも request で即座に戻る
            waiter.sleep(Duration::from_secs(60)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request();
        let interrupted = handle.await.unwrap();
        assert!(interrupted);
    }

    #[test]
    fn test_sleep_completes_without_request() {
        tokio_test::block_on(async {
            let shutdown = Shutdown::new();
            let interrupted = shutdown.sleep(Duration::from_millis(10)).await;
            assert!(!interrupted);
        });
    }
}
