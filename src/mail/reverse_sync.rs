//! 逆方向同期: Notion -> Mail.app
//!
//! AI レビュー済みのページ（AI Review Status = Reviewed かつ
//! Synced to Mail = false）を定期的に探し、指示された操作を Mail.app に
//! 適用して Synced to Mail を立てる。
//!
//! 対応する操作:
//! - Mark Read: 既読にする
//! - Flag Important: フラグを立てる
//! - Mark Read and Flag: 既読 + フラグ
//! - Archive: 現状は既読化のみ（メールボックス移動は未実装）
//!
//! 失敗したページには触らない。次の tick で再度対象になる。
//! 順方向のリトライキューとは独立している。

use crate::mail::arm::MailArm;
use crate::notion::sync::{NotionSyncOps, ReverseSyncPage};
use crate::shutdown::Shutdown;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const ACTION_MARK_READ: &str = "Mark Read";
pub const ACTION_FLAG_IMPORTANT: &str = "Flag Important";
pub const ACTION_MARK_READ_AND_FLAG: &str = "Mark Read and Flag";
pub const ACTION_ARCHIVE: &str = "Archive";

/// 逆方向同期の統計
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReverseSyncStats {
    pub checks: u64,
    pub synced: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// 逆方向同期ポーラー
pub struct ReverseSyncer<A, N>
where
    A: MailArm,
    N: NotionSyncOps,
{
    arm: Arc<A>,
    notion: Arc<N>,
    interval: Duration,
    shutdown: Shutdown,
    stats: ReverseSyncStats,
}

impl<A, N> ReverseSyncer<A, N>
where
    A: MailArm,
    N: NotionSyncOps,
{
    pub fn new(arm: Arc<A>, notion: Arc<N>, interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            arm,
            notion,
            interval,
            shutdown,
            stats: ReverseSyncStats::default(),
        }
    }

    pub fn stats(&self) -> &ReverseSyncStats {
        &self.stats
    }

    /// メインループ
    pub async fn run(&mut self) {
        log::info!("Reverse sync started (interval={}s)", self.interval.as_secs());
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            self.check_and_sync().await;
            if self.shutdown.sleep(self.interval).await {
                break;
            }
        }
        log::info!("Reverse sync stopped");
    }

    /// 1 回のチェック周期。ページ単位の失敗は記録して続行する
    pub async fn check_and_sync(&mut self) {
        self.stats.checks += 1;

        let pages = match self.notion.query_pages_for_reverse_sync().await {
            Ok(pages) => pages,
            Err(e) => {
                log::error!("Reverse sync query failed: {e}");
                return;
            }
        };

        if pages.is_empty() {
            log::debug!("No pages need reverse sync");
            return;
        }

        for page in pages {
            if self.shutdown.is_requested() {
                return;
            }
            match self.sync_single_page(&page).await {
                Ok(true) => self.stats.synced += 1,
                Ok(false) => self.stats.skipped += 1,
                Err(e) => {
                    log::error!("Failed to reverse-sync page {}: {e}", page.page_id);
                    self.stats.failed += 1;
                }
            }
        }

        log::info!(
            "Reverse sync tick done: synced={}, failed={}, skipped={}",
            self.stats.synced,
            self.stats.failed,
            self.stats.skipped
        );
    }

    /// 1 ページを Mail.app に反映する
    ///
    /// # Returns
    /// - Ok(true): 反映してページを更新した
    /// - Ok(false): 対象外（Message ID なしなど）
    /// - Err(..): 失敗。ページは触らず次の tick で再試行される
    async fn sync_single_page(&self, page: &ReverseSyncPage) -> Result<bool, String> {
        if page.message_id.is_empty() {
            log::warn!("Page {} has no Message ID, skipping", page.page_id);
            return Ok(false);
        }

        log::info!(
            "Syncing to Mail: {} action={}",
            truncate_id(&page.message_id),
            page.ai_action
        );

        let applied = match page.ai_action.as_str() {
            ACTION_MARK_READ => {
                self.arm
                    .mark_read(&page.message_id, true, page.mailbox)
                    .await?
            }
            ACTION_FLAG_IMPORTANT => {
                self.arm
                    .set_flag(&page.message_id, true, page.mailbox)
                    .await?
            }
            ACTION_MARK_READ_AND_FLAG => {
                let read_ok = self
                    .arm
                    .mark_read(&page.message_id, true, page.mailbox)
                    .await?;
                if read_ok {
                    self.arm
                        .set_flag(&page.message_id, true, page.mailbox)
                        .await?
                } else {
                    log::warn!("mark_read failed, skipping set_flag");
                    false
                }
            }
            ACTION_ARCHIVE => {
                // 既読化で代替する。メールボックス移動は未対応
                let ok = self
                    .arm
                    .mark_read(&page.message_id, true, page.mailbox)
                    .await?;
                if ok {
                    log::info!("Archive action: marked as read (move not implemented)");
                }
                ok
            }
            other => {
                if !other.is_empty() {
                    log::warn!("Unknown action '{other}', defaulting to mark as read");
                }
                self.arm
                    .mark_read(&page.message_id, true, page.mailbox)
                    .await?
            }
        };

        if !applied {
            return Err(format!(
                "Mail.app did not apply action '{}'",
                page.ai_action
            ));
        }

        // Mail.app 側の操作は成功している。Notion 更新の失敗は Err にして
        // 次の tick で再試行させる（操作は冪等なので安全）
        self.notion
            .update_page_mail_sync_status(&page.page_id)
            .await?;
        log::info!("Reverse sync completed for {}", truncate_id(&page.message_id));
        Ok(true)
    }
}

fn truncate_id(message_id: &str) -> String {
    if message_id.chars().count() > 40 {
        let head: String = message_id.chars().take(40).collect();
        format!("{head}...")
    } else {
        message_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::arm::MockMailArm;
    use crate::models::Mailbox;
    use crate::notion::sync::MockNotionSyncOps;

    fn page(action: &str) -> ReverseSyncPage {
        ReverseSyncPage {
            page_id: "page-1".to_string(),
            message_id: "m1@example.com".to_string(),
            ai_action: action.to_string(),
            mailbox: Mailbox::Inbox,
        }
    }

    fn syncer(
        arm: MockMailArm,
        notion: MockNotionSyncOps,
    ) -> ReverseSyncer<MockMailArm, MockNotionSyncOps> {
        ReverseSyncer::new(
            Arc::new(arm),
            Arc::new(notion),
            Duration::from_secs(30),
            Shutdown::new(),
        )
    }

    #[tokio::test]
    async fn test_mark_read_action() {
        let mut arm = MockMailArm::new();
        arm.expect_mark_read()
            .times(1)
            .returning(|message_id, read, _| {
                assert_eq!(message_id, "m1@example.com");
                assert!(read);
                Ok(true)
            });

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page(ACTION_MARK_READ)]));
        notion
            .expect_update_page_mail_sync_status()
            .times(1)
            .returning(|_| Ok(()));

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().synced, 1);
        assert_eq!(syncer.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_flag_important_action() {
        let mut arm = MockMailArm::new();
        arm.expect_set_flag()
            .times(1)
            .returning(|_, flagged, _| {
                assert!(flagged);
                Ok(true)
            });

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page(ACTION_FLAG_IMPORTANT)]));
        notion
            .expect_update_page_mail_sync_status()
            .times(1)
            .returning(|_| Ok(()));

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().synced, 1);
    }

    #[tokio::test]
    async fn test_mark_read_and_flag_short_circuits() {
        // mark_read が失敗したら set_flag は呼ばない
        let mut arm = MockMailArm::new();
        arm.expect_mark_read().times(1).returning(|_, _, _| Ok(false));
        // set_flag の期待は登録しない（呼ばれたら panic）

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page(ACTION_MARK_READ_AND_FLAG)]));
        // 失敗したページは更新しない

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().failed, 1);
        assert_eq!(syncer.stats().synced, 0);
    }

    #[tokio::test]
    async fn test_archive_maps_to_mark_read() {
        let mut arm = MockMailArm::new();
        arm.expect_mark_read().times(1).returning(|_, _, _| Ok(true));

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page(ACTION_ARCHIVE)]));
        notion
            .expect_update_page_mail_sync_status()
            .times(1)
            .returning(|_| Ok(()));

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().synced, 1);
    }

    #[tokio::test]
    async fn test_unknown_action_defaults_to_mark_read() {
        let mut arm = MockMailArm::new();
        arm.expect_mark_read().times(1).returning(|_, _, _| Ok(true));

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page("Do Something Odd")]));
        notion
            .expect_update_page_mail_sync_status()
            .times(1)
            .returning(|_| Ok(()));

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().synced, 1);
    }

    #[tokio::test]
    async fn test_page_without_message_id_is_skipped() {
        let mut notion = MockNotionSyncOps::new();
        notion.expect_query_pages_for_reverse_sync().returning(|| {
            Ok(vec![ReverseSyncPage {
                page_id: "page-x".to_string(),
                message_id: String::new(),
                ai_action: ACTION_MARK_READ.to_string(),
                mailbox: Mailbox::Inbox,
            }])
        });

        let mut syncer = syncer(MockMailArm::new(), notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_arm_failure_leaves_page_untouched() {
        let mut arm = MockMailArm::new();
        arm.expect_mark_read()
            .returning(|_, _, _| Err("script failed".to_string()));

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page(ACTION_MARK_READ)]));
        // update_page_mail_sync_status は呼ばれない（期待を登録しない）

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_notion_update_failure_counts_as_failed() {
        // Mail.app 操作は成功したが Notion 更新に失敗 → 次の tick で再試行される
        let mut arm = MockMailArm::new();
        arm.expect_mark_read().returning(|_, _, _| Ok(true));

        let mut notion = MockNotionSyncOps::new();
        notion
            .expect_query_pages_for_reverse_sync()
            .returning(|| Ok(vec![page(ACTION_MARK_READ)]));
        notion
            .expect_update_page_mail_sync_status()
            .returning(|_| Err("update failed".to_string()));

        let mut syncer = syncer(arm, notion);
        syncer.check_and_sync().await;
        assert_eq!(syncer.stats().failed, 1);
    }
}
