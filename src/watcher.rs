//! Watcher - 順方向同期の最上位ループ（Reconciler）
//!
//! 1 tick の流れ:
//! 1. 検知: Radar で max_row_id の変化を見る
//! 2. 取り込み: 新着行を SyncStore へ pending 登録し、チェックポイントを
//!    同一トランザクションで進める（取り込みは冪等）
//! 3. pending 処理: 最大 N 件を単メッセージパイプラインに通す
//! 4. リトライ処理: next_retry_at が到来した行を最大 M 件処理する
//! 5. 健全性: 連続エラー 5 回でプローブを実行し、不健全ならループを止める
//!
//! 単メッセージパイプラインの失敗は行単位で記録してバッチを続行する。
//! fetch 前の失敗は fetch_failed、fetch 後の失敗は failed（リトライで
//! 無駄な再取得をしないため）。メールが Mail.app から消えていた場合は
//! 行を削除する。
//!
//! Radar / Arm / SyncStore / Notion はすべてトレイト越しに使う。
//! テストはモックを差し込む。

use crate::converter::eml;
use crate::mail::arm::MailArm;
use crate::mail::ical::{self, MeetingInvite};
use crate::mail::mime;
use crate::models::{naive_local_to_utc, FetchOutcome, FetchedEmail, Mailbox};
use crate::notion::sync::NotionSyncOps;
use crate::radar::RadarSource;
use crate::shutdown::Shutdown;
use crate::sync_store::{SyncStoreRepository, STATE_LAST_MAX_ROW_ID};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// 連続エラーがこの回数に達したら健全性プローブを実行する
const CONSECUTIVE_ERROR_LIMIT: u64 = 5;

/// 同期ループの統計
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStats {
    pub polls: u64,
    pub new_emails_detected: u64,
    pub emails_synced: u64,
    pub emails_skipped: u64,
    pub meeting_invites: u64,
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
    pub errors: u64,
    pub consecutive_errors: u64,
}

/// 単メッセージパイプラインの結果
enum PipelineOutcome {
    Synced,
    Skipped,
}

/// 順方向同期ループ
pub struct Watcher<R, A, S, N>
where
    R: RadarSource,
    A: MailArm,
    S: SyncStoreRepository,
    N: NotionSyncOps,
{
    radar: Arc<R>,
    arm: Arc<A>,
    store: Arc<S>,
    notion: Arc<N>,
    poll_interval: Duration,
    pending_batch: usize,
    retry_batch: usize,
    sync_start_date: Option<DateTime<Utc>>,
    shutdown: Shutdown,
    stats: WatcherStats,
}

impl<R, A, S, N> Watcher<R, A, S, N>
where
    R: RadarSource,
    A: MailArm,
    S: SyncStoreRepository,
    N: NotionSyncOps,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        radar: Arc<R>,
        arm: Arc<A>,
        store: Arc<S>,
        notion: Arc<N>,
        poll_interval: Duration,
        pending_batch: usize,
        retry_batch: usize,
        sync_start_date: Option<DateTime<Utc>>,
        shutdown: Shutdown,
    ) -> Self {
        if let Some(start) = sync_start_date {
            log::info!(
                "Sync start date: {} (older emails are cached but not synced)",
                start.to_rfc3339()
            );
        }
        Self {
            radar,
            arm,
            store,
            notion,
            poll_interval,
            pending_batch,
            retry_batch,
            sync_start_date,
            shutdown,
            stats: WatcherStats::default(),
        }
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    /// メインループ。シャットダウン要求か不健全判定まで回り続ける
    pub async fn run(&mut self) -> Result<(), String> {
        self.establish_baseline().await?;
        log::info!("Watcher started");

        loop {
            if self.shutdown.is_requested() {
                break;
            }

            match self.tick().await {
                Ok(()) => {
                    self.stats.consecutive_errors = 0;
                }
                Err(e) => {
                    log::error!("Poll cycle error: {e}");
                    self.stats.errors += 1;
                    self.stats.consecutive_errors += 1;

                    if self.stats.consecutive_errors >= CONSECUTIVE_ERROR_LIMIT {
                        log::warn!("Too many consecutive errors, performing health check");
                        if !self.health_check().await {
                            log::error!("Service unhealthy, stopping watcher");
                            return Err("watcher stopped: unhealthy".to_string());
                        }
                    }
                }
            }

            if self.shutdown.sleep(self.poll_interval).await {
                break;
            }
        }

        log::info!("Watcher stopped");
        Ok(())
    }

    /// 初回起動時は現在の max_row_id をベースラインにする
    ///
    /// 過去メールは同期対象にしない（バックフィルは `backfill` で明示的に行う）。
    async fn establish_baseline(&self) -> Result<(), String> {
        let last = self.store.get_last_max_row_id().await?;
        if last > 0 {
            log::info!("Restored last_max_row_id from SyncStore: {last}");
            return Ok(());
        }
        if self.radar.is_available().await {
            let current = self.radar.current_max_row_id().await;
            if current > 0 {
                self.store
                    .set_state(STATE_LAST_MAX_ROW_ID, &current.to_string())
                    .await?;
                log::info!("First run, set baseline max_row_id: {current}");
            }
        }
        Ok(())
    }

    /// 初期バックフィル: 位置指定で過去 count 件を pending 登録する
    ///
    /// # Returns
    /// 新規に登録した件数
    pub async fn backfill(
        &self,
        count: usize,
        mailbox: Mailbox,
        offset: usize,
    ) -> Result<usize, String> {
        let metas = self.arm.fetch_by_position(count, mailbox, offset).await?;
        let mut inserted = 0usize;
        for meta in &metas {
            if self.store.insert(meta).await? {
                inserted += 1;
            }
        }
        log::info!(
            "Backfill: {} fetched, {inserted} newly registered",
            metas.len()
        );
        Ok(inserted)
    }

    /// 1 回のポーリング周期
    pub async fn tick(&mut self) -> Result<(), String> {
        self.stats.polls += 1;

        // 1-2. 検知と取り込み。Radar 不達でもリトライ処理は続ける
        if self.radar.is_available().await {
            self.ingest().await?;
        } else {
            log::debug!("Radar unavailable, skipping new email detection");
        }

        // 3. pending 処理
        let pending = self.store.get_pending(self.pending_batch as i64).await?;
        for record in pending {
            if self.shutdown.is_requested() {
                return Ok(());
            }
            self.process_message(record.internal_id, record.mailbox, false)
                .await;
        }

        // 4. リトライ処理
        let ready = self
            .store
            .get_ready_for_retry(self.retry_batch as i64)
            .await?;
        if !ready.is_empty() {
            log::info!("Retrying {} failed email(s)", ready.len());
        }
        for record in ready {
            if self.shutdown.is_requested() {
                return Ok(());
            }
            self.stats.retries_attempted += 1;
            log::info!(
                "Retry #{} for internal_id={}",
                record.retry_count + 1,
                record.internal_id
            );
            // fetch_failed は再取得から、failed も内容を再取得して全段を通す
            if self
                .process_message(record.internal_id, record.mailbox, true)
                .await
            {
                self.stats.retries_succeeded += 1;
            }
        }

        Ok(())
    }

    /// 新着の検知と取り込み
    async fn ingest(&mut self) -> Result<(), String> {
        let last = self.store.get_last_max_row_id().await?;
        let (has_new, current_max, estimated) = self.radar.check_for_changes(last).await;
        if !has_new {
            log::debug!("No new emails detected");
            return Ok(());
        }

        log::info!("Detected ~{estimated} new emails");
        self.stats.new_emails_detected += estimated as u64;

        let metas = self.radar.get_new_emails(last).await;
        // 挿入（冪等）とチェックポイント前進は同一トランザクション
        self.store
            .insert_batch_and_checkpoint(&metas, current_max, Utc::now())
            .await?;
        Ok(())
    }

    /// 単メッセージパイプライン
    ///
    /// # Returns
    /// synced まで到達したら true
    async fn process_message(&mut self, internal_id: i64, mailbox: Mailbox, is_retry: bool) -> bool {
        // a. Arm で取得
        let fetched = match self.arm.fetch_by_id(internal_id, mailbox).await {
            FetchOutcome::Fetched(email) => email,
            FetchOutcome::NotFound => {
                // ユーザーが削除したメール。行ごと消す
                log::warn!(
                    "Email no longer in Mail.app, removing from store: internal_id={internal_id}"
                );
                if let Err(e) = self.store.delete(internal_id).await {
                    log::error!("Failed to delete missing email: {e}");
                }
                return false;
            }
            FetchOutcome::Timeout => {
                self.record_fetch_failure(internal_id, "AppleScript timeout")
                    .await;
                return false;
            }
            FetchOutcome::ScriptError(diag) => {
                self.record_fetch_failure(internal_id, &diag).await;
                return false;
            }
        };

        // b. メタデータを反映（状態は変えない）。
        // 失敗は failed として記録しバックオフに乗せる（例: message_id の重複）
        if let Err(e) = self
            .store
            .update_after_fetch(
                internal_id,
                &fetched.message_id,
                &fetched.thread_id,
                &fetched.subject,
                &fetched.sender,
                fetched.date_local.map(naive_local_to_utc),
            )
            .await
        {
            log::error!("Failed to update metadata after fetch: {e}");
            self.stats.errors += 1;
            if let Err(e2) = self.store.mark_failed(internal_id, &e).await {
                log::error!("Failed to record failure: {e2}");
            }
            return false;
        }

        // c-i. fetch 後の失敗は failed として記録する（再取得は不要なため）
        match self.sync_fetched(internal_id, mailbox, &fetched).await {
            Ok(PipelineOutcome::Synced) => {
                self.stats.emails_synced += 1;
                if is_retry {
                    log::info!("Retry succeeded: internal_id={internal_id}");
                }
                true
            }
            Ok(PipelineOutcome::Skipped) => {
                self.stats.emails_skipped += 1;
                false
            }
            Err(e) => {
                log::error!("Failed to sync internal_id={internal_id}: {e}");
                self.stats.errors += 1;
                if let Err(e2) = self.store.mark_failed(internal_id, &e).await {
                    log::error!("Failed to record failure: {e2}");
                }
                false
            }
        }
    }

    async fn record_fetch_failure(&mut self, internal_id: i64, error: &str) {
        self.stats.errors += 1;
        if let Err(e) = self.store.mark_fetch_failed(internal_id, error).await {
            log::error!("Failed to record fetch failure: {e}");
        }
    }

    /// fetch 済みメールを Notion に同期する（パイプライン (c)-(i)）
    async fn sync_fetched(
        &mut self,
        internal_id: i64,
        mailbox: Mailbox,
        fetched: &FetchedEmail,
    ) -> Result<PipelineOutcome, String> {
        // c. 会議招待の検出と日程 upsert。失敗してもメール同期は続行する
        let invite = self.detect_meeting(&fetched.source);
        let calendar_page_id = match &invite {
            Some(invite) => match self.notion.upsert_meeting(invite).await {
                Ok(page_id) => {
                    if page_id.is_some() {
                        self.stats.meeting_invites += 1;
                    }
                    page_id
                }
                Err(e) => {
                    log::error!("Failed to sync meeting invite: {e}");
                    None
                }
            },
            None => None,
        };

        // メッセージ単位のスクラッチディレクトリ。成功・失敗どちらでも破棄される
        let scratch = tempfile::TempDir::new()
            .map_err(|e| format!("Failed to create scratch dir: {e}"))?;

        let parsed = mime::parse_email_source(fetched, mailbox, scratch.path())?;

        // d. 日付フィルタ。skipped の行はスレッド祖先の検索用に残る
        if let (Some(start), Some(date)) = (self.sync_start_date, parsed.date) {
            if date < start {
                log::info!(
                    "Skipping old email: {} < {}",
                    date.to_rfc3339(),
                    start.to_rfc3339()
                );
                self.store.mark_skipped(internal_id).await?;
                return Ok(PipelineOutcome::Skipped);
            }
        }

        // 重複ガード: 既存ページがあれば作らずに採用する。
        // クエリ失敗はここで伝播してリトライキューに乗る（不在扱いにしない）
        if let Some(existing) = self.notion.find_page_by_message_id(&parsed.message_id).await? {
            log::info!(
                "Page already exists for message, adopting: {existing} (internal_id={internal_id})"
            );
            self.store.mark_synced(internal_id, &existing).await?;
            return Ok(PipelineOutcome::Synced);
        }

        // e. .eml アーカイブ。生成失敗は警告に留める
        let eml_path = match eml::write_eml(scratch.path(), &parsed.message_id, &fetched.source) {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("Failed to generate .eml archive: {e}");
                None
            }
        };

        // f-g. ページ作成（添付アップロードとブロック分割込み）
        let page_id = self
            .notion
            .create_email_page(&parsed, eml_path, calendar_page_id, invite)
            .await?;

        // i. synced を先に記録する。スレッド書き込みはその後
        self.store.mark_synced(internal_id, &page_id).await?;
        log::info!("Email synced: internal_id={internal_id} -> {page_id}");

        // h. スレッド関係の再構築。失敗してもページ作成は確定済み。
        //    次に同じスレッドの誰かが同期されたときに再計算されて自己修復する
        self.reconcile_thread_with_cache(internal_id, &page_id, &parsed)
            .await;

        Ok(PipelineOutcome::Synced)
    }

    /// text/calendar パートがあれば会議招待としてパースする
    fn detect_meeting(&self, source: &str) -> Option<MeetingInvite> {
        let ics = mime::find_calendar_part(source)?;
        match ical::parse_meeting_invite(&ics) {
            Ok(invite) => invite,
            Err(e) => {
                log::warn!("Failed to parse meeting invite: {e}");
                None
            }
        }
    }

    /// スレッド再構築。ネガティブキャッシュでスレッド先頭のローカル検索を抑止する
    async fn reconcile_thread_with_cache(
        &self,
        internal_id: i64,
        page_id: &str,
        parsed: &crate::models::ParsedEmail,
    ) {
        if parsed.thread_id == parsed.message_id {
            // 自分がスレッド先頭。ローカルに兄弟がいなければ新規スレッドであり、
            // リモートのスレッドクエリは省略できる（遅れて届いた先頭なら兄弟がいる）
            match self
                .store
                .get_all_by_thread(&parsed.thread_id, Some(internal_id), true)
                .await
            {
                Ok(members) if members.is_empty() => {
                    log::debug!("New thread root, nothing to reconcile yet");
                    return;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Local thread lookup failed: {e}"),
            }
        } else {
            match self.store.is_thread_head_not_found(&parsed.thread_id).await {
                Ok(true) => {
                    // 既知の「先頭なし」スレッド。ローカル検索は省略してリモートだけ見る
                }
                Ok(false) => {
                    match self.store.get_by_message_id(&parsed.thread_id).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            // スレッド先頭がローカルに無い。次回以降の検索を抑止する
                            if let Err(e) = self
                                .store
                                .mark_thread_head_not_found(
                                    &parsed.thread_id,
                                    Some("not in local store".to_string()),
                                )
                                .await
                            {
                                log::warn!("Failed to cache missing thread head: {e}");
                            }
                        }
                        Err(e) => log::warn!("Thread head lookup failed: {e}"),
                    }
                }
                Err(e) => log::warn!("Thread head cache check failed: {e}"),
            }
        }

        if let Err(e) = self.notion.reconcile_thread(page_id, parsed).await {
            log::warn!(
                "Failed to reconcile thread for {}: {e}",
                parsed.thread_id
            );
        }
    }

    /// 健全性プローブ: SyncStore の疎通と Radar の可用性
    ///
    /// Radar は任意コンポーネントなので不達は警告のみ。
    /// SyncStore が落ちていたら不健全と判定する。
    async fn health_check(&self) -> bool {
        if let Err(e) = self.store.ping().await {
            log::error!("SyncStore health check failed: {e}");
            return false;
        }
        if !self.radar.is_available().await {
            log::warn!("Radar became unavailable");
        }
        true
    }
}
