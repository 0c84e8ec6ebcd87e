//! SyncStore - メール同期状態の永続化
//!
//! このホスト上の同期状態の唯一の真実。`internal_id`（Envelope Index の ROWID）を
//! 主キーとし、1メッセージ1行でライフサイクル・リトライキュー・dead letter を管理する。
//!
//! テーブル構成:
//! - sync_state: 同期状態の key/value（last_max_row_id, last_sync_time, db_version）
//! - email_metadata: メール1通の状態（internal_id が主キー、message_id は UNIQUE）
//! - thread_head_cache: 見つからないスレッド先頭のネガティブキャッシュ
//!
//! すべての複数ステップ操作は単一トランザクションで実行する。
//! WAL モード・単一プロセス書き込み。二重起動はロックファイルで拒否する。

use crate::models::{EmailRecord, Mailbox, MessageMeta, SyncStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// 最大リトライ回数。到達すると dead_letter になる
pub const MAX_RETRIES: i64 = 5;

/// リトライ間隔（秒）。retry_count 番目の失敗でこの表を引く。表を超えたら末尾に丸める
pub const RETRY_BACKOFF_SECS: [i64; 5] = [60, 300, 900, 3600, 7200];

/// 現在のスキーマバージョン
pub const DB_VERSION: i64 = 3;

/// ネガティブキャッシュの有効期間。これより古いエントリは無視する
const THREAD_HEAD_CACHE_TTL_HOURS: i64 = 24;

/// sync_state のキー
pub const STATE_LAST_MAX_ROW_ID: &str = "last_max_row_id";
pub const STATE_LAST_SYNC_TIME: &str = "last_sync_time";
pub const STATE_DB_VERSION: &str = "db_version";

/// ストアのオープン失敗
#[derive(Debug)]
pub enum StoreOpenError {
    /// ファイルが開けない・壊れている・別プロセスが使用中
    Unavailable(String),
    /// 保存されている db_version がこのビルドより新しい
    SchemaMismatch { found: i64, expected: i64 },
}

impl std::fmt::Display for StoreOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreOpenError::Unavailable(msg) => write!(f, "sync store unavailable: {msg}"),
            StoreOpenError::SchemaMismatch { found, expected } => write!(
                f,
                "sync store schema version mismatch: found v{found}, this build supports v{expected}"
            ),
        }
    }
}

/// 同期状態の統計情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_emails: i64,
    pub by_status: HashMap<String, i64>,
    pub by_mailbox: HashMap<String, i64>,
    pub retry_queue: i64,
    pub last_max_row_id: i64,
    pub last_sync_time: Option<String>,
}

/// SyncStore の操作を抽象化するトレイト
///
/// Reconciler はこのトレイトにのみ依存する。テストではモックに差し替える。
/// 各操作はコミット全体かロールバック全体のどちらか。
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncStoreRepository: Send + Sync {
    /// メッセージを pending として登録する。internal_id で冪等
    ///
    /// # Returns
    /// 新規に挿入されたら true、既知の internal_id なら false
    async fn insert(&self, meta: &MessageMeta) -> Result<bool, String>;

    /// ingest バッチの挿入とチェックポイント更新を同一トランザクションで行う
    ///
    /// バッチ全行の挿入（冪等）・`last_max_row_id`・`last_sync_time` の更新が
    /// すべて成功するか、すべて巻き戻るかのどちらか。
    async fn insert_batch_and_checkpoint(
        &self,
        metas: &[MessageMeta],
        current_max_row_id: i64,
        sync_time: DateTime<Utc>,
    ) -> Result<usize, String>;

    /// fetch 成功後のメタデータ反映。sync_status は変更しない
    async fn update_after_fetch(
        &self,
        internal_id: i64,
        message_id: &str,
        thread_id: &str,
        subject: &str,
        sender: &str,
        date_received: Option<DateTime<Utc>>,
    ) -> Result<(), String>;

    /// 同期成功。sync_error と next_retry_at をクリアする（retry_count は観測用に残す）
    async fn mark_synced(&self, internal_id: i64, notion_page_id: &str) -> Result<(), String>;

    /// 日付フィルタによる終端スキップ。リトライ関連フィールドをクリアする
    async fn mark_skipped(&self, internal_id: i64) -> Result<(), String>;

    /// fetch 失敗。retry_count を進め、上限到達で dead_letter にする
    async fn mark_fetch_failed(&self, internal_id: i64, error: &str) -> Result<(), String>;

    /// fetch 以降の失敗。retry_count を進め、上限到達で dead_letter にする
    async fn mark_failed(&self, internal_id: i64, error: &str) -> Result<(), String>;

    /// 行を削除する（メールが Mail.app から消えた場合）
    async fn delete(&self, internal_id: i64) -> Result<(), String>;

    async fn get(&self, internal_id: i64) -> Result<Option<EmailRecord>, String>;

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<EmailRecord>, String>;

    /// pending の行を date_received 降順で返す
    async fn get_pending(&self, limit: i64) -> Result<Vec<EmailRecord>, String>;

    /// next_retry_at が到来した failed / fetch_failed の行を next_retry_at 昇順で返す
    async fn get_ready_for_retry(&self, limit: i64) -> Result<Vec<EmailRecord>, String>;

    /// 同一スレッドのメールを date_received 降順で返す（スレッド再構築のホットパス）
    async fn get_all_by_thread(
        &self,
        thread_id: &str,
        exclude_internal_id: Option<i64>,
        synced_only: bool,
    ) -> Result<Vec<EmailRecord>, String>;

    async fn get_state(&self, key: &str) -> Result<Option<String>, String>;

    async fn set_state(&self, key: &str, value: &str) -> Result<(), String>;

    async fn get_last_max_row_id(&self) -> Result<i64, String>;

    /// スレッド先頭が見つからないことを記録する（Mail.app への再問い合わせを抑止）
    async fn mark_thread_head_not_found(
        &self,
        thread_id: &str,
        note: Option<String>,
    ) -> Result<(), String>;

    /// スレッド先頭が not_found として記録済みか。24時間より古いエントリは無視する
    async fn is_thread_head_not_found(&self, thread_id: &str) -> Result<bool, String>;

    /// dead_letter の行を pending に戻す（オペレータ操作）
    ///
    /// # Returns
    /// 対象が存在し dead_letter だったら true
    async fn retry_dead_letter(&self, internal_id: i64) -> Result<bool, String>;

    /// dead_letter の行を列挙する（診断用）
    async fn get_dead_letter(&self, limit: i64) -> Result<Vec<EmailRecord>, String>;

    async fn stats(&self) -> Result<StoreStats, String>;

    /// 健全性チェック用の疎通確認
    async fn ping(&self) -> Result<(), String>;
}

/// SQLite 実装
pub struct SqliteSyncStore {
    pool: SqlitePool,
    // プロセス生存中ロックを保持する。ドロップで解放
    _lock: Option<fslock::LockFile>,
}

impl SqliteSyncStore {
    /// ストアを開く。親ディレクトリ作成・二重起動ロック・マイグレーションまで行う
    pub async fn open(db_path: &Path) -> Result<Self, StoreOpenError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreOpenError::Unavailable(format!("failed to create data dir: {e}"))
                })?;
            }
        }

        // 二重起動の拒否。ロックはプロセス終了まで保持する
        let lock_path = db_path.with_extension("lock");
        let mut lock = fslock::LockFile::open(&lock_path)
            .map_err(|e| StoreOpenError::Unavailable(format!("failed to open lock file: {e}")))?;
        let locked = lock
            .try_lock()
            .map_err(|e| StoreOpenError::Unavailable(format!("failed to acquire lock: {e}")))?;
        if !locked {
            return Err(StoreOpenError::Unavailable(format!(
                "another instance is already running (lock held: {})",
                lock_path.display()
            )));
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .map_err(|e| StoreOpenError::Unavailable(format!("invalid database path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreOpenError::Unavailable(format!("failed to open database: {e}")))?;

        let store = Self {
            pool,
            _lock: Some(lock),
        };
        store.migrate().await?;
        log::info!("SyncStore opened: {}", db_path.display());
        Ok(store)
    }

    /// インメモリのストアを開く（テスト用）
    pub async fn open_in_memory() -> Result<Self, StoreOpenError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreOpenError::Unavailable(format!("failed to open database: {e}")))?;

        let store = Self { pool, _lock: None };
        store.migrate().await?;
        Ok(store)
    }

    /// スキーマを現在バージョンまで冪等に移行する。全体を1トランザクションで行う
    async fn migrate(&self) -> Result<(), StoreOpenError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreOpenError::Unavailable(format!("failed to begin migration tx: {e}"))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreOpenError::Unavailable(format!("failed to create sync_state: {e}")))?;

        let stored_version: Option<i64> =
            sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM sync_state WHERE key = ?")
                .bind(STATE_DB_VERSION)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    StoreOpenError::Unavailable(format!("failed to read db_version: {e}"))
                })?;

        if let Some(found) = stored_version {
            if found > DB_VERSION {
                return Err(StoreOpenError::SchemaMismatch {
                    found,
                    expected: DB_VERSION,
                });
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS email_metadata (
                internal_id INTEGER PRIMARY KEY,
                message_id TEXT UNIQUE,
                thread_id TEXT,
                subject TEXT NOT NULL DEFAULT '',
                sender TEXT NOT NULL DEFAULT '',
                sender_name TEXT NOT NULL DEFAULT '',
                to_addr TEXT NOT NULL DEFAULT '',
                cc_addr TEXT NOT NULL DEFAULT '',
                date_received TEXT,
                mailbox TEXT NOT NULL DEFAULT 'Inbox',
                is_read INTEGER NOT NULL DEFAULT 0,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                notion_page_id TEXT,
                sync_error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            StoreOpenError::Unavailable(format!("failed to create email_metadata: {e}"))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS thread_head_cache (
                thread_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'not_found',
                checked_at TEXT,
                note TEXT
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            StoreOpenError::Unavailable(format!("failed to create thread_head_cache: {e}"))
        })?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_email_thread ON email_metadata(thread_id)",
            "CREATE INDEX IF NOT EXISTS idx_email_date ON email_metadata(date_received DESC)",
            "CREATE INDEX IF NOT EXISTS idx_email_status_retry ON email_metadata(sync_status, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS idx_email_mailbox ON email_metadata(mailbox)",
        ] {
            sqlx::query(ddl)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreOpenError::Unavailable(format!("failed to create index: {e}")))?;
        }

        sqlx::query("INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(STATE_DB_VERSION)
            .bind(DB_VERSION.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreOpenError::Unavailable(format!("failed to set db_version: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreOpenError::Unavailable(format!("failed to commit migration: {e}")))?;

        Ok(())
    }

    /// 失敗系の共通処理。retry_count を進め、上限到達で dead_letter にする
    async fn mark_failure(
        &self,
        internal_id: i64,
        error: &str,
        status_on_fail: SyncStatus,
    ) -> Result<(), String> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin tx: {e}"))?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT retry_count FROM email_metadata WHERE internal_id = ?")
                .bind(internal_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| format!("Failed to read retry_count: {e}"))?;

        let Some(current) = current else {
            return Err(format!("No such message in store: internal_id={internal_id}"));
        };

        let retry_count = current + 1;

        if retry_count >= MAX_RETRIES {
            sqlx::query(
                r#"
                UPDATE email_metadata
                SET sync_status = 'dead_letter',
                    sync_error = ?,
                    retry_count = ?,
                    next_retry_at = NULL,
                    updated_at = ?
                WHERE internal_id = ?
                "#,
            )
            .bind(format!("Max retries exceeded: {error}"))
            .bind(retry_count)
            .bind(now.to_rfc3339())
            .bind(internal_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| format!("Failed to mark dead_letter: {e}"))?;

            tx.commit()
                .await
                .map_err(|e| format!("Failed to commit: {e}"))?;
            log::warn!("Marked as dead_letter (max retries): internal_id={internal_id}");
            return Ok(());
        }

        let idx = ((retry_count - 1).max(0) as usize).min(RETRY_BACKOFF_SECS.len() - 1);
        let delay = RETRY_BACKOFF_SECS[idx];
        let next_retry = now + Duration::seconds(delay);

        sqlx::query(
            r#"
            UPDATE email_metadata
            SET sync_status = ?,
                sync_error = ?,
                retry_count = ?,
                next_retry_at = ?,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(status_on_fail.as_str())
        .bind(error)
        .bind(retry_count)
        .bind(next_retry.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(internal_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| format!("Failed to mark {}: {e}", status_on_fail.as_str()))?;

        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit: {e}"))?;
        log::warn!(
            "Marked {}: internal_id={internal_id}, retry #{retry_count} in {delay}s",
            status_on_fail.as_str()
        );
        Ok(())
    }
}

#[cfg(test)]
impl SqliteSyncStore {
    /// テスト用: リトライ待ちの行の next_retry_at を過去へ倒す
    pub async fn force_retry_now_for_tests(&self) -> Result<(), String> {
        let past = (Utc::now() - Duration::seconds(5)).to_rfc3339();
        sqlx::query(
            "UPDATE email_metadata SET next_retry_at = ? WHERE next_retry_at IS NOT NULL",
        )
        .bind(past)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to force retry time: {e}"))?;
        Ok(())
    }
}

/// 行を EmailRecord に変換する
fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EmailRecord, String> {
    let parse_dt = |value: Option<String>| -> Result<Option<DateTime<Utc>>, String> {
        match value {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| format!("Invalid timestamp in store '{s}': {e}")),
        }
    };

    let status_str: String = row
        .try_get("sync_status")
        .map_err(|e| format!("Missing sync_status: {e}"))?;
    let sync_status = SyncStatus::parse(&status_str)
        .ok_or_else(|| format!("Unknown sync_status in store: {status_str}"))?;

    let mailbox_str: String = row
        .try_get("mailbox")
        .map_err(|e| format!("Missing mailbox: {e}"))?;
    let mailbox = Mailbox::parse(&mailbox_str)
        .ok_or_else(|| format!("Unknown mailbox in store: {mailbox_str}"))?;

    let created_at = parse_dt(row.try_get("created_at").ok())?
        .ok_or_else(|| "Missing created_at".to_string())?;
    let updated_at = parse_dt(row.try_get("updated_at").ok())?
        .ok_or_else(|| "Missing updated_at".to_string())?;

    Ok(EmailRecord {
        internal_id: row
            .try_get("internal_id")
            .map_err(|e| format!("Missing internal_id: {e}"))?,
        message_id: row.try_get("message_id").ok().flatten(),
        thread_id: row.try_get("thread_id").ok().flatten(),
        subject: row.try_get("subject").unwrap_or_default(),
        sender: row.try_get("sender").unwrap_or_default(),
        sender_name: row.try_get("sender_name").unwrap_or_default(),
        to_addr: row.try_get("to_addr").unwrap_or_default(),
        cc_addr: row.try_get("cc_addr").unwrap_or_default(),
        date_received: parse_dt(row.try_get("date_received").ok().flatten())?,
        mailbox,
        is_read: row.try_get::<i64, _>("is_read").unwrap_or(0) != 0,
        is_flagged: row.try_get::<i64, _>("is_flagged").unwrap_or(0) != 0,
        sync_status,
        notion_page_id: row.try_get("notion_page_id").ok().flatten(),
        sync_error: row.try_get("sync_error").ok().flatten(),
        retry_count: row.try_get("retry_count").unwrap_or(0),
        next_retry_at: parse_dt(row.try_get("next_retry_at").ok().flatten())?,
        created_at,
        updated_at,
    })
}

/// INSERT OR IGNORE の共通 SQL
const INSERT_SQL: &str = r#"
    INSERT OR IGNORE INTO email_metadata
    (internal_id, message_id, thread_id, subject, sender,
     date_received, mailbox, is_read, is_flagged,
     sync_status, retry_count, next_retry_at, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, NULL, ?, ?)
"#;

#[async_trait]
impl SyncStoreRepository for SqliteSyncStore {
    async fn insert(&self, meta: &MessageMeta) -> Result<bool, String> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(INSERT_SQL)
            .bind(meta.internal_id)
            .bind(&meta.message_id)
            .bind(&meta.thread_id)
            .bind(&meta.subject)
            .bind(&meta.sender)
            .bind(meta.date_received.map(|d| d.to_rfc3339()))
            .bind(meta.mailbox.as_str())
            .bind(meta.is_read as i64)
            .bind(meta.is_flagged as i64)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to insert email: {e}"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_batch_and_checkpoint(
        &self,
        metas: &[MessageMeta],
        current_max_row_id: i64,
        sync_time: DateTime<Utc>,
    ) -> Result<usize, String> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin tx: {e}"))?;

        let mut inserted = 0usize;
        for meta in metas {
            let result = sqlx::query(INSERT_SQL)
                .bind(meta.internal_id)
                .bind(&meta.message_id)
                .bind(&meta.thread_id)
                .bind(&meta.subject)
                .bind(&meta.sender)
                .bind(meta.date_received.map(|d| d.to_rfc3339()))
                .bind(meta.mailbox.as_str())
                .bind(meta.is_read as i64)
                .bind(meta.is_flagged as i64)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(|e| format!("Failed to insert email batch row: {e}"))?;
            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }

        // チェックポイントは最後の挿入と同一トランザクションで進める
        for (key, value) in [
            (STATE_LAST_MAX_ROW_ID, current_max_row_id.to_string()),
            (STATE_LAST_SYNC_TIME, sync_time.to_rfc3339()),
        ] {
            sqlx::query(
                "INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(value)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| format!("Failed to set state {key}: {e}"))?;
        }

        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit ingest batch: {e}"))?;

        if inserted > 0 {
            log::info!(
                "Ingested {inserted} new emails (checkpoint last_max_row_id={current_max_row_id})"
            );
        }
        Ok(inserted)
    }

    async fn update_after_fetch(
        &self,
        internal_id: i64,
        message_id: &str,
        thread_id: &str,
        subject: &str,
        sender: &str,
        date_received: Option<DateTime<Utc>>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"
            UPDATE email_metadata
            SET message_id = ?, thread_id = ?, subject = ?, sender = ?,
                date_received = COALESCE(?, date_received),
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(message_id)
        .bind(thread_id)
        .bind(subject)
        .bind(sender)
        .bind(date_received.map(|d| d.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to update after fetch: {e}"))?;
        Ok(())
    }

    async fn mark_synced(&self, internal_id: i64, notion_page_id: &str) -> Result<(), String> {
        sqlx::query(
            r#"
            UPDATE email_metadata
            SET sync_status = 'synced',
                notion_page_id = ?,
                sync_error = NULL,
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(notion_page_id)
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to mark synced: {e}"))?;
        log::debug!("Marked synced: internal_id={internal_id}");
        Ok(())
    }

    async fn mark_skipped(&self, internal_id: i64) -> Result<(), String> {
        sqlx::query(
            r#"
            UPDATE email_metadata
            SET sync_status = 'skipped',
                sync_error = NULL,
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to mark skipped: {e}"))?;
        Ok(())
    }

    async fn mark_fetch_failed(&self, internal_id: i64, error: &str) -> Result<(), String> {
        self.mark_failure(internal_id, error, SyncStatus::FetchFailed)
            .await
    }

    async fn mark_failed(&self, internal_id: i64, error: &str) -> Result<(), String> {
        self.mark_failure(internal_id, error, SyncStatus::Failed)
            .await
    }

    async fn delete(&self, internal_id: i64) -> Result<(), String> {
        sqlx::query("DELETE FROM email_metadata WHERE internal_id = ?")
            .bind(internal_id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to delete email: {e}"))?;
        log::debug!("Deleted email record: internal_id={internal_id}");
        Ok(())
    }

    async fn get(&self, internal_id: i64) -> Result<Option<EmailRecord>, String> {
        let row = sqlx::query("SELECT * FROM email_metadata WHERE internal_id = ?")
            .bind(internal_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to get email: {e}"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<EmailRecord>, String> {
        let row = sqlx::query("SELECT * FROM email_metadata WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to get email by message_id: {e}"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_pending(&self, limit: i64) -> Result<Vec<EmailRecord>, String> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM email_metadata
            WHERE sync_status = 'pending'
            ORDER BY date_received DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to get pending emails: {e}"))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_ready_for_retry(&self, limit: i64) -> Result<Vec<EmailRecord>, String> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM email_metadata
            WHERE sync_status IN ('failed', 'fetch_failed')
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to get ready for retry: {e}"))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_all_by_thread(
        &self,
        thread_id: &str,
        exclude_internal_id: Option<i64>,
        synced_only: bool,
    ) -> Result<Vec<EmailRecord>, String> {
        let mut sql = String::from("SELECT * FROM email_metadata WHERE thread_id = ?");
        if exclude_internal_id.is_some() {
            sql.push_str(" AND internal_id != ?");
        }
        if synced_only {
            sql.push_str(" AND sync_status = 'synced'");
        }
        sql.push_str(" ORDER BY date_received DESC");

        let mut query = sqlx::query(&sql).bind(thread_id);
        if let Some(exclude) = exclude_internal_id {
            query = query.bind(exclude);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to get emails by thread: {e}"))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>, String> {
        sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to get state {key}: {e}"))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), String> {
        sqlx::query("INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to set state {key}: {e}"))?;
        Ok(())
    }

    async fn get_last_max_row_id(&self) -> Result<i64, String> {
        let value = self.get_state(STATE_LAST_MAX_ROW_ID).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn mark_thread_head_not_found(
        &self,
        thread_id: &str,
        note: Option<String>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO thread_head_cache (thread_id, status, checked_at, note)
            VALUES (?, 'not_found', ?, ?)
            "#,
        )
        .bind(thread_id)
        .bind(Utc::now().to_rfc3339())
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to mark thread head not found: {e}"))?;
        Ok(())
    }

    async fn is_thread_head_not_found(&self, thread_id: &str) -> Result<bool, String> {
        let cutoff = (Utc::now() - Duration::hours(THREAD_HEAD_CACHE_TTL_HOURS)).to_rfc3339();
        let row: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM thread_head_cache
            WHERE thread_id = ? AND status = 'not_found' AND checked_at >= ?
            "#,
        )
        .bind(thread_id)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("Failed to check thread head cache: {e}"))?;
        Ok(row.is_some())
    }

    async fn retry_dead_letter(&self, internal_id: i64) -> Result<bool, String> {
        let result = sqlx::query(
            r#"
            UPDATE email_metadata
            SET sync_status = 'pending',
                retry_count = 0,
                sync_error = NULL,
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ? AND sync_status = 'dead_letter'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to retry dead letter: {e}"))?;

        let moved = result.rows_affected() > 0;
        if moved {
            log::info!("Moved dead_letter email back to pending: internal_id={internal_id}");
        } else {
            log::warn!("Email not found or not in dead_letter status: internal_id={internal_id}");
        }
        Ok(moved)
    }

    async fn get_dead_letter(&self, limit: i64) -> Result<Vec<EmailRecord>, String> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM email_metadata
            WHERE sync_status = 'dead_letter'
            ORDER BY date_received DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to get dead letter emails: {e}"))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats, String> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM email_metadata")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("Failed to count emails: {e}"))?;

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sync_status, COUNT(*) FROM email_metadata GROUP BY sync_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to count by status: {e}"))?;

        let by_mailbox: Vec<(String, i64)> =
            sqlx::query_as("SELECT mailbox, COUNT(*) FROM email_metadata GROUP BY mailbox")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| format!("Failed to count by mailbox: {e}"))?;

        let retry_queue: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM email_metadata
            WHERE sync_status IN ('failed', 'fetch_failed') AND next_retry_at IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| format!("Failed to count retry queue: {e}"))?;

        Ok(StoreStats {
            total_emails: total,
            by_status: by_status.into_iter().collect(),
            by_mailbox: by_mailbox.into_iter().collect(),
            retry_queue,
            last_max_row_id: self.get_last_max_row_id().await?,
            last_sync_time: self.get_state(STATE_LAST_SYNC_TIME).await?,
        })
    }

    async fn ping(&self) -> Result<(), String> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("SyncStore ping failed: {e}"))?;
        Ok(())
    }
}
