//! SQLite Radar - 新着メールの高速検知
//!
//! Mail.app 自身のインデックス（Envelope Index）を読み取り専用で開き、
//! max_row_id の変化だけを監視する。書き込みは一切しない。
//!
//! 接続は呼び出しごとに開いて閉じる。await をまたいで保持しない。
//! データベースが見つからない・読めない場合は例外を投げず、
//! `is_available() = false` と空の結果で縮退する（Reconciler はリトライ
//! キューの処理を続行できる）。
//!
//! 必要条件:
//! - Mail.app のデータベースへのフルディスクアクセス権限
//! - 少なくとも1アカウントが設定された Mail.app

use crate::mail::constants;
use crate::models::{Mailbox, MessageMeta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 新着検知の抽象。テストではモックに差し替える
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RadarSource: Send + Sync {
    /// データベースに到達できるか
    async fn is_available(&self) -> bool;

    /// 監視対象メールボックス・未削除行に限定した MAX(ROWID)。不達なら 0
    async fn current_max_row_id(&self) -> i64;

    /// メールボックスごとの件数（診断用）
    async fn email_count_by_mailbox(&self) -> HashMap<Mailbox, i64>;

    /// 前回の max_row_id と比較して新着を検知する
    ///
    /// # Returns
    /// `(has_new, current_max, estimated_new_count)`。状態は持たない。
    /// last_max_row_id の管理は呼び出し側（SyncStore）の仕事
    async fn check_for_changes(&self, last_max_row_id: i64) -> (bool, i64, i64);

    /// ROWID が since_row_id より大きい行を ROWID 昇順で列挙する
    ///
    /// message_id はインデックスからは読まない（Arm の fetch_by_id が埋める）。
    async fn get_new_emails(&self, since_row_id: i64) -> Vec<MessageMeta>;
}

/// Envelope Index を読む実装
pub struct SqliteRadar {
    db_path: Option<PathBuf>,
    mailboxes: Vec<Mailbox>,
}

impl SqliteRadar {
    /// ホームディレクトリ配下から Envelope Index を探して初期化する
    pub fn new(mailboxes: Vec<Mailbox>) -> Self {
        let db_path = find_envelope_index();
        match &db_path {
            Some(path) => {
                log::info!("SQLite radar initialized with database: {}", path.display());
                log::info!("Monitoring mailboxes: {:?}", mailboxes);
            }
            None => log::warn!("SQLite radar: Envelope Index not found"),
        }
        Self { db_path, mailboxes }
    }

    /// データベースパスを直接指定して初期化する（テスト・診断用）
    pub fn with_db_path(db_path: PathBuf, mailboxes: Vec<Mailbox>) -> Self {
        let db_path = if db_path.exists() {
            Some(db_path)
        } else {
            log::warn!("SQLite radar: database not found: {}", db_path.display());
            None
        };
        Self { db_path, mailboxes }
    }

    /// 読み取り専用の接続を開く。呼び出しごとに使い捨てる
    async fn connect(&self) -> Result<SqliteConnection, String> {
        let path = self
            .db_path
            .as_ref()
            .ok_or_else(|| "Envelope Index path not available".to_string())?;
        SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .connect()
            .await
            .map_err(|e| format!("Failed to open Envelope Index read-only: {e}"))
    }

    /// 監視対象メールボックスの WHERE 句を組み立てる
    ///
    /// パターンは `mail::constants` のコンパイル時定数のみ。実行時入力は混ぜない。
    /// 期待文字集合から外れるパターンは警告して捨てる。
    fn build_mailbox_filter(&self) -> String {
        let mut conditions = Vec::new();
        for mailbox in &self.mailboxes {
            for pattern in constants::sqlite_patterns(*mailbox) {
                if constants::is_safe_pattern(pattern) {
                    conditions.push(format!("mb.url LIKE '%{pattern}%'"));
                } else {
                    log::warn!("Skipping invalid mailbox pattern: {pattern}");
                }
            }
        }
        if conditions.is_empty() {
            "1=1".to_string()
        } else {
            format!("({})", conditions.join(" OR "))
        }
    }

    /// 単一メールボックス用の WHERE 句
    fn build_single_mailbox_filter(mailbox: Mailbox) -> String {
        let conditions: Vec<String> = constants::sqlite_patterns(mailbox)
            .iter()
            .filter(|p| constants::is_safe_pattern(p))
            .map(|p| format!("mb.url LIKE '%{p}%'"))
            .collect();
        format!("({})", conditions.join(" OR "))
    }
}

#[async_trait]
impl RadarSource for SqliteRadar {
    async fn is_available(&self) -> bool {
        if self.db_path.is_none() {
            return false;
        }
        match self.connect().await {
            Ok(mut conn) => {
                let ok = sqlx::query_scalar::<_, i64>("SELECT 1")
                    .fetch_one(&mut conn)
                    .await
                    .is_ok();
                let _ = conn.close().await;
                ok
            }
            Err(e) => {
                log::error!("SQLite radar availability check failed: {e}");
                false
            }
        }
    }

    async fn current_max_row_id(&self) -> i64 {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Failed to get max row_id: {e}");
                return 0;
            }
        };

        let query = format!(
            r#"
            SELECT MAX(m.ROWID)
            FROM messages m
            LEFT JOIN mailboxes mb ON m.mailbox = mb.ROWID
            WHERE m.deleted = 0
            AND {}
            "#,
            self.build_mailbox_filter()
        );

        let result: Result<Option<i64>, _> =
            sqlx::query_scalar(&query).fetch_one(&mut conn).await;
        let _ = conn.close().await;

        match result {
            Ok(max) => max.unwrap_or(0),
            Err(e) => {
                log::error!("Failed to get max row_id: {e}");
                0
            }
        }
    }

    async fn email_count_by_mailbox(&self) -> HashMap<Mailbox, i64> {
        let mut result = HashMap::new();
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Failed to get email count: {e}");
                return result;
            }
        };

        for mailbox in &self.mailboxes {
            let query = format!(
                r#"
                SELECT COUNT(*)
                FROM messages m
                LEFT JOIN mailboxes mb ON m.mailbox = mb.ROWID
                WHERE m.deleted = 0
                AND {}
                "#,
                Self::build_single_mailbox_filter(*mailbox)
            );
            match sqlx::query_scalar::<_, i64>(&query).fetch_one(&mut conn).await {
                Ok(count) => {
                    result.insert(*mailbox, count);
                }
                Err(e) => {
                    log::error!("Failed to get email count for {}: {e}", mailbox.as_str());
                }
            }
        }

        let _ = conn.close().await;
        result
    }

    async fn check_for_changes(&self, last_max_row_id: i64) -> (bool, i64, i64) {
        let current_max = self.current_max_row_id().await;

        if current_max > last_max_row_id {
            let estimated_new = current_max - last_max_row_id;
            log::info!(
                "Detected changes: max_row_id {last_max_row_id} -> {current_max} (estimated {estimated_new} new)"
            );
            (true, current_max, estimated_new)
        } else {
            (false, current_max, 0)
        }
    }

    async fn get_new_emails(&self, since_row_id: i64) -> Vec<MessageMeta> {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Failed to enumerate new emails: {e}");
                return Vec::new();
            }
        };

        let mut emails = Vec::new();

        // メールボックスごとに列挙してタグ付けする
        for mailbox in &self.mailboxes {
            let query = format!(
                r#"
                SELECT m.ROWID AS row_id,
                       COALESCE(s.subject, '') AS subject,
                       COALESCE(a.address, '') AS sender,
                       m.date_received AS date_received,
                       m.read AS is_read,
                       m.flagged AS is_flagged
                FROM messages m
                LEFT JOIN mailboxes mb ON m.mailbox = mb.ROWID
                LEFT JOIN subjects s ON m.subject = s.ROWID
                LEFT JOIN addresses a ON m.sender = a.ROWID
                WHERE m.deleted = 0
                AND m.ROWID > ?
                AND {}
                ORDER BY m.ROWID ASC
                "#,
                Self::build_single_mailbox_filter(*mailbox)
            );

            let rows = match sqlx::query(&query)
                .bind(since_row_id)
                .fetch_all(&mut conn)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    log::error!(
                        "Failed to enumerate new emails for {}: {e}",
                        mailbox.as_str()
                    );
                    continue;
                }
            };

            for row in rows {
                let internal_id: i64 = match row.try_get("row_id") {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!("Failed to parse radar row: {e}");
                        continue;
                    }
                };
                let date_received = row
                    .try_get::<Option<i64>, _>("date_received")
                    .ok()
                    .flatten()
                    .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0));

                emails.push(MessageMeta {
                    internal_id,
                    message_id: None,
                    subject: row.try_get("subject").unwrap_or_default(),
                    sender: row.try_get("sender").unwrap_or_default(),
                    date_received,
                    mailbox: *mailbox,
                    is_read: row.try_get::<i64, _>("is_read").unwrap_or(0) != 0,
                    is_flagged: row.try_get::<i64, _>("is_flagged").unwrap_or(0) != 0,
                    thread_id: None,
                });
            }
        }

        let _ = conn.close().await;

        // Reconciler が最古の未同期 ID から処理できるよう昇順を保証する
        emails.sort_by_key(|e| e.internal_id);
        log::debug!("get_new_emails: {} rows since {since_row_id}", emails.len());
        emails
    }
}

/// `~/Library/Mail/V*/MailData/Envelope Index` の最新バージョンを探す
fn find_envelope_index() -> Option<PathBuf> {
    let home = directories::BaseDirs::new()?.home_dir().to_path_buf();
    find_envelope_index_under(&home.join("Library").join("Mail"))
}

/// 指定ディレクトリ配下から Envelope Index を探す
///
/// `V10`, `V9` のような V ディレクトリのうち番号が最大のものを選ぶ。
fn find_envelope_index_under(mail_base: &Path) -> Option<PathBuf> {
    if !mail_base.exists() {
        log::debug!("Mail directory does not exist: {}", mail_base.display());
        return None;
    }

    let mut versions: Vec<(u32, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(mail_base).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix('V') {
            if let Ok(version) = rest.parse::<u32>() {
                versions.push((version, entry.path()));
            }
        }
    }

    versions.sort_by_key(|(v, _)| std::cmp::Reverse(*v));
    let (_, newest) = versions.into_iter().next()?;
    let db_path = newest.join("MailData").join("Envelope Index");

    if db_path.exists() {
        log::debug!("Found Mail database: {}", db_path.display());
        Some(db_path)
    } else {
        log::debug!("Envelope Index not found: {}", db_path.display());
        None
    }
}
