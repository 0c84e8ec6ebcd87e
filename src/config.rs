//! アプリケーション設定ファイルの管理
//!
//! 同期間隔・データベース ID・Mail.app アカウント名などを
//! mailagent_config.json で管理する。状態（last_max_row_id 等）は
//! SyncStore の sync_state テーブル、設定はこのファイルに分離する。
//!
//! # セキュリティガイドライン
//! - Notion トークンは設定ファイルに保存しない。環境変数 `NOTION_TOKEN` から読む
//! - トークンをログに出力しないこと

use crate::models::Mailbox;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILENAME: &str = "mailagent_config.json";

/// Notion トークンの環境変数名
pub const NOTION_TOKEN_ENV: &str = "NOTION_TOKEN";

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub notion: NotionConfig,
    pub mail: MailConfig,
    pub sync: SyncConfig,
}

/// Notion 側の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotionConfig {
    /// メール用データベース ID（必須。空なら起動時エラー）
    pub email_database_id: String,
    /// 日程用データベース ID（空なら会議招待の同期を無効化）
    #[serde(default)]
    pub calendar_database_id: String,
}

/// Mail.app 側の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Mail.app のアカウント名（AppleScript の `tell account` に使う）
    #[serde(default = "default_account_name")]
    pub account_name: String,
    /// 同期対象メールボックス
    #[serde(default = "default_mailboxes")]
    pub mailboxes: Vec<Mailbox>,
    /// AppleScript のタイムアウト（秒）。添付の多いメールは長くかかる
    #[serde(default = "default_applescript_timeout_secs")]
    pub applescript_timeout_secs: u64,
}

fn default_account_name() -> String {
    "Exchange".to_string()
}

fn default_mailboxes() -> Vec<Mailbox> {
    vec![Mailbox::Inbox, Mailbox::Sent]
}

fn default_applescript_timeout_secs() -> u64 {
    200
}

/// 同期ループの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 順方向ポーリング間隔（秒）
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// 逆方向同期の間隔（秒）
    #[serde(default = "default_reverse_sync_interval_secs")]
    pub reverse_sync_interval_secs: u64,
    /// 健全性チェックの間隔（秒）
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// 1 tick で処理する pending の上限
    #[serde(default = "default_pending_batch_size")]
    pub pending_batch_size: usize,
    /// 1 tick で処理するリトライの上限
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,
    /// この日付（YYYY-MM-DD、表示用タイムゾーン）より前のメールは skipped にする。
    /// 空なら日付フィルタなし
    #[serde(default)]
    pub sync_start_date: String,
    /// SyncStore の SQLite ファイルパス
    #[serde(default = "default_sync_store_path")]
    pub sync_store_path: String,
    /// 添付ファイルの上限サイズ（バイト）。Notion の制限に合わせる
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_reverse_sync_interval_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    3600
}

fn default_pending_batch_size() -> usize {
    10
}

fn default_retry_batch_size() -> usize {
    3
}

fn default_sync_store_path() -> String {
    "data/sync_store.db".to_string()
}

fn default_max_attachment_bytes() -> u64 {
    20 * 1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            notion: NotionConfig {
                email_database_id: String::new(),
                calendar_database_id: String::new(),
            },
            mail: MailConfig {
                account_name: default_account_name(),
                mailboxes: default_mailboxes(),
                applescript_timeout_secs: default_applescript_timeout_secs(),
            },
            sync: SyncConfig {
                poll_interval_secs: default_poll_interval_secs(),
                reverse_sync_interval_secs: default_reverse_sync_interval_secs(),
                health_check_interval_secs: default_health_check_interval_secs(),
                pending_batch_size: default_pending_batch_size(),
                retry_batch_size: default_retry_batch_size(),
                sync_start_date: String::new(),
                sync_store_path: default_sync_store_path(),
                max_attachment_bytes: default_max_attachment_bytes(),
            },
        }
    }
}

impl SyncConfig {
    /// sync_start_date を UTC 境界として解釈する
    ///
    /// YYYY-MM-DD は表示用タイムゾーンの 00:00 として扱い UTC に変換する。
    /// 形式が不正な場合は警告を出してフィルタなしにする。
    pub fn sync_start_date_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.sync_start_date.is_empty() {
            return None;
        }
        match chrono::NaiveDate::parse_from_str(&self.sync_start_date, "%Y-%m-%d") {
            Ok(date) => {
                let naive = date.and_hms_opt(0, 0, 0)?;
                Some(crate::models::naive_local_to_utc(naive))
            }
            Err(_) => {
                log::warn!(
                    "Invalid sync_start_date format (expected YYYY-MM-DD): {}",
                    self.sync_start_date
                );
                None
            }
        }
    }
}

/// Notion トークンを環境変数から読み込む
///
/// # セキュリティ
/// トークンはログに出力されない
pub fn notion_token() -> Result<String, String> {
    let token = std::env::var(NOTION_TOKEN_ENV)
        .map_err(|_| format!("{NOTION_TOKEN_ENV} environment variable is not set"))?;
    if token.is_empty() {
        return Err(format!("{NOTION_TOKEN_ENV} is empty"));
    }
    Ok(token)
}

/// 設定を読み込む。ファイルが存在しない場合はデフォルトを返し、保存する。
pub fn load(config_dir: &Path) -> Result<AppConfig, String> {
    let path = config_dir.join(CONFIG_FILENAME);

    if path.exists() {
        let contents =
            fs::read_to_string(&path).map_err(|e| format!("Failed to read config file: {e}"))?;
        serde_json::from_str(&contents).map_err(|e| format!("Invalid config JSON: {e}"))
    } else {
        let config = AppConfig::default();
        save(config_dir, &config)?;
        Ok(config)
    }
}

/// 設定を保存する。
pub fn save(config_dir: &Path, config: &AppConfig) -> Result<(), String> {
    fs::create_dir_all(config_dir).map_err(|e| format!("Failed to create config dir: {e}"))?;

    let path = config_dir.join(CONFIG_FILENAME);
    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;

    fs::write(&path, contents).map_err(|e| format!("Failed to write config file: {e}"))
}
