//! 同期エンジンの共有データモデル
//!
//! ローカルの Mail.app 側・SyncStore 側・Notion 側で共有される型を定義する。
//! `internal_id`（Envelope Index の ROWID）と `message_id`（RFC 822 Message-ID）は
//! 別物であり、混同してはならない。`internal_id` は Notion へは送信しない。

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 表示用タイムゾーン (UTC+8)。Notion 境界へ出すすべての日時はこのゾーンに揃える。
/// SyncStore 境界では常に UTC (RFC 3339) で保存する。
pub const DISPLAY_TZ: Tz = chrono_tz::Asia::Shanghai;

/// タイムゾーンなしのローカル日時を UTC に変換する
///
/// AppleScript が返す日時（`YYYY-MM-DDTHH:MM:SS`、ゾーンなし）は
/// 表示用タイムゾーンのローカル時刻として解釈する。
/// 夏時間の曖昧な時刻は earliest を採用する。
pub fn naive_local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    match DISPLAY_TZ.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        chrono::LocalResult::None => Utc.from_utc_datetime(&naive),
    }
}

/// UTC 日時を表示用タイムゾーンの RFC 3339 文字列にする（Notion の Date プロパティ用）
pub fn format_display(dt: DateTime<Utc>) -> String {
    dt.with_timezone(&DISPLAY_TZ).to_rfc3339()
}

/// 同期ライフサイクル状態
///
/// `Skipped` と `DeadLetter` は終端状態。`Skipped` の行は Notion へ出さないが、
/// スレッド祖先の検索用に SyncStore には残す。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
    FetchFailed,
    Skipped,
    DeadLetter,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::FetchFailed => "fetch_failed",
            SyncStatus::Skipped => "skipped",
            SyncStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<SyncStatus> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            "fetch_failed" => Some(SyncStatus::FetchFailed),
            "skipped" => Some(SyncStatus::Skipped),
            "dead_letter" => Some(SyncStatus::DeadLetter),
            _ => None,
        }
    }
}

/// 監視対象メールボックス
///
/// 固定セット。Envelope Index の URL パターンと AppleScript 名は
/// `mail::constants` のコンパイル時定数から引く（実行時入力からは組み立てない）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mailbox {
    Inbox,
    Sent,
}

impl Mailbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mailbox::Inbox => "Inbox",
            Mailbox::Sent => "Sent",
        }
    }

    pub fn parse(s: &str) -> Option<Mailbox> {
        match s {
            "Inbox" => Some(Mailbox::Inbox),
            "Sent" => Some(Mailbox::Sent),
            _ => None,
        }
    }

    /// Notion ページの icon 絵文字（受信 📧 / 送信 📤）
    pub fn icon_emoji(&self) -> &'static str {
        match self {
            Mailbox::Inbox => "📧",
            Mailbox::Sent => "📤",
        }
    }
}

/// Radar / Arm が返すメッセージのメタデータ
///
/// Envelope Index には message_id が無い行もあるため Option。
/// その場合は Arm の fetch_by_id が埋める。
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub internal_id: i64,
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub date_received: Option<DateTime<Utc>>,
    pub mailbox: Mailbox,
    pub is_read: bool,
    pub is_flagged: bool,
    pub thread_id: Option<String>,
}

/// SyncStore の1行（email_metadata テーブル）
#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub internal_id: i64,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub sender_name: String,
    pub to_addr: String,
    pub cc_addr: String,
    pub date_received: Option<DateTime<Utc>>,
    pub mailbox: Mailbox,
    pub is_read: bool,
    pub is_flagged: bool,
    pub sync_status: SyncStatus,
    pub notion_page_id: Option<String>,
    pub sync_error: Option<String>,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Arm の fetch_by_id が返す完全なメール
#[derive(Debug, Clone)]
pub struct FetchedEmail {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    /// AppleScript が返したローカル日時（ゾーンなし）。呼び出し側が正規化する。
    pub date_local: Option<NaiveDateTime>,
    /// 表示用本文（Mail.app の content プロパティ）
    pub content: String,
    /// RFC 822 の生ソース
    pub source: String,
    pub is_read: bool,
    pub is_flagged: bool,
    /// References 先頭 / In-Reply-To から導出。無ければ自身の message_id。
    pub thread_id: String,
}

/// Arm の1回の取得結果
///
/// Arm 自身はリトライしない。リトライ判断は Reconciler 側の仕事。
#[derive(Debug)]
pub enum FetchOutcome {
    /// 取得成功
    Fetched(Box<FetchedEmail>),
    /// メールが Mail.app から消えている（SyncStore の行は削除される）
    NotFound,
    /// タイムアウト（fetch_failed としてリトライキューへ）
    Timeout,
    /// その他のスクリプト失敗（診断メッセージ付き）
    ScriptError(String),
}

/// MIME パース後の添付ファイル1件
///
/// 一時ファイルはメッセージ単位のスクラッチディレクトリに置かれ、
/// パイプライン終了時（成功・失敗とも）にディレクトリごと破棄される。
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub path: PathBuf,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// MIME パース済みのメール（Notion ページ構築の入力）
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub sender_name: String,
    pub to: String,
    pub cc: String,
    pub date: Option<DateTime<Utc>>,
    pub content: String,
    /// "text/html" または "text/plain"
    pub content_type: String,
    pub is_read: bool,
    pub is_flagged: bool,
    pub attachments: Vec<AttachmentPart>,
    pub thread_id: String,
    pub mailbox: Mailbox,
}

impl ParsedEmail {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// アップロード済み添付（inline_map とブロック構築の入力）
#[derive(Debug, Clone)]
pub struct UploadedAttachment {
    pub filename: String,
    pub file_upload_id: String,
    pub content_type: String,
    pub content_id: Option<String>,
    pub is_inline: bool,
}
