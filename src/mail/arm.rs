//! AppleScript Arm - Mail.app への単発アクセス
//!
//! Mail.app と会話する唯一のコンポーネント。1回の呼び出しで1つの操作だけを行い、
//! 設定されたタイムアウト（既定 200 秒。添付の多いメールに必要）で打ち切る。
//!
//! 取得系は整数 id（Envelope Index の ROWID と同じ値）で特定する。
//! `whose id is N` は message id 文字列での検索より桁違いに速い。
//! 書き込み系（既読・フラグ）は頻度が低いので message id で特定する。
//!
//! スクリプトに埋め込む値は整数 id と引用符で囲んだ文字列のみ。
//! 文字列のエスケープ規則: バックスラッシュ→二重化（最初に処理）、
//! 二重引用符→エスケープ、CR/LF/TAB→空白。この順序以外は正しくない。
//!
//! Arm はリトライしない。リトライは Reconciler の仕事。

use crate::mail::constants;
use crate::mail::mime;
use crate::models::{FetchOutcome, FetchedEmail, Mailbox, MessageMeta};
use async_trait::async_trait;
use chrono::NaiveDateTime;
#[cfg(test)]
use mockall::automock;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// フィールド区切り
pub const SEPARATOR: &str = "{{SEP}}";
/// レコード区切り
pub const RECORD_SEPARATOR: &str = "{{REC}}";

/// 書き込み系操作のタイムアウト（秒）。本文を運ばないので短くてよい
const WRITE_TIMEOUT_SECS: u64 = 30;

/// Mail.app 操作の抽象。テストではモックに差し替える
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MailArm: Send + Sync {
    /// 整数 id でメール全体（生ソース込み）を取得する。クリティカルパス
    async fn fetch_by_id(&self, internal_id: i64, mailbox: Mailbox) -> FetchOutcome;

    /// 位置指定で最新 count 件のメタデータを取得する（初期バックフィル用）
    ///
    /// References / In-Reply-To はスクリプト内で直接名前引きして thread_id を安く埋める。
    async fn fetch_by_position(
        &self,
        count: usize,
        mailbox: Mailbox,
        offset: usize,
    ) -> Result<Vec<MessageMeta>, String>;

    /// 既読状態を変更する（逆方向同期）
    async fn mark_read(&self, message_id: &str, read: bool, mailbox: Mailbox)
        -> Result<bool, String>;

    /// フラグを変更する（逆方向同期）
    async fn set_flag(
        &self,
        message_id: &str,
        flagged: bool,
        mailbox: Mailbox,
    ) -> Result<bool, String>;
}

/// osascript を実行する実装
pub struct AppleScriptArm {
    account_name: String,
    timeout: Duration,
}

/// スクリプト実行の内部結果
enum ScriptResult {
    Output(String),
    Timeout,
    Failed(String),
}

impl AppleScriptArm {
    pub fn new(account_name: String, timeout_secs: u64) -> Self {
        log::debug!(
            "AppleScriptArm initialized: account={account_name}, timeout={timeout_secs}s"
        );
        Self {
            account_name,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// osascript -e を実行して標準出力を返す
    async fn execute_script(&self, script: &str, timeout: Duration) -> ScriptResult {
        let child = Command::new("osascript")
            .arg("-e")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return ScriptResult::Failed(format!("Failed to spawn osascript: {e}")),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => {
                log::error!(
                    "AppleScript execution timed out after {}s",
                    timeout.as_secs()
                );
                ScriptResult::Timeout
            }
            Ok(Err(e)) => ScriptResult::Failed(format!("osascript I/O error: {e}")),
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let truncated: String = stderr.chars().take(200).collect();
                    log::error!(
                        "AppleScript error (status={}): {truncated}",
                        output.status
                    );
                    return ScriptResult::Failed(truncated);
                }
                ScriptResult::Output(
                    String::from_utf8_lossy(&output.stdout).trim().to_string(),
                )
            }
        }
    }
}

#[async_trait]
impl MailArm for AppleScriptArm {
    async fn fetch_by_id(&self, internal_id: i64, mailbox: Mailbox) -> FetchOutcome {
        let mailbox_name = constants::applescript_name(mailbox);
        let script = build_fetch_by_id_script(&self.account_name, mailbox_name, internal_id);

        match self.execute_script(&script, self.timeout).await {
            ScriptResult::Timeout => FetchOutcome::Timeout,
            ScriptResult::Failed(diag) => FetchOutcome::ScriptError(diag),
            ScriptResult::Output(output) => parse_fetch_output(&output),
        }
    }

    async fn fetch_by_position(
        &self,
        count: usize,
        mailbox: Mailbox,
        offset: usize,
    ) -> Result<Vec<MessageMeta>, String> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mailbox_name = constants::applescript_name(mailbox);
        log::info!("Fetching {count} emails from {mailbox_name} via AppleScript (offset={offset})");
        let script =
            build_fetch_by_position_script(&self.account_name, mailbox_name, count, offset);

        match self.execute_script(&script, self.timeout).await {
            ScriptResult::Timeout => Err(format!(
                "fetch_by_position timed out after {}s",
                self.timeout.as_secs()
            )),
            ScriptResult::Failed(diag) => Err(format!("fetch_by_position failed: {diag}")),
            ScriptResult::Output(output) => Ok(parse_position_output(&output, mailbox)),
        }
    }

    async fn mark_read(
        &self,
        message_id: &str,
        read: bool,
        mailbox: Mailbox,
    ) -> Result<bool, String> {
        let mailbox_name = constants::applescript_name(mailbox);
        let script = build_status_write_script(
            &self.account_name,
            mailbox_name,
            message_id,
            "read status",
            read,
        );

        match self
            .execute_script(&script, Duration::from_secs(WRITE_TIMEOUT_SECS))
            .await
        {
            ScriptResult::Output(output) if output.starts_with("OK") => {
                log::debug!("mark_read: message_id={}, read={read}", truncate_id(message_id));
                Ok(true)
            }
            ScriptResult::Output(output) => {
                log::error!(
                    "mark_read failed: message_id={}, result={output}",
                    truncate_id(message_id)
                );
                Ok(false)
            }
            ScriptResult::Timeout => Err("mark_read timed out".to_string()),
            ScriptResult::Failed(diag) => Err(format!("mark_read failed: {diag}")),
        }
    }

    async fn set_flag(
        &self,
        message_id: &str,
        flagged: bool,
        mailbox: Mailbox,
    ) -> Result<bool, String> {
        let mailbox_name = constants::applescript_name(mailbox);
        let script = build_status_write_script(
            &self.account_name,
            mailbox_name,
            message_id,
            "flagged status",
            flagged,
        );

        match self
            .execute_script(&script, Duration::from_secs(WRITE_TIMEOUT_SECS))
            .await
        {
            ScriptResult::Output(output) if output.starts_with("OK") => {
                log::debug!(
                    "set_flag: message_id={}, flagged={flagged}",
                    truncate_id(message_id)
                );
                Ok(true)
            }
            ScriptResult::Output(output) => {
                log::error!(
                    "set_flag failed: message_id={}, result={output}",
                    truncate_id(message_id)
                );
                Ok(false)
            }
            ScriptResult::Timeout => Err("set_flag timed out".to_string()),
            ScriptResult::Failed(diag) => Err(format!("set_flag failed: {diag}")),
        }
    }
}

/// AppleScript 文字列リテラルのエスケープ
///
/// 順序が重要: バックスラッシュを最初に二重化しないと後続のエスケープを壊す。
pub fn escape_for_applescript(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', " ")
        .replace('\r', " ")
        .replace('\t', " ")
}

/// ログ用に message id を切り詰める
fn truncate_id(message_id: &str) -> String {
    if message_id.chars().count() > 40 {
        let head: String = message_id.chars().take(40).collect();
        format!("{head}...")
    } else {
        message_id.to_string()
    }
}

/// msgDate を YYYY-MM-DDTHH:MM:SS に整形する AppleScript 断片
///
/// ローカライズされた日付文字列（中文・和文など）を避けるため数値から組み立てる。
fn date_format_snippet() -> &'static str {
    r#"
                        set dateStr to (year of msgDate as string) & "-"
                        set monthNum to (month of msgDate as integer)
                        if monthNum < 10 then
                            set dateStr to dateStr & "0"
                        end if
                        set dateStr to dateStr & (monthNum as string) & "-"
                        set dayNum to (day of msgDate as integer)
                        if dayNum < 10 then
                            set dateStr to dateStr & "0"
                        end if
                        set dateStr to dateStr & (dayNum as string) & "T"
                        set hourNum to (hours of msgDate as integer)
                        if hourNum < 10 then
                            set dateStr to dateStr & "0"
                        end if
                        set dateStr to dateStr & (hourNum as string) & ":"
                        set minuteNum to (minutes of msgDate as integer)
                        if minuteNum < 10 then
                            set dateStr to dateStr & "0"
                        end if
                        set dateStr to dateStr & (minuteNum as string) & ":"
                        set secondNum to (seconds of msgDate as integer)
                        if secondNum < 10 then
                            set dateStr to dateStr & "0"
                        end if
                        set dateStr to dateStr & (secondNum as string)
"#
}

/// 整数 id で1通を取得するスクリプト
fn build_fetch_by_id_script(account: &str, mailbox_name: &str, internal_id: i64) -> String {
    format!(
        r#"
        tell application "Mail"
            tell account "{account}"
                tell mailbox "{mailbox}"
                    try
                        set theMessage to first message whose id is {internal_id}
                        set msgId to message id of theMessage
                        set msgSubject to subject of theMessage
                        set msgSender to sender of theMessage
                        set msgDate to date received of theMessage
                        set msgContent to content of theMessage
                        set msgSource to source of theMessage
                        set msgRead to read status of theMessage
                        set msgFlagged to flagged status of theMessage
{date_snippet}
                        return "OK" & "{sep}" & msgId & "{sep}" & msgSubject & "{sep}" & msgSender & "{sep}" & dateStr & "{sep}" & msgContent & "{sep}" & msgSource & "{sep}" & (msgRead as string) & "{sep}" & (msgFlagged as string)
                    on error errMsg
                        return "ERROR" & "{sep}" & errMsg
                    end try
                end tell
            end tell
        end tell
        "#,
        account = escape_for_applescript(account),
        mailbox = escape_for_applescript(mailbox_name),
        internal_id = internal_id,
        date_snippet = date_format_snippet(),
        sep = SEPARATOR,
    )
}

/// 位置指定で count 件のメタデータを取得するスクリプト
fn build_fetch_by_position_script(
    account: &str,
    mailbox_name: &str,
    count: usize,
    offset: usize,
) -> String {
    // AppleScript のインデックスは 1 始まり
    let start_index = offset + 1;
    let end_index = offset + count;
    format!(
        r#"
        tell application "Mail"
            set resultList to {{}}
            tell account "{account}"
                tell mailbox "{mailbox}"
                    set msgCount to count of messages
                    set startIdx to {start_index}
                    set endIdx to {end_index}

                    if startIdx > msgCount then
                        return ""
                    end if
                    if endIdx > msgCount then
                        set endIdx to msgCount
                    end if

                    repeat with i from startIdx to endIdx
                        try
                            set m to message i
                            set msgInternalId to id of m
                            set msgId to message id of m
                            set msgSubject to subject of m
                            set msgSender to sender of m
                            set msgDate to date received of m
                            set msgRead to read status of m
                            set msgFlagged to flagged status of m

                            -- References / In-Reply-To は名前で直接引く（全ヘッダ走査より 4-5 倍速い）
                            set msgReferences to ""
                            set msgInReplyTo to ""
                            try
                                set msgReferences to content of header "References" of m
                            end try
                            try
                                set msgInReplyTo to content of header "In-Reply-To" of m
                            end try
{date_snippet}
                            set info to (msgInternalId as string) & "{sep}" & msgId & "{sep}" & msgSubject & "{sep}" & msgSender & "{sep}" & dateStr & "{sep}" & (msgRead as string) & "{sep}" & (msgFlagged as string) & "{sep}" & msgReferences & "{sep}" & msgInReplyTo
                            set end of resultList to info
                        on error errMsg
                            -- 読めないメールは飛ばす
                        end try
                    end repeat
                end tell
            end tell

            set AppleScript's text item delimiters to "{rec}"
            set resultStr to resultList as string
            set AppleScript's text item delimiters to ""
            return resultStr
        end tell
        "#,
        account = escape_for_applescript(account),
        mailbox = escape_for_applescript(mailbox_name),
        start_index = start_index,
        end_index = end_index,
        date_snippet = date_format_snippet(),
        sep = SEPARATOR,
        rec = RECORD_SEPARATOR,
    )
}

/// 既読・フラグ書き込みスクリプト
fn build_status_write_script(
    account: &str,
    mailbox_name: &str,
    message_id: &str,
    property: &str,
    value: bool,
) -> String {
    format!(
        r#"
        tell application "Mail"
            tell account "{account}"
                tell mailbox "{mailbox}"
                    try
                        set theMessage to first message whose message id is "{message_id}"
                        set {property} of theMessage to {value}
                        return "OK"
                    on error errMsg
                        return "ERROR: " & errMsg
                    end try
                end tell
            end tell
        end tell
        "#,
        account = escape_for_applescript(account),
        mailbox = escape_for_applescript(mailbox_name),
        message_id = escape_for_applescript(message_id),
        property = property,
        value = value,
    )
}

/// fetch_by_id の出力をパースする
fn parse_fetch_output(output: &str) -> FetchOutcome {
    if output.is_empty() {
        return FetchOutcome::ScriptError("empty output from osascript".to_string());
    }

    if let Some(error_msg) = output.strip_prefix(&format!("ERROR{SEPARATOR}")) {
        // `whose id is N` が見つからないときの Mail.app のエラー文言
        if error_msg.contains("Can't get message") || error_msg.contains("Can’t get message") {
            return FetchOutcome::NotFound;
        }
        return FetchOutcome::ScriptError(error_msg.to_string());
    }

    let Some(rest) = output.strip_prefix(&format!("OK{SEPARATOR}")) else {
        let truncated: String = output.chars().take(100).collect();
        return FetchOutcome::ScriptError(format!("unexpected result format: {truncated}"));
    };

    let parts: Vec<&str> = rest.split(SEPARATOR).collect();
    if parts.len() < 8 {
        return FetchOutcome::ScriptError(format!(
            "invalid field count in fetch output: {}",
            parts.len()
        ));
    }

    let message_id = parts[0].trim().trim_matches(['<', '>']).to_string();
    if message_id.is_empty() {
        return FetchOutcome::ScriptError("fetched message has empty message id".to_string());
    }

    let source = parts[5].to_string();
    let thread_id = mime::extract_thread_id(&source).unwrap_or_else(|| message_id.clone());

    FetchOutcome::Fetched(Box::new(FetchedEmail {
        message_id,
        subject: parts[1].to_string(),
        sender: parts[2].to_string(),
        date_local: parse_script_date(parts[3]),
        content: parts[4].to_string(),
        source,
        is_read: parts[6].trim().eq_ignore_ascii_case("true"),
        is_flagged: parts[7].trim().eq_ignore_ascii_case("true"),
        thread_id,
    }))
}

/// fetch_by_position の出力をパースする
fn parse_position_output(output: &str, mailbox: Mailbox) -> Vec<MessageMeta> {
    let mut emails = Vec::new();

    for record in output.split(RECORD_SEPARATOR) {
        if record.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = record.split(SEPARATOR).collect();
        if parts.len() < 7 {
            log::warn!(
                "Failed to parse email record (fields={}): {}",
                parts.len(),
                record.chars().take(100).collect::<String>()
            );
            continue;
        }

        let Ok(internal_id) = parts[0].trim().parse::<i64>() else {
            log::warn!("Failed to parse internal id: {}", parts[0]);
            continue;
        };

        let references = parts.get(7).copied().unwrap_or("");
        let in_reply_to = parts.get(8).copied().unwrap_or("");
        let thread_id = mime::thread_id_from_headers(references, in_reply_to);

        emails.push(MessageMeta {
            internal_id,
            message_id: Some(parts[1].trim().trim_matches(['<', '>']).to_string()),
            subject: parts[2].to_string(),
            sender: parts[3].to_string(),
            date_received: parse_script_date(parts[4]).map(crate::models::naive_local_to_utc),
            mailbox,
            is_read: parts[5].trim().eq_ignore_ascii_case("true"),
            is_flagged: parts[6].trim().eq_ignore_ascii_case("true"),
            thread_id,
        });
    }

    log::debug!("fetch_by_position: parsed {} emails", emails.len());
    emails
}

/// スクリプトが返す YYYY-MM-DDTHH:MM:SS をパースする
fn parse_script_date(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S").ok()
}
