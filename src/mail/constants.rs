//! メールボックス名マッピングの一元管理
//!
//! Radar（Envelope Index の URL パターン）と Arm（AppleScript のメールボックス名）が
//! 同じメールボックスを別の識別子で参照するため、対応表をここに集約する。
//!
//! # セキュリティ
//! URL パターンはコンパイル時定数であり、実行時入力から組み立てることはない。
//! Radar はこのパターンを SQL の LIKE 句へ直接埋め込むため、これは境界条件である。

use crate::models::Mailbox;

/// メールボックス1件の対応表
pub struct MailboxEntry {
    pub mailbox: Mailbox,
    /// AppleScript の `tell mailbox "..."` に使う名前
    pub applescript_name: &'static str,
    /// Envelope Index の mailboxes.url に対する LIKE パターン断片
    ///
    /// URL エンコードされたフォルダ名を含む。アカウントのロケールによって
    /// 同じメールボックスが複数の URL を持つため、パターンは複数。
    pub sqlite_patterns: &'static [&'static str],
}

/// 対応表本体
///
/// パターンは実環境の Envelope Index から採取したもの。
/// `E6%94%B6%E4%BB%B6%E7%AE%B1` は「收件箱」、
/// `E5%B7%B2%E5%8F%91%E9%80%81%E9%82%AE%E4%BB%B6` は「已发送邮件」の URL エンコード。
pub const MAILBOX_TABLE: &[MailboxEntry] = &[
    MailboxEntry {
        mailbox: Mailbox::Inbox,
        applescript_name: "收件箱",
        sqlite_patterns: &["INBOX", "E6%94%B6%E4%BB%B6%E7%AE%B1"],
    },
    MailboxEntry {
        mailbox: Mailbox::Sent,
        applescript_name: "已发送邮件",
        sqlite_patterns: &[
            "Sent",
            "E5%8F%91%E4%BB%B6%E7%AE%B1",
            "E5%B7%B2%E5%8F%91%E9%80%81%E9%82%AE%E4%BB%B6",
            "E5%B7%B2%E5%8F%91%E9%80%81",
        ],
    },
];

/// AppleScript 用メールボックス名を引く
pub fn applescript_name(mailbox: Mailbox) -> &'static str {
    MAILBOX_TABLE
        .iter()
        .find(|e| e.mailbox == mailbox)
        .map(|e| e.applescript_name)
        .unwrap_or(mailbox.as_str())
}

/// Envelope Index の URL パターンを引く
pub fn sqlite_patterns(mailbox: Mailbox) -> &'static [&'static str] {
    MAILBOX_TABLE
        .iter()
        .find(|e| e.mailbox == mailbox)
        .map(|e| e.sqlite_patterns)
        .unwrap_or(&[])
}

/// パターンが期待する文字集合（英数字・%・_・-）だけで構成されているか検証する
///
/// 定数テーブルの追加ミスで LIKE 句が壊れるのを防ぐ。違反パターンは使わない。
pub fn is_safe_pattern(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '%' || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_mailbox_has_an_entry() {
        for mailbox in [Mailbox::Inbox, Mailbox::Sent] {
            assert!(!sqlite_patterns(mailbox).is_empty());
            assert!(!applescript_name(mailbox).is_empty());
        }
    }

    #[test]
    fn test_all_patterns_are_safe() {
        for entry in MAILBOX_TABLE {
            for pattern in entry.sqlite_patterns {
                assert!(is_safe_pattern(pattern), "unsafe pattern: {pattern}");
            }
        }
    }

    #[test]
    fn test_is_safe_pattern_rejects_quotes() {
        assert!(!is_safe_pattern("INBOX'--"));
        assert!(!is_safe_pattern(""));
        assert!(!is_safe_pattern("a b"));
        assert!(is_safe_pattern("E6%94%B6"));
    }

    #[test]
    fn test_encoded_patterns_match_folder_names() {
        // パターンは先頭の % を LIKE のワイルドカードに任せて省いている
        assert_eq!(
            format!("%{}", "E6%94%B6%E4%BB%B6%E7%AE%B1"),
            urlencoding::encode("收件箱").into_owned()
        );
        assert_eq!(
            format!("%{}", "E5%B7%B2%E5%8F%91%E9%80%81%E9%82%AE%E4%BB%B6"),
            urlencoding::encode("已发送邮件").into_owned()
        );
    }
}
