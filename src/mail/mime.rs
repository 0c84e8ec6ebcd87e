//! MIME 境界 - 生ソースの解釈
//!
//! Arm が取得した RFC 822 ソースから本文・添付・ヘッダ情報を取り出す。
//! パース本体は `mailparse` に任せ、このモジュールは文字列から型への変換を持つ。
//!
//! 添付ファイルはメッセージ単位のスクラッチディレクトリに書き出す。
//! ディレクトリの破棄はパイプライン側（Reconciler）の責任。

use crate::models::{AttachmentPart, FetchedEmail, Mailbox, ParsedEmail};
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use std::path::Path;

/// ソースからスレッド先頭の message_id を導出する
///
/// 優先順位:
/// 1. References ヘッダの先頭トークン（元メールの message_id）
/// 2. In-Reply-To ヘッダ
/// 3. どちらも無ければ None（呼び出し側が自身の message_id を使う）
pub fn extract_thread_id(source: &str) -> Option<String> {
    let parsed = mailparse::parse_mail(source.as_bytes()).ok()?;
    let references = parsed
        .headers
        .get_first_value("References")
        .unwrap_or_default();
    let in_reply_to = parsed
        .headers
        .get_first_value("In-Reply-To")
        .unwrap_or_default();
    thread_id_from_headers(&references, &in_reply_to)
}

/// References / In-Reply-To の生文字列から thread_id を導出する
pub fn thread_id_from_headers(references: &str, in_reply_to: &str) -> Option<String> {
    if let Some(first) = references.split_whitespace().next() {
        let id = first.trim_matches(['<', '>']);
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    let id = in_reply_to.trim().trim_matches(['<', '>']);
    if !id.is_empty() {
        return Some(id.to_string());
    }
    None
}

/// ソースに text/calendar パートが含まれるか（会議招待の高速判定）
pub fn has_calendar_part(source: &str) -> bool {
    find_calendar_part(source).is_some()
}

/// text/calendar パートの本文（iCalendar テキスト）を取り出す
pub fn find_calendar_part(source: &str) -> Option<String> {
    let parsed = mailparse::parse_mail(source.as_bytes()).ok()?;
    let mut result = None;
    walk_parts(&parsed, &mut |part| {
        if result.is_none() && part.ctype.mimetype.eq_ignore_ascii_case("text/calendar") {
            if let Ok(body) = part.get_body() {
                result = Some(body);
            }
        }
    });
    result
}

/// パートツリーを深さ優先で辿る
fn walk_parts<'a>(part: &'a ParsedMail<'a>, visit: &mut impl FnMut(&'a ParsedMail<'a>)) {
    visit(part);
    for sub in &part.subparts {
        walk_parts(sub, visit);
    }
}

/// From ヘッダを (表示名, アドレス) に分解する
fn split_sender(from_header: &str) -> (String, String) {
    if let Ok(addrs) = mailparse::addrparse(from_header) {
        if let Some(mailparse::MailAddr::Single(info)) = addrs.iter().next() {
            let name = info.display_name.clone().unwrap_or_default();
            return (name, info.addr.to_lowercase());
        }
    }
    (String::new(), from_header.trim().to_string())
}

/// ファイル名をスクラッチディレクトリ用に無害化する
fn safe_filename(raw: &str, index: usize) -> String {
    let name = sanitize_filename::sanitize(raw);
    if name.is_empty() {
        format!("attachment-{index}")
    } else {
        name
    }
}

/// 本文候補（HTML 優先、無ければプレーンテキスト）を選ぶ
fn select_body(parsed: &ParsedMail<'_>) -> (String, String) {
    let mut html = None;
    let mut plain = None;

    walk_parts(parsed, &mut |part| {
        let disposition = part.get_content_disposition();
        if disposition.disposition == mailparse::DispositionType::Attachment {
            return;
        }
        match part.ctype.mimetype.to_ascii_lowercase().as_str() {
            "text/html" if html.is_none() => {
                if let Ok(body) = part.get_body() {
                    html = Some(body);
                }
            }
            "text/plain" if plain.is_none() => {
                if let Ok(body) = part.get_body() {
                    plain = Some(body);
                }
            }
            _ => {}
        }
    });

    if let Some(html) = html {
        (html, "text/html".to_string())
    } else {
        (plain.unwrap_or_default(), "text/plain".to_string())
    }
}

/// 添付・インラインパートを抽出してスクラッチディレクトリへ書き出す
fn extract_attachments(
    parsed: &ParsedMail<'_>,
    scratch_dir: &Path,
) -> Result<Vec<AttachmentPart>, String> {
    let mut attachments = Vec::new();
    let mut parts = Vec::new();
    walk_parts(parsed, &mut |part| parts.push(part));

    for part in parts {
        let disposition = part.get_content_disposition();
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|v| v.trim().trim_matches(['<', '>']).to_string());

        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned());

        let is_attachment = disposition.disposition == mailparse::DispositionType::Attachment;
        let is_inline_with_cid = disposition.disposition == mailparse::DispositionType::Inline
            && content_id.is_some();
        // Content-ID だけで参照されるパート（disposition なしのインライン画像）も拾う
        let is_bare_inline = content_id.is_some()
            && !part.ctype.mimetype.to_ascii_lowercase().starts_with("text/")
            && !part.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/");

        if !(is_attachment || is_inline_with_cid || is_bare_inline) {
            continue;
        }

        let data = part
            .get_body_raw()
            .map_err(|e| format!("Failed to decode attachment body: {e}"))?;
        if data.is_empty() {
            continue;
        }

        let index = attachments.len();
        let filename = safe_filename(
            filename.as_deref().unwrap_or("attachment"),
            index,
        );
        let path = scratch_dir.join(&filename);
        std::fs::write(&path, &data)
            .map_err(|e| format!("Failed to write attachment {filename}: {e}"))?;

        attachments.push(AttachmentPart {
            filename,
            content_type: part.ctype.mimetype.to_ascii_lowercase(),
            size: data.len() as u64,
            path,
            content_id,
            is_inline: !is_attachment,
        });
    }

    Ok(attachments)
}

/// Date ヘッダを UTC にパースする
fn parse_mime_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let date_str = parsed.headers.get_first_value("Date")?;
    let epoch = mailparse::dateparse(&date_str).ok()?;
    DateTime::<Utc>::from_timestamp(epoch, 0)
}

/// Arm の取得結果と生ソースから ParsedEmail を組み立てる
///
/// 日付はタイムゾーン付きの MIME Date ヘッダを優先し、無ければ
/// AppleScript のローカル日時を正規化して使う。件名は AppleScript の値を
/// 優先する（MIME のエンコード崩れより信頼できる）。
pub fn parse_email_source(
    fetched: &FetchedEmail,
    mailbox: Mailbox,
    scratch_dir: &Path,
) -> Result<ParsedEmail, String> {
    if fetched.source.is_empty() {
        return Err("Email source is empty".to_string());
    }

    let parsed = mailparse::parse_mail(fetched.source.as_bytes())
        .map_err(|e| format!("Failed to parse MIME source: {e}"))?;

    let (content, content_type) = select_body(&parsed);
    let attachments = extract_attachments(&parsed, scratch_dir)?;

    let from_header = parsed.headers.get_first_value("From").unwrap_or_default();
    let (mut sender_name, sender) = if from_header.is_empty() {
        (String::new(), fetched.sender.clone())
    } else {
        split_sender(&from_header)
    };
    if sender_name.is_empty() {
        sender_name = sender.split('@').next().unwrap_or("").to_string();
    }

    let date = parse_mime_date(&parsed)
        .or_else(|| fetched.date_local.map(crate::models::naive_local_to_utc));

    let subject = if fetched.subject.is_empty() {
        parsed.headers.get_first_value("Subject").unwrap_or_default()
    } else {
        fetched.subject.clone()
    };
    let subject = if subject.is_empty() {
        "(No Subject)".to_string()
    } else {
        subject
    };

    // 本文が空なら Mail.app のレンダリング済みテキストで代替する
    let (content, content_type) = if content.trim().is_empty() {
        (fetched.content.clone(), "text/plain".to_string())
    } else {
        (content, content_type)
    };

    Ok(ParsedEmail {
        message_id: fetched.message_id.clone(),
        subject,
        sender,
        sender_name,
        to: parsed.headers.get_first_value("To").unwrap_or_default(),
        cc: parsed.headers.get_first_value("Cc").unwrap_or_default(),
        date,
        content,
        content_type,
        is_read: fetched.is_read,
        is_flagged: fetched.is_flagged,
        attachments,
        thread_id: fetched.thread_id.clone(),
        mailbox,
    })
}
