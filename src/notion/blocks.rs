//! Notion ページのプロパティとブロックの組み立て
//!
//! プロパティ名はリモートのデータベーススキーマとのコントラクト。
//! 名前を変えるときはデータベース側も変える必要がある。

use crate::converter::html::{paragraph_block, text_span, InlineMap};
use crate::mail::ical::MeetingInvite;
use crate::models::{format_display, ParsedEmail, UploadedAttachment, DISPLAY_TZ};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// HTML 内の cid: 参照
static CID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"cid:([^"'\s>]+)"#).expect("invalid cid regex"));

/// rich_text プロパティの上限文字数
const MAX_PROP_LEN: usize = 1999;

/// 文字数上限で切り詰める（文字境界を壊さない）
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn rich_text_prop(value: &str) -> Value {
    if value.is_empty() {
        json!({ "rich_text": [] })
    } else {
        json!({ "rich_text": [ { "text": { "content": truncate_chars(value, MAX_PROP_LEN) } } ] })
    }
}

/// ページのプロパティを組み立てる
pub fn build_properties(
    email: &ParsedEmail,
    eml_file_upload_id: Option<&str>,
    calendar_page_id: Option<&str>,
) -> Value {
    let mut properties = json!({
        "Subject": {
            "title": [ { "text": { "content": truncate_chars(&email.subject, 2000) } } ]
        },
        "From": { "email": email.sender },
        "From Name": rich_text_prop(&email.sender_name),
        "To": rich_text_prop(&email.to),
        "CC": rich_text_prop(&email.cc),
        "Message ID": rich_text_prop(&email.message_id),
        "Thread ID": rich_text_prop(&email.thread_id),
        "Mailbox": { "select": { "name": email.mailbox.as_str() } },
        "Processing Status": { "select": { "name": "Unreviewed" } },
        "Is Read": { "checkbox": email.is_read },
        "Is Flagged": { "checkbox": email.is_flagged },
        "Has Attachments": { "checkbox": email.has_attachments() },
    });

    // Date は表示用タイムゾーン（+08:00）の ISO-8601 で出す
    if let Some(date) = email.date {
        properties["Date"] = json!({ "date": { "start": format_display(date) } });
    }

    if let Some(eml_id) = eml_file_upload_id {
        properties["Original EML"] = json!({
            "files": [ {
                "type": "file_upload",
                "file_upload": { "id": eml_id }
            } ]
        });
    }

    if let Some(calendar_page_id) = calendar_page_id {
        properties["Calendar Events"] = json!({
            "relation": [ { "id": calendar_page_id } ]
        });
    }

    properties
}

/// Content-ID / ファイル名 → アップロード済みファイルの対応表を作る
///
/// HTML 内の cid: 参照を添付の Content-ID と突き合わせる。
/// Content-ID の無い古いメールはファイル名ベースのヒューリスティックに落とす。
pub fn build_inline_map(email: &ParsedEmail, uploaded: &[UploadedAttachment]) -> InlineMap {
    let mut map = InlineMap::new();

    if email.content_type != "text/html" {
        return map;
    }

    let cids: Vec<String> = CID_RE
        .captures_iter(&email.content)
        .map(|c| c[1].to_string())
        .collect();
    if cids.is_empty() {
        log::debug!("No cid references found in HTML");
        return map;
    }

    // Content-ID での正確な対応付け
    for att in uploaded {
        if let Some(content_id) = &att.content_id {
            let value = (att.file_upload_id.clone(), att.content_type.clone());
            map.insert(content_id.clone(), value.clone());
            map.insert(att.filename.clone(), value);
        }
    }

    // Content-ID の無い添付へのフォールバック（ファイル名の部分一致）
    for cid in &cids {
        if map.contains_key(cid) {
            continue;
        }
        let cid_stem = cid.split('@').next().unwrap_or(cid);
        for att in uploaded {
            if att.content_id.is_some() {
                continue;
            }
            let name_stem = att
                .filename
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&att.filename);
            if cid.contains(&att.filename)
                || att.filename.contains(cid.as_str())
                || cid.contains(name_stem)
                || name_stem.contains(cid_stem)
            {
                let value = (att.file_upload_id.clone(), att.content_type.clone());
                map.insert(cid.clone(), value.clone());
                map.insert(att.filename.clone(), value);
                break;
            }
        }
    }

    let inline_count = uploaded.iter().filter(|a| a.is_inline).count();
    log::debug!(
        "Inline map: {} keys, {} uploads marked inline",
        map.len(),
        inline_count
    );
    map
}

/// 会議招待の Callout ブロックを作る
pub fn build_meeting_callout(invite: &MeetingInvite) -> Value {
    let start = invite.start_time.with_timezone(&DISPLAY_TZ);
    let end = invite.end_time.with_timezone(&DISPLAY_TZ);

    let time_str = if invite.is_all_day {
        format!("{} (all day)", start.format("%Y-%m-%d"))
    } else {
        format!(
            "{} - {} (UTC+8)",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%H:%M")
        )
    };

    let (title, color) = if invite.is_cancelled() {
        ("[Cancelled] Meeting Invitation", "red_background")
    } else if invite.sequence > 0 {
        ("[Updated] Meeting Invitation", "blue_background")
    } else {
        ("Meeting Invitation", "blue_background")
    };

    let mut lines = vec![
        format!("📌 {}", invite.summary),
        format!("🕐 {time_str}"),
    ];
    if let Some(location) = &invite.location {
        lines.push(format!("📍 {location}"));
    }

    let mut rich_text = vec![
        json!({
            "type": "text",
            "text": { "content": format!("{title}\n\n") },
            "annotations": { "bold": true }
        }),
        text_span(&lines.join("\n")),
    ];

    if let Some(url) = &invite.meeting_url {
        let display = if url.chars().count() > 80 {
            format!("{}...", truncate_chars(url, 80))
        } else {
            url.clone()
        };
        rich_text.push(text_span("\n🔗 "));
        rich_text.push(json!({
            "type": "text",
            "text": { "content": display, "link": { "url": url } },
            "annotations": { "color": "blue" }
        }));
    }

    json!({
        "object": "block",
        "type": "callout",
        "callout": {
            "rich_text": rich_text,
            "icon": { "type": "emoji", "emoji": "🗓" },
            "color": color
        }
    })
}

fn divider_block() -> Value {
    json!({ "object": "block", "type": "divider", "divider": {} })
}

/// ページの本文ブロック列を組み立てる
///
/// 並び: 会議 Callout → 添付セクション → 本文見出し → 本文。
/// アップロードに失敗した添付があれば先頭に警告 Callout を入れる。
/// ここでは件数制限を掛けない（100 件ずつの分割は作成側で行う）。
pub fn build_children(
    email: &ParsedEmail,
    uploaded: &[UploadedAttachment],
    inline_map: &InlineMap,
    invite: Option<&MeetingInvite>,
    failed_attachments: &[String],
) -> Vec<Value> {
    let mut children = Vec::new();

    if let Some(invite) = invite {
        children.push(build_meeting_callout(invite));
        children.push(divider_block());
    }

    // インラインで使われない添付を上部の添付セクションへ
    let section_attachments: Vec<&UploadedAttachment> = uploaded
        .iter()
        .filter(|att| {
            let is_image = att.content_type.starts_with("image/");
            !is_image || !inline_map.contains_key(&att.filename)
        })
        .collect();

    if !section_attachments.is_empty() {
        children.push(json!({
            "object": "block",
            "type": "heading_3",
            "heading_3": { "rich_text": [ text_span("📎 Attachments") ] }
        }));

        for att in &section_attachments {
            let block_type = if att.content_type.starts_with("image/") {
                "image"
            } else {
                "file"
            };
            let mut block = json!({ "object": "block", "type": block_type });
            block[block_type] = json!({
                "type": "file_upload",
                "file_upload": { "id": att.file_upload_id },
                "caption": [ text_span(&att.filename) ]
            });
            children.push(block);
        }
        children.push(divider_block());
    }

    children.push(json!({
        "object": "block",
        "type": "heading_2",
        "heading_2": { "rich_text": [ text_span("📧 Email Content") ] }
    }));

    let content_blocks = if email.content_type == "text/html" {
        crate::converter::html::html_to_blocks(&email.content, inline_map)
    } else {
        crate::converter::html::text_to_blocks(&email.content)
    };
    if content_blocks.is_empty() {
        children.push(paragraph_block(&truncate_chars(&email.content, 2000)));
    } else {
        children.extend(content_blocks);
    }

    if !failed_attachments.is_empty() {
        let warning = json!({
            "object": "block",
            "type": "callout",
            "callout": {
                "rich_text": [ text_span(&format!(
                    "⚠️ {} attachment(s) failed to upload: {}",
                    failed_attachments.len(),
                    failed_attachments.join(", ")
                )) ],
                "icon": { "type": "emoji", "emoji": "⚠️" },
                "color": "yellow_background"
            }
        });
        children.insert(0, warning);
    }

    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mailbox;
    use chrono::{TimeZone, Utc};

    fn sample_email() -> ParsedEmail {
        ParsedEmail {
            message_id: "m1@example.com".to_string(),
            subject: "Quarterly Report".to_string(),
            sender: "alice@example.com".to_string(),
            sender_name: "Alice".to_string(),
            to: "bob@example.com".to_string(),
            cc: String::new(),
            date: Some(Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap()),
            content: "<p>hello</p>".to_string(),
            content_type: "text/html".to_string(),
            is_read: true,
            is_flagged: false,
            attachments: Vec::new(),
            thread_id: "m1@example.com".to_string(),
            mailbox: Mailbox::Inbox,
        }
    }

    fn uploaded(filename: &str, content_type: &str, content_id: Option<&str>) -> UploadedAttachment {
        UploadedAttachment {
            filename: filename.to_string(),
            file_upload_id: format!("fu-{filename}"),
            content_type: content_type.to_string(),
            content_id: content_id.map(|s| s.to_string()),
            is_inline: content_id.is_some(),
        }
    }

    #[test]
    fn test_build_properties_core_fields() {
        let email = sample_email();
        let props = build_properties(&email, Some("fu-eml"), None);

        assert_eq!(
            props["Subject"]["title"][0]["text"]["content"],
            "Quarterly Report"
        );
        assert_eq!(props["From"]["email"], "alice@example.com");
        assert_eq!(
            props["Message ID"]["rich_text"][0]["text"]["content"],
            "m1@example.com"
        );
        assert_eq!(props["Mailbox"]["select"]["name"], "Inbox");
        assert_eq!(props["Processing Status"]["select"]["name"], "Unreviewed");
        assert_eq!(props["Is Read"]["checkbox"], true);
        assert_eq!(props["Has Attachments"]["checkbox"], false);
        assert_eq!(
            props["Original EML"]["files"][0]["file_upload"]["id"],
            "fu-eml"
        );
        // Date は +08:00 で出る
        let date = props["Date"]["date"]["start"].as_str().unwrap();
        assert!(date.starts_with("2026-01-20T12:00:00"));
        assert!(date.ends_with("+08:00"));
        // CC が空なら空の rich_text
        assert!(props["CC"]["rich_text"].as_array().unwrap().is_empty());
        assert!(props.get("Calendar Events").is_none());
    }

    #[test]
    fn test_build_properties_with_calendar_relation() {
        let email = sample_email();
        let props = build_properties(&email, None, Some("cal-page-1"));
        assert_eq!(
            props["Calendar Events"]["relation"][0]["id"],
            "cal-page-1"
        );
        assert!(props.get("Original EML").is_none());
    }

    #[test]
    fn test_build_inline_map_by_content_id() {
        let mut email = sample_email();
        email.content = r#"<p><img src="cid:img1@x"></p>"#.to_string();
        let ups = vec![
            uploaded("pic.png", "image/png", Some("img1@x")),
            uploaded("doc.pdf", "application/pdf", None),
        ];

        let map = build_inline_map(&email, &ups);
        assert_eq!(map.get("img1@x").unwrap().0, "fu-pic.png");
        assert_eq!(map.get("pic.png").unwrap().0, "fu-pic.png");
        assert!(!map.contains_key("doc.pdf"));
    }

    #[test]
    fn test_build_inline_map_filename_fallback() {
        let mut email = sample_email();
        email.content = r#"<img src="cid:banner.png">"#.to_string();
        let ups = vec![uploaded("banner.png", "image/png", None)];

        let map = build_inline_map(&email, &ups);
        assert_eq!(map.get("banner.png").unwrap().0, "fu-banner.png");
    }

    #[test]
    fn test_build_inline_map_empty_for_plain_text() {
        let mut email = sample_email();
        email.content_type = "text/plain".to_string();
        let ups = vec![uploaded("pic.png", "image/png", Some("img1@x"))];
        assert!(build_inline_map(&email, &ups).is_empty());
    }

    #[test]
    fn test_build_children_layout() {
        let mut email = sample_email();
        email.content = r#"<p>body <img src="cid:img1@x"></p>"#.to_string();
        let ups = vec![
            uploaded("pic.png", "image/png", Some("img1@x")),
            uploaded("doc.pdf", "application/pdf", None),
        ];
        let map = build_inline_map(&email, &ups);

        let children = build_children(&email, &ups, &map, None, &[]);
        let types: Vec<&str> = children
            .iter()
            .map(|b| b["type"].as_str().unwrap())
            .collect();

        // 添付セクション（インライン画像は除外され doc.pdf のみ）→ 区切り → 本文見出し → 本文
        assert_eq!(types[0], "heading_3");
        assert_eq!(types[1], "file");
        assert_eq!(children[1]["file"]["file_upload"]["id"], "fu-doc.pdf");
        assert_eq!(types[2], "divider");
        assert_eq!(types[3], "heading_2");
        assert!(types.contains(&"paragraph"));
        // インライン画像は本文内で file_upload 画像になる
        assert!(types.contains(&"image"));
    }

    #[test]
    fn test_build_children_with_invite_and_failures() {
        let email = sample_email();
        let invite = MeetingInvite {
            uid: "ev-1".to_string(),
            summary: "Sync".to_string(),
            start_time: Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 1, 20, 5, 0, 0).unwrap(),
            is_all_day: false,
            location: Some("Room 1".to_string()),
            organizer: None,
            method: "REQUEST".to_string(),
            sequence: 0,
            status: None,
            description: None,
            meeting_url: Some("https://teams.microsoft.com/l/x".to_string()),
        };

        let children = build_children(
            &email,
            &[],
            &InlineMap::new(),
            Some(&invite),
            &["bad.bin".to_string()],
        );

        // 警告 Callout が先頭、次に会議 Callout
        assert_eq!(children[0]["type"], "callout");
        assert_eq!(children[0]["callout"]["color"], "yellow_background");
        assert_eq!(children[1]["type"], "callout");
        assert_eq!(children[1]["callout"]["color"], "blue_background");
        assert_eq!(children[2]["type"], "divider");
    }

    #[test]
    fn test_build_meeting_callout_cancelled_is_red() {
        let invite = MeetingInvite {
            uid: "ev-1".to_string(),
            summary: "Sync".to_string(),
            start_time: Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 1, 20, 5, 0, 0).unwrap(),
            is_all_day: false,
            location: None,
            organizer: None,
            method: "CANCEL".to_string(),
            sequence: 1,
            status: None,
            description: None,
            meeting_url: None,
        };

        let callout = build_meeting_callout(&invite);
        assert_eq!(callout["callout"]["color"], "red_background");
        let title = callout["callout"]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap();
        assert!(title.contains("Cancelled"));
        // 時刻は表示用タイムゾーンで出る（04:00Z → 12:00 +08:00）
        let body = callout["callout"]["rich_text"][1]["text"]["content"]
            .as_str()
            .unwrap();
        assert!(body.contains("12:00"), "body: {body}");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // マルチバイトでも境界を壊さない
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }
}
