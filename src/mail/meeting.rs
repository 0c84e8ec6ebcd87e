//! 会議招待の日程同期
//!
//! text/calendar パートを検出して VEVENT の UID で日程データベースに upsert する。
//! メールページとの関連付け（Calendar Events リレーション）は Notion の
//! ページ作成時に行う。このモジュールは日程側のペイロードだけを持つ。
//!
//! 日程データベースのプロパティ: Title（title）、Date（date）、UID（rich_text）、
//! Location（rich_text）、Organizer（rich_text）、Status（select）。

use crate::mail::ical::MeetingInvite;
use crate::models::format_display;
use serde_json::{json, Value};

/// 日程ページのプロパティを組み立てる
pub fn build_calendar_properties(invite: &MeetingInvite) -> Value {
    let status = if invite.is_cancelled() {
        "Cancelled"
    } else if invite.sequence > 0 {
        "Updated"
    } else {
        "Confirmed"
    };

    let mut properties = json!({
        "Title": {
            "title": [ { "text": { "content": invite.summary } } ]
        },
        "Date": {
            "date": {
                "start": format_display(invite.start_time),
                "end": format_display(invite.end_time)
            }
        },
        "UID": {
            "rich_text": [ { "text": { "content": invite.uid } } ]
        },
        "Status": { "select": { "name": status } },
    });

    if let Some(location) = &invite.location {
        properties["Location"] = json!({
            "rich_text": [ { "text": { "content": location } } ]
        });
    }
    if let Some(organizer) = &invite.organizer {
        properties["Organizer"] = json!({
            "rich_text": [ { "text": { "content": organizer } } ]
        });
    }

    properties
}

/// UID で日程ページを探すためのフィルタ
pub fn uid_filter(uid: &str) -> Value {
    json!({
        "property": "UID",
        "rich_text": { "equals": uid }
    })
}
