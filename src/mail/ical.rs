//! iCalendar (text/calendar) パートの解釈
//!
//! 会議招待メールに含まれる VEVENT から、日程同期に必要な最小限の情報を取り出す。
//! パース本体は `ical` クレートに任せる。
//!
//! VEVENT の UID が日程ページの upsert キーになる。

use crate::models::{naive_local_to_utc, DISPLAY_TZ};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

/// 会議リンクらしき URL（Teams / Zoom / Meet）
static MEETING_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https://(?:[\w.-]*teams\.microsoft\.com|[\w.-]*zoom\.us|meet\.google\.com)/[^\s">]+"#)
        .expect("invalid meeting url regex")
});

/// メールから取り出した会議招待
#[derive(Debug, Clone)]
pub struct MeetingInvite {
    /// VEVENT の UID。日程ページの upsert キー
    pub uid: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_all_day: bool,
    pub location: Option<String>,
    pub organizer: Option<String>,
    /// REQUEST / CANCEL / REPLY など（VCALENDAR の METHOD）
    pub method: String,
    /// 更新回数。0 より大きければ更新された招待
    pub sequence: i64,
    /// CONFIRMED / TENTATIVE / CANCELLED など
    pub status: Option<String>,
    pub description: Option<String>,
    /// 説明文などから抽出したオンライン会議 URL
    pub meeting_url: Option<String>,
}

impl MeetingInvite {
    /// キャンセル通知か（METHOD:CANCEL または STATUS:CANCELLED）
    pub fn is_cancelled(&self) -> bool {
        self.method.eq_ignore_ascii_case("CANCEL")
            || self
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("CANCELLED"))
    }
}

/// iCalendar テキストから最初の VEVENT を会議招待として取り出す
///
/// VEVENT が無い・UID か DTSTART が欠けている場合は Ok(None)。
pub fn parse_meeting_invite(ics_text: &str) -> Result<Option<MeetingInvite>, String> {
    let mut parser = ical::IcalParser::new(ics_text.as_bytes());
    let calendar = match parser.next() {
        None => return Ok(None),
        Some(Err(e)) => return Err(format!("Failed to parse iCalendar: {e}")),
        Some(Ok(calendar)) => calendar,
    };

    let method = property_value(&calendar.properties, "METHOD").unwrap_or_default();

    let Some(event) = calendar.events.first() else {
        return Ok(None);
    };

    let Some(uid) = property_value(&event.properties, "UID") else {
        log::debug!("VEVENT without UID, ignoring");
        return Ok(None);
    };

    let Some((start_time, is_all_day)) = property_datetime(&event.properties, "DTSTART") else {
        log::debug!("VEVENT without DTSTART, ignoring: uid={uid}");
        return Ok(None);
    };

    let end_time = property_datetime(&event.properties, "DTEND")
        .map(|(dt, _)| dt)
        .unwrap_or_else(|| {
            if is_all_day {
                start_time + Duration::days(1)
            } else {
                start_time + Duration::hours(1)
            }
        });

    let summary = property_value(&event.properties, "SUMMARY")
        .map(|s| unescape_text(&s))
        .unwrap_or_else(|| "(untitled)".to_string());
    let location = property_value(&event.properties, "LOCATION").map(|s| unescape_text(&s));
    let description = property_value(&event.properties, "DESCRIPTION").map(|s| unescape_text(&s));
    let organizer = property_value(&event.properties, "ORGANIZER")
        .map(|s| s.trim_start_matches("mailto:").to_string());
    let status = property_value(&event.properties, "STATUS");
    let sequence = property_value(&event.properties, "SEQUENCE")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    // 会議 URL は説明文 → 場所の順で探す
    let meeting_url = description
        .as_deref()
        .and_then(find_meeting_url)
        .or_else(|| location.as_deref().and_then(find_meeting_url));

    Ok(Some(MeetingInvite {
        uid,
        summary,
        start_time,
        end_time,
        is_all_day,
        location,
        organizer,
        method,
        sequence,
        status,
        description,
        meeting_url,
    }))
}

/// プロパティ値を名前で引く
fn property_value(properties: &[ical::property::Property], name: &str) -> Option<String> {
    properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .and_then(|p| p.value.clone())
}

/// DTSTART / DTEND を UTC に変換する
///
/// 対応形式:
/// - `20260120T040000Z` (UTC)
/// - `20260120T120000` + TZID パラメータ（無ければ表示用タイムゾーン扱い）
/// - `20260120` (終日)
fn property_datetime(
    properties: &[ical::property::Property],
    name: &str,
) -> Option<(DateTime<Utc>, bool)> {
    let prop = properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))?;
    let value = prop.value.as_deref()?.trim();

    // 終日（DATE 値）
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some((naive_local_to_utc(naive), true));
    }

    // UTC
    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some((Utc.from_utc_datetime(&naive), false));
    }

    // ローカル + TZID
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    let tzid = prop.params.as_ref().and_then(|params| {
        params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("TZID"))
            .and_then(|(_, values)| values.first().cloned())
    });

    let dt = match tzid.and_then(|id| chrono_tz::Tz::from_str(&id).ok()) {
        Some(tz) => match tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            chrono::LocalResult::None => Utc.from_utc_datetime(&naive),
        },
        None => {
            log::debug!("DTSTART/DTEND without usable TZID, assuming {DISPLAY_TZ}");
            naive_local_to_utc(naive)
        }
    };
    Some((dt, false))
}

/// iCalendar のテキストエスケープを戻す
fn unescape_text(text: &str) -> String {
    text.replace("\\n", "\n")
        .replace("\\N", "\n")
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\\\", "\\")
}

/// テキストから会議 URL を探す
fn find_meeting_url(text: &str) -> Option<String> {
    MEETING_URL_RE.find(text).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST_ICS: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
METHOD:REQUEST\r\n\
BEGIN:VEVENT\r\n\
UID:040000008200E00074C5B7101A82E008-1\r\n\
SUMMARY:Weekly Sync\\, Q1\r\n\
DTSTART:20260120T040000Z\r\n\
DTEND:20260120T050000Z\r\n\
LOCATION:Microsoft Teams Meeting\r\n\
ORGANIZER:mailto:boss@example.com\r\n\
SEQUENCE:0\r\n\
STATUS:CONFIRMED\r\n\
DESCRIPTION:Join here: https://teams.microsoft.com/l/meetup-join/abc%2Fdef\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn test_parse_request_invite() {
        let invite = parse_meeting_invite(REQUEST_ICS).unwrap().unwrap();
        assert_eq!(invite.uid, "040000008200E00074C5B7101A82E008-1");
        assert_eq!(invite.summary, "Weekly Sync, Q1");
        assert_eq!(invite.method, "REQUEST");
        assert_eq!(invite.sequence, 0);
        assert!(!invite.is_all_day);
        assert!(!invite.is_cancelled());
        assert_eq!(invite.organizer.as_deref(), Some("boss@example.com"));
        assert_eq!(
            invite.start_time.to_rfc3339(),
            "2026-01-20T04:00:00+00:00"
        );
        assert_eq!(invite.end_time.to_rfc3339(), "2026-01-20T05:00:00+00:00");
        assert!(invite
            .meeting_url
            .as_deref()
            .unwrap()
            .starts_with("https://teams.microsoft.com/l/meetup-join/"));
    }

    #[test]
    fn test_parse_cancel_invite() {
        let ics = REQUEST_ICS
            .replace("METHOD:REQUEST", "METHOD:CANCEL")
            .replace("SEQUENCE:0", "SEQUENCE:2");
        let invite = parse_meeting_invite(&ics).unwrap().unwrap();
        assert!(invite.is_cancelled());
        assert_eq!(invite.sequence, 2);
    }

    #[test]
    fn test_parse_all_day_event() {
        let ics = "BEGIN:VCALENDAR\r\n\
METHOD:REQUEST\r\n\
BEGIN:VEVENT\r\n\
UID:allday-1\r\n\
SUMMARY:Holiday\r\n\
DTSTART:20260121\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";
        let invite = parse_meeting_invite(ics).unwrap().unwrap();
        assert!(invite.is_all_day);
        // 表示用タイムゾーンの 00:00 が UTC に変換される (UTC+8 → 前日 16:00Z)
        assert_eq!(
            invite.start_time.to_rfc3339(),
            "2026-01-20T16:00:00+00:00"
        );
        // DTEND なしの終日は翌日まで
        assert_eq!(invite.end_time - invite.start_time, Duration::days(1));
    }

    #[test]
    fn test_parse_tzid_datetime() {
        let ics = "BEGIN:VCALENDAR\r\n\
METHOD:REQUEST\r\n\
BEGIN:VEVENT\r\n\
UID:tz-1\r\n\
SUMMARY:Call\r\n\
DTSTART;TZID=Asia/Tokyo:20260120T130000\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";
        let invite = parse_meeting_invite(ics).unwrap().unwrap();
        // 13:00 JST == 04:00Z
        assert_eq!(
            invite.start_time.to_rfc3339(),
            "2026-01-20T04:00:00+00:00"
        );
        // DTEND なしは 1 時間
        assert_eq!(invite.end_time - invite.start_time, Duration::hours(1));
    }

    #[test]
    fn test_missing_uid_or_event_returns_none() {
        let no_event = "BEGIN:VCALENDAR\r\nMETHOD:REQUEST\r\nEND:VCALENDAR\r\n";
        assert!(parse_meeting_invite(no_event).unwrap().is_none());

        let no_uid = "BEGIN:VCALENDAR\r\n\
BEGIN:VEVENT\r\n\
SUMMARY:No uid\r\n\
DTSTART:20260120T040000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";
        assert!(parse_meeting_invite(no_uid).unwrap().is_none());

        assert!(parse_meeting_invite("").unwrap().is_none());
    }

    #[test]
    fn test_find_meeting_url() {
        assert!(find_meeting_url("join https://zoom.us/j/123?pwd=x now").is_some());
        assert!(find_meeting_url("https://meet.google.com/abc-defg-hij").is_some());
        assert!(find_meeting_url("no link here").is_none());
    }

    #[test]
    fn test_unescape_text() {
        assert_eq!(unescape_text("a\\, b\\; c\\nd"), "a, b; c\nd");
    }
}
