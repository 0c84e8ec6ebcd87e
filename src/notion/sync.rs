//! Notion 同期オペレーション
//!
//! ページ作成（添付アップロード・100 ブロック分割込み）、Message ID による
//! 重複ガード、スレッド関係の再構築、逆方向同期クエリをまとめる。
//!
//! # スレッド関係のルール
//! 「スレッド内で最新のメールが先頭（母ノード）。他のメンバーの Parent Item は
//! 先頭を指す」。Notion の Parent Item / Sub-item は対称リレーションなので、
//! 先頭の Sub-item を書けば子側の Parent Item は自動で揃う。
//! 書き込みは (Parent クリア → Sub-item 設定) の順。逆にすると一時的に
//! 循環ができる。
//!
//! スレッド書き込みの失敗はページ作成を巻き戻さない。次に同じスレッドの
//! メールが同期されたとき、同じアルゴリズムが関係を最初から計算し直すので
//! 自己修復する。

use crate::mail::ical::MeetingInvite;
use crate::mail::meeting;
use crate::models::{format_display, Mailbox, ParsedEmail, UploadedAttachment};
use crate::notion::blocks;
use crate::notion::client::NotionClient;
use crate::notion::uploader::FileUploader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// 逆方向同期の対象ページ
#[derive(Debug, Clone)]
pub struct ReverseSyncPage {
    pub page_id: String,
    pub message_id: String,
    pub ai_action: String,
    pub mailbox: Mailbox,
}

/// Notion 側オペレーションの抽象。Reconciler はこのトレイトにのみ依存する
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotionSyncOps: Send + Sync {
    /// 重複ガード: Message ID でページを探す
    ///
    /// クエリ失敗は Err で返す。「不在」と「失敗」を区別しないと
    /// 部分障害時に重複ページを作ってしまう。
    async fn find_page_by_message_id(&self, message_id: &str) -> Result<Option<String>, String>;

    /// メールページを作成する（添付・EML アップロードとブロック分割込み）
    ///
    /// # Returns
    /// 作成したページの id
    async fn create_email_page(
        &self,
        email: &ParsedEmail,
        eml_path: Option<PathBuf>,
        calendar_page_id: Option<String>,
        invite: Option<MeetingInvite>,
    ) -> Result<String, String>;

    /// 同期済みメール M についてスレッド関係を再構築する
    async fn reconcile_thread(&self, page_id: &str, email: &ParsedEmail) -> Result<(), String>;

    /// 会議招待を日程データベースへ upsert する
    ///
    /// # Returns
    /// 日程ページの id。日程データベースが未設定なら None
    async fn upsert_meeting(&self, invite: &MeetingInvite) -> Result<Option<String>, String>;

    /// 逆方向同期の対象ページを列挙する
    /// （AI Review Status = Reviewed かつ Synced to Mail = false）
    async fn query_pages_for_reverse_sync(&self) -> Result<Vec<ReverseSyncPage>, String>;

    /// Synced to Mail = true / Mail Sync Time = now を書く
    async fn update_page_mail_sync_status(&self, page_id: &str) -> Result<(), String>;
}

/// 実装本体
pub struct NotionSyncer {
    client: Arc<NotionClient>,
    uploader: FileUploader,
}

impl NotionSyncer {
    pub fn new(client: Arc<NotionClient>, uploader: FileUploader) -> Self {
        Self { client, uploader }
    }

    /// 添付を1つずつアップロードする（並列送信はレート制限に当たる）
    ///
    /// # Returns
    /// (アップロード成功リスト, 失敗・スキップしたファイル名)
    async fn upload_attachments(
        &self,
        email: &ParsedEmail,
    ) -> (Vec<UploadedAttachment>, Vec<String>) {
        let mut uploaded = Vec::new();
        let mut failed = Vec::new();

        if email.attachments.is_empty() {
            return (uploaded, failed);
        }

        log::info!(
            "Uploading {} attachment(s) for {}",
            email.attachments.len(),
            truncate_id(&email.message_id)
        );

        for attachment in &email.attachments {
            match self.uploader.upload_file(&attachment.path).await {
                Ok(Some(file_upload_id)) => {
                    uploaded.push(UploadedAttachment {
                        filename: attachment.filename.clone(),
                        file_upload_id,
                        content_type: attachment.content_type.clone(),
                        content_id: attachment.content_id.clone(),
                        is_inline: attachment.is_inline,
                    });
                }
                Ok(None) => {
                    // サイズ超過スキップ。警告はアップローダ側で出ている
                    failed.push(attachment.filename.clone());
                }
                Err(e) => {
                    log::error!("Failed to upload {}: {e}", attachment.filename);
                    failed.push(attachment.filename.clone());
                }
            }
        }

        if !failed.is_empty() {
            log::warn!("Failed to upload {} attachment(s)", failed.len());
        }
        (uploaded, failed)
    }

    /// 100 ブロックを超えるページを分割作成する
    async fn create_page_with_blocks(
        &self,
        properties: Value,
        mut children: Vec<Value>,
        icon: Value,
    ) -> Result<String, String> {
        let tail = if children.len() > 100 {
            log::info!("Page has {} blocks, creating in batches", children.len());
            children.split_off(100)
        } else {
            Vec::new()
        };

        let page = self
            .client
            .create_page(properties, children, Some(icon))
            .await?;
        let page_id = page
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| "create_page response missing id".to_string())?
            .to_string();

        for batch in tail.chunks(100) {
            self.client
                .append_block_children(&page_id, batch.to_vec())
                .await?;
        }

        Ok(page_id)
    }

    /// スレッドの全メンバーを（自分を除いて）リモートから取得する
    async fn find_thread_members(
        &self,
        thread_id: &str,
        exclude_message_id: &str,
    ) -> Result<Vec<ThreadMember>, String> {
        let filter = json!({
            "property": "Thread ID",
            "rich_text": { "equals": thread_id }
        });
        let pages = self
            .client
            .query_database_all(&self.client.email_db_id, Some(filter))
            .await?;

        let mut members = Vec::new();
        for page in pages {
            let Some(page_id) = page.get("id").and_then(Value::as_str) else {
                continue;
            };
            let message_id = rich_text_prop_value(&page, "Message ID").unwrap_or_default();
            if message_id == exclude_message_id {
                continue;
            }
            let date = date_prop_value(&page, "Date").and_then(|s| parse_notion_date(&s));
            members.push(ThreadMember {
                page_id: page_id.to_string(),
                date,
            });
        }
        Ok(members)
    }

    /// 母ノードの Sub-item を書き換える
    ///
    /// 重複と自分自身の id を除いてから、(Parent クリア → Sub-item 設定) の順で書く。
    async fn update_sub_items(
        &self,
        parent_page_id: &str,
        child_page_ids: Vec<String>,
    ) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        let valid: Vec<String> = child_page_ids
            .into_iter()
            .filter(|id| !id.is_empty() && id != parent_page_id && seen.insert(id.clone()))
            .collect();

        if valid.is_empty() {
            return Ok(());
        }

        self.client
            .update_page(parent_page_id, json!({ "Parent Item": { "relation": [] } }))
            .await?;

        let relations: Vec<Value> = valid.iter().map(|id| json!({ "id": id })).collect();
        self.client
            .update_page(parent_page_id, json!({ "Sub-item": { "relation": relations } }))
            .await?;

        log::debug!(
            "Updated Sub-item for {parent_page_id}: {} children",
            valid.len()
        );
        Ok(())
    }
}

struct ThreadMember {
    page_id: String,
    date: Option<DateTime<Utc>>,
}

#[async_trait]
impl NotionSyncOps for NotionSyncer {
    async fn find_page_by_message_id(&self, message_id: &str) -> Result<Option<String>, String> {
        let filter = json!({
            "property": "Message ID",
            "rich_text": { "equals": message_id }
        });
        let page = self
            .client
            .query_database(&self.client.email_db_id, Some(filter), None, None)
            .await?;

        Ok(page
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|page| page.get("id"))
            .and_then(Value::as_str)
            .map(|s| s.to_string()))
    }

    async fn create_email_page(
        &self,
        email: &ParsedEmail,
        eml_path: Option<PathBuf>,
        calendar_page_id: Option<String>,
        invite: Option<MeetingInvite>,
    ) -> Result<String, String> {
        log::info!("Creating email page: {}", truncate_id(&email.message_id));

        let (uploaded, failed) = self.upload_attachments(email).await;

        // .eml アーカイブ。失敗してもページ作成は続行する
        let eml_file_upload_id = match eml_path {
            Some(path) => match self.uploader.upload_file(&path).await {
                Ok(id) => id,
                Err(e) => {
                    log::error!("Failed to upload .eml archive: {e}");
                    None
                }
            },
            None => None,
        };

        let inline_map = blocks::build_inline_map(email, &uploaded);
        let properties = blocks::build_properties(
            email,
            eml_file_upload_id.as_deref(),
            calendar_page_id.as_deref(),
        );
        let children =
            blocks::build_children(email, &uploaded, &inline_map, invite.as_ref(), &failed);
        let icon = json!({ "type": "emoji", "emoji": email.mailbox.icon_emoji() });

        let page_id = self
            .create_page_with_blocks(properties, children, icon)
            .await?;
        log::info!(
            "Email page created: {} -> {page_id}",
            truncate_id(&email.message_id)
        );
        Ok(page_id)
    }

    async fn reconcile_thread(&self, page_id: &str, email: &ParsedEmail) -> Result<(), String> {
        if email.thread_id.is_empty() {
            return Ok(());
        }

        let members = self
            .find_thread_members(&email.thread_id, &email.message_id)
            .await?;
        if members.is_empty() {
            log::debug!("No other thread members, nothing to reconcile");
            return Ok(());
        }

        // 日付がパースできたメンバーから最新を選ぶ。同時刻は page_id で決定的にする
        let mut latest: Option<(&ThreadMember, DateTime<Utc>)> = None;
        for member in &members {
            if let Some(date) = member.date {
                let replace = match &latest {
                    None => true,
                    Some((current, current_date)) => {
                        date > *current_date
                            || (date == *current_date && member.page_id > current.page_id)
                    }
                };
                if replace {
                    latest = Some((member, date));
                }
            }
        }
        let Some((latest_other, latest_date)) = latest else {
            log::warn!("No valid dates in thread members, skipping relation rebuild");
            return Ok(());
        };

        // 同時刻は新しく同期されたメール側を先頭にする（>= 比較）
        let current_is_head = email.date.is_some_and(|d| d >= latest_date);

        if current_is_head {
            let children: Vec<String> = members.iter().map(|m| m.page_id.clone()).collect();
            log::info!(
                "Current email is thread head, setting {} sub-item(s)",
                children.len()
            );
            self.update_sub_items(page_id, children).await
        } else {
            let mut siblings: Vec<String> = members
                .iter()
                .filter(|m| m.page_id != latest_other.page_id)
                .map(|m| m.page_id.clone())
                .collect();
            siblings.push(page_id.to_string());
            log::info!(
                "Current email is not thread head, updating head {}",
                latest_other.page_id
            );
            self.update_sub_items(&latest_other.page_id, siblings).await
        }
    }

    async fn upsert_meeting(&self, invite: &MeetingInvite) -> Result<Option<String>, String> {
        let Some(calendar_db_id) = self.client.calendar_db_id.clone() else {
            log::debug!("Calendar database not configured, skipping meeting sync");
            return Ok(None);
        };

        let properties = meeting::build_calendar_properties(invite);

        let existing = self
            .client
            .query_database(
                &calendar_db_id,
                Some(meeting::uid_filter(&invite.uid)),
                None,
                None,
            )
            .await?;
        let existing_id = existing
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|page| page.get("id"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        match existing_id {
            Some(page_id) => {
                self.client.update_page(&page_id, properties).await?;
                log::info!("Updated calendar event: {} -> {page_id}", invite.uid);
                Ok(Some(page_id))
            }
            None => {
                let page = self
                    .client
                    .create_page_in(
                        &calendar_db_id,
                        properties,
                        Vec::new(),
                        Some(json!({ "type": "emoji", "emoji": "🗓" })),
                    )
                    .await?;
                let page_id = page
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "calendar page response missing id".to_string())?
                    .to_string();
                log::info!("Created calendar event: {} -> {page_id}", invite.uid);
                Ok(Some(page_id))
            }
        }
    }

    async fn query_pages_for_reverse_sync(&self) -> Result<Vec<ReverseSyncPage>, String> {
        let filter = json!({
            "and": [
                { "property": "AI Review Status", "select": { "equals": "Reviewed" } },
                { "property": "Synced to Mail", "checkbox": { "equals": false } }
            ]
        });
        let pages = self
            .client
            .query_database_all(&self.client.email_db_id, Some(filter))
            .await?;

        let mut result = Vec::new();
        for page in pages {
            let Some(page_id) = page.get("id").and_then(Value::as_str) else {
                continue;
            };
            let message_id = rich_text_prop_value(&page, "Message ID").unwrap_or_default();
            let ai_action = select_prop_value(&page, "AI Action").unwrap_or_default();
            let mailbox = select_prop_value(&page, "Mailbox")
                .and_then(|name| Mailbox::parse(&name))
                .unwrap_or(Mailbox::Inbox);
            result.push(ReverseSyncPage {
                page_id: page_id.to_string(),
                message_id,
                ai_action,
                mailbox,
            });
        }

        log::info!("Found {} pages for reverse sync", result.len());
        Ok(result)
    }

    async fn update_page_mail_sync_status(&self, page_id: &str) -> Result<(), String> {
        let properties = json!({
            "Synced to Mail": { "checkbox": true },
            "Mail Sync Time": { "date": { "start": format_display(Utc::now()) } }
        });
        self.client.update_page(page_id, properties).await?;
        log::debug!("Mail sync status updated for page: {page_id}");
        Ok(())
    }
}

/// rich_text プロパティの先頭テキスト
fn rich_text_prop_value(page: &Value, name: &str) -> Option<String> {
    page.get("properties")?
        .get(name)?
        .get("rich_text")?
        .as_array()?
        .first()?
        .get("text")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// select プロパティの名前
fn select_prop_value(page: &Value, name: &str) -> Option<String> {
    page.get("properties")?
        .get(name)?
        .get("select")?
        .get("name")?
        .as_str()
        .map(|s| s.to_string())
}

/// date プロパティの start
fn date_prop_value(page: &Value, name: &str) -> Option<String> {
    page.get("properties")?
        .get(name)?
        .get("date")?
        .get("start")?
        .as_str()
        .map(|s| s.to_string())
}

/// Notion の日付（ミリ秒付き RFC 3339 あり）を UTC にパースする
fn parse_notion_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn truncate_id(message_id: &str) -> String {
    if message_id.chars().count() > 40 {
        let head: String = message_id.chars().take(40).collect();
        format!("{head}...")
    } else {
        message_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notion::client::NotionClient;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn syncer_for(server: &MockServer, calendar_db: Option<&str>) -> NotionSyncer {
        let client = Arc::new(
            NotionClient::new(
                "t".to_string(),
                "db-1".to_string(),
                calendar_db.map(|s| s.to_string()),
            )
            .unwrap()
            .with_base_url(server.uri()),
        );
        let uploader = FileUploader::new(client.clone(), 20 * 1024 * 1024);
        NotionSyncer::new(client, uploader)
    }

    fn sample_email() -> ParsedEmail {
        ParsedEmail {
            message_id: "m1@example.com".to_string(),
            subject: "Hello".to_string(),
            sender: "alice@example.com".to_string(),
            sender_name: "Alice".to_string(),
            to: "bob@example.com".to_string(),
            cc: String::new(),
            date: Some(Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap()),
            content: "<p>hi</p>".to_string(),
            content_type: "text/html".to_string(),
            is_read: false,
            is_flagged: false,
            attachments: Vec::new(),
            thread_id: "root@example.com".to_string(),
            mailbox: Mailbox::Inbox,
        }
    }

    fn thread_page(page_id: &str, message_id: &str, date: &str) -> Value {
        json!({
            "id": page_id,
            "properties": {
                "Message ID": { "rich_text": [ { "text": { "content": message_id } } ] },
                "Date": { "date": { "start": date } }
            }
        })
    }

    #[tokio::test]
    async fn test_find_page_by_message_id_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .and(body_partial_json(json!({
                "filter": { "property": "Message ID", "rich_text": { "equals": "m1@x" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [ { "id": "page-a" } ],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let syncer = syncer_for(&server, None);
        assert_eq!(
            syncer.find_page_by_message_id("m1@x").await.unwrap(),
            Some("page-a".to_string())
        );
        assert_eq!(syncer.find_page_by_message_id("other@x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_page_query_failure_raises() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "bad"})))
            .mount(&server)
            .await;

        let syncer = syncer_for(&server, None);
        // クエリ失敗は「不在」扱いにしない
        assert!(syncer.find_page_by_message_id("m1@x").await.is_err());
    }

    #[tokio::test]
    async fn test_create_email_page_splits_blocks_over_100() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/pages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/blocks/page-1/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut email = sample_email();
        // 150 段落 → 本文見出しと合わせて 100 件超え
        email.content_type = "text/plain".to_string();
        email.content = vec!["para"; 150].join("\n\n");

        let syncer = syncer_for(&server, None);
        let page_id = syncer
            .create_email_page(&email, None, None, None)
            .await
            .unwrap();
        assert_eq!(page_id, "page-1");

        // 作成リクエストは 100 件、追記は残り
        let requests = server.received_requests().await.unwrap();
        let create = requests
            .iter()
            .find(|r| r.url.path() == "/v1/pages")
            .unwrap();
        let body: Value = serde_json::from_slice(&create.body).unwrap();
        assert_eq!(body["children"].as_array().unwrap().len(), 100);
        let append = requests
            .iter()
            .find(|r| r.url.path() == "/v1/blocks/page-1/children")
            .unwrap();
        let body: Value = serde_json::from_slice(&append.body).unwrap();
        assert_eq!(body["children"].as_array().unwrap().len(), 51);
    }

    #[tokio::test]
    async fn test_reconcile_thread_new_reply_becomes_head() {
        // シナリオ: 既存の page_A (10:00) に対し新着 (12:00) が先頭になる
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [ thread_page("page-a", "old@x", "2026-01-20T10:00:00.000+08:00") ],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/pages/page-b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-b"})))
            .expect(2) // Parent クリア + Sub-item 設定
            .mount(&server)
            .await;

        let mut email = sample_email();
        // 12:00 +08:00 = 04:00Z
        email.date = Some(Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap());

        let syncer = syncer_for(&server, None);
        syncer.reconcile_thread("page-b", &email).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let updates: Vec<Value> = requests
            .iter()
            .filter(|r| r.url.path() == "/v1/pages/page-b")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect();
        // 先に Parent クリア、次に Sub-item
        assert_eq!(updates[0]["properties"]["Parent Item"]["relation"], json!([]));
        assert_eq!(
            updates[1]["properties"]["Sub-item"]["relation"],
            json!([{ "id": "page-a" }])
        );
    }

    #[tokio::test]
    async fn test_reconcile_thread_late_arrival_does_not_become_head() {
        // シナリオ: 先頭 page_B (12:00) が既にいて、遅れて 11:00 のメールが届く
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    thread_page("page-b", "head@x", "2026-01-20T12:00:00.000+08:00"),
                    thread_page("page-a", "old@x", "2026-01-20T10:00:00.000+08:00")
                ],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/pages/page-b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-b"})))
            .expect(2)
            .mount(&server)
            .await;

        let mut email = sample_email();
        // 11:00 +08:00 = 03:00Z — 先頭より古い
        email.date = Some(Utc.with_ymd_and_hms(2026, 1, 20, 3, 0, 0).unwrap());

        let syncer = syncer_for(&server, None);
        syncer.reconcile_thread("page-new", &email).await.unwrap();

        // 先頭 page-b の Sub-item が page-a と新着で書き換わる
        let requests = server.received_requests().await.unwrap();
        let updates: Vec<Value> = requests
            .iter()
            .filter(|r| r.url.path() == "/v1/pages/page-b")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect();
        let relation = updates[1]["properties"]["Sub-item"]["relation"]
            .as_array()
            .unwrap();
        let ids: Vec<&str> = relation
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["page-a", "page-new"]);
    }

    #[tokio::test]
    async fn test_reconcile_thread_no_members_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let syncer = syncer_for(&server, None);
        syncer
            .reconcile_thread("page-x", &sample_email())
            .await
            .unwrap();
        // PATCH は1回も飛ばない
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() != "PATCH"));
    }

    #[tokio::test]
    async fn test_upsert_meeting_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/cal-db/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/pages"))
            .and(body_partial_json(json!({
                "parent": { "database_id": "cal-db" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cal-page-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let invite = MeetingInvite {
            uid: "ev-1".to_string(),
            summary: "Sync".to_string(),
            start_time: Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 1, 20, 5, 0, 0).unwrap(),
            is_all_day: false,
            location: None,
            organizer: None,
            method: "REQUEST".to_string(),
            sequence: 0,
            status: None,
            description: None,
            meeting_url: None,
        };

        let syncer = syncer_for(&server, Some("cal-db"));
        let page_id = syncer.upsert_meeting(&invite).await.unwrap();
        assert_eq!(page_id.as_deref(), Some("cal-page-1"));

        // 日程データベース未設定なら何もしない
        let syncer = syncer_for(&server, None);
        assert!(syncer.upsert_meeting(&invite).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_meeting_updates_existing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/cal-db/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [ { "id": "cal-page-7" } ],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/pages/cal-page-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cal-page-7"})))
            .expect(1)
            .mount(&server)
            .await;

        let invite = MeetingInvite {
            uid: "ev-1".to_string(),
            summary: "Sync v2".to_string(),
            start_time: Utc.with_ymd_and_hms(2026, 1, 20, 4, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 1, 20, 5, 0, 0).unwrap(),
            is_all_day: false,
            location: None,
            organizer: None,
            method: "REQUEST".to_string(),
            sequence: 1,
            status: None,
            description: None,
            meeting_url: None,
        };

        let syncer = syncer_for(&server, Some("cal-db"));
        let page_id = syncer.upsert_meeting(&invite).await.unwrap();
        assert_eq!(page_id.as_deref(), Some("cal-page-7"));
    }

    #[tokio::test]
    async fn test_query_pages_for_reverse_sync_maps_properties() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .and(body_partial_json(json!({
                "filter": { "and": [
                    { "property": "AI Review Status", "select": { "equals": "Reviewed" } },
                    { "property": "Synced to Mail", "checkbox": { "equals": false } }
                ] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [ {
                    "id": "page-1",
                    "properties": {
                        "Message ID": { "rich_text": [ { "text": { "content": "m1@x" } } ] },
                        "AI Action": { "select": { "name": "Flag Important" } },
                        "Mailbox": { "select": { "name": "Sent" } }
                    }
                } ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let syncer = syncer_for(&server, None);
        let pages = syncer.query_pages_for_reverse_sync().await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_id, "page-1");
        assert_eq!(pages[0].message_id, "m1@x");
        assert_eq!(pages[0].ai_action, "Flag Important");
        assert_eq!(pages[0].mailbox, Mailbox::Sent);
    }

    #[tokio::test]
    async fn test_update_page_mail_sync_status() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/pages/page-1"))
            .and(body_partial_json(json!({
                "properties": { "Synced to Mail": { "checkbox": true } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let syncer = syncer_for(&server, None);
        syncer.update_page_mail_sync_status("page-1").await.unwrap();
    }
}
