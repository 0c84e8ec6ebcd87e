//! Notion API クライアント
//!
//! 1つの reqwest クライアント（keep-alive）を全ループで共有する。
//! リトライ方針:
//! - 429: Retry-After ヘッダがあれば従う。無ければ 1 秒から指数バックオフ
//! - 5xx・ネットワークエラー: 同じ予算で指数バックオフ
//! - それ以外の 4xx: 即時失敗（リトライしない）
//! - 最大 5 回試行、リクエスト単位のタイムアウト 120 秒
//!
//! 一過性のエラーはここで吸収する。Reconciler には操作単位の成否だけが見える。
//!
//! # セキュリティガイドライン
//! - トークンとメール本文をログに出力しないこと。ログは件数・ステータス・処理時間のみ

use serde_json::{json, Value};
use std::time::Duration;

/// Notion API のバージョン（コントラクト文字列として固定）
pub const NOTION_VERSION: &str = "2022-06-28";

/// 最大試行回数
pub const MAX_RETRIES: u32 = 5;

/// バックオフの初期値（秒）
const BASE_RETRY_DELAY_SECS: f64 = 1.0;

/// リクエスト単位のタイムアウト（秒）
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Notion API クライアント
pub struct NotionClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    /// メール用データベース ID
    pub email_db_id: String,
    /// 日程用データベース ID（空なら日程同期は無効）
    pub calendar_db_id: Option<String>,
}

impl NotionClient {
    pub fn new(
        token: String,
        email_db_id: String,
        calendar_db_id: Option<String>,
    ) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            http,
            token,
            base_url: "https://api.notion.com".to_string(),
            email_db_id,
            calendar_db_id,
        })
    }

    /// ベース URL を差し替える（テスト用）
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// JSON リクエストをリトライ付きで送る
    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, String> {
        let url = format!("{}{path}", self.base_url);
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .header("Notion-Version", NOTION_VERSION);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    // ネットワーク層の失敗もバックオフ対象
                    last_error = format!("network error: {e}");
                    let delay = backoff_delay(attempt);
                    log::warn!(
                        "Notion request network error (attempt {}/{MAX_RETRIES}), retrying in {:.1}s",
                        attempt + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 {
                let delay = retry_after(&response).unwrap_or_else(|| backoff_delay(attempt));
                log::warn!(
                    "Rate limited by Notion API (attempt {}/{MAX_RETRIES}), retrying in {:.1}s",
                    attempt + 1,
                    delay.as_secs_f64()
                );
                last_error = "rate limited (429)".to_string();
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_server_error() {
                let delay = backoff_delay(attempt);
                log::warn!(
                    "Notion API server error {status} (attempt {}/{MAX_RETRIES}), retrying in {:.1}s",
                    attempt + 1,
                    delay.as_secs_f64()
                );
                last_error = format!("server error ({status})");
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                // 429 以外の 4xx はスキーマかペイロードの問題。リトライしても無駄
                let body_text = response.text().await.unwrap_or_default();
                let truncated: String = body_text.chars().take(300).collect();
                return Err(format!("Notion API {method} {path} failed: {status} - {truncated}"));
            }

            return response
                .json::<Value>()
                .await
                .map_err(|e| format!("Failed to parse Notion response: {e}"));
        }

        Err(format!(
            "Max retries ({MAX_RETRIES}) exceeded for {method} {path}. Last error: {last_error}"
        ))
    }

    /// multipart/form-data をリトライ付きで送る（ファイルアップロード Step 2）
    ///
    /// multipart の Form は再送できないため試行ごとに組み立て直す。
    pub async fn post_multipart(
        &self,
        url: &str,
        filename: String,
        content_type: String,
        bytes: Vec<u8>,
    ) -> Result<(), String> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(filename.clone())
                .mime_str(&content_type)
                .map_err(|e| format!("Invalid content type {content_type}: {e}"))?;
            let form = reqwest::multipart::Form::new().part("file", part);

            let response = match self
                .http
                .post(url)
                .bearer_auth(&self.token)
                .header("Notion-Version", NOTION_VERSION)
                .multipart(form)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = format!("network error: {e}");
                    let delay = backoff_delay(attempt);
                    log::warn!(
                        "Upload network error (attempt {}/{MAX_RETRIES}), retrying in {:.1}s",
                        attempt + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                let delay = retry_after(&response).unwrap_or_else(|| backoff_delay(attempt));
                last_error = "rate limited (429)".to_string();
                tokio::time::sleep(delay).await;
                continue;
            }
            if status.is_server_error() {
                last_error = format!("server error ({status})");
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                let truncated: String = body_text.chars().take(300).collect();
                return Err(format!("Upload failed: {status} - {truncated}"));
            }
            return Ok(());
        }

        Err(format!(
            "Max retries ({MAX_RETRIES}) exceeded for upload. Last error: {last_error}"
        ))
    }

    /// メール用データベースに Page を作成する
    ///
    /// children は最大 100 件まで。超過分は `append_block_children` で追記する。
    pub async fn create_page(
        &self,
        properties: Value,
        children: Vec<Value>,
        icon: Option<Value>,
    ) -> Result<Value, String> {
        self.create_page_in(&self.email_db_id, properties, children, icon)
            .await
    }

    /// 指定データベースに Page を作成する（日程ページ用）
    pub async fn create_page_in(
        &self,
        database_id: &str,
        properties: Value,
        children: Vec<Value>,
        icon: Option<Value>,
    ) -> Result<Value, String> {
        if children.len() > 100 {
            return Err(format!(
                "create_page accepts at most 100 children, got {}",
                children.len()
            ));
        }

        let mut body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        if !children.is_empty() {
            body["children"] = Value::Array(children);
        }
        if let Some(icon) = icon {
            body["icon"] = icon;
        }

        let page = self
            .request_with_retry(reqwest::Method::POST, "/v1/pages", Some(&body))
            .await?;
        log::debug!(
            "Created Notion page: {}",
            page.get("id").and_then(Value::as_str).unwrap_or("?")
        );
        Ok(page)
    }

    /// Page のプロパティを更新する
    pub async fn update_page(&self, page_id: &str, properties: Value) -> Result<Value, String> {
        let body = json!({ "properties": properties });
        self.request_with_retry(
            reqwest::Method::PATCH,
            &format!("/v1/pages/{page_id}"),
            Some(&body),
        )
        .await
    }

    /// Block（通常は Page）に子ブロックを追記する。1回につき最大 100 件
    pub async fn append_block_children(
        &self,
        block_id: &str,
        children: Vec<Value>,
    ) -> Result<Value, String> {
        if children.len() > 100 {
            return Err(format!(
                "append_block_children accepts at most 100 children, got {}",
                children.len()
            ));
        }
        let count = children.len();
        let body = json!({ "children": children });
        let result = self
            .request_with_retry(
                reqwest::Method::PATCH,
                &format!("/v1/blocks/{block_id}/children"),
                Some(&body),
            )
            .await?;
        log::debug!("Appended {count} blocks to {block_id}");
        Ok(result)
    }

    /// データベースを1ページ分クエリする
    pub async fn query_database(
        &self,
        database_id: &str,
        filter: Option<Value>,
        sorts: Option<Value>,
        start_cursor: Option<String>,
    ) -> Result<Value, String> {
        let mut body = json!({ "page_size": 100 });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        if let Some(sorts) = sorts {
            body["sorts"] = sorts;
        }
        if let Some(cursor) = start_cursor {
            body["start_cursor"] = Value::String(cursor);
        }

        self.request_with_retry(
            reqwest::Method::POST,
            &format!("/v1/databases/{database_id}/query"),
            Some(&body),
        )
        .await
    }

    /// next_cursor を辿って全件クエリする
    pub async fn query_database_all(
        &self,
        database_id: &str,
        filter: Option<Value>,
    ) -> Result<Vec<Value>, String> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .query_database(database_id, filter.clone(), None, cursor.clone())
                .await?;

            if let Some(items) = page.get("results").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }

            let has_more = page.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            if !has_more {
                break;
            }
            cursor = page
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            if cursor.is_none() {
                break;
            }
        }

        Ok(results)
    }

    /// ファイルアップロードの Step 1: アップロード記述子を作成する
    ///
    /// # Returns
    /// `(upload_url, file_upload_id)`
    pub async fn create_file_upload(&self, filename: &str) -> Result<(String, String), String> {
        let body = json!({ "filename": filename });
        let upload = self
            .request_with_retry(reqwest::Method::POST, "/v1/file_uploads", Some(&body))
            .await?;

        let upload_url = upload
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| "file upload response missing upload_url".to_string())?
            .to_string();
        let id = upload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| "file upload response missing id".to_string())?
            .to_string();
        Ok((upload_url, id))
    }
}

/// 指数バックオフの待ち時間（1s, 2s, 4s, ...）
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs_f64(BASE_RETRY_DELAY_SECS * f64::from(1u32 << attempt.min(8)))
}

/// Retry-After ヘッダ（秒）を読む
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> NotionClient {
        NotionClient::new("test-token".to_string(), "db-1".to_string(), None)
            .unwrap()
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_create_page_sends_auth_and_version_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/pages"))
            .and(header("Authorization", "Bearer test-token"))
            .and(header("Notion-Version", NOTION_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let page = client
            .create_page(json!({"Subject": {}}), vec![json!({"type": "paragraph"})], None)
            .await
            .unwrap();
        assert_eq!(page["id"], "page-1");
    }

    #[tokio::test]
    async fn test_429_with_retry_after_is_absorbed() {
        let server = MockServer::start().await;

        // 3 回 429 を返した後に成功する
        Mock::given(method("POST"))
            .and(path("/v1/pages"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(3)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/pages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let page = client.create_page(json!({}), vec![], None).await.unwrap();
        assert_eq!(page["id"], "page-1");
    }

    #[tokio::test]
    async fn test_server_error_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [], "has_more": false})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.query_database("db-1", None, None, None).await.unwrap();
        assert_eq!(result["has_more"], false);
    }

    #[tokio::test]
    async fn test_4xx_fails_fast_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/pages"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "bad property"})),
            )
            .expect(1) // リトライされない
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.create_page(json!({}), vec![], None).await;
        let err = result.unwrap_err();
        assert!(err.contains("400"));
        assert!(err.contains("bad property"));
    }

    #[tokio::test]
    async fn test_query_database_all_paginates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .and(body_partial_json(json!({"start_cursor": "c1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": "p2"}],
                "has_more": false,
                "next_cursor": null
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": "p1"}],
                "has_more": true,
                "next_cursor": "c1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let results = client.query_database_all("db-1", None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["id"], "p1");
        assert_eq!(results[1]["id"], "p2");
    }

    #[tokio::test]
    async fn test_create_page_rejects_too_many_children() {
        let server = MockServer::start().await;
        let client = client_for(&server);
        let children: Vec<Value> = (0..101).map(|_| json!({})).collect();
        let result = client.create_page(json!({}), children, None).await;
        assert!(result.unwrap_err().contains("at most 100"));
    }

    #[tokio::test]
    async fn test_create_file_upload_returns_url_and_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/file_uploads"))
            .and(body_partial_json(json!({"filename": "report.pdf"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "fu-1",
                "upload_url": format!("{}/v1/file_uploads/fu-1/send", server.uri())
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let (url, id) = client.create_file_upload("report.pdf").await.unwrap();
        assert!(url.ends_with("/v1/file_uploads/fu-1/send"));
        assert_eq!(id, "fu-1");
    }

    #[tokio::test]
    async fn test_post_multipart_retries_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client
            .post_multipart(
                &format!("{}/send", server.uri()),
                "a.pdf".to_string(),
                "application/pdf".to_string(),
                vec![1, 2, 3],
            )
            .await
            .unwrap();
    }
}
