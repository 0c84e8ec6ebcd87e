//! ファイルアップローダ - Notion の3ステップアップロード
//!
//! 手順（リモート側のコントラクト）:
//! 1. POST /v1/file_uploads で記述子を作成 → `{upload_url, id}` を受け取る
//! 2. upload_url へ multipart/form-data で実データを送る
//! 3. 受け取った id をページ作成・更新時に file_upload として参照する
//!
//! # 拡張子偽装
//! Notion は Step 1 で一部の拡張子（.eml など）を拒否する。
//! 許可リストに無い拡張子の場合、Step 1 では `<stem>.pdf` という名前で宣言し、
//! Step 2 では実データと実ファイル名で送る。ページには実ファイル名が表示される。
//! この回避策はこのモジュールの外に漏らさないこと。
//!
//! ファイルは1つずつ順番に送る。並列送信はレート制限に当たる。

use crate::notion::client::NotionClient;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Notion File Upload API が受け付ける拡張子（公式ドキュメントの一覧）
/// https://developers.notion.com/docs/uploading-small-files
static SUPPORTED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Audio
        ".aac", ".adts", ".mid", ".midi", ".mp3", ".mpga", ".m4a", ".m4b", ".mp4", ".oga",
        ".ogg", ".wav", ".wma",
        // Document
        ".pdf", ".txt", ".json", ".doc", ".dot", ".docx", ".dotx", ".xls", ".xlt", ".xla",
        ".xlsx", ".xltx", ".ppt", ".pot", ".pps", ".ppa", ".pptx", ".potx",
        // Image
        ".gif", ".heic", ".jpeg", ".jpg", ".png", ".svg", ".tif", ".tiff", ".webp", ".ico",
        // Video
        ".amv", ".asf", ".wmv", ".avi", ".f4v", ".flv", ".gifv", ".m4v", ".mkv", ".webm",
        ".mov", ".qt", ".mpeg",
    ]
    .into_iter()
    .collect()
});

/// 拡張子が Notion に受け付けられるか
pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str())
}

/// Step 1 で宣言するファイル名を決める
///
/// 許可されない拡張子は `<stem>.pdf` に偽装する。
pub fn step1_filename(real_name: &str) -> (String, bool) {
    let path = Path::new(real_name);
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default();

    if !ext.is_empty() && is_supported_extension(&ext) {
        (real_name.to_string(), true)
    } else {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        (format!("{stem}.pdf"), false)
    }
}

/// ファイルアップローダ
pub struct FileUploader {
    client: Arc<NotionClient>,
    max_bytes: u64,
}

impl FileUploader {
    pub fn new(client: Arc<NotionClient>, max_bytes: u64) -> Self {
        Self { client, max_bytes }
    }

    /// ファイルを1つアップロードして file_upload_id を返す
    ///
    /// # Returns
    /// - `Ok(Some(id))`: アップロード成功
    /// - `Ok(None)`: サイズ超過でスキップ（警告ログ済み）
    /// - `Err(..)`: アップロード失敗（呼び出し側でメッセージ単位の失敗にする）
    pub async fn upload_file(&self, path: &Path) -> Result<Option<String>, String> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| format!("File not found: {}: {e}", path.display()))?;

        if metadata.len() > self.max_bytes {
            log::warn!(
                "Skipping oversized attachment: {} ({} bytes > {} bytes)",
                path.display(),
                metadata.len(),
                self.max_bytes
            );
            return Ok(None);
        }

        let real_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| format!("Invalid attachment path: {}", path.display()))?;

        let (declared_name, is_supported) = step1_filename(&real_name);
        if !is_supported {
            log::debug!(
                "Unsupported extension, using fake filename for Step 1: {declared_name}"
            );
        }

        // Step 1: 記述子の作成（偽装名の場合あり）
        let (upload_url, file_upload_id) = self.client.create_file_upload(&declared_name).await?;
        log::debug!("Created file upload: {file_upload_id}");

        // Step 2: 実データを実ファイル名で送る
        let bytes = std::fs::read(path)
            .map_err(|e| format!("Failed to read attachment {}: {e}", path.display()))?;
        let content_type = if is_supported {
            mime_guess::from_path(path)
                .first_raw()
                .unwrap_or("application/octet-stream")
                .to_string()
        } else {
            "application/pdf".to_string()
        };

        self.client
            .post_multipart(&upload_url, real_name.clone(), content_type, bytes)
            .await?;

        log::debug!(
            "File uploaded: {real_name}{}",
            if is_supported { "" } else { " (used PDF disguise)" }
        );

        // Step 3 は呼び出し側: file_upload_id をページに参照させる
        Ok(Some(file_upload_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn uploader_for(server: &MockServer, max_bytes: u64) -> FileUploader {
        let client = NotionClient::new("t".to_string(), "db".to_string(), None)
            .unwrap()
            .with_base_url(server.uri());
        FileUploader::new(Arc::new(client), max_bytes)
    }

    #[test]
    fn test_is_supported_extension() {
        assert!(is_supported_extension(".pdf"));
        assert!(is_supported_extension(".PNG"));
        assert!(!is_supported_extension(".eml"));
        assert!(!is_supported_extension(".xyz"));
        assert!(!is_supported_extension(""));
    }

    #[test]
    fn test_step1_filename_disguises_unknown_extensions() {
        assert_eq!(
            step1_filename("report.pdf"),
            ("report.pdf".to_string(), true)
        );
        assert_eq!(
            step1_filename("message.eml"),
            ("message.pdf".to_string(), false)
        );
        assert_eq!(step1_filename("noext"), ("noext.pdf".to_string(), false));
        assert_eq!(
            step1_filename("archive.data.bin"),
            ("archive.data.pdf".to_string(), false)
        );
    }

    #[tokio::test]
    async fn test_upload_supported_file_uses_real_name() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("pic.png");
        std::fs::write(&file_path, b"\x89PNG....").unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/file_uploads"))
            .and(body_partial_json(json!({"filename": "pic.png"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "fu-1",
                "upload_url": format!("{}/v1/file_uploads/fu-1/send", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/file_uploads/fu-1/send"))
            .and(body_string_contains("filename=\"pic.png\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, 20 * 1024 * 1024);
        let id = uploader.upload_file(&file_path).await.unwrap();
        assert_eq!(id.as_deref(), Some("fu-1"));
    }

    #[tokio::test]
    async fn test_upload_eml_declares_pdf_but_sends_real_name() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("original.eml");
        std::fs::write(&file_path, b"From: a@b\r\n\r\nbody").unwrap();

        // Step 1 は偽装名（.pdf）
        Mock::given(method("POST"))
            .and(path("/v1/file_uploads"))
            .and(body_partial_json(json!({"filename": "original.pdf"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "fu-2",
                "upload_url": format!("{}/v1/file_uploads/fu-2/send", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;
        // Step 2 は実ファイル名
        Mock::given(method("POST"))
            .and(path("/v1/file_uploads/fu-2/send"))
            .and(body_string_contains("filename=\"original.eml\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, 20 * 1024 * 1024);
        let id = uploader.upload_file(&file_path).await.unwrap();
        assert_eq!(id.as_deref(), Some("fu-2"));
    }

    #[tokio::test]
    async fn test_oversized_file_is_skipped() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("big.pdf");
        std::fs::write(&file_path, vec![0u8; 1024]).unwrap();

        // サイズ超過は API を呼ばない
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, 100);
        let id = uploader.upload_file(&file_path).await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let server = MockServer::start().await;
        let uploader = uploader_for(&server, 1024);
        let result = uploader.upload_file(Path::new("/nonexistent/file.pdf")).await;
        assert!(result.is_err());
    }
}
