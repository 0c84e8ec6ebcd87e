//! .eml アーカイブの生成
//!
//! Arm が取得した RFC 822 の生ソースをそのまま .eml として書き出す。
//! Notion の "Original EML" プロパティにアップロードするための一時ファイルで、
//! スクラッチディレクトリごと破棄される。

use std::path::{Path, PathBuf};

/// 生ソースをスクラッチディレクトリに .eml として書き出す
pub fn write_eml(scratch_dir: &Path, message_id: &str, source: &str) -> Result<PathBuf, String> {
    let stem = sanitize_filename::sanitize(message_id);
    let stem = if stem.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        stem
    };
    let path = scratch_dir.join(format!("{stem}.eml"));

    std::fs::write(&path, source.as_bytes())
        .map_err(|e| format!("Failed to write .eml archive: {e}"))?;
    Ok(path)
}
