//! HTML → Notion ブロック変換
//!
//! `(html, inline_map)` を受け取りブロック列を返す純粋な変換。
//! レイアウトの完全再現は狙わない（ベストエフォート）。ブロック要素の
//! テキストを段落系ブロックに平坦化し、`cid:` 画像は inline_map 経由で
//! file_upload 画像ブロックに置き換える。
//!
//! inline_map のキーは Content-ID とファイル名の両方。値は
//! `(file_upload_id, content_type)`。

use scraper::{ElementRef, Html};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Content-ID / ファイル名 → (file_upload_id, content_type)
pub type InlineMap = HashMap<String, (String, String)>;

/// Notion の rich_text 1要素あたりの上限文字数
const MAX_TEXT_LEN: usize = 2000;

/// ブロックとして扱う要素名
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "pre", "td",
];

/// HTML をブロック列に変換する
pub fn html_to_blocks(html: &str, inline_map: &InlineMap) -> Vec<Value> {
    let doc = Html::parse_document(html);
    let mut blocks = Vec::new();

    for node in doc.root_element().descendants() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        let name = el.value().name();

        if name == "img" {
            if let Some(block) = image_block(&el, inline_map) {
                blocks.push(block);
            }
            continue;
        }

        if BLOCK_ELEMENTS.contains(&name) && !has_block_ancestor(&el) {
            let text: String = el.text().collect::<String>().trim().to_string();
            if text.is_empty() {
                continue;
            }
            blocks.extend(text_element_blocks(name, &text));
        }
    }

    // ブロック要素が1つも無い HTML（テキスト断片など）は全文を段落にする
    if blocks.is_empty() {
        let text: String = doc.root_element().text().collect::<String>();
        blocks = text_to_blocks(&text);
    }

    blocks
}

/// プレーンテキストを段落ブロック列に変換する
pub fn text_to_blocks(text: &str) -> Vec<Value> {
    let mut blocks = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        for chunk in chunk_text(paragraph) {
            blocks.push(paragraph_block(&chunk));
        }
    }
    blocks
}

/// 祖先に別のブロック要素がいるか（入れ子の二重変換を防ぐ）
fn has_block_ancestor(el: &ElementRef<'_>) -> bool {
    el.ancestors().any(|node| {
        ElementRef::wrap(node)
            .map(|parent| BLOCK_ELEMENTS.contains(&parent.value().name()))
            .unwrap_or(false)
    })
}

/// 要素名に応じたブロックを作る（長文は分割）
fn text_element_blocks(name: &str, text: &str) -> Vec<Value> {
    chunk_text(text)
        .into_iter()
        .map(|chunk| match name {
            "h1" | "h2" => heading_block("heading_2", &chunk),
            "h3" | "h4" | "h5" | "h6" => heading_block("heading_3", &chunk),
            "li" => json!({
                "object": "block",
                "type": "bulleted_list_item",
                "bulleted_list_item": { "rich_text": [text_span(&chunk)] }
            }),
            "blockquote" => json!({
                "object": "block",
                "type": "quote",
                "quote": { "rich_text": [text_span(&chunk)] }
            }),
            _ => paragraph_block(&chunk),
        })
        .collect()
}

/// img 要素をブロックに変換する
///
/// `cid:` は inline_map で file_upload に解決する。未解決の cid は捨てる
/// （対応する添付が無い、またはアップロードに失敗している）。
/// http(s) の外部画像は external 画像ブロックにする。
fn image_block(el: &ElementRef<'_>, inline_map: &InlineMap) -> Option<Value> {
    let src = el.value().attr("src")?.trim();

    if let Some(cid) = src.strip_prefix("cid:") {
        let (file_upload_id, _) = inline_map.get(cid)?;
        return Some(json!({
            "object": "block",
            "type": "image",
            "image": {
                "type": "file_upload",
                "file_upload": { "id": file_upload_id }
            }
        }));
    }

    if src.starts_with("https://") || src.starts_with("http://") {
        return Some(json!({
            "object": "block",
            "type": "image",
            "image": {
                "type": "external",
                "external": { "url": src }
            }
        }));
    }

    None
}

/// 段落ブロック
pub fn paragraph_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": [text_span(text)] }
    })
}

fn heading_block(kind: &str, text: &str) -> Value {
    let mut block = json!({ "object": "block", "type": kind });
    block[kind] = json!({ "rich_text": [text_span(text)] });
    block
}

/// rich_text の1要素
pub fn text_span(text: &str) -> Value {
    json!({ "type": "text", "text": { "content": text } })
}

/// 文字数上限で分割する（文字境界を壊さない）
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= MAX_TEXT_LEN {
        return vec![text.to_string()];
    }
    chars
        .chunks(MAX_TEXT_LEN)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
