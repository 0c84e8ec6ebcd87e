//! mailagent - Mail.app → Notion 同期デーモン
//!
//! ローカルのメールストア（macOS Mail.app）とそのカレンダーを Notion の
//! データベースへミラーする常駐プロセス。コアは4つのサブシステム:
//!
//! - [`radar`]: Envelope Index を読み取り専用で監視する高速な変化検知
//! - [`mail::arm`]: 整数 id で1通を取り出す AppleScript 実行器
//! - [`sync_store`]: メッセージ単位のライフサイクル・リトライキュー・dead letter
//! - [`watcher`]: pending → synced を駆動しスレッド関係を保守する Reconciler
//!
//! 逆方向（Notion → Mail.app の既読・フラグ反映）は [`mail::reverse_sync`]、
//! Notion との通信は [`notion`] 配下にまとまっている。

pub mod config;
pub mod converter;
pub mod mail;
pub mod models;
pub mod notion;
pub mod radar;
pub mod shutdown;
pub mod sync_store;
pub mod watcher;
