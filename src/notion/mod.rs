//! Notion 側のコンポーネント群

pub mod blocks;
pub mod client;
pub mod sync;
pub mod uploader;
