//! 外部協力者としての変換器（HTML → ブロック、.eml アーカイブ）

pub mod eml;
pub mod html;
