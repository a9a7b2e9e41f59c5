//! Persistent storage: the ANN graph, the vector index wrapping it, and
//! the JSON key-value metadata store.

pub mod hnsw;
pub mod kv;
pub mod vector;

use serde::{Deserialize, Serialize};

/// Where a record's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Text,
    PdfText,
    PdfImage,
    Image,
}

/// One indexed unit of content: a text chunk or an extracted image.
/// Stored as the KV document for its ID and joined against vector hits
/// at query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub chunk_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_image_ids: Vec<String>,
}

/// Current wall-clock time as whole epoch seconds.
#[inline]
pub fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}
