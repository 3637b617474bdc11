use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::fingerprint::FileFingerprint;

use super::{
    deserialize_datetime, deserialize_flexible_id, deserialize_option_datetime,
    serialize_datetime, serialize_option_datetime,
};

/// The atomic persisted unit: one embedded chunk plus the provenance of
/// the source-file version it was produced from. Every record stamped
/// with `content_hash`/`size_bytes`/`last_modified` reflects exactly the
/// file version that was chunked and embedded, never a stale mix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub created_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub updated_at: DateTime<Utc>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source_path: String,
    pub file_name: String,
    pub page_numbers: Option<Vec<u32>>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub last_modified: DateTime<Utc>,
    pub content_hash: String,
    pub size_bytes: u64,
}

impl ChunkRecord {
    pub fn new(
        text: String,
        embedding: Vec<f32>,
        page_numbers: Option<Vec<u32>>,
        fingerprint: &FileFingerprint,
    ) -> Self {
        let now = Utc::now();
        let file_name = std::path::Path::new(&fingerprint.path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| fingerprint.path.clone());

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            text,
            embedding,
            source_path: fingerprint.path.clone(),
            file_name,
            page_numbers,
            last_modified: fingerprint.modified_at,
            content_hash: fingerprint.content_hash.clone(),
            size_bytes: fingerprint.size_bytes,
        }
    }
}

/// Read-side projection of a record's fingerprint fields. Older rows may
/// lack any of these; the change detector treats such rows as incomplete
/// and repairs metadata without re-embedding.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredFingerprint {
    pub source_path: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(
        deserialize_with = "deserialize_option_datetime",
        serialize_with = "serialize_option_datetime",
        default
    )]
    pub last_modified: Option<DateTime<Utc>>,
}

impl StoredFingerprint {
    /// A snapshot entry is complete when every fingerprint field is
    /// present and non-empty.
    pub fn is_complete(&self) -> bool {
        self.content_hash.as_deref().is_some_and(|hash| !hash.is_empty())
            && self.size_bytes.is_some()
            && self.last_modified.is_some()
    }

    /// Field-by-field equality against a freshly computed fingerprint.
    /// Any missing field counts as a mismatch.
    pub fn matches(&self, current: &FileFingerprint) -> bool {
        self.content_hash.as_deref() == Some(current.content_hash.as_str())
            && self.size_bytes == Some(current.size_bytes)
            && self.last_modified == Some(current.modified_at)
    }
}
