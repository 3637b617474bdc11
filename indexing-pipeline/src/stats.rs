use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{error::AppError, storage::vector_store::VectorStoreManager};

#[derive(Debug, Clone)]
pub struct DocumentStats {
    pub source_path: String,
    pub chunks: usize,
    pub size_bytes: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Aggregated view over one collection's committed records, for the
/// `stats` subcommand.
#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub collection_id: String,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub avg_chunks_per_document: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub documents: Vec<DocumentStats>,
}

impl CollectionStats {
    pub async fn collect(
        store: &VectorStoreManager,
        collection_id: &str,
    ) -> Result<Self, AppError> {
        let rows = store.metadata_rows(collection_id).await?;
        let total_chunks = rows.len();

        let mut by_path: BTreeMap<String, DocumentStats> = BTreeMap::new();
        for row in rows {
            let entry = by_path
                .entry(row.source_path.clone())
                .or_insert_with(|| DocumentStats {
                    source_path: row.source_path,
                    chunks: 0,
                    size_bytes: None,
                    last_modified: None,
                });
            entry.chunks = entry.chunks.saturating_add(1);
            entry.size_bytes = entry.size_bytes.or(row.size_bytes);
            entry.last_modified = match (entry.last_modified, row.last_modified) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }

        let documents: Vec<DocumentStats> = by_path.into_values().collect();
        let total_documents = documents.len();
        let last_updated = documents.iter().filter_map(|d| d.last_modified).max();
        let avg_chunks_per_document = if total_documents == 0 {
            0.0
        } else {
            total_chunks as f64 / total_documents as f64
        };

        Ok(Self {
            collection_id: collection_id.to_string(),
            total_documents,
            total_chunks,
            avg_chunks_per_document,
            last_updated,
            documents,
        })
    }
}
