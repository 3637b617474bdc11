use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::chunk_record::{ChunkRecord, StoredFingerprint},
    },
    utils::fingerprint::FileFingerprint,
};

/// One nearest-neighbor match.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub source_path: String,
    pub file_name: String,
    #[serde(default)]
    pub page_numbers: Option<Vec<u32>>,
    pub distance: f64,
}

/// Owns all physical mutation of the per-collection chunk tables. The
/// indexing pipeline decides *what* to write; nothing else writes to
/// storage directly.
///
/// Each collection maps deterministically to one SCHEMALESS table with
/// an HNSW index over `embedding` whose dimension is frozen for the
/// table's lifetime.
#[derive(Clone)]
pub struct VectorStoreManager {
    db: Arc<SurrealDbClient>,
    dimension: usize,
}

/// Derives the stable table name for a collection identifier.
pub fn table_name_for(collection_id: &str) -> String {
    let sanitized: String = collection_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("chunks_{sanitized}")
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

enum IndexDimension {
    Missing,
    Matches,
    Different(u64),
}

impl VectorStoreManager {
    pub fn new(db: Arc<SurrealDbClient>, dimension: usize) -> Self {
        Self { db, dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn table_exists(&self, collection_id: &str) -> Result<bool, AppError> {
        let table = table_name_for(collection_id);
        let mut response = self.db.query("INFO FOR DB;").await?;
        let info: surrealdb::Value = response.take(0)?;
        let info_json: Value = serde_json::to_value(info)
            .map_err(|e| AppError::InternalError(format!("serializing db info: {e}")))?;

        let exists = info_json
            .get("Object")
            .and_then(|o| o.get("tables"))
            .and_then(|t| t.get("Object"))
            .and_then(|t| t.as_object())
            .is_some_and(|tables| tables.contains_key(&table));

        Ok(exists)
    }

    /// Idempotent create-or-open. The embedding dimension is frozen when
    /// the index is first defined; encountering an existing index with a
    /// different dimension is a schema mismatch that only `rebuild` can
    /// resolve.
    pub async fn ensure_table(&self, collection_id: &str) -> Result<String, AppError> {
        let table = table_name_for(collection_id);

        match self.index_dimension(&table).await? {
            IndexDimension::Different(found) => {
                return Err(AppError::SchemaMismatch {
                    table,
                    expected: self.dimension,
                    found: usize::try_from(found).unwrap_or(0),
                });
            }
            IndexDimension::Matches => return Ok(table),
            IndexDimension::Missing => {}
        }

        let definition = format!(
            "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_embedding_{table} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;",
            dimension = self.dimension,
        );
        self.db.query(definition).await?.check()?;

        debug!(table = %table, dimension = self.dimension, "vector table ready");

        Ok(table)
    }

    /// Inserts all records. Does not deduplicate; callers pass only
    /// records for new or modified source files.
    pub async fn append(
        &self,
        collection_id: &str,
        records: Vec<ChunkRecord>,
    ) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }
        if !self.table_exists(collection_id).await? {
            return Err(AppError::TableNotFound(table_name_for(collection_id)));
        }

        let table = table_name_for(collection_id);
        let count = records.len();
        let _inserted: Vec<ChunkRecord> = self.db.insert(table.as_str()).content(records).await?;

        debug!(table = %table, records = count, "appended chunk records");

        Ok(())
    }

    /// Full replace: drop, recreate with the current dimension, append.
    /// Used by forced refreshes and to recover from a schema mismatch.
    pub async fn rebuild(
        &self,
        collection_id: &str,
        records: Vec<ChunkRecord>,
    ) -> Result<(), AppError> {
        let table = table_name_for(collection_id);
        self.db
            .query(format!("REMOVE TABLE IF EXISTS {table};"))
            .await?
            .check()?;

        self.ensure_table(collection_id).await?;
        let count = records.len();
        self.append(collection_id, records).await?;

        info!(table = %table, records = count, "table rebuilt");

        Ok(())
    }

    pub async fn drop_table(&self, collection_id: &str) -> Result<(), AppError> {
        let table = table_name_for(collection_id);
        self.db
            .query(format!("REMOVE TABLE IF EXISTS {table};"))
            .await?
            .check()?;
        Ok(())
    }

    /// Removes every record produced from `source_path`. Run before
    /// appending a modified file's replacement records so the table never
    /// holds two versions of one source.
    pub async fn delete_by_source(
        &self,
        collection_id: &str,
        source_path: &str,
    ) -> Result<(), AppError> {
        let table = table_name_for(collection_id);
        self.db
            .query(format!("DELETE {table} WHERE source_path = $path;"))
            .bind(("path", source_path.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Metadata-only repair: rewrites the fingerprint fields on every
    /// record of a source file in place, leaving embeddings untouched.
    pub async fn patch_metadata(
        &self,
        collection_id: &str,
        fingerprint: &FileFingerprint,
    ) -> Result<(), AppError> {
        let table = table_name_for(collection_id);
        self.db
            .query(format!(
                "UPDATE {table} SET content_hash = $hash, size_bytes = $size, \
                 last_modified = $mtime, updated_at = time::now() WHERE source_path = $path;"
            ))
            .bind(("hash", fingerprint.content_hash.clone()))
            .bind(("size", fingerprint.size_bytes))
            .bind(("mtime", surrealdb::sql::Datetime::from(fingerprint.modified_at)))
            .bind(("path", fingerprint.path.clone()))
            .await?
            .check()?;
        Ok(())
    }

    /// All fingerprint projections currently committed to the table, one
    /// row per record.
    pub async fn metadata_rows(
        &self,
        collection_id: &str,
    ) -> Result<Vec<StoredFingerprint>, AppError> {
        if !self.table_exists(collection_id).await? {
            return Err(AppError::TableNotFound(table_name_for(collection_id)));
        }

        let table = table_name_for(collection_id);
        let rows: Vec<StoredFingerprint> = self
            .db
            .query(format!(
                "SELECT source_path, content_hash, size_bytes, last_modified FROM {table};"
            ))
            .await?
            .take(0)?;

        Ok(rows)
    }

    /// Path-keyed view of the committed fingerprints, as consumed by the
    /// change detector. Sibling records of one source share metadata; the
    /// first row wins.
    pub async fn snapshot_metadata(
        &self,
        collection_id: &str,
    ) -> Result<HashMap<String, StoredFingerprint>, AppError> {
        let rows = self.metadata_rows(collection_id).await?;

        let mut snapshot = HashMap::new();
        for row in rows {
            snapshot.entry(row.source_path.clone()).or_insert(row);
        }

        Ok(snapshot)
    }

    /// Nearest-neighbor query over the table's HNSW index, ranked by
    /// distance. Tie order among equal distances is unspecified.
    pub async fn search(
        &self,
        collection_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        if !self.table_exists(collection_id).await? {
            return Err(AppError::TableNotFound(table_name_for(collection_id)));
        }

        let table = table_name_for(collection_id);
        let query = format!(
            "SELECT text, source_path, file_name, page_numbers, \
             vector::distance::knn() AS distance FROM {table} \
             WHERE embedding <|{k},40|> {query_vector:?} ORDER BY distance"
        );

        let hits: Vec<SearchHit> = self.db.query(query).await?.take(0)?;

        Ok(hits)
    }

    pub async fn record_count(&self, collection_id: &str) -> Result<u64, AppError> {
        if !self.table_exists(collection_id).await? {
            return Err(AppError::TableNotFound(table_name_for(collection_id)));
        }

        let table = table_name_for(collection_id);
        let mut response = self
            .db
            .query(format!("SELECT count() AS count FROM {table} GROUP ALL;"))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    async fn index_dimension(&self, table: &str) -> Result<IndexDimension, AppError> {
        let mut response = self.db.query(format!("INFO FOR TABLE {table};")).await?;
        let info: surrealdb::Value = response.take(0)?;
        let info_json: Value = serde_json::to_value(info)
            .map_err(|e| AppError::InternalError(format!("serializing table info: {e}")))?;

        let Some(indexes) = info_json
            .get("Object")
            .and_then(|o| o.get("indexes"))
            .and_then(|i| i.get("Object"))
            .and_then(|i| i.as_object())
        else {
            return Ok(IndexDimension::Missing);
        };

        let Some(definition) = indexes
            .get(&format!("idx_embedding_{table}"))
            .and_then(|details| details.get("Strand"))
            .and_then(|v| v.as_str())
        else {
            return Ok(IndexDimension::Missing);
        };

        let Some(found) = extract_dimension(definition) else {
            return Ok(IndexDimension::Missing);
        };

        if found == self.dimension as u64 {
            Ok(IndexDimension::Matches)
        } else {
            Ok(IndexDimension::Different(found))
        }
    }
}

fn extract_dimension(definition: &str) -> Option<u64> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.trim_end_matches(';').parse::<u64>().ok())
}
