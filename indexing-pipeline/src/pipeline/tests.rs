use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, vector_store::VectorStoreManager},
    utils::{config::CollectionConfig, fingerprint::FileFingerprint},
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    chunking::Chunk,
    embedding::EmbeddedChunk,
};

use super::{
    services::{Enumeration, PipelineServices},
    IndexingConfig, IndexingPipeline,
};

const DIM: usize = 8;
const CHUNKS_PER_FILE: usize = 2;

struct MockServices {
    files: Mutex<Vec<FileFingerprint>>,
    failing_paths: Vec<String>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockServices {
    fn new(files: Vec<FileFingerprint>) -> Self {
        Self {
            files: Mutex::new(files),
            failing_paths: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_failing_path(files: Vec<FileFingerprint>, path: &str) -> Self {
        Self {
            files: Mutex::new(files),
            failing_paths: vec![path.to_string()],
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn set_files(&self, files: Vec<FileFingerprint>) {
        *self.files.lock().await = files;
    }

    async fn record(&self, stage: &'static str) {
        self.calls.lock().await.push(stage);
    }

    async fn take_calls(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.calls.lock().await)
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    async fn enumerate_files(
        &self,
        _collection: &CollectionConfig,
    ) -> Result<Enumeration, AppError> {
        self.record("enumerate").await;
        Ok(Enumeration {
            fingerprints: self.files.lock().await.clone(),
            skipped: Vec::new(),
        })
    }

    async fn chunk_document(&self, path: &Path) -> Result<Vec<Chunk>, AppError> {
        self.record("chunk").await;
        let path = path.to_string_lossy().into_owned();
        if self.failing_paths.contains(&path) {
            return Err(AppError::Conversion(format!(
                "no converter available for {path}"
            )));
        }

        Ok((0..CHUNKS_PER_FILE)
            .map(|ordinal| Chunk {
                ordinal,
                text: format!("{path} chunk {ordinal}"),
                page_numbers: None,
            })
            .collect())
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, AppError> {
        self.record("embed").await;
        Ok(chunks
            .into_iter()
            .map(|chunk| EmbeddedChunk {
                embedding: vec![chunk.ordinal as f32 + 0.5; DIM],
                chunk,
            })
            .collect())
    }
}

fn fingerprint(path: &str, hash: &str) -> FileFingerprint {
    FileFingerprint {
        path: path.into(),
        content_hash: hash.into(),
        size_bytes: 256,
        modified_at: Utc::now(),
    }
}

fn collection() -> CollectionConfig {
    CollectionConfig {
        id: "docs".into(),
        name: "Documentation".into(),
        data_paths: vec!["/data/docs".into()],
        system_prompt: None,
    }
}

async fn setup_store() -> (Arc<SurrealDbClient>, VectorStoreManager) {
    let namespace = "pipeline_test";
    let database = Uuid::new_v4().to_string();
    let db = Arc::new(
        SurrealDbClient::memory(namespace, &database)
            .await
            .expect("Failed to create in-memory SurrealDB"),
    );
    let store = VectorStoreManager::new(Arc::clone(&db), DIM);
    (db, store)
}

fn pipeline(store: &VectorStoreManager, services: Arc<MockServices>, force: bool) -> IndexingPipeline {
    IndexingPipeline::with_services(
        store.clone(),
        IndexingConfig {
            force,
            ..IndexingConfig::default()
        },
        services,
    )
}

#[tokio::test]
async fn first_run_indexes_everything_then_second_run_is_idempotent() {
    let (_db, store) = setup_store().await;
    let services = Arc::new(MockServices::new(vec![
        fingerprint("/data/docs/a.txt", "hash-a"),
        fingerprint("/data/docs/b.txt", "hash-b"),
    ]));
    let pipeline = pipeline(&store, services.clone(), false);

    let report = pipeline.run_collection(&collection()).await.expect("run");
    assert_eq!(report.files_seen, 2);
    assert_eq!(report.new_files, 2);
    assert_eq!(report.records_written, 2 * CHUNKS_PER_FILE);
    assert_eq!(
        store.record_count("docs").await.expect("count") as usize,
        2 * CHUNKS_PER_FILE
    );
    assert_eq!(
        services.take_calls().await,
        vec!["enumerate", "chunk", "embed", "chunk", "embed"]
    );

    // Same inputs again: nothing embedded, nothing written.
    let report = pipeline.run_collection(&collection()).await.expect("rerun");
    assert_eq!(report.unchanged_files, 2);
    assert_eq!(report.new_files, 0);
    assert_eq!(report.records_written, 0);
    assert_eq!(services.take_calls().await, vec!["enumerate"]);
    assert_eq!(
        store.record_count("docs").await.expect("count") as usize,
        2 * CHUNKS_PER_FILE
    );
}

#[tokio::test]
async fn modified_file_replaces_its_previous_records() {
    let (_db, store) = setup_store().await;
    let services = Arc::new(MockServices::new(vec![
        fingerprint("/data/docs/a.txt", "hash-a"),
        fingerprint("/data/docs/b.txt", "hash-b"),
    ]));
    let pipeline = pipeline(&store, services.clone(), false);
    pipeline.run_collection(&collection()).await.expect("run");

    // a.txt changed on disk; b.txt did not.
    services
        .set_files(vec![
            fingerprint("/data/docs/a.txt", "hash-a2"),
            fingerprint("/data/docs/b.txt", "hash-b"),
        ])
        .await;

    let report = pipeline.run_collection(&collection()).await.expect("rerun");
    assert_eq!(report.modified_files, 1);
    assert_eq!(report.unchanged_files, 1);
    assert_eq!(report.records_written, CHUNKS_PER_FILE);

    // No version mixing: still one set of records per file, with the
    // new hash stamped on the replacement rows.
    assert_eq!(
        store.record_count("docs").await.expect("count") as usize,
        2 * CHUNKS_PER_FILE
    );
    let snapshot = store.snapshot_metadata("docs").await.expect("snapshot");
    assert_eq!(
        snapshot
            .get("/data/docs/a.txt")
            .and_then(|s| s.content_hash.as_deref()),
        Some("hash-a2")
    );
}

#[tokio::test]
async fn incomplete_metadata_is_repaired_without_embedding() {
    let (db, store) = setup_store().await;
    let table = store.ensure_table("docs").await.expect("ensure");

    // A record committed before fingerprint metadata existed.
    db.query(format!(
        "CREATE {table} CONTENT {{ text: 'legacy', embedding: {:?}, \
         source_path: '/data/docs/a.txt', file_name: 'a.txt' }};",
        vec![0.1f32; DIM]
    ))
    .await
    .expect("seed")
    .check()
    .expect("check");

    let services = Arc::new(MockServices::new(vec![fingerprint(
        "/data/docs/a.txt",
        "hash-a",
    )]));
    let pipeline = pipeline(&store, services.clone(), false);

    let report = pipeline.run_collection(&collection()).await.expect("run");
    assert_eq!(report.repaired_files, 1);
    assert_eq!(report.new_files, 0);
    assert_eq!(report.records_written, 0);
    assert_eq!(services.take_calls().await, vec!["enumerate"]);

    // The row was patched in place, not re-created.
    assert_eq!(store.record_count("docs").await.expect("count"), 1);
    let snapshot = store.snapshot_metadata("docs").await.expect("snapshot");
    let entry = snapshot.get("/data/docs/a.txt").expect("entry");
    assert!(entry.is_complete());
    assert_eq!(entry.content_hash.as_deref(), Some("hash-a"));
}

#[tokio::test]
async fn forced_run_rebuilds_and_drops_stale_rows() {
    let (_db, store) = setup_store().await;
    let services = Arc::new(MockServices::new(vec![
        fingerprint("/data/docs/a.txt", "hash-a"),
        fingerprint("/data/docs/b.txt", "hash-b"),
    ]));
    let plain = pipeline(&store, services.clone(), false);
    plain.run_collection(&collection()).await.expect("run");

    // b.txt disappeared from the source tree; force rebuilds from scratch.
    services
        .set_files(vec![fingerprint("/data/docs/a.txt", "hash-a")])
        .await;
    let forced = pipeline(&store, services.clone(), true);

    let report = forced.run_collection(&collection()).await.expect("forced");
    assert_eq!(report.new_files, 1);
    assert_eq!(report.records_written, CHUNKS_PER_FILE);
    assert_eq!(
        store.record_count("docs").await.expect("count") as usize,
        CHUNKS_PER_FILE
    );
    let snapshot = store.snapshot_metadata("docs").await.expect("snapshot");
    assert!(snapshot.contains_key("/data/docs/a.txt"));
    assert!(!snapshot.contains_key("/data/docs/b.txt"));
}

#[tokio::test]
async fn failing_document_does_not_block_its_siblings() {
    let (_db, store) = setup_store().await;
    let services = Arc::new(MockServices::with_failing_path(
        vec![
            fingerprint("/data/docs/a.txt", "hash-a"),
            fingerprint("/data/docs/broken.docx", "hash-x"),
        ],
        "/data/docs/broken.docx",
    ));
    let pipeline = pipeline(&store, services.clone(), false);

    let report = pipeline.run_collection(&collection()).await.expect("run");
    assert_eq!(report.skipped_files, 1);
    assert_eq!(report.records_written, CHUNKS_PER_FILE);

    let snapshot = store.snapshot_metadata("docs").await.expect("snapshot");
    assert!(snapshot.contains_key("/data/docs/a.txt"));
    assert!(!snapshot.contains_key("/data/docs/broken.docx"));

    // The skipped file stays classified as new, so the next run retries it.
    let report = pipeline.run_collection(&collection()).await.expect("rerun");
    assert_eq!(report.new_files, 1);
    assert_eq!(report.skipped_files, 1);
}
