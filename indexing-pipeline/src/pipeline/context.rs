use std::time::Duration;

use common::{
    error::AppError,
    storage::{types::chunk_record::ChunkRecord, vector_store::VectorStoreManager},
    utils::{config::CollectionConfig, fingerprint::FileFingerprint},
};
use tracing::error;

use crate::change_detection::ChangeSet;

use super::{
    config::IndexingConfig,
    services::{PipelineServices, SkippedFile},
};

/// All records produced for one source-file version, committed or
/// discarded as a unit.
#[derive(Debug)]
pub struct EmbeddedDocument {
    pub fingerprint: FileFingerprint,
    pub records: Vec<ChunkRecord>,
    /// True when older rows for this path must be deleted first.
    pub replaces_existing: bool,
}

/// Outcome of one collection refresh.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub collection_id: String,
    pub files_seen: usize,
    pub new_files: usize,
    pub modified_files: usize,
    pub unchanged_files: usize,
    pub repaired_files: usize,
    pub skipped_files: usize,
    pub records_written: usize,
    pub elapsed: Duration,
}

pub struct PipelineContext<'a> {
    pub collection: &'a CollectionConfig,
    pub collection_id: String,
    pub force: bool,
    pub store: &'a VectorStoreManager,
    pub services: &'a dyn PipelineServices,
    pub fingerprints: Vec<FileFingerprint>,
    pub skipped: Vec<SkippedFile>,
    pub changes: Option<ChangeSet>,
    pub embedded: Vec<EmbeddedDocument>,
    pub records_written: usize,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        collection: &'a CollectionConfig,
        store: &'a VectorStoreManager,
        pipeline_config: &'a IndexingConfig,
        services: &'a dyn PipelineServices,
    ) -> Self {
        Self {
            collection,
            collection_id: collection.id.clone(),
            force: pipeline_config.force,
            store,
            services,
            fingerprints: Vec::new(),
            skipped: Vec::new(),
            changes: None,
            embedded: Vec::new(),
            records_written: 0,
        }
    }

    pub fn changes(&self) -> Result<&ChangeSet, AppError> {
        self.changes
            .as_ref()
            .ok_or_else(|| AppError::InternalError("change set expected to be available".into()))
    }

    pub fn report(&self, elapsed: Duration) -> RunReport {
        let (new_files, modified_files, unchanged_files, repaired_files) = self
            .changes
            .as_ref()
            .map_or((0, 0, 0, 0), |changes| {
                (
                    changes.new.len(),
                    changes.modified.len(),
                    changes.unchanged.len(),
                    changes.incomplete.len(),
                )
            });

        RunReport {
            collection_id: self.collection_id.clone(),
            files_seen: self.fingerprints.len(),
            new_files,
            modified_files,
            unchanged_files,
            repaired_files,
            skipped_files: self.skipped.len(),
            records_written: self.records_written,
            elapsed,
        }
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            collection = %self.collection_id,
            error = %err,
            "indexing pipeline aborted"
        );
        err
    }
}
