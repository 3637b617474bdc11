mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{IndexingConfig, IndexingTuning};
pub use context::RunReport;
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, Enumeration, PipelineServices, SkippedFile};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::vector_store::VectorStoreManager,
    utils::{config::CollectionConfig, embedding::EmbeddingService},
};
use tracing::info;

use self::{
    context::PipelineContext,
    stages::{classify_changes, embed_delta, enumerate_files, merge},
    state::idle,
};

/// Drives one collection through enumerate → classify → embed → merge.
/// The stages accumulate everything in memory; storage is only touched
/// at the merge commit point.
#[allow(clippy::module_name_repetitions)]
pub struct IndexingPipeline {
    store: VectorStoreManager,
    pipeline_config: IndexingConfig,
    services: Arc<dyn PipelineServices>,
}

impl IndexingPipeline {
    pub fn new(
        store: VectorStoreManager,
        embedding_service: Arc<dyn EmbeddingService>,
        pipeline_config: IndexingConfig,
    ) -> Self {
        let services = DefaultPipelineServices::new(embedding_service, &pipeline_config.tuning);
        Self::with_services(store, pipeline_config, Arc::new(services))
    }

    pub fn with_services(
        store: VectorStoreManager,
        pipeline_config: IndexingConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            store,
            pipeline_config,
            services,
        }
    }

    #[tracing::instrument(skip_all, fields(collection = %collection.id))]
    pub async fn run_collection(
        &self,
        collection: &CollectionConfig,
    ) -> Result<RunReport, AppError> {
        let mut ctx = PipelineContext::new(
            collection,
            &self.store,
            &self.pipeline_config,
            self.services.as_ref(),
        );

        let machine = idle();
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let machine = enumerate_files(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let enumerate_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = classify_changes(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let classify_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = embed_delta(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let embed_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let _machine = merge(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let merge_duration = stage_start.elapsed();

        let report = ctx.report(pipeline_started.elapsed());

        info!(
            collection = %report.collection_id,
            files_seen = report.files_seen,
            new = report.new_files,
            modified = report.modified_files,
            unchanged = report.unchanged_files,
            repaired = report.repaired_files,
            skipped = report.skipped_files,
            records_written = report.records_written,
            total_ms = Self::duration_millis(report.elapsed),
            enumerate_ms = Self::duration_millis(enumerate_duration),
            classify_ms = Self::duration_millis(classify_duration),
            embed_ms = Self::duration_millis(embed_duration),
            merge_ms = Self::duration_millis(merge_duration),
            "indexing pipeline finished"
        );

        Ok(report)
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests;
