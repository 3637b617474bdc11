#![allow(clippy::missing_docs_in_private_items)]

pub mod change_detection;
pub mod chunking;
pub mod embedding;
pub mod pipeline;
pub mod stats;

pub use pipeline::{IndexingConfig, IndexingPipeline, IndexingTuning, RunReport};

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        vector_store::{SearchHit, VectorStoreManager},
    },
    utils::{
        config::{AppConfig, CollectionConfig},
        embedding::EmbeddingService,
    },
};
use tracing::{error, warn};

#[derive(Debug)]
pub struct CollectionFailure {
    pub collection_id: String,
    pub error: AppError,
}

/// Outcome of a multi-collection refresh. Per-collection failures are
/// collected rather than propagated so one broken collection cannot
/// block the others.
#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub reports: Vec<RunReport>,
    pub failures: Vec<CollectionFailure>,
}

impl RefreshSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Refreshes every configured collection, or just `selector` when given.
/// Only configuration-level errors abort the whole run.
pub async fn refresh_collections(
    db: Arc<SurrealDbClient>,
    config: &AppConfig,
    embedding_service: Arc<dyn EmbeddingService>,
    selector: Option<&str>,
    force: bool,
) -> Result<RefreshSummary, AppError> {
    let collections = select_collections(config, selector)?;

    let store = VectorStoreManager::new(db, embedding_service.dimension());
    let pipeline_config = IndexingConfig {
        force,
        ..IndexingConfig::default()
    };
    let pipeline = IndexingPipeline::new(store, embedding_service, pipeline_config);

    let mut summary = RefreshSummary::default();

    for collection in collections {
        match pipeline.run_collection(collection).await {
            Ok(report) => summary.reports.push(report),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                error!(
                    collection = %collection.id,
                    error = %err,
                    "collection refresh failed; continuing with remaining collections"
                );
                summary.failures.push(CollectionFailure {
                    collection_id: collection.id.clone(),
                    error: err,
                });
            }
        }
    }

    Ok(summary)
}

/// Embeds the query and runs a nearest-neighbor search against the
/// collection's table. A collection that has never been indexed yields
/// an empty result set rather than an error.
pub async fn search_collection(
    db: Arc<SurrealDbClient>,
    config: &AppConfig,
    embedding_service: Arc<dyn EmbeddingService>,
    collection_id: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, AppError> {
    if config.collection(collection_id).is_none() {
        return Err(unknown_collection(config, collection_id));
    }

    let store = VectorStoreManager::new(db, embedding_service.dimension());
    let query_vector = embedding_service.embed_one(query).await?;

    match store.search(collection_id, &query_vector, limit).await {
        Ok(hits) => Ok(hits),
        Err(AppError::TableNotFound(table)) => {
            warn!(
                collection = %collection_id,
                table = %table,
                "collection has not been indexed yet; returning no results"
            );
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

fn select_collections<'a>(
    config: &'a AppConfig,
    selector: Option<&str>,
) -> Result<Vec<&'a CollectionConfig>, AppError> {
    match selector {
        Some(id) => config
            .collection(id)
            .map(|collection| vec![collection])
            .ok_or_else(|| unknown_collection(config, id)),
        None => {
            if config.collections.is_empty() {
                Err(AppError::Validation("no collections configured".into()))
            } else {
                Ok(config.collections.iter().collect())
            }
        }
    }
}

fn unknown_collection(config: &AppConfig, id: &str) -> AppError {
    let known: Vec<&str> = config.collections.iter().map(|c| c.id.as_str()).collect();
    AppError::Validation(format!(
        "unknown collection '{id}'; configured collections: [{}]",
        known.join(", ")
    ))
}
