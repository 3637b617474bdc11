use std::path::Path;

use common::{error::AppError, storage::types::chunk_record::ChunkRecord};
use state_machines::core::GuardError;
use tracing::{info, instrument, warn};

use crate::change_detection::{classify, ChangeSet};

use super::{
    context::{EmbeddedDocument, PipelineContext},
    services::SkippedFile,
    state::{Classified, Embedded, Enumerated, Idle, IndexingMachine, Merged},
};

#[instrument(level = "trace", skip_all, fields(collection = %ctx.collection_id))]
pub async fn enumerate_files(
    machine: IndexingMachine<(), Idle>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IndexingMachine<(), Enumerated>, AppError> {
    let enumeration = ctx.services.enumerate_files(ctx.collection).await?;

    info!(
        collection = %ctx.collection_id,
        files = enumeration.fingerprints.len(),
        skipped = enumeration.skipped.len(),
        roots = ctx.collection.data_paths.len(),
        "source files enumerated"
    );

    ctx.fingerprints = enumeration.fingerprints;
    ctx.skipped = enumeration.skipped;

    machine
        .enumerate()
        .map_err(|(_, guard)| map_guard_error("enumerate", &guard))
}

/// Partitions the enumerated files. A forced run and a first run against
/// a missing table both skip the snapshot and treat every file as new.
#[instrument(level = "trace", skip_all, fields(collection = %ctx.collection_id))]
pub async fn classify_changes(
    machine: IndexingMachine<(), Enumerated>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IndexingMachine<(), Classified>, AppError> {
    let changes = if ctx.force || !ctx.store.table_exists(&ctx.collection_id).await? {
        ChangeSet {
            new: ctx.fingerprints.clone(),
            ..ChangeSet::default()
        }
    } else {
        let snapshot = ctx.store.snapshot_metadata(&ctx.collection_id).await?;
        classify(ctx.fingerprints.clone(), &snapshot)
    };

    info!(
        collection = %ctx.collection_id,
        new = changes.new.len(),
        modified = changes.modified.len(),
        unchanged = changes.unchanged.len(),
        incomplete = changes.incomplete.len(),
        forced = ctx.force,
        "changes classified"
    );

    ctx.changes = Some(changes);

    machine
        .classify()
        .map_err(|(_, guard)| map_guard_error("classify", &guard))
}

/// Chunks and embeds every new or modified file. Failures isolate to the
/// document: the file is recorded as skipped and the run continues,
/// unless the error is fatal for the whole run.
#[instrument(level = "trace", skip_all, fields(collection = %ctx.collection_id))]
pub async fn embed_delta(
    machine: IndexingMachine<(), Classified>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IndexingMachine<(), Embedded>, AppError> {
    let to_embed: Vec<_> = {
        let changes = ctx.changes()?;
        changes
            .new
            .iter()
            .cloned()
            .map(|fp| (fp, false))
            .chain(changes.modified.iter().cloned().map(|fp| (fp, true)))
            .collect()
    };

    for (fingerprint, replaces_existing) in to_embed {
        let path = Path::new(&fingerprint.path);

        let outcome = async {
            let chunks = ctx.services.chunk_document(path).await?;
            ctx.services.embed_chunks(chunks).await
        }
        .await;

        match outcome {
            Ok(embedded) => {
                let records: Vec<ChunkRecord> = embedded
                    .into_iter()
                    .map(|item| {
                        ChunkRecord::new(
                            item.chunk.text,
                            item.embedding,
                            item.chunk.page_numbers,
                            &fingerprint,
                        )
                    })
                    .collect();

                ctx.embedded.push(EmbeddedDocument {
                    fingerprint,
                    records,
                    replaces_existing,
                });
            }
            Err(err) if !err.is_fatal() => {
                warn!(
                    collection = %ctx.collection_id,
                    path = %fingerprint.path,
                    error = %err,
                    "document failed to embed; skipping"
                );
                ctx.skipped.push(SkippedFile {
                    path: fingerprint.path,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    machine
        .embed()
        .map_err(|(_, guard)| map_guard_error("embed", &guard))
}

/// The single commit point. Nothing touches storage before this stage;
/// a forced run replaces the whole table, otherwise replaced rows are
/// deleted, new records appended, and incomplete metadata patched.
#[instrument(level = "trace", skip_all, fields(collection = %ctx.collection_id))]
pub async fn merge(
    machine: IndexingMachine<(), Embedded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IndexingMachine<(), Merged>, AppError> {
    let documents = std::mem::take(&mut ctx.embedded);
    let records_total: usize = documents.iter().map(|doc| doc.records.len()).sum();
    let documents_total = documents.len();

    if ctx.force {
        let records: Vec<ChunkRecord> = documents
            .into_iter()
            .flat_map(|doc| doc.records)
            .collect();
        ctx.store.rebuild(&ctx.collection_id, records).await?;
    } else {
        ctx.store.ensure_table(&ctx.collection_id).await?;

        for document in documents {
            if document.replaces_existing {
                ctx.store
                    .delete_by_source(&ctx.collection_id, &document.fingerprint.path)
                    .await?;
            }
            ctx.store
                .append(&ctx.collection_id, document.records)
                .await?;
        }

        let repairs = ctx.changes()?.incomplete.clone();
        for fingerprint in &repairs {
            ctx.store
                .patch_metadata(&ctx.collection_id, fingerprint)
                .await?;
        }
    }

    ctx.records_written = records_total;

    info!(
        collection = %ctx.collection_id,
        documents = documents_total,
        records = records_total,
        forced = ctx.force,
        "merge committed"
    );

    machine
        .merge()
        .map_err(|(_, guard)| map_guard_error("merge", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid indexing pipeline transition during {event}: {guard:?}"
    ))
}
