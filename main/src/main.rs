use std::sync::Arc;

use clap::{Parser, Subcommand};
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, vector_store::VectorStoreManager},
    utils::{
        config::{get_config, AppConfig},
        embedding::service_from_config,
    },
};
use indexing_pipeline::{refresh_collections, search_collection, stats::CollectionStats};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "docindex", about = "Incremental document indexing for vector search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synchronize collections with their source directories.
    Refresh {
        /// Collection id; omit to refresh every configured collection.
        collection: Option<String>,
        /// Drop and rebuild instead of diffing against the index.
        #[arg(long)]
        force: bool,
    },
    /// Nearest-neighbor search within one collection.
    Search {
        query: String,
        #[arg(long)]
        collection: String,
        #[arg(long, default_value_t = 3)]
        limit: usize,
    },
    /// Show per-collection index statistics.
    Stats {
        /// Collection id; omit for all configured collections.
        collection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));
    let embedding_service = service_from_config(&config, Some(openai_client))?;
    info!(
        embedding_backend = ?config.embedding_backend,
        embedding_dimension = embedding_service.dimension(),
        "embedding service initialized"
    );

    match cli.command {
        Commands::Refresh { collection, force } => {
            let summary = refresh_collections(
                Arc::clone(&db),
                &config,
                embedding_service,
                collection.as_deref(),
                force,
            )
            .await?;

            for report in &summary.reports {
                println!(
                    "{}: {} files ({} new, {} modified, {} unchanged, {} repaired, {} skipped), {} records written in {:.1}s",
                    report.collection_id,
                    report.files_seen,
                    report.new_files,
                    report.modified_files,
                    report.unchanged_files,
                    report.repaired_files,
                    report.skipped_files,
                    report.records_written,
                    report.elapsed.as_secs_f64(),
                );
            }

            if !summary.all_succeeded() {
                for failure in &summary.failures {
                    eprintln!("{}: refresh failed: {}", failure.collection_id, failure.error);
                }
                std::process::exit(1);
            }
        }
        Commands::Search {
            query,
            collection,
            limit,
        } => {
            let hits = search_collection(
                Arc::clone(&db),
                &config,
                embedding_service,
                &collection,
                &query,
                limit,
            )
            .await?;

            if hits.is_empty() {
                println!("no results");
            }
            for (rank, hit) in hits.iter().enumerate() {
                let pages = hit
                    .page_numbers
                    .as_ref()
                    .map(|pages| {
                        let joined = pages
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!(" (p. {joined})")
                    })
                    .unwrap_or_default();
                println!(
                    "{}. {}{} [distance {:.4}]\n   {}",
                    rank + 1,
                    hit.file_name,
                    pages,
                    hit.distance,
                    hit.text.replace('\n', " "),
                );
            }
        }
        Commands::Stats { collection } => {
            let store = VectorStoreManager::new(Arc::clone(&db), embedding_service.dimension());
            for id in selected_ids(&config, collection.as_deref())? {
                match CollectionStats::collect(&store, &id).await {
                    Ok(stats) => print_stats(&stats),
                    Err(AppError::TableNotFound(_)) => {
                        println!("{id}: not indexed yet");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    Ok(())
}

fn selected_ids(config: &AppConfig, selector: Option<&str>) -> Result<Vec<String>, AppError> {
    match selector {
        Some(id) => {
            if config.collection(id).is_none() {
                let known: Vec<&str> = config.collections.iter().map(|c| c.id.as_str()).collect();
                return Err(AppError::Validation(format!(
                    "unknown collection '{id}'; configured collections: [{}]",
                    known.join(", ")
                )));
            }
            Ok(vec![id.to_string()])
        }
        None => Ok(config.collections.iter().map(|c| c.id.clone()).collect()),
    }
}

fn print_stats(stats: &CollectionStats) {
    println!(
        "{}: {} documents, {} chunks ({:.1} chunks/document)",
        stats.collection_id,
        stats.total_documents,
        stats.total_chunks,
        stats.avg_chunks_per_document,
    );
    if let Some(last_updated) = stats.last_updated {
        println!("  last updated: {last_updated}");
    }
    for document in &stats.documents {
        let size = document
            .size_bytes
            .map(|bytes| format!("{bytes} bytes"))
            .unwrap_or_else(|| "unknown size".into());
        println!("  {}: {} chunks, {}", document.source_path, document.chunks, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_refresh_with_force() {
        let cli = Cli::try_parse_from(["docindex", "refresh", "procedures", "--force"])
            .expect("should parse");
        match cli.command {
            Commands::Refresh { collection, force } => {
                assert_eq!(collection.as_deref(), Some("procedures"));
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_search_with_default_limit() {
        let cli = Cli::try_parse_from([
            "docindex",
            "search",
            "how do I file a claim",
            "--collection",
            "procedures",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Search {
                query,
                collection,
                limit,
            } => {
                assert_eq!(query, "how do I file a claim");
                assert_eq!(collection, "procedures");
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["docindex"]).is_err());
    }
}
