use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use ragstream_core::{IngestionPipeline, Manifest, MetadataFilter, Retriever, Settings};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ragstream", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file. Built-in defaults are used when omitted.
    #[arg(long, env = "RAGSTREAM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Incrementally ingest one subfolder of the document root.
    Ingest {
        /// Folder under the document root.
        #[arg(long, default_value = "")]
        subfolder: String,
    },
    /// Embed a query and print the closest chunk ids.
    Query {
        #[arg(long)]
        text: String,
        /// Number of results; defaults to retrieval.top_k.
        #[arg(long)]
        top_k: Option<usize>,
        /// Only return chunks of this document path.
        #[arg(long)]
        filter_path: Option<String>,
    },
    /// Write a point-in-time copy of the vector store.
    Snapshot,
    /// Summarize the published manifest and the store size.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        backend = ?settings.store.backend,
        provider = ?settings.embedding.provider,
        "ragstream boot"
    );

    let embedder = settings.build_embedder()?;
    let mut store = settings.open_store(embedder.dimensions()).await?;

    match cli.command {
        Command::Ingest { subfolder } => {
            let pipeline =
                IngestionPipeline::new(&settings.paths.doc_root, settings.ingestion_options())?;
            let stats = pipeline
                .run(
                    &subfolder,
                    store.as_mut(),
                    embedder.as_ref(),
                    &settings.paths.manifest,
                )
                .await
                .with_context(|| format!("ingesting subfolder {subfolder:?}"))?;

            println!(
                "scanned={} processed={} unchanged={} tombstones={}",
                stats.files_scanned, stats.to_process, stats.unchanged, stats.tombstones
            );
            println!(
                "chunks={} upserted={} deleted_old={} deleted_tombstones={} bytes={}",
                stats.chunks_embedded,
                stats.vectors_upserted,
                stats.deleted_old_versions,
                stats.deleted_tombstones,
                stats.embedded_bytes
            );
            println!("manifest written to {}", stats.manifest_path.display());
        }
        Command::Query {
            text,
            top_k,
            filter_path,
        } => {
            let k = top_k.unwrap_or(settings.retrieval.top_k);
            let filter = filter_path.map(|path| MetadataFilter::new().eq("path", path));
            let retriever = Retriever::new(store.as_ref(), embedder.as_ref());
            let hits = retriever
                .retrieve_filtered(&text, k, false, filter.as_ref())
                .await?;

            if hits.is_empty() {
                println!("no results");
            }
            for (rank, hit) in hits.iter().enumerate() {
                if retriever.scores_are_meaningful() {
                    println!("{:>2}. {:.4}  {}", rank + 1, hit.score, hit.id);
                } else {
                    println!("{:>2}. {}", rank + 1, hit.id);
                }
            }
        }
        Command::Snapshot => {
            let location = store.snapshot().await?;
            println!("snapshot: {}", location.display());
        }
        Command::Status => {
            let manifest = Manifest::load(&settings.paths.manifest)?;
            let generated = manifest
                .generated_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "manifest: {} files, {} bytes, generated {}",
                manifest.len(),
                manifest.total_bytes(),
                generated
            );
            println!("store ({}): {} vectors", store.backend(), store.count().await?);
        }
    }

    Ok(())
}
