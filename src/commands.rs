use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, get_config_dir};
use crate::embeddings::EmbeddingFunction;
use crate::embeddings::ollama::OllamaEmbedder;
use crate::pipeline::lifecycle::RagService;
use crate::pipeline::{BuildStatus, FsDocumentSource, RagPipeline};

fn load_config() -> Result<Config> {
    let config_dir = get_config_dir().context("Failed to resolve config directory")?;
    Config::load(config_dir)
}

fn build_service(config: &Config, auto_build: bool) -> Result<RagService> {
    let url = config
        .ollama
        .ollama_url()
        .context("Failed to generate Ollama URL from config")?;

    let text_embedder = OllamaEmbedder::new(
        url.clone(),
        config.ollama.model.clone(),
        config.ollama.embedding_dimension as usize,
    );
    let image_embedder = OllamaEmbedder::new(
        url,
        config.ollama.image_model.clone(),
        config.ollama.image_embedding_dimension as usize,
    );

    let pipeline = RagPipeline::new(
        config,
        EmbeddingFunction::new(Arc::new(text_embedder)),
        EmbeddingFunction::new(Arc::new(image_embedder)),
        Box::new(FsDocumentSource),
    )?;

    Ok(RagService::new(Arc::new(pipeline), auto_build))
}

/// Print the effective configuration.
#[inline]
pub fn show_config() -> Result<()> {
    let config = load_config()?;

    println!("Configuration file: {}", config.config_file_path().display());
    println!();
    println!(
        "{}",
        toml::to_string_pretty(&config).context("Failed to render configuration")?
    );
    println!("working directory: {}", config.working_dir().display());
    println!("update directory:  {}", config.update_dir_path().display());
    Ok(())
}

/// Write the default configuration file if none exists yet.
#[inline]
pub fn init_config() -> Result<()> {
    let config = load_config()?;
    let path = config.config_file_path();

    if path.exists() {
        println!("Configuration already exists: {}", path.display());
        println!("Edit it directly, or run 'localrag config --show' to inspect it.");
        return Ok(());
    }

    config.save()?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Ingest everything new from the update directory.
#[inline]
pub async fn build_index() -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config, false)?;

    let pipeline = service.pipeline();
    pipeline.initialize().await;

    info!("starting build from {}", config.update_dir_path().display());
    let report = pipeline.build_from_shards().await?;

    match report.status {
        BuildStatus::Success => {
            println!("Build complete.");
            println!("  Files scanned:  {}", report.files);
            println!("  Chunks indexed: {}", report.chunks_indexed);
            println!("  Images indexed: {}", report.images_indexed);
        }
        BuildStatus::NoSourcesFound => {
            println!(
                "No sources found in {}.",
                config.update_dir_path().display()
            );
            println!("Place *.txt shards (or texts/, images/, PDF.json) there and rerun.");
        }
        BuildStatus::NoChunksGenerated => {
            println!(
                "Found {} file(s) but none produced indexable chunks.",
                report.files
            );
        }
    }

    Ok(())
}

/// Run a retrieval query and print the joined results.
#[inline]
pub async fn run_query(text: &str, top_k: Option<usize>, data_urls: bool) -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config, false)?;

    // Warmup loads the stores and probes the embedding endpoint; a
    // query against a dead endpoint fails here instead of mid-search.
    service.warmup().await?;

    let pipeline = service.pipeline();
    let top_k = top_k.unwrap_or_else(|| pipeline.top_k());
    let results = pipeline.query(text, top_k).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (rank, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({})",
            rank + 1,
            result.score,
            result.id,
            result.source
        );
        if let (Some(pdf), Some(page)) = (&result.pdf_name, result.pdf_page) {
            println!("   from {} page {}", pdf, page);
        }

        let preview: String = result.content.chars().take(200).collect();
        if preview.len() < result.content.len() {
            println!("   {}…", preview.trim_end());
        } else if !preview.is_empty() {
            println!("   {}", preview.trim_end());
        }

        for image in &result.linked_images {
            if data_urls {
                match image.data_url() {
                    Ok(url) => println!("   image {} [{:.3}]: {}", image.id, image.score, url),
                    Err(e) => println!(
                        "   image {} [{:.3}]: unreadable ({})",
                        image.id, image.score, e
                    ),
                }
            } else {
                println!(
                    "   image {} [{:.3}]: {}",
                    image.id,
                    image.score,
                    image.path.display()
                );
            }
        }
        println!();
    }

    Ok(())
}

/// Print store sizes and on-disk locations.
#[inline]
pub async fn show_status() -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config, false)?;

    let pipeline = service.pipeline();
    pipeline.initialize().await;
    let counts = pipeline.counts().await;

    println!("Workspace: {}", config.working_dir().display());
    println!("Namespace: {}", config.namespace);
    println!();
    println!("  Text chunks:  {}", counts.chunks);
    println!("  Images:       {}", counts.images);
    println!("  KV documents: {}", counts.kv_docs);
    Ok(())
}

/// Delete every persisted store in the workspace.
#[inline]
pub async fn drop_stores() -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config, false)?;

    let pipeline = service.pipeline();
    pipeline.initialize().await;
    pipeline.drop_data().await?;

    println!("Dropped all stores in {}.", config.working_dir().display());
    Ok(())
}
