use clap::{Parser, Subcommand};
use localrag::Result;
use localrag::commands::{
    build_index, drop_stores, init_config, run_query, show_config, show_status,
};

#[derive(Parser)]
#[command(name = "localrag")]
#[command(about = "Local vector retrieval engine: HNSW index, KV store, and ingestion pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize or inspect the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Index new shards, extracted pages, and images from the update directory
    Build,
    /// Query the text index and show linked images
    Query {
        /// Query text
        text: String,
        /// Number of results to return
        #[arg(long)]
        top_k: Option<usize>,
        /// Render linked images as base64 data URLs instead of paths
        #[arg(long)]
        data_urls: bool,
    },
    /// Show store sizes and on-disk locations
    Status,
    /// Delete all persisted stores in the workspace
    Drop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                init_config()?;
            }
        }
        Commands::Build => {
            build_index().await?;
        }
        Commands::Query {
            text,
            top_k,
            data_urls,
        } => {
            run_query(&text, top_k, data_urls).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Drop => {
            drop_stores().await?;
        }
    }

    Ok(())
}
