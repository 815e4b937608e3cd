//! Graphweave CLI: run merge jobs against local stores.
//!
//! Usage:
//!   graphweave merge --workspace <id> --input batch.json [--config graphweave.yaml] [--db path]
//!   graphweave show --workspace <id> [--limit n] [--db path]

use clap::{Parser, Subcommand};
use graphweave::{
    Backends, GraphweaveConfig, JobSummary, MergeJob, RawBatch, StorageConfig, Workspace,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "graphweave",
    version,
    about = "Merge extracted knowledge graph batches into persistent stores"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge one batch of raw records into a workspace
    Merge {
        /// Workspace the batch belongs to
        #[arg(long)]
        workspace: String,
        /// JSON file with `entities` and `relationships` arrays
        #[arg(long)]
        input: PathBuf,
        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path to the SQLite graph database
        #[arg(long)]
        db: Option<PathBuf>,
        /// Path to the SQLite vector database
        #[arg(long)]
        vector_db: Option<PathBuf>,
    },
    /// List stored entities of a workspace
    Show {
        #[arg(long)]
        workspace: String,
        /// Maximum number of entities to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path to the SQLite graph database
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Get the default data directory (~/.local/share/graphweave)
fn default_data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let dir = data_dir.join("graphweave");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

/// Load configuration, then point file-backed stores at the CLI paths.
///
/// Without a config file the CLI persists to SQLite under the data directory.
fn load_config(
    config: Option<&Path>,
    db: Option<PathBuf>,
    vector_db: Option<PathBuf>,
) -> Result<GraphweaveConfig, String> {
    let mut loaded = match config {
        Some(path) => GraphweaveConfig::from_yaml_file(path)
            .map_err(|e| format!("Failed to load config '{}': {}", path.display(), e))?,
        None => {
            let dir = default_data_dir();
            GraphweaveConfig {
                storage: StorageConfig {
                    graph_backend: "sqlite".to_string(),
                    graph_path: Some(dir.join("graph.db")),
                    vector_backend: "sqlite".to_string(),
                    vector_path: Some(dir.join("vectors.db")),
                    ..StorageConfig::default()
                },
                ..GraphweaveConfig::default()
            }
        }
    };
    if let Some(db) = db {
        loaded.storage.graph_backend = "sqlite".to_string();
        loaded.storage.graph_path = Some(db);
    }
    if let Some(vector_db) = vector_db {
        loaded.storage.vector_backend = "sqlite".to_string();
        loaded.storage.vector_path = Some(vector_db);
    }
    loaded.validate().map_err(|e| e.to_string())?;
    Ok(loaded)
}

fn read_batch(path: &Path) -> Result<RawBatch, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid batch '{}': {}", path.display(), e))
}

fn print_summary(summary: &JobSummary) -> Result<(), String> {
    let json = serde_json::to_string_pretty(summary).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

async fn cmd_merge(
    workspace: Workspace,
    input: &Path,
    config: GraphweaveConfig,
) -> Result<i32, String> {
    let batch = read_batch(input)?;
    let backends = Backends::from_config(&config.storage, &config.merge)
        .map_err(|e| format!("Failed to open backends: {}", e))?;
    let job = MergeJob::new(workspace, config.merge, backends).map_err(|e| e.to_string())?;

    let token = job.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling merge job");
            token.cancel();
        }
    });

    let summary = job
        .run(batch.entities, batch.relationships)
        .await
        .map_err(|e| e.to_string())?;
    print_summary(&summary)?;
    Ok(if summary.is_clean() { 0 } else { 2 })
}

async fn cmd_show(workspace: Workspace, limit: usize, config: GraphweaveConfig) -> Result<i32, String> {
    let backends = Backends::from_config(&config.storage, &config.merge)
        .map_err(|e| format!("Failed to open backends: {}", e))?;
    let graph = backends.graph;
    let nodes = graph
        .list_nodes(&workspace, Some(limit))
        .await
        .map_err(|e| e.to_string())?;
    let edges = graph.edge_count(&workspace).await.map_err(|e| e.to_string())?;
    let total = graph.node_count(&workspace).await.map_err(|e| e.to_string())?;

    if nodes.is_empty() {
        println!("No entities in workspace '{}'.", workspace);
        return Ok(0);
    }
    println!("{:<32}  {:<16}  {:>7}  {:>5}", "NAME", "TYPE", "SOURCES", "FILES");
    println!("{}", "-".repeat(66));
    for (name, attrs) in &nodes {
        println!(
            "{:<32}  {:<16}  {:>7}  {:>5}",
            name,
            attrs.entity_type,
            attrs.source_ids.len(),
            attrs.file_paths.len()
        );
    }
    println!("{} of {} entities, {} relationships", nodes.len(), total, edges);
    Ok(0)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Merge {
            workspace,
            input,
            config,
            db,
            vector_db,
        } => Workspace::new(workspace)
            .map_err(|e| e.to_string())
            .and_then(|ws| Ok((ws, load_config(config.as_deref(), db, vector_db)?)))
            .and_then(|(ws, cfg)| runtime.block_on(cmd_merge(ws, &input, cfg))),
        Commands::Show {
            workspace,
            limit,
            config,
            db,
        } => Workspace::new(workspace)
            .map_err(|e| e.to_string())
            .and_then(|ws| Ok((ws, load_config(config.as_deref(), db, None)?)))
            .and_then(|(ws, cfg)| runtime.block_on(cmd_show(ws, limit, cfg))),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
