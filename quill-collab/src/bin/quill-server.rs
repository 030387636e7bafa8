use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use quill_collab::{DocumentStore, ServerConfig, SyncServer, DEFAULT_LOG_CAPACITY};
use quill_ot::{Edit, Operation, TreeOp};

/// Quill sync server - central revision authority for collaborative documents
#[derive(Parser, Debug)]
#[command(name = "quill-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Document model served over the connection
    #[arg(short, long, value_enum, default_value_t = DocumentKind::Text)]
    kind: DocumentKind,

    /// RocksDB directory; documents are kept in memory when omitted
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Maximum sessions per document
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,

    /// Operations retained per document for rebasing stale submissions
    #[arg(long, default_value_t = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,

    /// Create unknown documents when a client joins them
    #[arg(long)]
    auto_create: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentKind {
    /// Plain text addressed by character offset
    Text,
    /// Element/text node tree addressed by path
    Tree,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServerConfig {
        bind_addr: cli.bind,
        max_sessions_per_document: cli.max_sessions,
        log_capacity: cli.log_capacity,
        heartbeat_interval_secs: cli.heartbeat,
        storage_path: cli.storage,
        auto_create_documents: cli.auto_create,
        ..ServerConfig::default()
    };

    match cli.kind {
        DocumentKind::Text => serve::<Operation>(config).await,
        DocumentKind::Tree => serve::<TreeOp>(config).await,
    }
}

async fn serve<E: Edit>(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage_path {
        Some(path) => {
            log::info!("Persisting documents to {}", path.display());
            run(SyncServer::<E, _>::with_storage(config)?).await
        }
        None => {
            log::warn!("No storage path given; documents will not survive a restart");
            run(SyncServer::<E, _>::in_memory(config)).await
        }
    }
}

async fn run<E: Edit, S: DocumentStore<E>>(
    server: SyncServer<E, S>,
) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Starting Quill sync server on {}", server.bind_addr());
    server.run().await
}
