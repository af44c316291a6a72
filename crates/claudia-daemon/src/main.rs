//! claudia-memoryd - persistent memory daemon for the Claudia assistant.
//!
//! One entry point, three modes:
//!
//! - `--daemon`       run the scheduler, health endpoint, and tool server
//! - `--consolidate`  run one full consolidation and exit
//! - `--demo`         use the isolated demo store root
//!
//! Exit codes: 0 success, 2 configuration error, 3 schema/integrity
//! failure, 1 unexpected. Logging goes to stderr; stdout carries the tool
//! protocol.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use claudia_core::{Config, MemoryError, Store};
use claudia_daemon::context::AppContext;
use claudia_daemon::daemon;

const EXIT_OK: i32 = 0;
const EXIT_UNEXPECTED: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_SCHEMA: i32 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "claudia-memoryd",
    version,
    about = "Persistent memory engine for the Claudia assistant"
)]
struct Cli {
    /// Workspace directory this memory store is scoped to
    #[arg(long, value_name = "PATH")]
    workspace: Option<PathBuf>,

    /// Run the daemon: scheduler + health endpoint + tool server on stdio
    #[arg(long)]
    daemon: bool,

    /// Run one full consolidation and exit
    #[arg(long)]
    consolidate: bool,

    /// Use the isolated demo store root
    #[arg(long)]
    demo: bool,

    /// Health endpoint port
    #[arg(long, value_name = "N")]
    port: Option<u16>,
}

fn exit_code_for(error: &MemoryError) -> i32 {
    match error {
        MemoryError::MigrationFailure(_) | MemoryError::SchemaMismatch { .. } => EXIT_SCHEMA,
        MemoryError::Config(_) => EXIT_CONFIG,
        _ => EXIT_UNEXPECTED,
    }
}

#[tokio::main]
async fn main() {
    // stdout belongs to the tool protocol; all logging goes to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    if !cli.daemon && !cli.consolidate {
        error!("nothing to do: pass --daemon or --consolidate");
        return EXIT_CONFIG;
    }

    // Environment first, CLI flags override
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return EXIT_CONFIG;
        }
    };
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }
    if cli.demo {
        config.demo = true;
    }
    if let Some(port) = cli.port {
        config.health_port = port;
    }
    if let Err(e) = config.rehome() {
        error!("configuration error: {}", e);
        return EXIT_CONFIG;
    }

    info!(
        workspace = %config.workspace.display(),
        store = %config.db_path.display(),
        demo = config.demo,
        "claudia-memoryd v{} starting",
        env!("CARGO_PKG_VERSION"),
    );

    // Schema problems here are fatal by design
    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open store: {}", e);
            return exit_code_for(&e);
        }
    };

    let ctx = match AppContext::build(config, store) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("cannot start services: {}", e);
            return exit_code_for(&e);
        }
    };

    // Dimension mismatch against the store is fatal at startup; an
    // unreachable runtime just means degraded mode
    if let Err(e) = ctx.embedder.verify_dimensions().await {
        error!("embedding dimension check failed: {}", e);
        return exit_code_for(&e);
    }

    if cli.consolidate {
        return match ctx.consolidate.consolidate().await {
            Ok(report) => {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("cannot render report: {}", e),
                }
                let _ = ctx.store.close();
                EXIT_OK
            }
            Err(e) => {
                error!("consolidation failed: {}", e);
                exit_code_for(&e)
            }
        };
    }

    match daemon::run(ctx).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("daemon failed: {}", e);
            EXIT_UNEXPECTED
        }
    }
}
