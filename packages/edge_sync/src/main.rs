use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use edge_sync::config::load_config;
use edge_sync::{
    ClientConfig, ClientEvent, CookieJar, EdgeClient, EdgeSyncConfig, FileConfig, SessionContext,
    SyncCursor,
};

#[derive(Parser)]
#[command(name = "edge-sync")]
#[command(about = "Stream messaging deltas from the edge as JSON lines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.edgesync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print every event until interrupted
    Listen(ListenArgs),

    /// Show or reset the stored sync cursor
    Cursor(CursorArgs),
}

#[derive(Parser)]
struct ListenArgs {
    /// Exported session cookies (defaults to <data-dir>/appstate.json)
    #[arg(long)]
    appstate: Option<PathBuf>,

    /// Region hint for the edge endpoint
    #[arg(long)]
    region: Option<String>,

    /// Ignore the stored cursor and bootstrap from scratch
    #[arg(long)]
    fresh: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Parser)]
struct CursorArgs {
    /// Delete the stored cursor
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EdgeSyncConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Listen(args) => run_listen(args, config).await,
        Commands::Cursor(args) => cursor_command(&config, args.reset),
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "edge_sync=debug,info"
    } else {
        "edge_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    // stdout carries the event stream, logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run_listen(args: ListenArgs, config: EdgeSyncConfig) -> Result<()> {
    init_tracing(args.debug);

    let mut file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Failed to load configuration")?;
    if let Some(region) = args.region {
        file_config.edge.region = Some(region);
    }
    let client_config = ClientConfig::from_file(&file_config);

    let appstate = args.appstate.unwrap_or_else(|| config.appstate_path());
    let jar = CookieJar::load(&appstate)
        .with_context(|| format!("Failed to load appstate from {}", appstate.display()))?;

    let cursor_path = config.cursor_path();
    let mut session = SessionContext::new(jar).context("Appstate has no usable session")?;
    if !args.fresh {
        if let Some(cursor) = SyncCursor::load(&cursor_path)? {
            info!(seq_id = cursor.last_seq_id, "Loaded stored cursor");
            session = session.resume_from(cursor);
        }
    }
    let session = Arc::new(session);

    info!(user_id = session.user_id(), "Starting edge listener");
    let mut listener = EdgeClient::new(session.clone(), client_config)?
        .listen()
        .await
        .context("Failed to start listening")?;

    // Persist every cursor move, including sync-token-only updates and
    // re-bootstraps that never surface a delta
    let mut cursor_rx = listener.cursor_changes();
    let mut stdout = std::io::stdout().lock();
    let outcome = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
            Ok(()) = cursor_rx.changed() => {
                let cursor = cursor_rx.borrow_and_update().clone();
                if let Err(e) = cursor.save(&cursor_path) {
                    warn!(error = %e, "Failed to persist cursor");
                }
                continue;
            }
            event = listener.recv() => event,
        };

        match event {
            Some(ClientEvent::Delta(delta)) => {
                let line = serde_json::to_string(&delta)?;
                writeln!(stdout, "{line}")?;
                stdout.flush()?;
            }
            Some(ClientEvent::Error(e)) => break Err(anyhow::Error::new(e)),
            None => break Ok(()),
        }
    };

    listener.stop().await;
    session
        .cursor()
        .save(&cursor_path)
        .context("Failed to persist cursor")?;
    outcome.context("Edge listener stopped")
}

fn cursor_command(config: &EdgeSyncConfig, reset: bool) -> Result<()> {
    let path = config.cursor_path();
    if reset {
        match std::fs::remove_file(&path) {
            Ok(()) => println!("Cursor reset."),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => println!("No stored cursor."),
            Err(e) => return Err(e).context("Failed to remove cursor"),
        }
        return Ok(());
    }

    match SyncCursor::load(&path)? {
        Some(cursor) => println!("{}", serde_json::to_string_pretty(&cursor)?),
        None => println!("No stored cursor."),
    }
    Ok(())
}
