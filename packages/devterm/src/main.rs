use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use devterm::config::{DevtermConfig, FileConfig, TerminalsConfig, load_config};
use devterm::{
    MemoryStore, SessionStore, SqliteStore, TerminalManager, TracingAudit, TtyBackend,
};

#[derive(Parser)]
#[command(name = "devterm")]
#[command(about = "Browser terminals on demand, one pty per port")]
struct Cli {
    /// Data directory (default: ~/.devterm)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Restore the saved layout and keep the terminals running until Ctrl-C
    Serve {
        /// Override [terminals].max_terminals
        #[arg(long)]
        max_terminals: Option<usize>,

        /// Keep state in memory instead of the database
        #[arg(long)]
        ephemeral: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "devterm=debug,tty_wrapper=debug,audit=info"
    } else {
        "devterm=info,tty_wrapper=info,audit=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = DevtermConfig::new(cli.data_dir)?;
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;

    match cli.command.unwrap_or(Command::Serve {
        max_terminals: None,
        ephemeral: false,
    }) {
        Command::Serve {
            max_terminals,
            ephemeral,
        } => serve(&config, &file_config, max_terminals, ephemeral).await,
    }
}

async fn serve(
    config: &DevtermConfig,
    file_config: &FileConfig,
    max_terminals: Option<usize>,
    ephemeral: bool,
) -> Result<()> {
    let mut terminals = TerminalsConfig::from_file(&file_config.terminals);
    if let Some(max) = max_terminals {
        terminals.max_terminals = max;
    }

    let store: Arc<dyn SessionStore> = if ephemeral {
        info!("Using in-memory state");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(&config.db_url()).await?)
    };

    let manager = TerminalManager::builder(Arc::new(TtyBackend::new(terminals.reconnect)), store)
        .audit(Arc::new(TracingAudit))
        .options(terminals.manager_options())
        .build();

    let layout = manager
        .restore()
        .await
        .context("Failed to restore terminals")?;
    info!("Restored {} layout", layout);

    for terminal in manager.terminals().await {
        println!(
            "{}",
            listing_line(terminal.id.0, &terminal.title, terminal.port)
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    if let Err(e) = manager.shutdown().await {
        warn!("{}", e);
    }
    Ok(())
}

/// One row of the startup listing. Backends answer only through the proxy's
/// basic auth, so no URL is printed.
fn listing_line(id: u64, title: &str, port: u16) -> String {
    format!("{id:>3}  {title:<20} port {port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_shows_port_without_url() {
        let line = listing_line(3, "Terminal 3", 41234);
        assert_eq!(line, "  3  Terminal 3           port 41234");
        assert!(!line.contains("http"));
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["devterm", "--data-dir", "/tmp/dt"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/dt")));

        let cli = Cli::try_parse_from(["devterm", "serve", "--max-terminals", "4", "--ephemeral"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Serve {
                max_terminals: Some(4),
                ephemeral: true
            })
        ));
    }
}
