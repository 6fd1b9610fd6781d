use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tty_wrapper::{ServerOptions, TtyServer};

#[derive(Parser)]
#[command(name = "wrapper")]
#[command(about = "Serve an interactive command over HTTP and WebSocket")]
struct Args {
    /// Command to run
    command: String,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Port for the HTTP server (0 for automatic)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Address to bind to
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Allow clients to write to the terminal
    #[arg(short = 'w', long)]
    permit_write: bool,

    /// Basic auth credential as user:password
    #[arg(short = 'c', long)]
    credential: Option<String>,

    /// Tell clients to reconnect after the connection drops
    #[arg(long)]
    reconnect: bool,

    /// Client reconnect interval in seconds
    #[arg(long, default_value = "10")]
    reconnect_time: u64,

    /// Page title
    #[arg(long = "title-format", default_value = "Terminal")]
    title: String,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("tty_wrapper={level},tower_http=info"))),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = ServerOptions {
        address: args.address,
        port: args.port,
        permit_write: args.permit_write,
        reconnect: args
            .reconnect
            .then(|| Duration::from_secs(args.reconnect_time)),
        title: args.title,
        credential: args.credential,
        command: args.command,
        args: args.args,
        working_dir: args.cwd,
    };

    let cancel = CancellationToken::new();
    let server = TtyServer::start(options, cancel.clone()).await?;
    println!("http://{}", server.local_addr());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.stop().await;
        }
        _ = server.finished() => {}
    }

    Ok(())
}
