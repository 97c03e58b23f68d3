use anyhow::Result;
use clap::{Parser, Subcommand};
use fetchgate_mcp::config::Config;
use fetchgate_mcp::service::FetchService;
use fetchgate_mcp::{http, mcp};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "fetchgate", version, about = "Safe URL-fetching MCP server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve MCP over stdio (for editor/agent clients).
    McpStdio,
    /// Serve the streamable HTTP endpoint.
    Serve(ServeCmd),
    /// Print the version.
    Version,
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080", env = "FETCHGATE_ADDR")]
    addr: String,
}

fn init_tracing() {
    // stdout belongs to the stdio transport; logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_env("FETCHGATE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::McpStdio => {
            let service = Arc::new(FetchService::new(Config::from_env()));
            mcp::serve_stdio(service)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Serve(args) => {
            let service = Arc::new(FetchService::new(Config::from_env()));
            let cancel = CancellationToken::new();
            let shutdown_cancel = cancel.clone();
            let shutdown_service = service.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                shutdown_service.abort_all_task_executions();
                shutdown_cancel.cancel();
            });
            http::serve_http(service, args.addr.parse()?, cancel).await?;
        }
        Commands::Version => {
            println!("fetchgate {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
