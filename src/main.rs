use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};

mod client;
mod error;
mod models;
mod pipeline;
mod proxy;
mod repl;
mod server;
mod session;
mod settings;
mod sse;
mod tree;

#[derive(Debug, Parser)]
#[command(name = "branch_chat")]
#[command(about = "Branching LLM chat: streaming proxy server and terminal client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the conversation proxy (reads GOOGLE_API_KEY, optional GEMINI_BASE_URL)
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        /// Expose Prometheus metrics on this address
        #[arg(long)]
        metrics_listen: Option<String>,
    },
    /// Interactive chat against a running proxy
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:7171")]
        server: String,
        /// Use the non-streaming endpoint
        #[arg(long)]
        no_stream: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen, metrics_listen } => {
            let addr: SocketAddr = listen.parse()?;
            if let Some(metrics_addr) = metrics_listen {
                let metrics_addr: SocketAddr = metrics_addr.parse()?;
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .with_http_listener(metrics_addr)
                    .install()?;
                tracing::info!(%metrics_addr, "metrics exporter listening");
            }
            let state = server::AppState::from_env();
            server::serve(addr, state).await?;
        }
        Commands::Chat { server, no_stream } => {
            repl::run(client::HttpTransport::new(server), !no_stream).await?;
        }
    }
    Ok(())
}
