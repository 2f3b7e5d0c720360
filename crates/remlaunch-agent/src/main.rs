//! `remlaunch-agent`: HTTP exec agent binary.

use clap::Parser;
use remlaunch_agent::AgentConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "remlaunch-agent")]
#[command(about = "Accept file uploads and run shell commands over HTTP", version)]
struct Cli {
    #[command(flatten)]
    config: AgentConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = remlaunch_agent::serve(cli.config).await {
        tracing::error!(error = %e, "agent stopped");
        std::process::exit(1);
    }
}
