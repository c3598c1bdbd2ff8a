use clap::Parser;
use tracing::info;

mod app;
mod shutdown;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("TICKD_BUILD"), ")");

/// Local job-scheduling daemon.
#[derive(Parser, Debug)]
#[command(name = "tickd", version = VERSION, about)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/tickd/tickd.toml)
    #[arg(long = "config", env = "TICKD_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tickd_daemon=info,tickd_scheduler=info,tickd_core=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = tickd_core::TickdConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        tickd_core::TickdConfig::default()
    });

    let state = app::AppState::boot(config)?;
    info!(version = VERSION, pid = std::process::id(), "tickd running");

    let waited = shutdown::wait_for_signal().await;
    state.shutdown();
    waited
}
