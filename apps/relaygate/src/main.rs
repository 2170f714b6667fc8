mod bootstrap;

use clap::Parser;
use relaygate_router::{AppState, RouterConfig, build_router};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = bootstrap::CliArgs::parse();
    let request_timeout = std::time::Duration::from_secs(args.request_timeout_secs.max(1));
    // `boot` is held for the rest of `main` so the health scanner and log
    // pipeline it owns keep running for the life of the process.
    let boot = bootstrap::bootstrap(args).await?;

    let state = AppState {
        dispatcher: boot.dispatcher,
        snapshot: boot.snapshot,
        config: RouterConfig { request_timeout },
    };
    let app = build_router(state);

    let bind = format!("{}:{}", boot.global.host, boot.global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "relaygate listening");
    axum::serve(listener, app).await?;

    Ok(())
}
