use std::error::Error;

use keyrelay_core::bootstrap_from_env;
use keyrelay_router::app_router;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("keyrelay failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let boot = bootstrap_from_env().await?;
    let state = boot.state;
    let bind = {
        let global = state.global.load();
        format!("{}:{}", global.host, global.port)
    };

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(event = "shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "signal_listener_failed", error = %err);
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keyrelay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
