use clap::Parser;
use interview_relay::config::RelayConfig;
use interview_relay::screenshots::ScreenshotStore;
use interview_relay::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "interview_relay=info".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let state = AppState::new(ScreenshotStore::new(&config.screenshot_dir))
        .with_idle_timeout(config.idle_timeout());
    let app = interview_relay::router(state);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.addr,
        screenshot_dir = %config.screenshot_dir.display(),
        "Interview relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Interview relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
