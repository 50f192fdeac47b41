use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hlsd::api::{ApiServer, ApiServerConfig, AppState};
use hlsd::manager::TaskManager;
use hlsd::settings::SettingsStore;
use hlsfetch::{FetchConfig, SpeedLimiter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hlsd=info,hlsfetch=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let settings_path =
        std::env::var("HLSD_SETTINGS").unwrap_or_else(|_| "./settings.json".to_string());
    let settings = Arc::new(SettingsStore::load_or_create(settings_path)?);
    let current = settings.get().clamped();

    let client = hlsfetch::build_client(&FetchConfig::default())?;
    let limiter = Arc::new(SpeedLimiter::new());
    let manager = TaskManager::new(client, limiter, current.max_concurrent_download);
    manager.set_rate_limit(current.download_speed_limit);
    manager.spawn_queue_processor();

    let state = AppState {
        manager: Arc::clone(&manager),
        settings,
    };
    let server = ApiServer::new(ApiServerConfig::from_env(), state);

    let shutdown = server.cancel_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    server.run().await?;

    manager.shutdown();
    tracing::info!("hlsd stopped cleanly");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
