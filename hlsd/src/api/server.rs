//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::routes;
use crate::error::{Error, Result};
use crate::manager::TaskManager;
use crate::settings::SettingsStore;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    /// Overridable via `HLSD_BIND` and `HLSD_PORT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("HLSD_BIND") {
            config.bind_address = bind;
        }
        if let Some(port) = std::env::var("HLSD_PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub settings: Arc<SettingsStore>,
}

/// The HTTP control surface.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token that shuts the server down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());
        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }
        router.layer(TraceLayer::new_for_http())
    }

    /// Serve until the cancel token fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {e}")))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("API server listening on http://{addr}");

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::config(format!("server error: {e}")))?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
