// main.rs
mod address;
mod commands;
mod config;
mod connectivity;
mod devices;
mod docs;
mod error;
mod handlers;
mod metrics;
mod models;
mod proxy;
mod registry;
#[cfg(test)]
mod test_support;

use axum::{Router, routing::get, response::Redirect};
use tower_http::services::ServeDir;
use std::sync::Arc;
use models::AppState;
use proxy::ProxyGateway;
use registry::{DeviceRegistry, FileStore};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = config::Settings::new()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    if settings.metrics.enabled {
        metrics::setup_metrics(settings.metrics.port)
            .map_err(|e| anyhow::anyhow!("Failed to start metrics exporter: {}", e))?;
        tracing::info!("Metrics exporter listening on port {}", settings.metrics.port);
    }

    let store = FileStore::new(&settings.storage.path);
    tracing::info!("Device settings stored in {}", store.path().display());
    let registry = Arc::new(DeviceRegistry::load(Arc::new(store)));
    for record in registry.all().await {
        tracing::info!(
            id = %record.id,
            name = %record.name,
            connected = record.connected,
            "Device loaded"
        );
    }
    let gateway = Arc::new(
        ProxyGateway::new(settings.proxy.timeout())
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?,
    );
    let state = Arc::new(AppState::new(
        registry,
        gateway,
        settings.controller.brightness_debounce(),
    ));

    for controller in state.controllers() {
        let controller = controller.clone();
        tracing::debug!(id = %controller.id(), "Initial refresh");
        tokio::spawn(async move {
            controller.refresh().await;
        });
    }

    let app = Router::new()
        .route("/", get(|| async { Redirect::permanent("/static/") }))
        .merge(handlers::router(state.clone()))
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", docs::ApiDoc::openapi()))
        .nest_service("/static", ServeDir::new(&settings.server.static_dir));

    let listener = tokio::net::TcpListener::bind(&settings.server.address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind address: {}", e))?;

    tracing::info!("Server started on {}", settings.server.address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    state.shutdown().await;
    Ok(())
}
