//! Amnesia Downloads Server
//!
//! Serves library files with up-to-date embedded metadata, regenerating
//! them on demand and caching the results on disk.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amnesia_downloads::config::Config;
use amnesia_downloads::library::JsonCatalog;
use amnesia_downloads::routes;
use amnesia_downloads::state::AppState;
use amnesia_downloads::storage::verify_writable;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amnesia_downloads=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Amnesia Downloads v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Cache directory: {}", config.cache.cache_dir.display());
    tracing::info!(
        max_bytes = config.cache.max_bytes(),
        target_bytes = config.cache.target_bytes(),
        "Cache size bounds"
    );

    verify_writable(&config.cache.cache_dir)
        .await
        .with_context(|| format!("cache directory {} is not writable", config.cache.cache_dir.display()))?;

    let catalog = JsonCatalog::load(&config.library.catalog_path)
        .await
        .with_context(|| format!("failed to load catalog {}", config.library.catalog_path.display()))?;
    tracing::info!("Library initialized with {} files", catalog.len());

    let app_state = AppState::new(&config.cache, Arc::new(catalog));

    // Clean up after any crash before serving requests
    app_state
        .cache()
        .store()
        .sweep()
        .await
        .context("failed to sweep cache directory")?;
    if let Some(report) = app_state.cache().evictor().run().await.context("initial eviction failed")? {
        tracing::info!(
            entries = report.scanned,
            total_bytes = report.total_after,
            "Download cache ready"
        );
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid SERVER_HOST {}", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Amnesia Downloads listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
