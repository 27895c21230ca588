//! Intake Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;

use intake_core::{
    api::{self, AppState},
    config::{Config, StoreBackend},
    delivery::DeliveryManager,
    engine::{IntakeRegistry, SubmissionEngine},
    observability,
    store::{MemoryStore, PgStore, SubmissionStore},
    validation::{AcceptAllUploads, AllowAllReviewers, SchemaValidator},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("INTAKE_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config {
                server: Default::default(),
                store: Default::default(),
                observability: Default::default(),
                delivery: Default::default(),
                intakes: Vec::new(),
            }
        }),
    };

    // Initialize observability
    observability::init("intake-server", &config.observability)?;
    let metrics = observability::install_metrics()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        intakes = config.intakes.len(),
        "Starting Intake Server"
    );

    // Wire the store
    let store: Arc<dyn SubmissionStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("running on the in-memory store, state will not survive restarts");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            let url = config.store.database_url.clone().ok_or_else(|| {
                anyhow::anyhow!("store.database_url is required for the postgres backend")
            })?;
            let pg = PgStore::connect(
                &url,
                config.store.max_connections,
                config.store.min_connections,
            )
            .await?;
            pg.migrate().await?;
            tracing::info!("Connected to database, migrations applied");
            Arc::new(pg)
        }
    };

    // Wire the engine and its collaborators
    let registry = IntakeRegistry::new(config.intakes.clone());
    let engine = Arc::new(SubmissionEngine::new(
        store.clone(),
        registry,
        Arc::new(SchemaValidator),
        Arc::new(AcceptAllUploads::new("https://uploads.invalid")),
        Arc::new(AllowAllReviewers),
    ));

    // Start the delivery scheduler
    let delivery = Arc::new(DeliveryManager::new(
        engine.clone(),
        store.clone(),
        config.delivery.clone(),
    )?);
    let scheduler = tokio::spawn(delivery.clone().run());

    // Build router
    let app_state = AppState {
        engine,
        delivery: delivery.clone(),
        store,
        metrics,
    };
    let app = api::build_router(app_state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    delivery.shutdown();
    let _ = scheduler.await;
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
