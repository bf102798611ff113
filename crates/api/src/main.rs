// Blockflow API server
// Decision: Queue workers run in the API process unless BLOCKFLOW_RUN_WORKERS=false,
// so a single binary is a complete deployment; more workers scale out by sharing the database

use std::sync::Arc;

use anyhow::{Context, Result};
use blockflow_api::ApiConfig;
use blockflow_engine::{
    Engine, EngineConfig, ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore,
    WorkerPool, WorkerPoolConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "blockflow_api=debug,blockflow_engine=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("blockflow-api starting...");

    let config = ApiConfig::from_env();
    let engine_config = EngineConfig::from_env();

    let store: Arc<dyn ExecutionStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresExecutionStore::connect(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Connected to database");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage (state is lost on exit)");
            Arc::new(InMemoryExecutionStore::new())
        }
    };

    let engine = Engine::builder(store).with_config(engine_config.clone()).build();

    let pool = if config.run_workers {
        let pool = WorkerPool::new(engine.clone(), WorkerPoolConfig::from_engine(&engine_config));
        pool.start().context("Failed to start worker pool")?;
        tracing::info!(
            worker_id = %pool.worker_id(),
            workers = engine_config.workers,
            "Worker pool started"
        );
        Some(pool)
    } else {
        tracing::info!("Worker pool disabled (BLOCKFLOW_RUN_WORKERS=false)");
        None
    };

    let app = blockflow_api::app(engine, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(pool) = pool {
        tracing::info!("Draining worker pool");
        pool.shutdown().await.context("Worker pool shutdown failed")?;
    }

    tracing::info!("blockflow-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
