use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use services::{
    fetch_service::FetchService, remote_source::HttpFolderSource, resume::resume,
    scheduler::SchedulerConfig, state_store::StateStore, supervisor::spawn_retry_sweeper,
};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("folder_fetch=info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting folder-fetch with config: {:?}", cfg);

    // --- Ensure download directory exists ---
    if !Path::new(&cfg.download_dir).exists() {
        tokio::fs::create_dir_all(&cfg.download_dir)
            .await
            .with_context(|| format!("creating download directory {}", cfg.download_dir))?;
        tracing::info!("Created download directory at {}", cfg.download_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let store = StateStore::new(db.clone());
    store.migrate().await.context("running database migrations")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let source = Arc::new(HttpFolderSource::new(&cfg.remote_base_url)?);
    let service = FetchService::new(
        store,
        source,
        SchedulerConfig {
            max_concurrent: cfg.max_concurrent,
            download_root: cfg.download_dir.clone().into(),
            transfer_timeout: cfg.transfer_timeout(),
        },
    );

    // --- Resume interrupted work, then start draining ---
    resume(&service).await.context("resuming persisted downloads")?;
    service.scheduler().start();

    let cancel = CancellationToken::new();
    let sweeper = spawn_retry_sweeper(service.clone(), cfg.retry_interval(), cancel.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.body_limit).with_state(service.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Stop background work ---
    tracing::info!("Shutdown signal received, stopping background work...");
    cancel.cancel();
    let _ = sweeper.await;

    if service.scheduler().shutdown(cfg.shutdown_grace()).await {
        tracing::info!("All in-flight transfers finished");
    } else {
        tracing::warn!(
            "Transfers still running after {:?}; they resume on next start",
            cfg.shutdown_grace()
        );
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
