//! Application startup and lifecycle management.

use crate::clock::ApplicationClock;
use crate::config::TallyConfig;
use crate::controller::{EventTallyService, HostTallyService, RetentionService};
use crate::enrichment::CloudigradeEnricher;
use crate::handlers;
use crate::jobs::JobRunner;
use crate::registry::ProductRegistry;
use crate::services::{
    get_metrics, init_metrics, publisher, Database, MemoryStore, SnapshotPublisher, Stores,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: TallyConfig,
    pub stores: Stores,
    pub runner: Arc<JobRunner>,
    /// `None` when running on in-memory stores.
    pub db: Option<Arc<Database>>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = match &state.db {
        Some(db) => db.health_check().await,
        None => Ok(()),
    };
    match db_status {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "tally-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "tally-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(db) = &state.db else {
        return StatusCode::OK;
    };
    match db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/internal/tally/orgs", post(handlers::tally_all_orgs))
        .route("/internal/tally/orgs/:org_id", post(handlers::tally_org))
        .route("/internal/tally/hourly", post(handlers::tally_all_hourly))
        .route("/internal/tally/hourly/:org_id", post(handlers::tally_hourly))
        .route("/internal/retention", post(handlers::purge_expired))
        .route("/internal/events", post(handlers::ingest_events))
        .route("/internal/snapshots/:org_id", get(handlers::list_snapshots))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build against Postgres, or against in-memory stores when no database URL
    /// is configured.
    pub async fn build(config: TallyConfig) -> Result<Self, AppError> {
        init_metrics();

        let (stores, db) = if config.database.url.trim().is_empty() {
            tracing::warn!("DATABASE_URL empty - using in-memory stores");
            (MemoryStore::new().stores(), None)
        } else {
            let db = Database::new(
                &config.database.url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
            let db = Arc::new(db);
            let stores = Stores {
                facts: db.clone(),
                hosts: db.clone(),
                snapshots: db.clone(),
                events: db.clone(),
            };
            (stores, Some(db))
        };

        let publisher = publisher::from_config(&config.publisher);
        Self::assemble(config, stores, db, publisher, ApplicationClock::system()).await
    }

    /// Build around caller-supplied stores, publisher and clock.
    pub async fn build_with_stores(
        config: TallyConfig,
        stores: Stores,
        publisher: Arc<dyn SnapshotPublisher>,
        clock: ApplicationClock,
    ) -> Result<Self, AppError> {
        init_metrics();
        Self::assemble(config, stores, None, publisher, clock).await
    }

    async fn assemble(
        config: TallyConfig,
        stores: Stores,
        db: Option<Arc<Database>>,
        publisher: Arc<dyn SnapshotPublisher>,
        clock: ApplicationClock,
    ) -> Result<Self, AppError> {
        let registry = Arc::new(ProductRegistry::load(config.registry.path.as_deref())?);
        tracing::info!(products = registry.tags().len(), "Product registry loaded");

        let enricher = CloudigradeEnricher::from_config(&config.enrichment, registry.clone())?
            .map(Arc::new);
        if enricher.is_none() {
            tracing::info!("Cloud concurrency enrichment disabled");
        }

        let host_tally = Arc::new(HostTallyService::new(
            stores.clone(),
            registry.clone(),
            enricher,
            publisher.clone(),
            clock,
            config.tally.clone(),
            config.jobs.retry.clone(),
        ));
        let event_tally = Arc::new(EventTallyService::new(
            stores.clone(),
            registry,
            publisher,
            clock,
            &config.tally,
            config.jobs.retry.clone(),
        ));
        let retention = Arc::new(RetentionService::new(
            stores.clone(),
            clock,
            config.retention.clone(),
        ));
        let runner = Arc::new(JobRunner::new(
            host_tally,
            event_tally,
            retention,
            stores.clone(),
            config.jobs.org_concurrency,
        ));

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();
        tracing::info!(http_port, "Tally service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState {
                config,
                stores,
                runner,
                db,
            },
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn runner(&self) -> Arc<JobRunner> {
        self.state.runner.clone()
    }

    pub fn stores(&self) -> &Stores {
        &self.state.stores
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let http_router = router(self.state);

        tracing::info!(
            service = "tally-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, http_router)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
