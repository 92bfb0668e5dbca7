//! Application startup and lifecycle management.
//!
//! The service runs as a settlement worker: health/readiness/metrics
//! endpoints for probes and scraping, plus the background retry sweep. The
//! operator-facing CRUD surface lives in a separate gateway.

use crate::config::RefundConfig;
use crate::models::RefundMethod;
use crate::services::notify::TracingNotifier;
use crate::services::providers::{CashDeskProvider, MobileMoneyClient, ProviderRegistry};
use crate::services::store::Store;
use crate::services::{
    get_metrics, init_metrics, CurrencyService, Database, FormService, RetrySweep,
    SettlementService,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use secrecy::ExposeSecret;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use taxfree_core::error::AppError;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: RefundConfig,
    pub db: Arc<Database>,
    pub forms: Arc<FormService>,
    pub settlement: Arc<SettlementService>,
    pub currencies: CurrencyService,
}

#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "refund-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "refund-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing the worker lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
    sweep: RetrySweep,
    sweep_interval: std::time::Duration,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: RefundConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        db.run_migrations().await?;
        let db = Arc::new(db);
        let store: Arc<dyn Store> = db.clone();

        let mut providers = ProviderRegistry::new();
        providers.register(RefundMethod::Cash, Arc::new(CashDeskProvider::new()));
        let mobile_money = MobileMoneyClient::new(config.mobile_money.clone());
        if mobile_money.is_configured() {
            providers.register(RefundMethod::MobileMoney, Arc::new(mobile_money));
            tracing::info!("Mobile money provider registered");
        } else {
            tracing::warn!(
                "Mobile money credentials not configured - mobile money payouts disabled"
            );
        }

        let settlement = Arc::new(SettlementService::new(
            store.clone(),
            providers,
            Arc::new(TracingNotifier),
            config.settlement_settings(),
        ));
        let forms = Arc::new(FormService::new(store.clone()));
        let currencies = CurrencyService::new(store.clone());

        let state = AppState {
            config: config.clone(),
            db: db.clone(),
            forms,
            settlement: settlement.clone(),
            currencies,
        };

        let health_state = HealthState { db };
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(health_state)
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await?;

        let sweep = RetrySweep::new(store, settlement);
        let sweep_interval = std::time::Duration::from_secs(config.worker.sweep_interval_secs);

        Ok(Self {
            port: config.common.port,
            listener,
            router,
            state,
            sweep,
            sweep_interval,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Service handles for operator tooling built on top of the worker.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve probes/metrics and run the retry sweep until either exits.
    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        tracing::info!(port = self.port, "refund-service listening");

        let sweep = self.sweep;
        let interval = self.sweep_interval;
        let sweep_task = tokio::spawn(sweep.run(interval));

        let serve = axum::serve(self.listener, self.router);
        let result = serve.await;

        sweep_task.abort();
        result.map_err(|e| AppError::InternalError(anyhow::anyhow!("server error: {}", e)))
    }
}
