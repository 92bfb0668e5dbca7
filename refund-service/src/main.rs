//! Refund settlement worker entry point.

use refund_service::config::RefundConfig;
use refund_service::services::init_metrics;
use refund_service::startup::Application;

use taxfree_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = RefundConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting refund-service"
    );

    init_metrics();

    tracing::info!(
        service_name = %config.common.service_name,
        port = %config.common.port,
        sweep_interval_secs = %config.worker.sweep_interval_secs,
        retry_backoff_secs = %config.worker.retry_backoff_secs,
        max_retries = %config.worker.max_retries,
        db_max_connections = %config.database.max_connections,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    tokio::select! {
        result = app.run_until_stopped() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server error");
                return Err(std::io::Error::other(format!("Server error: {}", e)));
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("refund-service stopped");
        }
    }

    Ok(())
}
