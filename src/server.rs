use crate::config::Config;
use crate::error::{AdmissionError, Result};
use crate::handlers::{admit, get_policy, health_check, list_policies, reset_bucket, AppState};
use crate::middleware::logging_middleware;
use crate::rate_limiter::RateLimiter;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Router for the decision service.
pub fn create_app(limiter: Arc<RateLimiter>, enable_tracing: bool) -> Router {
    let router = Router::new()
        .route("/v1/admit", post(admit))
        .route("/v1/policies", get(list_policies))
        .route("/v1/policies/:name", get(get_policy))
        .route("/v1/buckets/:policy/:identifier", delete(reset_bucket))
        .route("/health", get(health_check))
        .with_state(AppState::new(limiter))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        );

    if enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

pub struct Server {
    config: Config,
    limiter: Arc<RateLimiter>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config));
        Self { config, limiter }
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                AdmissionError::Configuration(format!(
                    "failed to bind {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        self.limiter.start_sweeper()?;
        let app = create_app(Arc::clone(&self.limiter), self.config.enable_tracing);

        tracing::info!("Admission service listening on {}", self.config.bind_addr);
        tracing::info!("Health check available at /health");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        self.limiter.stop();
        served.map_err(|e| AdmissionError::Internal(format!("server error: {}", e)))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
