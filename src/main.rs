//! Gateway HTTP entrypoint.
//!
//! Launches the Axum server that exposes the tenant payment API and the
//! processor callback endpoints.
//!
//! Endpoints:
//! - `POST /payments/initiate/` – Start a payment (tenant auth)
//! - `GET /payments/{reference}/` – Payment status (tenant auth)
//! - `GET /payments/` – Paginated payment listing (tenant auth)
//! - `POST /payments/{reference}/refund/` – Full or partial refund (tenant auth)
//! - `GET /payments/verify/` – Processor user-redirect callback
//! - `POST /payments/webhook/` – Processor server-to-server webhook
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the binding address
//! - `PROCESSOR_SECRET_KEY` and friends configure the upstream client
//! - `OTEL_*` variables enable tracing export

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use acoruss_payments::auth::RateLimiter;
use acoruss_payments::config::Config;
use acoruss_payments::dispatcher::WebhookDispatcher;
use acoruss_payments::engine::PaymentEngine;
use acoruss_payments::handlers::{self, AppState};
use acoruss_payments::processor::{PaystackClient, Processor};
use acoruss_payments::repository::{InMemoryRepository, Repository};
use acoruss_payments::shutdown::Shutdown;
use acoruss_payments::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Arc::new(Config::from_env()?);

    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let processor: Arc<dyn Processor> = Arc::new(PaystackClient::new(&config.processor));
    let dispatcher = WebhookDispatcher::new(repo.clone(), config.webhooks.clone());
    let engine = Arc::new(PaymentEngine::new(
        repo.clone(),
        processor,
        dispatcher.clone(),
        &config.site_url,
    ));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit));

    let state = AppState {
        config: config.clone(),
        repo,
        engine,
        limiter,
    };

    let http_endpoints = handlers::routes(state)
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.inspect_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
    })?;

    let shutdown = Shutdown::listen()?;
    let token = shutdown.token();
    axum::serve(
        listener,
        http_endpoints.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await?;

    // Let in-flight webhook deliveries run out their retry budgets.
    dispatcher.drain().await;

    Ok(())
}
