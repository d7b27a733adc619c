//! Tenant authentication and per-key rate limiting.
//!
//! Requests carry `Authorization: Bearer <api_key>`. The middleware
//! resolves the key to an active tenant, applies the sliding-window rate
//! limit, checks the tenant's IP allowlist, and attaches the tenant to the
//! request extensions for downstream handlers. Keys are only ever logged by
//! their first 12 characters.

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::handlers::AppState;
use crate::model::Tenant;

/// Sliding-window limiter keyed by truncated API key.
///
/// The map is sharded internally, so concurrent requests for different keys
/// do not contend. Counts are per process; horizontally scaled deployments
/// accept the resulting drift.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            window: config.window,
            max_requests: config.max_requests,
            hits: DashMap::new(),
        }
    }

    /// Admit or reject one request for `key`. Admission appends the current
    /// timestamp; timestamps older than the window are discarded first.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push(now);
        true
    }
}

/// The authenticated tenant, attached to request extensions on success.
#[derive(Clone)]
pub struct CurrentTenant {
    pub tenant: Tenant,
    pub client_ip: String,
}

/// Extract the caller's IP: first `X-Forwarded-For` entry when present,
/// otherwise the transport peer address.
pub fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Middleware guarding the tenant API surface.
pub async fn require_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let Some(api_key) = header.strip_prefix("Bearer ") else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header. Use: Bearer <api_key>",
        );
    };
    let key_prefix: String = api_key.chars().take(12).collect();

    if !state.limiter.check(&format!("api:{key_prefix}")) {
        tracing::warn!("Rate limit exceeded for API key: {key_prefix}...");
        return reject(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Try again later.",
        );
    }

    let tenant = match state.repo.tenant_by_api_key(api_key).await {
        Ok(tenant) => tenant,
        Err(error) => {
            tracing::error!("Tenant lookup failed: {error}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };
    let Some(tenant) = tenant.filter(|t| t.is_active) else {
        tracing::warn!("Invalid API key attempt: {key_prefix}...");
        return reject(StatusCode::UNAUTHORIZED, "Invalid API key");
    };

    let client_ip = client_ip(&request);
    if !tenant.allowed_ips.is_empty() && !tenant.allowed_ips.contains(&client_ip) {
        tracing::warn!(
            tenant = %tenant.slug,
            %client_ip,
            "Client IP not in tenant allowlist"
        );
        return reject(StatusCode::FORBIDDEN, "IP address not allowed");
    }

    request
        .extensions_mut()
        .insert(CurrentTenant { tenant, client_ip });
    next.run(request).await
}
