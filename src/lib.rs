//! Multi-tenant payments orchestration gateway.
//!
//! The gateway fronts a Paystack-compatible card/mobile-money processor.
//! Registered tenants initiate payments through a signed HTTP API; the end
//! user completes the transaction on the processor's hosted page; the
//! gateway reconciles the outcome through the processor's user-redirect
//! callback and its signed server-to-server webhook, then notifies the
//! tenant with a signed outbound webhook, retried with back-off.
//!
//! # Modules
//!
//! - [`auth`] — Bearer-key tenant authentication, IP allowlisting, and the
//!   per-key sliding-window rate limiter.
//! - [`config`] — Environment-driven server configuration.
//! - [`credentials`] — Mint for payment references and tenant API
//!   key/secret pairs.
//! - [`dispatcher`] — Outbound webhook delivery with bounded retries and
//!   per-attempt audit logging.
//! - [`engine`] — The payment lifecycle: initiation with idempotency,
//!   verification, refunds, inbound event application.
//! - [`handlers`] — HTTP endpoints: the tenant API and the processor
//!   callbacks.
//! - [`model`] — Tenants, payments, and webhook delivery logs.
//! - [`processor`] — Typed client for the upstream processor plus inbound
//!   notification DTOs.
//! - [`repository`] — The persistence trait and the in-memory adapter.
//! - [`signature`] — HMAC signing/verification for both webhook directions.
//! - [`shutdown`] — Signal-driven graceful shutdown.
//! - [`telemetry`] — Tracing and optional OpenTelemetry export.
//! - [`types`] — Currencies, statuses, events, and the payment reference.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod engine;
pub mod handlers;
pub mod model;
pub mod processor;
pub mod repository;
pub mod shutdown;
pub mod signature;
pub mod telemetry;
pub mod types;
