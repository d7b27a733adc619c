//! Configuration for the gateway server.
//!
//! Everything comes from environment variables (with `.env` loaded by the
//! entrypoint). Each knob has a production default; only the upstream
//! processor secret is genuinely required for the gateway to do anything
//! useful, and even that is allowed to be absent so the server can boot in
//! development.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use url::Url;

const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";
const ENV_SITE_URL: &str = "SITE_URL";
const ENV_PROCESSOR_SECRET_KEY: &str = "PROCESSOR_SECRET_KEY";
const ENV_PROCESSOR_PUBLIC_KEY: &str = "PROCESSOR_PUBLIC_KEY";
const ENV_PROCESSOR_BASE_URL: &str = "PROCESSOR_BASE_URL";
const ENV_PROCESSOR_TIMEOUT_SECONDS: &str = "PROCESSOR_TIMEOUT_SECONDS";
const ENV_RATE_LIMIT_WINDOW_SECONDS: &str = "RATE_LIMIT_WINDOW_SECONDS";
const ENV_RATE_LIMIT_MAX: &str = "RATE_LIMIT_MAX";
const ENV_WEBHOOK_MAX_ATTEMPTS: &str = "WEBHOOK_MAX_ATTEMPTS";
const ENV_WEBHOOK_RETRY_DELAYS: &str = "WEBHOOK_RETRY_DELAYS";
const ENV_WEBHOOK_TIMEOUT_SECONDS: &str = "WEBHOOK_TIMEOUT_SECONDS";

const DEFAULT_PROCESSOR_BASE_URL: &str = "https://api.paystack.co";
const DEFAULT_SITE_URL: &str = "http://localhost:8000";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Server configuration, fully resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Public base URL of this gateway; used to build the redirect-back
    /// target handed to the upstream processor.
    pub site_url: Url,
    pub processor: ProcessorConfig,
    pub rate_limit: RateLimitConfig,
    pub webhooks: WebhookConfig,
}

/// Credentials and transport settings for the upstream processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub secret_key: String,
    pub public_key: String,
    pub base_url: Url,
    pub timeout: Duration,
}

/// Sliding-window limits applied per API key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: usize,
}

/// Outbound webhook delivery policy.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    /// Back-off between attempts; `delays[n-1]` runs after attempt `n`.
    pub retry_delays: Vec<Duration>,
    pub timeout: Duration,
}

fn env_parsed<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the environment, applying defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_parsed(ENV_HOST, IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port = env_parsed(ENV_PORT, 8000u16)?;
        let site_url = env_parsed(ENV_SITE_URL, Url::parse(DEFAULT_SITE_URL).expect("valid URL"))?;

        let processor = ProcessorConfig {
            secret_key: std::env::var(ENV_PROCESSOR_SECRET_KEY).unwrap_or_default(),
            public_key: std::env::var(ENV_PROCESSOR_PUBLIC_KEY).unwrap_or_default(),
            base_url: env_parsed(
                ENV_PROCESSOR_BASE_URL,
                Url::parse(DEFAULT_PROCESSOR_BASE_URL).expect("valid URL"),
            )?,
            timeout: Duration::from_secs(env_parsed(ENV_PROCESSOR_TIMEOUT_SECONDS, 30u64)?),
        };

        let rate_limit = RateLimitConfig {
            window: Duration::from_secs(env_parsed(ENV_RATE_LIMIT_WINDOW_SECONDS, 60u64)?),
            max_requests: env_parsed(ENV_RATE_LIMIT_MAX, 60usize)?,
        };

        let webhooks = WebhookConfig {
            max_attempts: env_parsed(ENV_WEBHOOK_MAX_ATTEMPTS, 3u32)?,
            retry_delays: parse_delays(
                &std::env::var(ENV_WEBHOOK_RETRY_DELAYS).unwrap_or_else(|_| "1,5,25".to_string()),
            )?,
            timeout: Duration::from_secs(env_parsed(ENV_WEBHOOK_TIMEOUT_SECONDS, 15u64)?),
        };

        Ok(Config {
            host,
            port,
            site_url,
            processor,
            rate_limit,
            webhooks,
        })
    }
}

/// Parse a comma-separated list of back-off delays in seconds.
fn parse_delays(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::Invalid {
                    var: ENV_WEBHOOK_RETRY_DELAYS,
                    message: format!("{}: {}", s, e),
                })
        })
        .collect()
}
