//! Nudge pipeline: security gateway, behavior-pattern detection, response enhancement,
//! feedback capture and intervention delivery for a chat product.

pub mod api;
pub mod config;
pub mod error;
pub mod intervention;
pub mod metrics;
pub mod pipeline;
pub mod relay;
pub mod security;
pub mod services;
pub mod usage;

pub use crate::api::{router, AppState};
pub use crate::config::GatewayConfig;

use axum::Router;
use tracing::info;

/// Build the application from `config/gateway.toml` (or `GATEWAY_CONFIG_PATH`) plus env.
pub fn app() -> anyhow::Result<Router> {
    build_app(GatewayConfig::load()?)
}

pub fn build_app(config: GatewayConfig) -> anyhow::Result<Router> {
    info!(
        target: "gateway",
        environment = ?config.environment,
        origins = config.cors_origins.len(),
        remote_scoring = config.services.scoring_url.is_some(),
        relay = config.webhook_base_url.is_some(),
        trusted_proxy_hops = config.trusted_proxy_hops,
        "building router"
    );
    let state = AppState::from_config(config)?;
    Ok(router(state))
}
