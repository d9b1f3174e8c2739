//! Binary entrypoint: loads `.env`, initializes tracing and serves the router on Shuttle.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "nudge_pipeline=info,gateway=info,pipeline=info,intervention=info,relay=info,tower_http=warn";

/// `LOG_FORMAT=json` switches to structured output; anything else stays compact.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // the platform may have installed a subscriber already
    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    let _ = dotenvy::dotenv();
    init_tracing();

    let router = nudge_pipeline::app()?;
    Ok(router.into())
}
