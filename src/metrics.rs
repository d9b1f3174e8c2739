use axum::{routing::get, Router};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder once; later calls share the handle.
    pub fn init() -> anyhow::Result<Self> {
        let handle = HANDLE.get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            describe();
            Ok::<_, anyhow::Error>(handle)
        })?;
        Ok(Self {
            handle: handle.clone(),
        })
    }

    /// `/metrics` in the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

fn describe() {
    describe_counter!("usage_events_total", "Pipeline calls recorded by the usage tracker");
    describe_histogram!("pipeline_duration_ms", "Orchestrator processing time in milliseconds");
    describe_histogram!("pipeline_patterns_detected", "Patterns returned by the scorer per call");
    describe_counter!("gateway_rate_limited_total", "Requests denied by rate admission");
    describe_counter!("gateway_csrf_rejected_total", "POST requests rejected by CSRF verification");
    describe_counter!("interventions_total", "Intervention state transitions, by kind");
    describe_counter!("relay_requests_total", "Webhook relay attempts, by outcome");
}
