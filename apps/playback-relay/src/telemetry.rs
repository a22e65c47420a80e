use anyhow::{Context, Result};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Installs the Prometheus recorder and the fmt subscriber. `RUST_LOG`
    /// overrides the default `info` filter.
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        describe_counter!("playback_relay_polls_total", "Playback polls issued upstream");
        describe_counter!(
            "playback_relay_poll_failures_total",
            "Polls that failed with a non rate-limit error"
        );
        describe_counter!(
            "playback_relay_rate_limited_total",
            "Upstream 429 responses seen while polling"
        );
        describe_counter!("playback_relay_refresh_total", "Token refresh attempts by outcome");
        describe_counter!("playback_relay_commands_total", "Viewer commands by outcome");

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}
