use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{
    BuildError as PrometheusBuildError, PrometheusBuilder, PrometheusHandle,
};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use twi_hook_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] PrometheusBuildError),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output for development and tests,
/// JSON lines in production. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_timer(UtcTime::rfc_3339());

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.environment {
        Environment::Development | Environment::Test => registry
            .with(base.event_format(tracing_fmt::format().pretty()))
            .try_init()?,
        Environment::Production => registry.with(base.json()).try_init()?,
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once per process and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = METRICS_HANDLE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *slot = Some(handle.clone());
    drop(slot);

    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    describe_counter!(
        "hub_requests_total",
        "Count of subscribe/unsubscribe requests sent to the hub, labelled by mode and result"
    );
    describe_counter!(
        "webhook_challenges_total",
        "Count of hub verification requests answered, labelled by mode and result"
    );
    describe_counter!(
        "webhook_notifications_total",
        "Count of notification deliveries received, labelled by topic and result"
    );
    describe_counter!(
        "webhook_handler_panics_total",
        "Count of event handlers that panicked during dispatch, labelled by topic"
    );
    describe_histogram!(
        "webhook_dispatch_latency_seconds",
        "Latency in seconds from receiving a notification to finishing dispatch"
    );
    describe_counter!(
        "subscription_renewals_total",
        "Count of subscription renewals attempted, labelled by result"
    );
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

/// Recorder output plus build info and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = write!(
        body,
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        build_git_sha()
    );
    body
}
