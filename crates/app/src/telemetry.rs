use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use invoice_sync_util::{AppConfig, Environment};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

static TRACING_READY: OnceLock<()> = OnceLock::new();
static METRICS: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

enum Kind {
    Counter,
    Histogram,
}

const DESCRIPTIONS: &[(Kind, &str, &str)] = &[
    (Kind::Counter, "webhook_ingress_total", "Authenticated webhook deliveries by provider"),
    (Kind::Counter, "webhook_invalid_signature_total", "Webhook deliveries rejected for a bad signature"),
    (Kind::Histogram, "webhook_ack_latency_seconds", "Seconds taken to acknowledge a webhook delivery"),
    (Kind::Counter, "normalizer_errors_total", "Payloads or single logs that failed normalization by provider"),
    (Kind::Counter, "normalizer_events_total", "Canonical events produced by provider and event"),
    (Kind::Counter, "sync_outcomes_total", "Lifecycle apply outcomes by event and outcome"),
    (Kind::Counter, "sync_retries_total", "Retryable apply failures that were retried"),
    (Kind::Counter, "sync_abandoned_total", "Events given up after exhausting retries"),
    (Kind::Counter, "queue_enqueue_failures_total", "Events dropped at a full or closed partition"),
    (Kind::Counter, "reconcile_logs_total", "Logs replayed by reconciliation by result"),
    (Kind::Counter, "reconcile_runs_total", "Reconciliation runs by final status"),
    (Kind::Counter, "reconcile_retries_total", "Replayed logs retried after a retryable failure"),
];

fn git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output outside production, JSON
/// lines in production. Repeated calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_timer(UtcTime::rfc_3339());
    let output = match config.environment {
        Environment::Production => base.json().boxed(),
        Environment::Development | Environment::Test => {
            base.event_format(tracing_fmt::format().pretty()).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()?;

    TRACING_READY.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once per process and hands out clones of
/// its handle afterwards.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = METRICS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    for (kind, name, description) in DESCRIPTIONS {
        match kind {
            Kind::Counter => describe_counter!(*name, *description),
            Kind::Histogram => describe_histogram!(*name, *description),
        }
    }
    STARTED_AT.get_or_init(Instant::now);

    *slot = Some(handle.clone());
    Ok(handle)
}

/// Recorder output followed by the build and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    // Writing into a String cannot fail.
    let _ = write!(
        body,
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        git_sha()
    );
    body
}
