use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "loadtally";

/// Prometheus metrics for ingest, drain and loss accounting.
///
/// Counters are the source of truth for [`crate::aggregate::AggregatorStats`];
/// the HTTP endpoint is optional.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    /// Raw lines handed to ingest.
    pub records_ingested: IntCounter,
    /// Lines discarded for wrong arity, bad numbers or unusable keys.
    pub records_malformed: IntCounter,
    /// Samples whose bucket was already drained.
    pub records_late: IntCounter,
    /// Combines abandoned because the aggregator was cancelled.
    pub combines_abandoned: IntCounter,
    /// Drain invocations abandoned while waiting for the table lock.
    pub drains_abandoned: IntCounter,
    /// Buckets written to the sink.
    pub buckets_drained: IntCounter,
    /// Sum of request counts over drained buckets.
    pub requests_aggregated: IntCounter,
    /// Rows the sink failed to write.
    pub sink_write_errors: IntCounter,
    /// Buckets currently held in memory.
    pub live_buckets: IntGauge,
    /// Runs started and not yet ended.
    pub active_runs: IntGauge,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    Ok(IntCounter::with_opts(
        Opts::new(name, help).namespace(NAMESPACE),
    )?)
}

fn gauge(name: &str, help: &str) -> Result<IntGauge> {
    Ok(IntGauge::with_opts(
        Opts::new(name, help).namespace(NAMESPACE),
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_ingested = counter(
            "records_ingested_total",
            "Total raw result lines handed to ingest.",
        )?;
        let records_malformed = counter(
            "records_malformed_total",
            "Total result lines discarded as malformed.",
        )?;
        let records_late = counter(
            "records_late_total",
            "Total samples dropped because their second was already drained.",
        )?;
        let combines_abandoned = counter(
            "combines_abandoned_total",
            "Total combine tasks abandoned on cancellation.",
        )?;
        let drains_abandoned = counter(
            "drains_abandoned_total",
            "Total drain invocations abandoned while waiting for the table lock.",
        )?;
        let buckets_drained = counter(
            "buckets_drained_total",
            "Total statistics buckets written to the sink.",
        )?;
        let requests_aggregated = counter(
            "requests_aggregated_total",
            "Total requests covered by drained buckets.",
        )?;
        let sink_write_errors = counter(
            "sink_write_errors_total",
            "Total rows the sink failed to write.",
        )?;
        let live_buckets = gauge("live_buckets", "Statistics buckets currently in memory.")?;
        let active_runs = gauge("active_runs", "Runs started and not yet ended.")?;

        registry.register(Box::new(records_ingested.clone()))?;
        registry.register(Box::new(records_malformed.clone()))?;
        registry.register(Box::new(records_late.clone()))?;
        registry.register(Box::new(combines_abandoned.clone()))?;
        registry.register(Box::new(drains_abandoned.clone()))?;
        registry.register(Box::new(buckets_drained.clone()))?;
        registry.register(Box::new(requests_aggregated.clone()))?;
        registry.register(Box::new(sink_write_errors.clone()))?;
        registry.register(Box::new(live_buckets.clone()))?;
        registry.register(Box::new(active_runs.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            records_ingested,
            records_malformed,
            records_late,
            combines_abandoned,
            drains_abandoned,
            buckets_drained,
            requests_aggregated,
            sink_write_errors,
            live_buckets,
            active_runs,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
