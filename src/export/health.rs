use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "procdash";

/// Prometheus metrics for ingestion and broadcast health.
///
/// All metrics use the "procdash" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Snapshot rounds applied to the store.
    pub samples_ingested: Counter,
    /// Sampling rounds that failed before reaching the store.
    pub sample_errors: Counter,
    pub hosts_tracked: Gauge,
    pub processes_tracked: Gauge,
    /// Live points across every retained series.
    pub series_points: Gauge,
    pub ingest_round_duration: Histogram,
    /// Series rewritten by the compactor.
    pub compactions: Counter,

    // === Broadcast ===
    pub events_queued: Counter,
    pub batches_flushed: Counter,
    /// Events per flushed batch.
    pub batch_size: Histogram,
    /// Failed deliveries by reason (closed/full/io/encode).
    pub delivery_errors: CounterVec,
    pub subscribers: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_ingested = Counter::with_opts(
            Opts::new(
                "samples_ingested_total",
                "Total snapshot rounds applied to the store.",
            )
            .namespace(NAMESPACE),
        )?;
        let sample_errors = Counter::with_opts(
            Opts::new("sample_errors_total", "Total failed sampling rounds.").namespace(NAMESPACE),
        )?;
        let hosts_tracked = Gauge::with_opts(
            Opts::new("hosts_tracked", "Number of hosts with retained history.")
                .namespace(NAMESPACE),
        )?;
        let processes_tracked = Gauge::with_opts(
            Opts::new("processes_tracked", "Number of processes with retained history.")
                .namespace(NAMESPACE),
        )?;
        let series_points = Gauge::with_opts(
            Opts::new("series_points", "Live points across all retained series.")
                .namespace(NAMESPACE),
        )?;
        let ingest_round_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_round_duration_seconds",
                "Time to apply one snapshot round to the store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        let compactions = Counter::with_opts(
            Opts::new("compactions_total", "Total series rewritten by the compactor.")
                .namespace(NAMESPACE),
        )?;

        let events_queued = Counter::with_opts(
            Opts::new("events_queued_total", "Total events pushed to the broadcast queue.")
                .namespace(NAMESPACE),
        )?;
        let batches_flushed = Counter::with_opts(
            Opts::new("batches_flushed_total", "Total non-empty batches flushed.")
                .namespace(NAMESPACE),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Number of events per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0]),
        )?;
        let delivery_errors = CounterVec::new(
            Opts::new(
                "delivery_errors_total",
                "Total failed batch deliveries by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let subscribers = Gauge::with_opts(
            Opts::new("subscribers", "Number of connected subscribers.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(samples_ingested.clone()))?;
        registry.register(Box::new(sample_errors.clone()))?;
        registry.register(Box::new(hosts_tracked.clone()))?;
        registry.register(Box::new(processes_tracked.clone()))?;
        registry.register(Box::new(series_points.clone()))?;
        registry.register(Box::new(ingest_round_duration.clone()))?;
        registry.register(Box::new(compactions.clone()))?;

        registry.register(Box::new(events_queued.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(delivery_errors.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_ingested,
            sample_errors,
            hosts_tracked,
            processes_tracked,
            series_points,
            ingest_round_duration,
            compactions,
            events_queued,
            batches_flushed,
            batch_size,
            delivery_errors,
            subscribers,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
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

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
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
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.samples_ingested.inc();
        metrics.delivery_errors.with_label_values(&["closed"]).inc();
        metrics.batch_size.observe(3.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("procdash_samples_ingested_total 1"));
        assert!(text.contains("procdash_delivery_errors_total{reason=\"closed\"} 1"));
        assert!(text.contains("procdash_batch_size_count 1"));
    }

    #[tokio::test]
    async fn test_start_and_stop_on_ephemeral_port() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.start().await.expect("start");
        metrics.stop().await.expect("stop");
        // Stopping twice is a no-op.
        metrics.stop().await.expect("stop again");
    }
}
