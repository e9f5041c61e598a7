//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Port the health server listens on
pub const HEALTH_PORT: u16 = 8080;

/// Labels for per-namespace metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct NamespaceLabels {
    pub namespace: String,
}

impl EncodeLabelSet for NamespaceLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for snapshot pruning (retention scope)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PruneLabels {
    pub namespace: String,
    pub scope: String,
}

impl EncodeLabelSet for PruneLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("scope", self.scope.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for admission outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdmissionLabels {
    pub webhook: String,
    pub outcome: String,
}

impl EncodeLabelSet for AdmissionLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("webhook", self.webhook.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<NamespaceLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<NamespaceLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<NamespaceLabels, Histogram>,
    /// Snapshots created after an API server restart
    pub snapshots_created_total: Family<NamespaceLabels, Counter>,
    /// Snapshots deleted by retention
    pub snapshots_pruned_total: Family<PruneLabels, Counter>,
    /// Admission requests by webhook and outcome
    pub admissions_total: Family<AdmissionLabels, Counter>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<NamespaceLabels, Counter>::default();
        registry.register(
            "auditlog_reconciliations",
            "Total number of pod reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<NamespaceLabels, Counter>::default();
        registry.register(
            "auditlog_reconciliation_errors",
            "Total number of pod reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<NamespaceLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "auditlog_reconcile_duration_seconds",
            "Duration of pod reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let snapshots_created_total = Family::<NamespaceLabels, Counter>::default();
        registry.register(
            "auditlog_snapshots_created",
            "Audit log volume snapshots created after an API server restart",
            snapshots_created_total.clone(),
        );

        let snapshots_pruned_total = Family::<PruneLabels, Counter>::default();
        registry.register(
            "auditlog_snapshots_pruned",
            "Audit log volume snapshots deleted by retention",
            snapshots_pruned_total.clone(),
        );

        let admissions_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "auditlog_admissions",
            "Admission requests handled by the mutating webhooks",
            admissions_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            snapshots_created_total,
            snapshots_pruned_total,
            admissions_total,
            registry,
        }
    }

    fn ns(namespace: &str) -> NamespaceLabels {
        NamespaceLabels {
            namespace: namespace.to_string(),
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, duration_secs: f64) {
        let labels = Self::ns(namespace);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str) {
        self.reconciliation_errors_total
            .get_or_create(&Self::ns(namespace))
            .inc();
    }

    /// Record a created snapshot
    pub fn record_snapshot_created(&self, namespace: &str) {
        self.snapshots_created_total
            .get_or_create(&Self::ns(namespace))
            .inc();
    }

    /// Record snapshots deleted by one retention pass
    pub fn record_snapshots_pruned(&self, namespace: &str, scope: &str, count: u64) {
        let labels = PruneLabels {
            namespace: namespace.to_string(),
            scope: scope.to_string(),
        };
        self.snapshots_pruned_total
            .get_or_create(&labels)
            .inc_by(count);
    }

    /// Record an admission outcome ("allowed", "patched", "error", "invalid")
    pub fn record_admission(&self, webhook: &str, outcome: &str) {
        let labels = AdmissionLabels {
            webhook: webhook.to_string(),
            outcome: outcome.to_string(),
        };
        self.admissions_total.get_or_create(&labels).inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (webhook serving, controller running when leader)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Store the time of the last successful reconcile
    pub fn touch_reconcile(&self, epoch_secs: u64) {
        self.last_reconcile.store(epoch_secs, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
