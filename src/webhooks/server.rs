//! Admission webhook server.
//!
//! Provides HTTP endpoints for the mutating admission webhooks:
//! - `/mutate-pod` - audit log PVC for API server pods
//! - `/mutate-configmap` - audit log rotation flags in the KAS config
//!
//! To enable webhooks:
//! 1. Issue a serving certificate for the webhook service
//! 2. Create a MutatingWebhookConfiguration pointing at these paths
//! 3. Mount the TLS certificate secret to the operator pod at /etc/webhook/certs/
//!
//! The webhook server starts automatically when certificates are present.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::post,
};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::client::PersistenceKubeClient;
use crate::controller::error::Result;
use crate::health::HealthState;
use crate::webhooks::{configmap, pod};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;

const POD_WEBHOOK: &str = "pod";
const CONFIGMAP_WEBHOOK: &str = "configmap";

type ReviewResponse = (StatusCode, Json<AdmissionReview<DynamicObject>>);

/// Shared state for webhook handlers
pub struct WebhookState {
    pub kube: Arc<dyn PersistenceKubeClient>,
    pub health_state: Option<Arc<HealthState>>,
}

impl WebhookState {
    pub fn new(kube: Arc<dyn PersistenceKubeClient>, health_state: Option<Arc<HealthState>>) -> Self {
        Self { kube, health_state }
    }

    fn record(&self, webhook: &str, outcome: &str) {
        if let Some(ref health_state) = self.health_state {
            health_state.metrics.record_admission(webhook, outcome);
        }
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-pod", post(mutate_pod_handler))
        .route("/mutate-configmap", post(mutate_configmap_handler))
        .with_state(state)
}

/// Pod mutation handler
pub async fn mutate_pod_handler(
    State(state): State<Arc<WebhookState>>,
    payload: std::result::Result<Json<AdmissionReview<DynamicObject>>, JsonRejection>,
) -> ReviewResponse {
    let request = match admission_request(&state, POD_WEBHOOK, payload) {
        Ok(request) => request,
        Err(invalid) => return invalid,
    };
    if request.kind.kind != "Pod" || request.operation != Operation::Create {
        state.record(POD_WEBHOOK, "allowed");
        return allow(&request);
    }
    let pod: Pod = match decode_object(&state, POD_WEBHOOK, &request) {
        Ok(pod) => pod,
        Err(rejected) => return rejected,
    };

    let result = pod::admit_pod(
        state.kube.as_ref(),
        &request.operation,
        request.namespace.as_deref(),
        &pod,
    )
    .await;
    respond(&state, POD_WEBHOOK, &request, result)
}

/// Config map mutation handler
pub async fn mutate_configmap_handler(
    State(state): State<Arc<WebhookState>>,
    payload: std::result::Result<Json<AdmissionReview<DynamicObject>>, JsonRejection>,
) -> ReviewResponse {
    let request = match admission_request(&state, CONFIGMAP_WEBHOOK, payload) {
        Ok(request) => request,
        Err(invalid) => return invalid,
    };
    if request.kind.kind != "ConfigMap"
        || !matches!(request.operation, Operation::Create | Operation::Update)
    {
        state.record(CONFIGMAP_WEBHOOK, "allowed");
        return allow(&request);
    }
    let config_map: ConfigMap = match decode_object(&state, CONFIGMAP_WEBHOOK, &request) {
        Ok(config_map) => config_map,
        Err(rejected) => return rejected,
    };

    let result = configmap::admit_configmap(
        state.kube.as_ref(),
        &request.operation,
        request.namespace.as_deref(),
        &config_map,
    )
    .await;
    respond(&state, CONFIGMAP_WEBHOOK, &request, result)
}

/// Unwrap the request from a review, answering 400 when the review is malformed.
fn admission_request(
    state: &WebhookState,
    webhook: &str,
    payload: std::result::Result<Json<AdmissionReview<DynamicObject>>, JsonRejection>,
) -> std::result::Result<AdmissionRequest<DynamicObject>, ReviewResponse> {
    let invalid = |message: String| {
        error!(webhook = %webhook, error = %message, "Failed to extract admission request");
        state.record(webhook, "invalid");
        (
            StatusCode::BAD_REQUEST,
            Json(AdmissionResponse::invalid(format!("Invalid AdmissionReview: {message}")).into_review()),
        )
    };

    let Json(review) = payload.map_err(|e| invalid(e.body_text()))?;
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => return Err(invalid(e.to_string())),
    };

    debug!(
        webhook = %webhook,
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );
    Ok(request)
}

/// Decode the submitted object, rejecting the request with code 400 when absent or malformed.
fn decode_object<K: kube::Resource<DynamicType = ()> + DeserializeOwned>(
    state: &WebhookState,
    webhook: &str,
    request: &AdmissionRequest<DynamicObject>,
) -> std::result::Result<K, ReviewResponse> {
    let decoded = match &request.object {
        Some(obj) => obj.clone().try_parse::<K>().map_err(|e| e.to_string()),
        None => Err("missing object in request".to_string()),
    };
    decoded.map_err(|message| {
        warn!(webhook = %webhook, uid = %request.uid, error = %message, "Undecodable admission object");
        state.record(webhook, "invalid");
        error_response(request, 400, message)
    })
}

/// Turn a mutation result into an admission response.
fn respond(
    state: &WebhookState,
    webhook: &str,
    request: &AdmissionRequest<DynamicObject>,
    result: Result<Option<json_patch::Patch>>,
) -> ReviewResponse {
    let uid = &request.uid;
    match result {
        Ok(Some(patch)) if !patch.0.is_empty() => {
            let ops = patch.0.len();
            match AdmissionResponse::from(request).with_patch(patch) {
                Ok(response) => {
                    info!(webhook = %webhook, uid = %uid, ops, "Admission request mutated");
                    state.record(webhook, "patched");
                    (StatusCode::OK, Json(response.into_review()))
                }
                Err(e) => {
                    error!(webhook = %webhook, uid = %uid, error = %e, "Failed to serialize patch");
                    state.record(webhook, "error");
                    error_response(request, 500, format!("patch serialization error: {e}"))
                }
            }
        }
        Ok(_) => {
            debug!(webhook = %webhook, uid = %uid, "Admission request allowed unchanged");
            state.record(webhook, "allowed");
            allow(request)
        }
        Err(e) => {
            error!(webhook = %webhook, uid = %uid, error = %e, "Admission mutation failed");
            state.record(webhook, "error");
            error_response(request, 500, e.to_string())
        }
    }
}

fn allow(request: &AdmissionRequest<DynamicObject>) -> ReviewResponse {
    (
        StatusCode::OK,
        Json(AdmissionResponse::from(request).into_review()),
    )
}

/// Error response carrying an HTTP-style code in the admission status.
fn error_response(
    request: &AdmissionRequest<DynamicObject>,
    code: u16,
    message: String,
) -> ReviewResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    (StatusCode::OK, Json(response.into_review()))
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    /// Server error
    #[error("Webhook server error: {0}")]
    Server(String),
}

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:9443 and serves the mutation endpoints.
/// TLS certificates are loaded from the paths specified.
///
/// # Arguments
/// * `kube` - Object-store client
/// * `health_state` - Optional health state for admission metrics
/// * `cert_path` - Path to TLS certificate file (PEM format)
/// * `key_path` - Path to TLS private key file (PEM format)
pub async fn run_webhook_server(
    kube: Arc<dyn PersistenceKubeClient>,
    health_state: Option<Arc<HealthState>>,
    cert_path: &str,
    key_path: &str,
) -> std::result::Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let state = Arc::new(WebhookState::new(kube, health_state));
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
