//! Webhook module for mutating admission requests.
//!
//! This module provides MutatingAdmissionWebhooks for hosted control plane
//! namespaces:
//! - `pod`: per-pod audit log PVC for API server pods (CREATE)
//! - `configmap`: audit log rotation flags in the KAS config (CREATE, UPDATE)

pub mod configmap;
pub mod pod;
mod server;

pub use server::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, WebhookState,
    create_webhook_router, mutate_configmap_handler, mutate_pod_handler, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
