//! audit-log-operator library crate
//!
//! Persists the audit logs of hosted control plane API servers: a mutating
//! webhook gives every API server pod its own PVC, and a controller snapshots
//! that PVC when the API server crashes.

pub mod client;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod webhooks;

pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use client::PersistenceKubeClient;
use controller::context::Context;
use controller::snapshot_reconciler::{error_policy, reconcile};
use resources::common::api_server_pod_selector;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watcher configuration for the pod controller.
///
/// Only API server pods are watched; the label selector is applied by the
/// API server so other pods never reach the reconciler.
fn pod_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(&api_server_pod_selector())
        .any_semantic()
}

/// Run the snapshot controller (cluster-wide).
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    kube: Arc<dyn PersistenceKubeClient>,
    health_state: Option<Arc<HealthState>>,
) {
    run_controller_scoped(client, kube, health_state, None).await
}

/// Run the snapshot controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches pods in that namespace.
/// When `namespace` is `None`, watches pods cluster-wide.
pub async fn run_controller_scoped(
    client: Client,
    kube: Arc<dyn PersistenceKubeClient>,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(scope = %scope_msg, "Starting audit log snapshot controller");

    let ctx = Arc::new(Context::new(kube, health_state));

    let pods: Api<Pod> = scoped_api(client, namespace);

    Controller::new(pods, pod_watcher_config())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(pod = %obj.name, namespace = ?obj.namespace, "Reconciled");
                }
                Err(e) => {
                    // Pods deleted between the watch event and the reconcile
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    info!("Snapshot controller stopped");
}
