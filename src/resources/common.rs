//! Names, labels and selectors shared by the webhooks and the controller.
//!
//! These strings are read by other components of the hosted control plane and
//! by operators inspecting snapshots, so they must not change.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// Namespace label marking a hosted control plane namespace
pub const CONTROL_PLANE_NAMESPACE_LABEL: &str = "hypershift.openshift.io/hosted-control-plane";

/// Pod label key selecting API server pods
pub const APP_LABEL: &str = "app";
/// Value of [`APP_LABEL`] on API server pods
pub const API_SERVER_APP: &str = "kube-apiserver";
/// Container whose restarts trigger snapshots
pub const API_SERVER_CONTAINER: &str = "kube-apiserver";
/// Name prefix of API server pods (the deployment name)
pub const API_SERVER_NAME_PREFIX: &str = "kube-apiserver";

/// Prefix of the per-pod audit log PersistentVolumeClaim
pub const PVC_NAME_PREFIX: &str = "kas-audit-logs-";
/// Pod volume holding the audit logs
pub const LOGS_VOLUME_NAME: &str = "logs";

/// Restart count of the API server container last seen by the controller
pub const LAST_OBSERVED_RESTART_COUNT_ANNOTATION: &str =
    "hypershift.openshift.io/last-observed-restart-count";
/// RFC 3339 time of the last snapshot taken for the pod
pub const LAST_SNAPSHOT_TIME_ANNOTATION: &str = "hypershift.openshift.io/last-snapshot-time";

/// Snapshot label holding the source PVC name
pub const SNAPSHOT_PVC_LABEL: &str = "hypershift.openshift.io/audit-logs-pvc";
/// Snapshot label holding the pod name
pub const SNAPSHOT_POD_LABEL: &str = "hypershift.openshift.io/audit-logs-pod";
/// Snapshot label holding the control plane namespace
pub const SNAPSHOT_NAMESPACE_LABEL: &str = "hypershift.openshift.io/hosted-control-plane-namespace";

/// Whether a namespace opted in as a hosted control plane namespace.
pub fn is_control_plane_namespace(namespace: &Namespace) -> bool {
    namespace
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CONTROL_PLANE_NAMESPACE_LABEL))
        .is_some_and(|value| value == "true")
}

/// Whether pod labels select an API server pod.
pub fn has_api_server_label(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|labels| labels.get(APP_LABEL))
        .is_some_and(|value| value == API_SERVER_APP)
}

/// Whether a pod name or generateName belongs to the API server deployment.
pub fn has_api_server_name(name: Option<&str>, generate_name: Option<&str>) -> bool {
    [name, generate_name]
        .into_iter()
        .flatten()
        .any(|n| n.starts_with(API_SERVER_NAME_PREFIX))
}

/// Name of the audit log PVC for a pod.
pub fn pvc_name(pod_name: &str) -> String {
    format!("{PVC_NAME_PREFIX}{pod_name}")
}

/// The first ReplicaSet among a pod's owner references.
pub fn replica_set_owner(owners: Option<&[OwnerReference]>) -> Option<OwnerReference> {
    owners?.iter().find(|o| o.kind == "ReplicaSet").cloned()
}

/// Label selector for snapshots of one PVC.
pub fn pvc_snapshot_selector(pvc_name: &str) -> String {
    format!("{SNAPSHOT_PVC_LABEL}={pvc_name}")
}

/// Label selector for snapshots of one control plane namespace.
pub fn namespace_snapshot_selector(namespace: &str) -> String {
    format!("{SNAPSHOT_NAMESPACE_LABEL}={namespace}")
}

/// Label selector used by the controller's pod watch.
pub fn api_server_pod_selector() -> String {
    format!("{APP_LABEL}={API_SERVER_APP}")
}
