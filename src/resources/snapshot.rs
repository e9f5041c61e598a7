//! VolumeSnapshot of a pod's audit log PVC.

use std::collections::BTreeMap;

use jiff::Timestamp;
use kube::api::ObjectMeta;

use crate::crd::{VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use crate::resources::common::{SNAPSHOT_NAMESPACE_LABEL, SNAPSHOT_POD_LABEL, SNAPSHOT_PVC_LABEL};

/// Timestamp suffix of snapshot names (UTC, sortable, DNS safe).
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Snapshot name for a PVC at `now`.
pub fn snapshot_name(pvc_name: &str, now: Timestamp) -> String {
    format!(
        "{pvc_name}-snapshot-{}",
        now.strftime(SNAPSHOT_TIMESTAMP_FORMAT)
    )
}

/// Labels attached to every snapshot; retention lists by them.
pub fn snapshot_labels(pvc_name: &str, pod_name: &str, namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SNAPSHOT_PVC_LABEL.to_string(), pvc_name.to_string()),
        (SNAPSHOT_POD_LABEL.to_string(), pod_name.to_string()),
        (SNAPSHOT_NAMESPACE_LABEL.to_string(), namespace.to_string()),
    ])
}

/// Build the snapshot of a pod's audit log PVC.
pub fn generate_snapshot(
    pvc_name: &str,
    pod_name: &str,
    namespace: &str,
    snapshot_class: &str,
    now: Timestamp,
) -> VolumeSnapshot {
    let volume_snapshot_class_name =
        (!snapshot_class.is_empty()).then(|| snapshot_class.to_string());

    VolumeSnapshot {
        metadata: ObjectMeta {
            name: Some(snapshot_name(pvc_name, now)),
            namespace: Some(namespace.to_string()),
            labels: Some(snapshot_labels(pvc_name, pod_name, namespace)),
            ..Default::default()
        },
        spec: VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(pvc_name.to_string()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name,
        },
        status: None,
    }
}
