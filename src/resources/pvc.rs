//! Per-pod audit log PersistentVolumeClaim.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::crd::StorageConfig;

/// Build the audit log PVC for a pod.
///
/// The claim is owned by the pod's ReplicaSet (when known) rather than the
/// pod, so it survives pod restarts and is collected with the ReplicaSet.
pub fn generate_audit_log_pvc(
    name: &str,
    namespace: &str,
    storage: &StorageConfig,
    owner: Option<&OwnerReference>,
) -> PersistentVolumeClaim {
    let storage_class_name =
        (!storage.storage_class_name.is_empty()).then(|| storage.storage_class_name.clone());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            storage_class_name,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume source pointing at a PVC.
pub fn pvc_volume_source(claim_name: &str) -> PersistentVolumeClaimVolumeSource {
    PersistentVolumeClaimVolumeSource {
        claim_name: claim_name.to_string(),
        read_only: None,
    }
}
