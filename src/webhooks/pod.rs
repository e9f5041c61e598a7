//! Pod mutation for API server pods.
//!
//! On pod creation in a hosted control plane namespace, gives every API server
//! pod its own audit log PVC and points the pod's `logs` volume at it. The pod
//! name is fixed here (from `generateName` if needed) because the PVC name is
//! derived from it and must exist before the pod is scheduled.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::admission::Operation;
use rand::Rng;
use tracing::{debug, info};

use crate::client::{CreateOutcome, PersistenceKubeClient, patch_from};
use crate::controller::error::{Error, Result};
use crate::crd::{AuditLogPersistenceConfigSpec, StorageConfig};
use crate::resources::common::{
    LOGS_VOLUME_NAME, has_api_server_label, has_api_server_name, is_control_plane_namespace,
    pvc_name, replica_set_owner,
};
use crate::resources::generate_audit_log_pvc;
use crate::resources::pvc::pvc_volume_source;

/// Length of the random suffix appended to `generateName`.
pub const NAME_SUFFIX_LEN: usize = 5;

/// Alphabet of generated name suffixes: lowercase alphanumerics without
/// vowels and easily confused characters, as the API server uses.
pub const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Decide on and compute the mutation for a pod admission request.
///
/// Returns `Ok(None)` when the pod is not ours to mutate and `Ok(Some(patch))`
/// with the JSON patch from the submitted pod to the mutated one otherwise.
pub async fn admit_pod(
    kube: &dyn PersistenceKubeClient,
    operation: &Operation,
    namespace: Option<&str>,
    pod: &Pod,
) -> Result<Option<json_patch::Patch>> {
    if *operation != Operation::Create {
        return Ok(None);
    }
    let Some(namespace) = namespace
        .or(pod.metadata.namespace.as_deref())
        .filter(|ns| !ns.is_empty())
    else {
        debug!("Pod admission without namespace, allowing unchanged");
        return Ok(None);
    };
    if !has_api_server_name(
        pod.metadata.name.as_deref(),
        pod.metadata.generate_name.as_deref(),
    ) || !has_api_server_label(pod.metadata.labels.as_ref())
    {
        return Ok(None);
    }

    match kube.get_namespace(namespace).await? {
        Some(ns) if is_control_plane_namespace(&ns) => {}
        _ => return Ok(None),
    }
    let Some(config) = kube.get_persistence_config().await? else {
        return Ok(None);
    };
    let spec = config.spec.with_defaults();
    if !spec.is_enabled() {
        return Ok(None);
    }

    let mut mutated = pod.clone();
    mutate_pod(kube, namespace, &mut mutated, &spec).await?;
    Ok(Some(patch_from(pod, &mutated)?))
}

/// Materialise the pod name, ensure its audit log PVC and wire the `logs` volume.
pub async fn mutate_pod(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    pod: &mut Pod,
    spec: &AuditLogPersistenceConfigSpec,
) -> Result<()> {
    let pod_name = materialize_name(pod, &mut rand::thread_rng())?;
    let claim_name = pvc_name(&pod_name);
    let owner = replica_set_owner(pod.metadata.owner_references.as_deref());

    ensure_pvc(kube, namespace, &claim_name, &spec.storage, owner.as_ref()).await?;
    wire_logs_volume(pod, &claim_name);

    info!(
        pod = %pod_name,
        namespace = %namespace,
        pvc = %claim_name,
        owner = ?owner.as_ref().map(|o| &o.name),
        "Wired audit log PVC into API server pod"
    );
    Ok(())
}

/// Fix the pod's final name, generating one from `generateName` if needed.
pub fn materialize_name<R: Rng + ?Sized>(pod: &mut Pod, rng: &mut R) -> Result<String> {
    if let Some(name) = pod.metadata.name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    let Some(generate_name) = pod
        .metadata
        .generate_name
        .as_deref()
        .filter(|n| !n.is_empty())
    else {
        return Err(Error::MissingField(
            "pod has neither metadata.name nor metadata.generateName".to_string(),
        ));
    };

    let name = format!("{generate_name}{}", random_suffix(rng, NAME_SUFFIX_LEN));
    pod.metadata.name = Some(name.clone());
    pod.metadata.generate_name = None;
    Ok(name)
}

/// Random string drawn from [`NAME_SUFFIX_ALPHABET`].
pub fn random_suffix<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..NAME_SUFFIX_ALPHABET.len());
            NAME_SUFFIX_ALPHABET.get(idx).copied().map_or('x', char::from)
        })
        .collect()
}

/// Create the PVC, or adopt an existing one that has no owner yet.
async fn ensure_pvc(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    claim_name: &str,
    storage: &StorageConfig,
    owner: Option<&OwnerReference>,
) -> Result<()> {
    let pvc = generate_audit_log_pvc(claim_name, namespace, storage, owner);
    match kube.create_pvc(namespace, &pvc).await? {
        CreateOutcome::Created => {
            debug!(pvc = %claim_name, namespace = %namespace, "Created audit log PVC");
            Ok(())
        }
        CreateOutcome::AlreadyExists => {
            let Some(existing) = kube.get_pvc(namespace, claim_name).await? else {
                return Err(Error::Transient(format!(
                    "PVC {namespace}/{claim_name} reported as existing but not found"
                )));
            };
            adopt_pvc(kube, namespace, &existing, owner).await
        }
    }
}

async fn adopt_pvc(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    existing: &PersistentVolumeClaim,
    owner: Option<&OwnerReference>,
) -> Result<()> {
    let has_owners = existing
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|o| !o.is_empty());
    let Some(owner) = owner.filter(|_| !has_owners) else {
        return Ok(());
    };

    let mut modified = existing.clone();
    modified.metadata.owner_references = Some(vec![owner.clone()]);
    let patch = patch_from(existing, &modified)?;
    let name = existing.metadata.name.as_deref().unwrap_or_default();
    kube.patch_pvc(namespace, name, &patch).await?;
    info!(pvc = %name, namespace = %namespace, replica_set = %owner.name, "Adopted existing audit log PVC");
    Ok(())
}

/// Point the `logs` volume at the PVC, adding the volume if missing.
pub fn wire_logs_volume(pod: &mut Pod, claim_name: &str) {
    let volume = Volume {
        name: LOGS_VOLUME_NAME.to_string(),
        persistent_volume_claim: Some(pvc_volume_source(claim_name)),
        ..Default::default()
    };
    let volumes = pod
        .spec
        .get_or_insert_with(Default::default)
        .volumes
        .get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == LOGS_VOLUME_NAME) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}
