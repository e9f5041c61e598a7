//! Snapshot retention.
//!
//! Two passes run after each new snapshot: one bounded by the per-pod count
//! (snapshots of one PVC) and one by the per-namespace count. Each pass
//! deletes the oldest snapshots by creation timestamp until the count fits.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::client::PersistenceKubeClient;
use crate::controller::error::Result;
use crate::crd::VolumeSnapshot;
use crate::resources::common::{namespace_snapshot_selector, pvc_snapshot_selector};

/// Snapshots deleted by one retention run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Deleted by the per-pod pass
    pub pod_scope: Vec<String>,
    /// Deleted by the per-namespace pass
    pub namespace_scope: Vec<String>,
}

/// Pick the snapshots to delete so that at most `keep` remain.
///
/// Oldest first by creation timestamp; snapshots without one sort first.
/// The sort is stable, so equal timestamps keep their listing order.
pub fn select_for_deletion(mut snapshots: Vec<VolumeSnapshot>, keep: usize) -> Vec<VolumeSnapshot> {
    if snapshots.len() <= keep {
        return Vec::new();
    }
    snapshots.sort_by_key(|s| s.metadata.creation_timestamp.as_ref().map(|t| t.0));
    let excess = snapshots.len() - keep;
    snapshots.truncate(excess);
    snapshots
}

/// Enforce both retention bounds for the snapshots of `pvc_name`.
///
/// Snapshots that vanish before deletion are ignored; any other delete error
/// stops the run and is returned.
pub async fn enforce_retention(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    pvc_name: &str,
    per_pod: usize,
    per_namespace: usize,
) -> Result<RetentionReport> {
    let pod_scope = prune(kube, namespace, &pvc_snapshot_selector(pvc_name), per_pod).await?;
    let namespace_scope = prune(
        kube,
        namespace,
        &namespace_snapshot_selector(namespace),
        per_namespace,
    )
    .await?;

    Ok(RetentionReport {
        pod_scope,
        namespace_scope,
    })
}

async fn prune(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    selector: &str,
    keep: usize,
) -> Result<Vec<String>> {
    let snapshots = kube.list_snapshots(namespace, selector).await?;
    let total = snapshots.len();
    let doomed = select_for_deletion(snapshots, keep);
    if doomed.is_empty() {
        return Ok(Vec::new());
    }

    info!(
        namespace = %namespace,
        selector = %selector,
        total,
        keep,
        deleting = doomed.len(),
        "Deleting snapshots over retention"
    );

    let mut deleted = Vec::with_capacity(doomed.len());
    for snapshot in doomed {
        let name = snapshot.name_any();
        if kube.delete_snapshot(namespace, &name).await? {
            deleted.push(name);
        } else {
            debug!(snapshot = %name, "Snapshot already gone");
        }
    }
    Ok(deleted)
}
