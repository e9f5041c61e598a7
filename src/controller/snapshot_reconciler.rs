//! Restart-triggered snapshot reconciler.
//!
//! Watches API server pods and snapshots a pod's audit log PVC when the
//! `kube-apiserver` container's restart count rises above the count recorded
//! on the pod, subject to the configured minimum interval. The edge detector
//! state lives in pod annotations, so operator restarts never cause duplicate
//! snapshots.
//!
//! ## Pass
//!
//! 1. Refetch the pod; stop if it is gone or not an API server pod
//! 2. Stop unless the namespace is opted in and the feature and snapshots are enabled
//! 3. Compare the container restart count with the recorded count
//! 4. Record the new count (always, even when the snapshot is then skipped)
//! 5. Apply the minimum interval gate
//! 6. Snapshot the PVC, record the snapshot time, enforce retention

use std::sync::Arc;
use std::time::Instant;

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::core::v1::Pod;
use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::client::{PersistenceKubeClient, PodEvent, annotations_patch};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::retention::{RetentionReport, enforce_retention};
use crate::crd::AuditLogPersistenceConfigSpec;
use crate::resources::common::{
    API_SERVER_CONTAINER, LAST_OBSERVED_RESTART_COUNT_ANNOTATION, LAST_SNAPSHOT_TIME_ANNOTATION,
    has_api_server_label, is_control_plane_namespace, pvc_name,
};
use crate::resources::generate_snapshot;

/// Reason for a Normal event after a snapshot was taken
pub const EVENT_SNAPSHOT_CREATED: &str = "AuditLogSnapshotCreated";
/// Reason for a Warning event when retention could not finish
pub const EVENT_RETENTION_FAILED: &str = "SnapshotRetentionFailed";

/// RFC 3339 layout written to the snapshot time annotation.
const RFC3339_SECONDS: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Why a pass stopped before looking at restart counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    PodNotFound,
    NotApiServerPod,
    NamespaceNotOptedIn,
    ConfigNotFound,
    FeatureDisabled,
    SnapshotsDisabled,
}

/// Result of one reconcile pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// A precondition did not hold
    Skipped(SkipReason),
    /// The restart count did not rise
    NoRestart { restart_count: i32, last_observed: i32 },
    /// A restart was recorded but the previous snapshot is too recent
    RateLimited {
        restart_count: i32,
        last_snapshot: Timestamp,
    },
    /// A restart was recorded but the pod has no audit log PVC
    PvcMissing { restart_count: i32, pvc_name: String },
    /// A snapshot was created
    Created {
        restart_count: i32,
        snapshot_name: String,
        /// `None` when retention failed and was only logged
        retention: Option<RetentionReport>,
    },
}

/// Reconcile an API server pod.
///
/// Called by the controller for every change of a watched pod.
pub async fn reconcile(obj: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    debug!(pod = %name, namespace = %namespace, "Reconciling pod");

    let outcome = reconcile_pod(ctx.kube.as_ref(), &namespace, &name, Timestamp::now()).await?;

    ctx.backoff.reset(&backoff_key(&namespace, &name));
    if let Some(ref health_state) = ctx.health_state {
        let metrics = &health_state.metrics;
        metrics.record_reconcile(&namespace, start_time.elapsed().as_secs_f64());
        if let SnapshotOutcome::Created { retention, .. } = &outcome {
            metrics.record_snapshot_created(&namespace);
            if let Some(report) = retention {
                metrics.record_snapshots_pruned(&namespace, "pod", report.pod_scope.len() as u64);
                metrics.record_snapshots_pruned(
                    &namespace,
                    "namespace",
                    report.namespace_scope.len() as u64,
                );
            }
        }
        health_state.touch_reconcile(Timestamp::now().as_second().max(0).unsigned_abs());
    }

    debug!(pod = %name, namespace = %namespace, outcome = ?outcome, "Reconcile finished");
    Ok(Action::await_change())
}

/// Error policy for the controller.
///
/// Every failure is retried with a per-pod exponential back-off (1s to 10s).
pub fn error_policy(obj: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace);
    }

    let delay = ctx.backoff.next_delay(&backoff_key(&namespace, &name));
    if error.is_retryable() {
        warn!(pod = %name, namespace = %namespace, error = %error, ?delay, "Retryable error, will retry");
    } else {
        error!(pod = %name, namespace = %namespace, error = %error, ?delay, "Reconcile failed");
    }
    Action::requeue(delay)
}

fn backoff_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Run one pass of the snapshot state machine for `namespace/name` at `now`.
pub async fn reconcile_pod(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    name: &str,
    now: Timestamp,
) -> Result<SnapshotOutcome> {
    let Some(mut pod) = kube.get_pod(namespace, name).await? else {
        return Ok(SnapshotOutcome::Skipped(SkipReason::PodNotFound));
    };
    if !has_api_server_label(pod.metadata.labels.as_ref()) {
        return Ok(SnapshotOutcome::Skipped(SkipReason::NotApiServerPod));
    }

    match kube.get_namespace(namespace).await? {
        Some(ns) if is_control_plane_namespace(&ns) => {}
        _ => return Ok(SnapshotOutcome::Skipped(SkipReason::NamespaceNotOptedIn)),
    }

    let Some(config) = kube.get_persistence_config().await? else {
        return Ok(SnapshotOutcome::Skipped(SkipReason::ConfigNotFound));
    };
    let spec = config.spec.with_defaults();
    if !spec.is_enabled() {
        return Ok(SnapshotOutcome::Skipped(SkipReason::FeatureDisabled));
    }
    if !spec.is_snapshots_enabled() {
        return Ok(SnapshotOutcome::Skipped(SkipReason::SnapshotsDisabled));
    }

    let restart_count = api_server_restart_count(&pod);
    let last_observed = match annotation(&pod, LAST_OBSERVED_RESTART_COUNT_ANNOTATION) {
        None => 0,
        Some(raw) => match raw.parse::<i32>() {
            Ok(count) => count,
            Err(e) => {
                debug!(
                    pod = %name,
                    value = %raw,
                    error = %e,
                    "Unparsable restart count annotation, resetting to 0"
                );
                let reset = set_annotation(LAST_OBSERVED_RESTART_COUNT_ANNOTATION, "0".to_string());
                if let Err(e) = patch_annotations(kube, &mut pod, reset).await {
                    warn!(pod = %name, error = %e, "Failed to reset restart count annotation");
                }
                0
            }
        },
    };

    if restart_count <= last_observed {
        return Ok(SnapshotOutcome::NoRestart {
            restart_count,
            last_observed,
        });
    }

    patch_annotations(
        kube,
        &mut pod,
        set_annotation(
            LAST_OBSERVED_RESTART_COUNT_ANNOTATION,
            restart_count.to_string(),
        ),
    )
    .await?;

    if let Some(last_snapshot) = last_snapshot_time(kube, &mut pod).await {
        match spec.min_interval() {
            Ok(min_interval) if now.duration_since(last_snapshot) < min_interval => {
                debug!(
                    pod = %name,
                    restart_count,
                    min_interval = %min_interval,
                    remaining = %remaining_interval(last_snapshot, min_interval, now),
                    "Skipping snapshot inside minimum interval"
                );
                return Ok(SnapshotOutcome::RateLimited {
                    restart_count,
                    last_snapshot,
                });
            }
            Ok(_) => {}
            Err(e) => {
                error!(pod = %name, error = %e, "Invalid minimum interval, taking snapshot anyway");
            }
        }
    }

    let pvc_name = pvc_name(name);
    if kube.get_pvc(namespace, &pvc_name).await?.is_none() {
        debug!(pod = %name, pvc = %pvc_name, "PVC not found for pod, skipping snapshot");
        return Ok(SnapshotOutcome::PvcMissing {
            restart_count,
            pvc_name,
        });
    }

    let snapshot = generate_snapshot(
        &pvc_name,
        name,
        namespace,
        &spec.snapshots.volume_snapshot_class_name,
        now,
    );
    let snapshot_name = snapshot.name_any();
    kube.create_snapshot(namespace, &snapshot).await?;

    patch_annotations(
        kube,
        &mut pod,
        set_annotation(
            LAST_SNAPSHOT_TIME_ANNOTATION,
            now.strftime(RFC3339_SECONDS).to_string(),
        ),
    )
    .await?;

    kube.publish_pod_event(
        &pod,
        PodEvent::normal(
            EVENT_SNAPSHOT_CREATED,
            "CreateSnapshot",
            format!("Created snapshot {snapshot_name} after restart {restart_count}"),
        ),
    )
    .await;

    let retention = match retain(kube, namespace, &pvc_name, &spec).await {
        Ok(report) => Some(report),
        Err(e @ Error::Internal(_)) => return Err(e),
        Err(e) => {
            warn!(pod = %name, namespace = %namespace, error = %e, "Failed to manage snapshot retention");
            kube.publish_pod_event(
                &pod,
                PodEvent::warning(EVENT_RETENTION_FAILED, "PruneSnapshots", e.to_string()),
            )
            .await;
            None
        }
    };

    info!(
        pod = %name,
        namespace = %namespace,
        snapshot = %snapshot_name,
        restart_count,
        previous_restart_count = last_observed,
        "Created audit log snapshot after API server restart"
    );

    Ok(SnapshotOutcome::Created {
        restart_count,
        snapshot_name,
        retention,
    })
}

async fn retain(
    kube: &dyn PersistenceKubeClient,
    namespace: &str,
    pvc_name: &str,
    spec: &AuditLogPersistenceConfigSpec,
) -> Result<RetentionReport> {
    let (per_pod, per_namespace) = spec.retention_counts()?;
    enforce_retention(kube, namespace, pvc_name, per_pod, per_namespace).await
}

/// Restart count of the API server container, 0 when not reported yet.
pub fn api_server_restart_count(pod: &Pod) -> i32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == API_SERVER_CONTAINER))
        .map(|c| c.restart_count)
        .unwrap_or(0)
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Parse the snapshot time annotation, dropping it when corrupt.
///
/// Returns `None` when there is no usable previous snapshot time.
async fn last_snapshot_time(kube: &dyn PersistenceKubeClient, pod: &mut Pod) -> Option<Timestamp> {
    let raw = annotation(pod, LAST_SNAPSHOT_TIME_ANNOTATION)?.to_string();
    if let Some(ts) = parse_rfc3339(&raw) {
        return Some(ts);
    }

    let name = pod.name_any();
    debug!(pod = %name, value = %raw, "Snapshot time annotation is not RFC 3339, removing it");
    let remove = |a: &mut std::collections::BTreeMap<String, String>| {
        a.remove(LAST_SNAPSHOT_TIME_ANNOTATION);
    };
    if let Err(e) = patch_annotations(kube, pod, remove).await {
        warn!(pod = %name, error = %e, "Failed to remove snapshot time annotation");
    }
    None
}

/// Parse a strict RFC 3339 timestamp: `YYYY-MM-DDTHH:MM:SS`, optional
/// fractional seconds, then `Z` or a `+HH:MM` / `-HH:MM` offset.
///
/// The generic `Timestamp` parser also takes a space separator, bracketed
/// time zone annotations and surrounding forms that are rejected here.
pub fn parse_rfc3339(raw: &str) -> Option<Timestamp> {
    let (date_time, rest) = (raw.get(..19)?, raw.get(19..)?);
    let shape_ok = date_time.bytes().enumerate().all(|(i, c)| match i {
        4 | 7 => c == b'-',
        10 => c == b'T',
        13 | 16 => c == b':',
        _ => c.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }

    let offset = match rest.strip_prefix('.') {
        Some(fraction) => {
            let digits = fraction.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            fraction.get(digits..)?
        }
        None => rest,
    };
    let offset_ok = offset == "Z"
        || (offset.len() == 6
            && offset.bytes().enumerate().all(|(i, c)| match i {
                0 => c == b'+' || c == b'-',
                3 => c == b':',
                _ => c.is_ascii_digit(),
            }));
    if !offset_ok {
        return None;
    }

    raw.parse::<Timestamp>().ok()
}

fn set_annotation(
    key: &'static str,
    value: String,
) -> impl FnOnce(&mut std::collections::BTreeMap<String, String>) {
    move |a| {
        a.insert(key.to_string(), value);
    }
}

/// Merge-patch the pod's annotations and mirror the change into `pod`.
///
/// Later patches are computed against the mirrored copy, so a failed patch
/// leaves `pod` as the server still has it.
async fn patch_annotations<F>(kube: &dyn PersistenceKubeClient, pod: &mut Pod, edit: F) -> Result<()>
where
    F: FnOnce(&mut std::collections::BTreeMap<String, String>),
{
    let mut annotations = pod.metadata.annotations.clone().unwrap_or_default();
    edit(&mut annotations);
    let Some(patch) = annotations_patch(pod, |a| *a = annotations.clone()) else {
        return Ok(());
    };

    let namespace = pod.namespace().unwrap_or_default();
    kube.patch_pod(&namespace, &pod.name_any(), &patch).await?;
    pod.metadata.annotations = Some(annotations);
    Ok(())
}

/// Minimum interval left before the next snapshot may be taken.
pub fn remaining_interval(
    last_snapshot: Timestamp,
    min_interval: SignedDuration,
    now: Timestamp,
) -> SignedDuration {
    (min_interval - now.duration_since(last_snapshot)).max(SignedDuration::ZERO)
}
