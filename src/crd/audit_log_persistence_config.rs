//! AuditLogPersistenceConfig Custom Resource Definition.
//!
//! A cluster-scoped singleton (named `cluster`) that switches audit log
//! persistence on, sizes the per-pod log volumes, tunes the API server's
//! audit log rotation and controls crash-triggered snapshots.
//!
//! Fields left empty or zero in the stored object are filled in by
//! [`AuditLogPersistenceConfigSpec::apply_defaults`] on a local copy; the
//! stored object is never rewritten by the operator.

use jiff::SignedDuration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};

/// Name of the singleton configuration object.
pub const CONFIG_NAME: &str = "cluster";

/// Default size of each per-pod audit log volume.
pub const DEFAULT_STORAGE_SIZE: &str = "5Gi";
/// Default `--audit-log-maxsize` in megabytes.
pub const DEFAULT_AUDIT_LOG_MAX_SIZE: i32 = 200;
/// Default `--audit-log-maxbackup` file count.
pub const DEFAULT_AUDIT_LOG_MAX_BACKUP: i32 = 10;
/// Default minimum time between two snapshots of the same pod.
pub const DEFAULT_MIN_INTERVAL: &str = "1h";
/// Default number of snapshots kept per pod volume.
pub const DEFAULT_PER_POD_RETENTION: i32 = 10;
/// Default number of snapshots kept per namespace.
pub const DEFAULT_NAMESPACE_RETENTION: i32 = 50;

/// AuditLogPersistenceConfig configures audit log persistence for all
/// hosted control planes on the management cluster.
///
/// Example:
/// ```yaml
/// apiVersion: auditlogpersistence.hypershift.openshift.io/v1alpha1
/// kind: AuditLogPersistenceConfig
/// metadata:
///   name: cluster
/// spec:
///   enabled: true
///   storage:
///     size: 10Gi
///     storageClassName: gp3-csi
///   snapshots:
///     enabled: true
///     minInterval: 1h
///     perPodRetentionCount: 10
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "auditlogpersistence.hypershift.openshift.io",
    version = "v1alpha1",
    kind = "AuditLogPersistenceConfig",
    plural = "auditlogpersistenceconfigs",
    printcolumn = r#"{"name":"Enabled", "type":"boolean", "jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"Snapshots", "type":"boolean", "jsonPath":".spec.snapshots.enabled"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogPersistenceConfigSpec {
    /// Master switch for the feature (default: false).
    #[serde(default)]
    pub enabled: bool,

    /// Per-pod audit log volume settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Audit log rotation settings passed to the API server.
    #[serde(default)]
    pub audit_log: AuditLogConfig,

    /// Crash-triggered snapshot settings.
    #[serde(default)]
    pub snapshots: SnapshotConfig,
}

/// Storage settings for the per-pod audit log volume.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Requested volume size as a Kubernetes quantity (default: 5Gi).
    #[serde(default)]
    pub size: String,

    /// Storage class for the volume. Empty uses the cluster default.
    #[serde(default)]
    pub storage_class_name: String,
}

/// Audit log rotation settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogConfig {
    /// Maximum size in megabytes of an audit log file before rotation (default: 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i32>,

    /// Maximum number of rotated audit log files to keep (default: 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backup: Option<i32>,
}

/// Snapshot settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    /// Take a snapshot of the audit log volume when the API server crashes (default: false).
    #[serde(default)]
    pub enabled: bool,

    /// Minimum time between snapshots of the same pod, e.g. "1h" or "30m" (default: 1h).
    #[serde(default)]
    pub min_interval: String,

    /// Snapshots kept per pod volume (default: 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub per_pod_retention_count: Option<i32>,

    /// Snapshots kept per control plane namespace (default: 50).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub namespace_retention_count: Option<i32>,

    /// VolumeSnapshotClass for new snapshots. Empty uses the cluster default.
    #[serde(default)]
    pub volume_snapshot_class_name: String,
}

impl AuditLogPersistenceConfigSpec {
    /// Fill in every missing or zero field with its default.
    pub fn apply_defaults(&mut self) {
        if self.storage.size.is_empty() {
            self.storage.size = DEFAULT_STORAGE_SIZE.to_string();
        }

        if self.audit_log.max_size.is_none_or(|v| v == 0) {
            self.audit_log.max_size = Some(DEFAULT_AUDIT_LOG_MAX_SIZE);
        }
        if self.audit_log.max_backup.is_none_or(|v| v == 0) {
            self.audit_log.max_backup = Some(DEFAULT_AUDIT_LOG_MAX_BACKUP);
        }

        if self.snapshots.min_interval.is_empty() {
            self.snapshots.min_interval = DEFAULT_MIN_INTERVAL.to_string();
        }
        if self.snapshots.per_pod_retention_count.is_none_or(|v| v == 0) {
            self.snapshots.per_pod_retention_count = Some(DEFAULT_PER_POD_RETENTION);
        }
        if self.snapshots.namespace_retention_count.is_none_or(|v| v == 0) {
            self.snapshots.namespace_retention_count = Some(DEFAULT_NAMESPACE_RETENTION);
        }
    }

    /// Return a defaulted copy, leaving `self` untouched.
    pub fn with_defaults(&self) -> Self {
        let mut spec = self.clone();
        spec.apply_defaults();
        spec
    }

    /// Whether audit log persistence is switched on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether crash-triggered snapshots are switched on.
    pub fn is_snapshots_enabled(&self) -> bool {
        self.snapshots.enabled
    }

    /// Parse `snapshots.minInterval` ("1h", "30m", "1h30m", ...).
    pub fn min_interval(&self) -> Result<SignedDuration> {
        parse_duration(&self.snapshots.min_interval)
    }

    /// Per-pod and per-namespace retention counts.
    ///
    /// Fails with `Internal` when defaults were never applied and with
    /// `Validation` when a count is below 1, since keeping nothing would
    /// delete the snapshot that was just taken.
    pub fn retention_counts(&self) -> Result<(usize, usize)> {
        let per_pod = self.snapshots.per_pod_retention_count.ok_or_else(|| {
            Error::Internal("perPodRetentionCount is unset; defaults were not applied".to_string())
        })?;
        let per_namespace = self.snapshots.namespace_retention_count.ok_or_else(|| {
            Error::Internal(
                "namespaceRetentionCount is unset; defaults were not applied".to_string(),
            )
        })?;
        Ok((
            retention_count("perPodRetentionCount", per_pod)?,
            retention_count("namespaceRetentionCount", per_namespace)?,
        ))
    }
}

fn retention_count(field: &str, value: i32) -> Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|count| *count >= 1)
        .ok_or_else(|| Error::Validation(format!("{field} must be at least 1, got {value}")))
}

/// Parse a Go-style duration string such as "1h", "90s" or "1h30m".
pub fn parse_duration(value: &str) -> Result<SignedDuration> {
    value
        .trim()
        .parse::<SignedDuration>()
        .map_err(|e| Error::Validation(format!("invalid duration {value:?}: {e}")))
}
