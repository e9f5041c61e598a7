//! Custom resource types used by audit-log-operator.
//!
//! - `AuditLogPersistenceConfig`: the cluster-scoped feature configuration
//! - `VolumeSnapshot`: CSI snapshots of the per-pod audit log volumes

mod audit_log_persistence_config;
mod volume_snapshot;

pub use audit_log_persistence_config::*;
pub use volume_snapshot::*;
