//! Resource generation module.
//!
//! Contains the names and builders for the objects the operator creates.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | PersistentVolumeClaim | Per-pod audit log volume, owned by the pod's ReplicaSet |
//! | VolumeSnapshot | Point-in-time copy of that volume after an API server crash |

pub mod common;
pub mod pvc;
pub mod snapshot;

pub use common::pvc_name;
pub use pvc::generate_audit_log_pvc;
pub use snapshot::generate_snapshot;
