//! Controller module for audit-log-operator.
//!
//! Contains the restart-triggered snapshot reconciler, snapshot retention,
//! error handling and the failure back-off used by the error policy.

pub mod backoff;
pub mod context;
pub mod error;
pub mod retention;
pub mod snapshot_reconciler;
