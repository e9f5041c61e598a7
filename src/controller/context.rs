//! Shared context for the snapshot controller.
//!
//! The Context struct holds shared state that is passed to the reconciler,
//! including the object-store client and the failure back-off tracker.

use std::sync::Arc;

use crate::client::PersistenceKubeClient;
use crate::controller::backoff::FailureBackoff;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "audit-log-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Object-store client
    pub kube: Arc<dyn PersistenceKubeClient>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Per-pod failure back-off
    pub backoff: Arc<FailureBackoff>,
}

impl Context {
    /// Create a new context
    pub fn new(kube: Arc<dyn PersistenceKubeClient>, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            kube,
            health_state,
            backoff: Arc::new(FailureBackoff::default()),
        }
    }
}
