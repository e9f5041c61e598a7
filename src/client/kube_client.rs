//! Object-store trait and its Kubernetes implementation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::crd::{AuditLogPersistenceConfig, CONFIG_NAME, VolumeSnapshot};

/// Result of a create call that tolerates an existing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object was created by this call.
    Created,
    /// An object with the same name already existed.
    AlreadyExists,
}

/// A Kubernetes event to attach to a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl PodEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }
}

/// Trait abstracting the Kubernetes calls made by the webhooks and the
/// snapshot controller.
///
/// Getters return `Ok(None)` when the object does not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PersistenceKubeClient: Send + Sync {
    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Get the `cluster` AuditLogPersistenceConfig singleton
    async fn get_persistence_config(&self) -> Result<Option<AuditLogPersistenceConfig>>;

    /// Get a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Apply a JSON merge patch to a pod
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a PersistentVolumeClaim, reporting a name collision instead of failing
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim)
    -> Result<CreateOutcome>;

    /// Apply a JSON patch to a PersistentVolumeClaim
    async fn patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()>;

    /// Create a VolumeSnapshot
    async fn create_snapshot(&self, namespace: &str, snapshot: &VolumeSnapshot) -> Result<()>;

    /// List VolumeSnapshots in a namespace matching a label selector
    async fn list_snapshots(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<VolumeSnapshot>>;

    /// Delete a VolumeSnapshot. Returns `false` if it was already gone.
    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Publish an event on a pod. Failures are logged, never returned.
    async fn publish_pod_event(&self, pod: &Pod, event: PodEvent);
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct PersistenceKubeClientImpl {
    client: Client,
    reporter: Reporter,
}

impl PersistenceKubeClientImpl {
    /// Create a new client wrapping the given kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PersistenceKubeClient for PersistenceKubeClientImpl {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_persistence_config(&self) -> Result<Option<AuditLogPersistenceConfig>> {
        let api: Api<AuditLogPersistenceConfig> = Api::all(self.client.clone());
        Ok(api.get_opt(CONFIG_NAME).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::patch_params(), &Patch::Merge(patch))
            .await?;
        debug!(pod = %name, namespace = %namespace, "Patched pod");
        Ok(())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<CreateOutcome> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&Self::post_params(), pvc).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists" => {
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::patch_params(), &Patch::<()>::Json(patch.clone()))
            .await?;
        Ok(())
    }

    async fn create_snapshot(&self, namespace: &str, snapshot: &VolumeSnapshot) -> Result<()> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), snapshot).await?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<VolumeSnapshot>> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_pod_event(&self, pod: &Pod, event: PodEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = pod.object_ref(&());
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
