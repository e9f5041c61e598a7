//! In-memory object store implementing [`PersistenceKubeClient`].
//!
//! JSON patches are applied with `json_patch::patch`, so a patch that would fail
//! against the API server (e.g. replacing a missing key) fails here as well.
//! Pod patches are merge patches applied with `json_patch::merge`.
//! Individual calls can be made to fail to exercise error paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use audit_log_operator::client::{CreateOutcome, PersistenceKubeClient, PodEvent};
use audit_log_operator::controller::error::{Error, Result};
use audit_log_operator::crd::{AuditLogPersistenceConfig, VolumeSnapshot};
use jiff::Timestamp;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::core::{ErrorResponse, response::StatusSummary};
use serde::Serialize;
use serde::de::DeserializeOwned;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Calls that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Call {
    GetNamespace,
    GetConfig,
    GetPod,
    PatchPod,
    GetPvc,
    CreatePvc,
    PatchPvc,
    CreateSnapshot,
    ListSnapshots,
    DeleteSnapshot,
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    config: Option<AuditLogPersistenceConfig>,
    pods: BTreeMap<Key, Pod>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    snapshots: BTreeMap<Key, VolumeSnapshot>,
    events: Vec<(String, PodEvent)>,
    failing: HashSet<Call>,
    pod_patches: usize,
    racing_annotations: Vec<(String, String)>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(Box::new(ErrorResponse {
        status: Some(StatusSummary::Failure),
        message,
        reason: reason.to_string(),
        code,
        metadata: None,
        details: None,
    })))
}

fn apply<T: Serialize + DeserializeOwned>(object: &T, patch: &json_patch::Patch) -> Result<T> {
    let mut value = serde_json::to_value(object)?;
    json_patch::patch(&mut value, &patch.0)
        .map_err(|e| api_error(422, "Invalid", e.to_string()))?;
    Ok(serde_json::from_value(value)?)
}

fn merge<T: Serialize + DeserializeOwned>(object: &T, patch: &serde_json::Value) -> Result<T> {
    let mut value = serde_json::to_value(object)?;
    json_patch::merge(&mut value, patch);
    Ok(serde_json::from_value(value)?)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check(&self, call: Call) -> Result<()> {
        if self.state().failing.contains(&call) {
            return Err(api_error(500, "InternalError", format!("{call:?} failed")));
        }
        Ok(())
    }

    /// Make every subsequent `call` fail with a 500.
    pub fn fail(&self, call: Call) {
        self.state().failing.insert(call);
    }

    pub fn recover(&self, call: Call) {
        self.state().failing.remove(&call);
    }

    pub fn with_namespace(self, namespace: Namespace) -> Self {
        self.state()
            .namespaces
            .insert(namespace.name_any(), namespace);
        self
    }

    pub fn with_config(self, config: AuditLogPersistenceConfig) -> Self {
        self.state().config = Some(config);
        self
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.put_pod(pod);
        self
    }

    pub fn with_pvc(self, pvc: PersistentVolumeClaim) -> Self {
        let namespace = pvc.namespace().unwrap_or_default();
        self.state().pvcs.insert(key(&namespace, &pvc.name_any()), pvc);
        self
    }

    pub fn with_snapshot(self, snapshot: VolumeSnapshot) -> Self {
        let namespace = snapshot.namespace().unwrap_or_default();
        self.state()
            .snapshots
            .insert(key(&namespace, &snapshot.name_any()), snapshot);
        self
    }

    /// Insert or replace a pod, e.g. to simulate a kubelet status update.
    pub fn put_pod(&self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        self.state().pods.insert(key(&namespace, &pod.name_any()), pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state().pods.get(&key(namespace, name)).cloned()
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state().pvcs.get(&key(namespace, name)).cloned()
    }

    pub fn pvcs(&self) -> Vec<PersistentVolumeClaim> {
        self.state().pvcs.values().cloned().collect()
    }

    pub fn snapshots(&self, namespace: &str) -> Vec<VolumeSnapshot> {
        self.state()
            .snapshots
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn snapshot_names(&self, namespace: &str) -> Vec<String> {
        self.snapshots(namespace)
            .iter()
            .map(ResourceExt::name_any)
            .collect()
    }

    pub fn events(&self) -> Vec<(String, PodEvent)> {
        self.state().events.clone()
    }

    /// Set an annotation on the stored pod just before the next pod patch
    /// lands, as another writer would between our read and our write.
    pub fn race_next_pod_patch(&self, key: &str, value: &str) {
        self.state()
            .racing_annotations
            .push((key.to_string(), value.to_string()));
    }

    /// Number of patches applied to pods so far.
    pub fn pod_patches(&self) -> usize {
        self.state().pod_patches
    }

    /// Pod annotation value, if set.
    pub fn annotation(&self, namespace: &str, name: &str, annotation: &str) -> Option<String> {
        self.pod(namespace, name)?
            .metadata
            .annotations?
            .get(annotation)
            .cloned()
    }
}

fn matches_selector(snapshot: &VolumeSnapshot, selector: &str) -> bool {
    let labels = snapshot.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|value| value == v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl PersistenceKubeClient for MemoryStore {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        self.check(Call::GetNamespace)?;
        Ok(self.state().namespaces.get(name).cloned())
    }

    async fn get_persistence_config(&self) -> Result<Option<AuditLogPersistenceConfig>> {
        self.check(Call::GetConfig)?;
        Ok(self.state().config.clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.check(Call::GetPod)?;
        Ok(self.pod(namespace, name))
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.check(Call::PatchPod)?;
        let mut state = self.state();
        let racing = std::mem::take(&mut state.racing_annotations);
        let Some(pod) = state.pods.get_mut(&key(namespace, name)) else {
            return Err(api_error(404, "NotFound", format!("pod {namespace}/{name}")));
        };
        if !racing.is_empty() {
            pod.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(racing);
        }
        let patched = merge(&*pod, patch)?;
        state.pods.insert(key(namespace, name), patched);
        state.pod_patches += 1;
        Ok(())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.check(Call::GetPvc)?;
        Ok(self.pvc(namespace, name))
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<CreateOutcome> {
        self.check(Call::CreatePvc)?;
        let mut state = self.state();
        let k = key(namespace, &pvc.name_any());
        if state.pvcs.contains_key(&k) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut stored = pvc.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        state.pvcs.insert(k, stored);
        Ok(CreateOutcome::Created)
    }

    async fn patch_pvc(&self, namespace: &str, name: &str, patch: &json_patch::Patch) -> Result<()> {
        self.check(Call::PatchPvc)?;
        let mut state = self.state();
        let Some(pvc) = state.pvcs.get(&key(namespace, name)) else {
            return Err(api_error(404, "NotFound", format!("pvc {namespace}/{name}")));
        };
        let patched = apply(pvc, patch)?;
        state.pvcs.insert(key(namespace, name), patched);
        Ok(())
    }

    async fn create_snapshot(&self, namespace: &str, snapshot: &VolumeSnapshot) -> Result<()> {
        self.check(Call::CreateSnapshot)?;
        let mut state = self.state();
        let k = key(namespace, &snapshot.name_any());
        if state.snapshots.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("volumesnapshot {namespace}/{}", snapshot.name_any()),
            ));
        }
        let mut stored = snapshot.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.creation_timestamp = Some(Time(Timestamp::now()));
        state.snapshots.insert(k, stored);
        Ok(())
    }

    async fn list_snapshots(&self, namespace: &str, label_selector: &str) -> Result<Vec<VolumeSnapshot>> {
        self.check(Call::ListSnapshots)?;
        Ok(self
            .snapshots(namespace)
            .into_iter()
            .filter(|s| matches_selector(s, label_selector))
            .collect())
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<bool> {
        self.check(Call::DeleteSnapshot)?;
        Ok(self.state().snapshots.remove(&key(namespace, name)).is_some())
    }

    async fn publish_pod_event(&self, pod: &Pod, event: PodEvent) {
        self.state().events.push((pod.name_any(), event));
    }
}
