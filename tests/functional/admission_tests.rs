//! Admission scenarios for API server pods and the KAS config map.

use audit_log_operator::client::PersistenceKubeClient;
use audit_log_operator::controller::error::Error;
use audit_log_operator::resources::common::pvc_name;
use audit_log_operator::webhooks::configmap::{KAS_CONFIG_KEY, KAS_CONFIG_MAP_NAME, admit_configmap};
use audit_log_operator::webhooks::pod::{NAME_SUFFIX_ALPHABET, NAME_SUFFIX_LEN, admit_pod};
use audit_log_operator::webhooks::Operation;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Volume};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::common::fixtures::{ConfigBuilder, HCP_NAMESPACE, PodBuilder, namespace, replica_set_ref};
use crate::common::memory_store::{Call, MemoryStore};

fn store(config: ConfigBuilder) -> MemoryStore {
    MemoryStore::new()
        .with_namespace(namespace(HCP_NAMESPACE, true))
        .with_config(config.build())
}

fn apply<T: Serialize + DeserializeOwned>(object: &T, patch: &json_patch::Patch) -> T {
    let mut value = serde_json::to_value(object).unwrap();
    json_patch::patch(&mut value, &patch.0).unwrap();
    serde_json::from_value(value).unwrap()
}

/// Admit a pod creation and return the pod as the API server would store it.
async fn admit(kube: &dyn PersistenceKubeClient, pod: &Pod) -> Option<Pod> {
    admit_pod(kube, &Operation::Create, Some(HCP_NAMESPACE), pod)
        .await
        .unwrap()
        .map(|patch| apply(pod, &patch))
}

fn logs_claim(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == "logs")?
        .persistent_volume_claim
        .as_ref()
        .map(|p| p.claim_name.clone())
}

fn volumes_except_logs(pod: &Pod) -> Vec<Volume> {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|v| v.name != "logs")
        .collect()
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Quantity {
    pvc.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"]
        .clone()
}

#[tokio::test]
async fn test_named_pod_gets_pvc_and_logs_volume() {
    let kube = store(ConfigBuilder::enabled().storage("10Gi", ""));
    let pod = PodBuilder::named("kube-apiserver-abc123").build();

    let admitted = admit(&kube, &pod).await.expect("pod should be mutated");

    let claim = "kas-audit-logs-kube-apiserver-abc123";
    let pvc = kube.pvc(HCP_NAMESPACE, claim).expect("PVC should exist");
    assert_eq!(storage_request(&pvc), Quantity("10Gi".to_string()));
    assert_eq!(pvc.spec.as_ref().unwrap().storage_class_name, None);
    assert_eq!(
        pvc.spec.as_ref().unwrap().access_modes,
        Some(vec!["ReadWriteOnce".to_string()])
    );
    assert_eq!(logs_claim(&admitted).as_deref(), Some(claim));
    let volumes = admitted.spec.as_ref().unwrap().volumes.as_ref().unwrap();
    let logs = volumes.iter().find(|v| v.name == "logs").unwrap();
    assert!(logs.empty_dir.is_none(), "emptyDir source must be replaced, not merged");
}

#[tokio::test]
async fn test_generate_name_is_materialised() {
    let kube = store(ConfigBuilder::enabled().storage("5Gi", ""));
    let pod = PodBuilder::generated("kube-apiserver-7f6b67c88-").build();

    let admitted = admit(&kube, &pod).await.unwrap();

    let name = admitted.metadata.name.clone().unwrap();
    let suffix = name.strip_prefix("kube-apiserver-7f6b67c88-").unwrap();
    assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
    assert!(suffix.bytes().all(|b| NAME_SUFFIX_ALPHABET.contains(&b)));
    assert_eq!(admitted.metadata.generate_name, None);

    let claim = pvc_name(&name);
    assert!(kube.pvc(HCP_NAMESPACE, &claim).is_some());
    assert_eq!(logs_claim(&admitted), Some(claim));
}

#[tokio::test]
async fn test_pvc_is_owned_by_replica_set() {
    let kube = store(ConfigBuilder::enabled().storage("10Gi", ""));
    let pod = PodBuilder::named("kube-apiserver-xyz789")
        .replica_set("kube-apiserver-abc123", "rs-uid")
        .build();

    admit(&kube, &pod).await.unwrap();

    let pvc = kube
        .pvc(HCP_NAMESPACE, "kas-audit-logs-kube-apiserver-xyz789")
        .unwrap();
    let owners = pvc.metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "ReplicaSet");
    assert_eq!(owners[0].name, "kube-apiserver-abc123");
    assert_eq!(owners[0].uid, "rs-uid");
    assert_eq!(owners[0].api_version, "apps/v1");
}

#[tokio::test]
async fn test_pod_without_replica_set_leaves_pvc_unowned() {
    let kube = store(ConfigBuilder::enabled());
    let pod = PodBuilder::named("kube-apiserver-solo").build();

    admit(&kube, &pod).await.unwrap();

    let pvc = kube.pvc(HCP_NAMESPACE, "kas-audit-logs-kube-apiserver-solo").unwrap();
    assert!(pvc.metadata.owner_references.is_none());
    assert_eq!(storage_request(&pvc), Quantity("5Gi".to_string()));
}

#[tokio::test]
async fn test_storage_class_is_set() {
    let kube = store(ConfigBuilder::enabled().storage("20Gi", "fast-ssd"));
    let pod = PodBuilder::named("kube-apiserver-def456").build();

    admit(&kube, &pod).await.unwrap();

    let pvc = kube.pvc(HCP_NAMESPACE, "kas-audit-logs-kube-apiserver-def456").unwrap();
    assert_eq!(storage_request(&pvc), Quantity("20Gi".to_string()));
    assert_eq!(
        pvc.spec.unwrap().storage_class_name.as_deref(),
        Some("fast-ssd")
    );
}

#[tokio::test]
async fn test_existing_unowned_pvc_is_adopted() {
    let existing = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("kas-audit-logs-kube-apiserver-xyz789".to_string()),
            namespace: Some(HCP_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let kube = store(ConfigBuilder::enabled()).with_pvc(existing);
    let pod = PodBuilder::named("kube-apiserver-xyz789")
        .replica_set("kube-apiserver-abc123", "rs-uid")
        .build();

    let admitted = admit(&kube, &pod).await.unwrap();

    let pvc = kube
        .pvc(HCP_NAMESPACE, "kas-audit-logs-kube-apiserver-xyz789")
        .unwrap();
    assert_eq!(
        pvc.metadata.owner_references,
        Some(vec![replica_set_ref("kube-apiserver-abc123", "rs-uid")])
    );
    assert_eq!(kube.pvcs().len(), 1);
    assert_eq!(
        logs_claim(&admitted).as_deref(),
        Some("kas-audit-logs-kube-apiserver-xyz789")
    );
}

#[tokio::test]
async fn test_existing_owned_pvc_is_left_alone() {
    let existing = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("kas-audit-logs-kube-apiserver-xyz789".to_string()),
            namespace: Some(HCP_NAMESPACE.to_string()),
            owner_references: Some(vec![replica_set_ref("kube-apiserver-old", "old-uid")]),
            ..Default::default()
        },
        ..Default::default()
    };
    let kube = store(ConfigBuilder::enabled()).with_pvc(existing.clone());
    kube.fail(Call::PatchPvc);
    let pod = PodBuilder::named("kube-apiserver-xyz789")
        .replica_set("kube-apiserver-new", "new-uid")
        .build();

    admit(&kube, &pod).await.unwrap();

    assert_eq!(
        kube.pvc(HCP_NAMESPACE, "kas-audit-logs-kube-apiserver-xyz789"),
        Some(existing)
    );
}

#[tokio::test]
async fn test_other_volumes_are_unchanged() {
    let kube = store(ConfigBuilder::enabled());
    let pod = PodBuilder::named("kube-apiserver-abc123").build();

    let admitted = admit(&kube, &pod).await.unwrap();

    assert_eq!(volumes_except_logs(&admitted), volumes_except_logs(&pod));
    assert_eq!(
        admitted.spec.as_ref().unwrap().containers,
        pod.spec.as_ref().unwrap().containers
    );
}

#[tokio::test]
async fn test_missing_logs_volume_is_appended() {
    let kube = store(ConfigBuilder::enabled());
    let pod = PodBuilder::named("kube-apiserver-abc123")
        .volumes(vec![Volume {
            name: "certs".to_string(),
            ..Default::default()
        }])
        .build();

    let admitted = admit(&kube, &pod).await.unwrap();

    let volumes = admitted.spec.unwrap().volumes.unwrap();
    assert_eq!(volumes.len(), 2);
    assert_eq!(volumes[0].name, "certs");
    assert_eq!(volumes[1].name, "logs");
    assert_eq!(
        volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
        "kas-audit-logs-kube-apiserver-abc123"
    );
}

#[tokio::test]
async fn test_mutation_is_idempotent() {
    let kube = store(ConfigBuilder::enabled());
    let pod = PodBuilder::named("kube-apiserver-abc123")
        .replica_set("kube-apiserver-abc123", "rs-uid")
        .build();

    let first = admit(&kube, &pod).await.unwrap();
    let second = admit(&kube, &pod).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(kube.pvcs().len(), 1);

    // Re-admitting the already mutated pod changes nothing
    let again = admit(&kube, &first).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(kube.pvcs().len(), 1);
}

#[tokio::test]
async fn test_preconditions_leave_pod_untouched() {
    let pod = PodBuilder::named("kube-apiserver-abc123").build();

    // Namespace not opted in
    let kube = MemoryStore::new()
        .with_namespace(namespace(HCP_NAMESPACE, false))
        .with_config(ConfigBuilder::enabled().build());
    assert!(admit(&kube, &pod).await.is_none());

    // Namespace missing
    let kube = MemoryStore::new().with_config(ConfigBuilder::enabled().build());
    assert!(admit(&kube, &pod).await.is_none());

    // No config
    let kube = MemoryStore::new().with_namespace(namespace(HCP_NAMESPACE, true));
    assert!(admit(&kube, &pod).await.is_none());

    // Feature disabled
    let kube = store(ConfigBuilder::disabled());
    assert!(admit(&kube, &pod).await.is_none());
    assert!(kube.pvcs().is_empty());
}

#[tokio::test]
async fn test_non_api_server_pods_are_ignored() {
    let kube = store(ConfigBuilder::enabled());

    let unlabelled = PodBuilder::named("kube-apiserver-abc123").without_labels().build();
    assert!(admit(&kube, &unlabelled).await.is_none());

    let wrong_name = PodBuilder::named("etcd-0").build();
    assert!(admit(&kube, &wrong_name).await.is_none());

    let update = admit_pod(
        &kube,
        &Operation::Update,
        Some(HCP_NAMESPACE),
        &PodBuilder::named("kube-apiserver-abc123").build(),
    )
    .await
    .unwrap();
    assert!(update.is_none());
    assert!(kube.pvcs().is_empty());
}

#[tokio::test]
async fn test_pvc_creation_failure_fails_admission() {
    let kube = store(ConfigBuilder::enabled());
    kube.fail(Call::CreatePvc);
    let pod = PodBuilder::named("kube-apiserver-abc123").build();

    let result = admit_pod(&kube, &Operation::Create, Some(HCP_NAMESPACE), &pod).await;
    assert!(matches!(result, Err(Error::Kube(_))));
}

#[tokio::test]
async fn test_existing_pvc_lookup_failure_fails_admission() {
    let existing = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("kas-audit-logs-kube-apiserver-abc123".to_string()),
            namespace: Some(HCP_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let kube = store(ConfigBuilder::enabled()).with_pvc(existing.clone());
    kube.fail(Call::GetPvc);
    let pod = PodBuilder::named("kube-apiserver-abc123")
        .replica_set("kube-apiserver-rs", "rs-uid")
        .build();

    let result = admit_pod(&kube, &Operation::Create, Some(HCP_NAMESPACE), &pod).await;

    assert!(matches!(result, Err(Error::Kube(_))));
    assert_eq!(
        kube.pvc(HCP_NAMESPACE, "kas-audit-logs-kube-apiserver-abc123"),
        Some(existing)
    );
}

#[tokio::test]
async fn test_config_lookup_failure_fails_admission() {
    let kube = store(ConfigBuilder::enabled());
    kube.fail(Call::GetConfig);
    let pod = PodBuilder::named("kube-apiserver-abc123").build();

    let result = admit_pod(&kube, &Operation::Create, Some(HCP_NAMESPACE), &pod).await;
    assert!(result.is_err());
    assert!(kube.pvcs().is_empty());
}

fn kas_config(document: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(KAS_CONFIG_MAP_NAME.to_string()),
            namespace: Some(HCP_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KAS_CONFIG_KEY.to_string(),
            document.to_string(),
        )])),
        ..Default::default()
    }
}

fn kas_arguments(config_map: &ConfigMap) -> Value {
    let document: Value =
        serde_json::from_str(&config_map.data.as_ref().unwrap()[KAS_CONFIG_KEY]).unwrap();
    document["apiServerArguments"].clone()
}

#[tokio::test]
async fn test_kas_config_gets_default_rotation_flags() {
    let kube = store(ConfigBuilder::enabled());
    let config_map = kas_config(r#"{"apiServerArguments":{"feature-gates":["A=true"]}}"#);

    let patch = admit_configmap(&kube, &Operation::Create, Some(HCP_NAMESPACE), &config_map)
        .await
        .unwrap()
        .expect("config map should be mutated");
    let mutated = apply(&config_map, &patch);

    let arguments = kas_arguments(&mutated);
    assert_eq!(arguments["audit-log-maxsize"], serde_json::json!(["200"]));
    assert_eq!(arguments["audit-log-maxbackup"], serde_json::json!(["10"]));
    assert_eq!(arguments["feature-gates"], serde_json::json!(["A=true"]));
}

#[tokio::test]
async fn test_kas_config_update_uses_configured_values() {
    let kube = store(ConfigBuilder::enabled().audit_log(Some(500), Some(3)));
    let config_map = kas_config("{}");

    let patch = admit_configmap(&kube, &Operation::Update, Some(HCP_NAMESPACE), &config_map)
        .await
        .unwrap()
        .unwrap();
    let arguments = kas_arguments(&apply(&config_map, &patch));

    assert_eq!(arguments["audit-log-maxsize"], serde_json::json!(["500"]));
    assert_eq!(arguments["audit-log-maxbackup"], serde_json::json!(["3"]));
}

#[tokio::test]
async fn test_kas_config_outside_control_plane_is_ignored() {
    let kube = MemoryStore::new()
        .with_namespace(namespace(HCP_NAMESPACE, false))
        .with_config(ConfigBuilder::enabled().build());
    let config_map = kas_config("{}");

    let result = admit_configmap(&kube, &Operation::Create, Some(HCP_NAMESPACE), &config_map)
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_invalid_kas_config_fails_admission() {
    let kube = store(ConfigBuilder::enabled());
    let config_map = kas_config("not json");

    let result =
        admit_configmap(&kube, &Operation::Create, Some(HCP_NAMESPACE), &config_map).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}
