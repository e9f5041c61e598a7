//! KAS config map mutation.
//!
//! Sets the API server's audit log rotation flags (`audit-log-maxsize`,
//! `audit-log-maxbackup`) in the `apiServerArguments` of the `config.json`
//! document held by the `kas-config` config map, so rotated logs fit on the
//! per-pod volume.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::admission::Operation;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::client::{PersistenceKubeClient, patch_from};
use crate::controller::error::{Error, Result};
use crate::crd::AuditLogConfig;
use crate::resources::common::is_control_plane_namespace;

/// Name of the API server config map
pub const KAS_CONFIG_MAP_NAME: &str = "kas-config";
/// Data key of the API server configuration document
pub const KAS_CONFIG_KEY: &str = "config.json";

const API_SERVER_ARGUMENTS: &str = "apiServerArguments";
const AUDIT_LOG_MAX_SIZE_ARG: &str = "audit-log-maxsize";
const AUDIT_LOG_MAX_BACKUP_ARG: &str = "audit-log-maxbackup";

/// Decide on and compute the mutation for a config map admission request.
pub async fn admit_configmap(
    kube: &dyn PersistenceKubeClient,
    operation: &Operation,
    namespace: Option<&str>,
    config_map: &ConfigMap,
) -> Result<Option<json_patch::Patch>> {
    if !matches!(operation, Operation::Create | Operation::Update) {
        return Ok(None);
    }
    if config_map.metadata.name.as_deref() != Some(KAS_CONFIG_MAP_NAME) {
        return Ok(None);
    }
    let Some(namespace) = namespace
        .or(config_map.metadata.namespace.as_deref())
        .filter(|ns| !ns.is_empty())
    else {
        return Ok(None);
    };

    match kube.get_namespace(namespace).await? {
        Some(ns) if is_control_plane_namespace(&ns) => {}
        _ => return Ok(None),
    }
    let Some(config) = kube.get_persistence_config().await? else {
        return Ok(None);
    };
    let spec = config.spec.with_defaults();
    if !spec.is_enabled() {
        return Ok(None);
    }

    let mut mutated = config_map.clone();
    mutate_kas_config(&mut mutated, &spec.audit_log)?;
    debug!(namespace = %namespace, "Set audit log rotation arguments in KAS config");
    Ok(Some(patch_from(config_map, &mutated)?))
}

/// Write the audit log rotation flags into `config.json`.
///
/// A config map without `config.json` is left alone. An empty or invalid
/// document is an error.
pub fn mutate_kas_config(config_map: &mut ConfigMap, audit_log: &AuditLogConfig) -> Result<()> {
    let Some(raw) = config_map
        .data
        .as_mut()
        .and_then(|data| data.get_mut(KAS_CONFIG_KEY))
    else {
        return Ok(());
    };
    if raw.trim().is_empty() {
        return Err(Error::Validation(format!("{KAS_CONFIG_KEY} is empty")));
    }

    let mut document: Map<String, Value> = serde_json::from_str(raw.as_str())
        .map_err(|e| Error::Validation(format!("{KAS_CONFIG_KEY} is not a JSON object: {e}")))?;

    let arguments = document
        .entry(API_SERVER_ARGUMENTS)
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(arguments) = arguments.as_object_mut() else {
        return Err(Error::Validation(format!(
            "{API_SERVER_ARGUMENTS} in {KAS_CONFIG_KEY} is not an object"
        )));
    };

    if let Some(max_size) = audit_log.max_size.filter(|v| *v > 0) {
        arguments.insert(
            AUDIT_LOG_MAX_SIZE_ARG.to_string(),
            json!([max_size.to_string()]),
        );
    }
    if let Some(max_backup) = audit_log.max_backup.filter(|v| *v > 0) {
        arguments.insert(
            AUDIT_LOG_MAX_BACKUP_ARG.to_string(),
            json!([max_backup.to_string()]),
        );
    }

    *raw = serde_json::to_string(&document)?;
    Ok(())
}
