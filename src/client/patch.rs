//! JSON patch helpers.
//!
//! Webhook mutations and PVC adoption are expressed as an RFC 6902 diff between
//! an original object and a modified copy. Pod annotation writes from the
//! snapshot controller are RFC 7386 merge patches carrying only changed keys.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

use crate::controller::error::Result;

/// Diff two serialisable objects into a JSON patch.
pub fn patch_from<T: Serialize>(original: &T, modified: &T) -> Result<json_patch::Patch> {
    let original = serde_json::to_value(original)?;
    let modified = serde_json::to_value(modified)?;
    Ok(json_patch::diff(&original, &modified))
}

/// Build a JSON merge patch that edits a pod's annotations through `edit`.
///
/// Only keys whose value changed are sent, removed keys as `null`, so
/// annotations written by others since `pod` was read are left in place.
/// Returns `None` when `edit` changed nothing.
pub fn annotations_patch<F>(pod: &Pod, edit: F) -> Option<serde_json::Value>
where
    F: FnOnce(&mut BTreeMap<String, String>),
{
    let original = pod.metadata.annotations.clone().unwrap_or_default();
    let mut modified = original.clone();
    edit(&mut modified);

    let mut changes = serde_json::Map::new();
    for (key, value) in &modified {
        if original.get(key) != Some(value) {
            changes.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
    }
    for key in original.keys().filter(|k| !modified.contains_key(*k)) {
        changes.insert(key.clone(), serde_json::Value::Null);
    }
    if changes.is_empty() {
        return None;
    }
    Some(serde_json::json!({ "metadata": { "annotations": changes } }))
}
