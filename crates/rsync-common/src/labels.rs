//! Deployment-session labels stamped onto every staged resource

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Label key identifying the `(session, app)` a resource was deployed by
pub const DEPLOYMENT_LABEL: &str = "rsync.dev/deployment-id";

/// Maximum length of a label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Kinds whose pod template also receives the label
const POD_TEMPLATE_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet", "Job"];

/// Label value for one app of a session, truncated to a legal label value
pub fn deployment_label_value(session: &str, app: &str) -> String {
    let full = format!("{session}-{app}");
    let truncated: String = full.chars().take(MAX_LABEL_VALUE_LEN).collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// `key=value` selector matching resources of one app of a session
pub fn deployment_selector(session: &str, app: &str) -> String {
    format!(
        "{DEPLOYMENT_LABEL}={}",
        deployment_label_value(session, app)
    )
}

fn labels_at<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let mut cursor = value;
    for key in path {
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        cursor = cursor
            .as_object_mut()?
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if cursor.is_null() {
        *cursor = Value::Object(Map::new());
    }
    cursor.as_object_mut()
}

/// Stamp `DEPLOYMENT_LABEL=label_value` onto a parsed manifest in place
pub fn tag_value(value: &mut Value, label_value: &str) -> Result<()> {
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    labels_at(value, &["metadata", "labels"])
        .ok_or_else(|| Error::serialization_for_kind(&kind, "metadata.labels is not a map"))?
        .insert(DEPLOYMENT_LABEL.to_string(), Value::from(label_value));

    if POD_TEMPLATE_KINDS.contains(&kind.as_str()) {
        labels_at(value, &["spec", "template", "metadata", "labels"])
            .ok_or_else(|| {
                Error::serialization_for_kind(&kind, "spec.template.metadata.labels is not a map")
            })?
            .insert(DEPLOYMENT_LABEL.to_string(), Value::from(label_value));
    }
    Ok(())
}

/// Parse, tag and re-render a manifest as YAML
pub fn tag_manifest(manifest: &str, label_value: &str) -> Result<String> {
    let mut value = crate::yaml::parse_document(manifest)?;
    if !value.is_object() {
        return Err(Error::serialization("manifest is not an object"));
    }
    tag_value(&mut value, label_value)?;
    serde_yaml::to_string(&value).map_err(|e| Error::serialization(e.to_string()))
}
