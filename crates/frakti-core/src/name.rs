//! Name Codec (C3, spec §4.3): builds and parses the canonical identifiers
//! carried through opaque backend name fields, and the annotation-in-label
//! encoding used because backends only store labels.

use crate::error::Result;
use log::warn;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;

const PREFIX: &str = "k8s";
const ANNOTATIONS_LABEL_KEY: &str = "io.kubernetes.frakti.annotations";

/// A parsed canonical name: `k8s_<localName>_<podName>_<podNamespace>_<podUID>_<rand>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub local_name: String,
    pub attempt: u32,
    pub pod_name: String,
    pub namespace: String,
    pub pod_uid: String,
    pub rand: String,
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Build the sandbox name: local name is `POD.<attempt>`.
pub fn build_sandbox_name(pod_name: &str, namespace: &str, pod_uid: &str, attempt: u32) -> String {
    build_name(&format!("POD.{attempt}"), pod_name, namespace, pod_uid)
}

/// Build the container name: local name is `<containerName>.<attempt>`.
pub fn build_container_name(
    container_name: &str,
    pod_name: &str,
    namespace: &str,
    pod_uid: &str,
    attempt: u32,
) -> String {
    build_name(
        &format!("{container_name}.{attempt}"),
        pod_name,
        namespace,
        pod_uid,
    )
}

fn build_name(local_name: &str, pod_name: &str, namespace: &str, pod_uid: &str) -> String {
    format!(
        "{PREFIX}_{local_name}_{pod_name}_{namespace}_{pod_uid}_{}",
        random_suffix()
    )
}

/// Parse a canonical name. Requires `parts[0] == "k8s"` and at least 6 `_`-separated
/// parts; an unparsable attempt number logs a warning and defaults to 0 rather
/// than failing the whole parse (spec §4.3).
pub fn parse_name(name: &str) -> Result<ParsedName> {
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() < 6 || parts[0] != PREFIX {
        return Err(crate::error::FraktiError::malformed_name(
            name,
            "expected k8s_<local>_<pod>_<namespace>_<uid>_<rand> with at least 6 parts",
        ));
    }

    let mut local_parts = parts[1].splitn(2, '.');
    let local_name = local_parts.next().unwrap_or_default().to_string();
    let attempt = match local_parts.next() {
        Some(s) => s.parse::<u32>().unwrap_or_else(|_| {
            warn!("name {name}: invalid attempt suffix '{s}', defaulting to 0");
            0
        }),
        None => 0,
    };

    Ok(ParsedName {
        local_name,
        attempt,
        pod_name: parts[2].to_string(),
        namespace: parts[3].to_string(),
        pod_uid: parts[4].to_string(),
        rand: parts[5].to_string(),
    })
}

/// JSON-encode `annotations` into the reserved label key, merging with `labels`.
pub fn build_labels_with_annotations(
    labels: &HashMap<String, String>,
    annotations: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out = labels.clone();
    if !annotations.is_empty() {
        let encoded = serde_json::to_string(annotations).unwrap_or_default();
        out.insert(ANNOTATIONS_LABEL_KEY.to_string(), encoded);
    }
    out
}

/// Decode the reserved label key back into an annotations map, if present.
pub fn get_annotations_from_labels(labels: &HashMap<String, String>) -> HashMap<String, String> {
    labels
        .get(ANNOTATIONS_LABEL_KEY)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| v.as_object().cloned())
        .map(|obj| {
            obj.into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Labels visible to callers should exclude the reserved annotations key.
pub fn labels_without_annotations(labels: &HashMap<String, String>) -> HashMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != ANNOTATIONS_LABEL_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
