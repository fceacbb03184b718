//! Request rewriting.
//!
//! Everything here mutates a parsed request before it is forwarded: owner
//! labels are injected into JSON bodies and query parameters, and the
//! container-create containment rules are applied. Rewrites either succeed
//! or refuse the request; nothing is forwarded half-modified.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use url::form_urlencoded;

use crate::config::Config;
use crate::constants::OWNER_LABEL_KEY;
use crate::director::link::is_bind_allowed;
use crate::error::{SockguardError, SockguardResult};
use crate::http::RequestHead;

/// Insert the owner label into a top-level `Labels` map, tolerantly: a
/// missing or non-object `Labels` member is left untouched (clients for
/// volume/network create always send one).
fn insert_owner_label(root: &mut Map<String, Value>, owner: &str) {
    match root.get_mut("Labels") {
        Some(Value::Object(labels)) => {
            labels.insert(OWNER_LABEL_KEY.to_string(), json!(owner));
        }
        Some(other) => {
            tracing::warn!(labels = %other, "unhandled Labels type, leaving untouched");
        }
        None => {}
    }
}

/// Rewrite a JSON body by inserting the owner label into `Labels`.
/// Used for volume create.
pub fn label_body(body: &[u8], owner: &str) -> SockguardResult<Vec<u8>> {
    let mut doc: Value = serde_json::from_slice(body)?;
    let root = doc
        .as_object_mut()
        .ok_or_else(|| SockguardError::BadRequest("request body must be a JSON object".into()))?;
    insert_owner_label(root, owner);
    Ok(serde_json::to_vec(&doc)?)
}

/// Merge `label=<owner key>=<owner>` into the `filters` query parameter.
///
/// Docker clients ship two encodings of `filters`: a map of value to `true`
/// and a plain array of values. Both are accepted and normalised to the
/// array form; any other value shape is a 400.
pub fn label_query_filters(head: &mut RequestHead, owner: &str) -> SockguardResult<()> {
    let mut pairs = query_pairs(head);
    let mut filters: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if let Some(raw) = pair_value(&pairs, "filters").filter(|raw| !raw.is_empty()) {
        let existing: Map<String, Value> = serde_json::from_str(raw)?;
        for (key, value) in existing {
            let values = filters.entry(key.clone()).or_default();
            match value {
                Value::Object(map) => values.extend(map.into_iter().map(|(k, _)| k)),
                Value::Array(items) => {
                    for item in items {
                        match item {
                            Value::String(s) => values.push(s),
                            other => {
                                return Err(SockguardError::BadRequest(format!(
                                    "unhandled {key:?} filter value {other}"
                                )));
                            }
                        }
                    }
                }
                other => {
                    return Err(SockguardError::BadRequest(format!(
                        "unhandled filter type for {key:?}: {other}"
                    )));
                }
            }
        }
    }

    let owner_filter = format!("{OWNER_LABEL_KEY}={owner}");
    let labels = filters.entry("label".to_string()).or_default();
    if !labels.contains(&owner_filter) {
        labels.push(owner_filter);
    }

    set_pair(&mut pairs, "filters", serde_json::to_string(&filters)?);
    write_query(head, pairs);
    Ok(())
}

/// Insert the owner label into the `labels` query parameter (a JSON map of
/// string to string). Used for image builds.
pub fn label_query_labels(head: &mut RequestHead, owner: &str) -> SockguardResult<()> {
    let mut pairs = query_pairs(head);
    let mut labels: BTreeMap<String, String> = match pair_value(&pairs, "labels") {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
        _ => BTreeMap::new(),
    };
    labels.insert(OWNER_LABEL_KEY.to_string(), owner.to_string());

    set_pair(&mut pairs, "labels", serde_json::to_string(&labels)?);
    write_query(head, pairs);
    Ok(())
}

/// Container create: stamp the owner label and enforce the containment
/// policy, in order. Denials name the rule that fired.
pub fn container_create(body: &[u8], config: &Config) -> SockguardResult<Vec<u8>> {
    let mut doc: Value = serde_json::from_slice(body)?;
    let root = doc.as_object_mut().ok_or_else(|| {
        SockguardError::BadRequest("container create body must be a JSON object".into())
    })?;

    // Owner label, creating the map when the client sent none.
    let labels = root.entry("Labels").or_insert_with(|| json!({}));
    if labels.is_null() {
        *labels = json!({});
    }
    match labels {
        Value::Object(labels) => {
            labels.insert(OWNER_LABEL_KEY.to_string(), json!(config.owner));
        }
        other => {
            return Err(SockguardError::BadRequest(format!(
                "Labels must be a JSON object, got {other}"
            )));
        }
    }

    let host_config = root.get("HostConfig").and_then(Value::as_object);

    if host_config
        .and_then(|hc| hc.get("Privileged"))
        .and_then(Value::as_bool)
        == Some(true)
    {
        return Err(SockguardError::Denied(
            "Containers aren't allowed to run as privileged".into(),
        ));
    }

    if let Some(binds) = host_config
        .and_then(|hc| hc.get("Binds"))
        .and_then(Value::as_array)
    {
        for bind in binds.iter().filter_map(Value::as_str) {
            if !is_bind_allowed(bind, &config.allow_binds) {
                tracing::debug!(bind, "denied host bind");
                return Err(SockguardError::Denied("Host binds aren't allowed".into()));
            }
        }
    }

    if host_config
        .and_then(|hc| hc.get("NetworkMode"))
        .and_then(Value::as_str)
        == Some("host")
        && !config.allow_host_mode_networking
    {
        return Err(SockguardError::Denied(
            "Containers aren't allowed to use host networking".into(),
        ));
    }

    let client_cgroup = match host_config.and_then(|hc| hc.get("CgroupParent")) {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        Some(other) => {
            return Err(SockguardError::BadRequest(format!(
                "HostConfig.CgroupParent must be a string, got {other}"
            )));
        }
    };
    match &config.cgroup_parent {
        Some(parent) => {
            host_config_mut(root)?.insert("CgroupParent".into(), json!(parent));
        }
        None if !client_cgroup.is_empty() => {
            return Err(SockguardError::Denied(format!(
                "Containers aren't allowed to set their own CgroupParent (received '{client_cgroup}')"
            )));
        }
        None => {}
    }

    if let Some(link) = &config.docker_link {
        let links = host_config_mut(root)?
            .entry("Links")
            .or_insert_with(|| json!([]));
        if links.is_null() {
            *links = json!([]);
        }
        match links {
            Value::Array(links) => links.push(json!(link)),
            other => {
                return Err(SockguardError::BadRequest(format!(
                    "unable to parse HostConfig.Links: {other}"
                )));
            }
        }
    }

    if let Some(user) = &config.user {
        root.insert("User".into(), json!(user));
    }

    Ok(serde_json::to_vec(&doc)?)
}

/// Image build: owner label into the `labels` query parameter plus the
/// cgroup parent rules (force the configured value, or refuse a
/// client-chosen one).
pub fn build(head: &mut RequestHead, config: &Config) -> SockguardResult<()> {
    label_query_labels(head, &config.owner)?;

    let mut pairs = query_pairs(head);
    let client_cgroup = pair_value(&pairs, "cgroupparent")
        .unwrap_or_default()
        .to_string();
    match &config.cgroup_parent {
        Some(parent) => {
            let parent = parent.clone();
            set_pair(&mut pairs, "cgroupparent", parent);
            write_query(head, pairs);
        }
        None if !client_cgroup.is_empty() => {
            return Err(SockguardError::Denied(format!(
                "Image builds aren't allowed to set their own CgroupParent (received '{client_cgroup}')"
            )));
        }
        None => {}
    }
    Ok(())
}

/// Network create: stamp the owner label and extract the network name for
/// the synthetic sibling attach that follows the upstream response.
pub fn network_create(body: &[u8], owner: &str) -> SockguardResult<(String, Vec<u8>)> {
    let mut doc: Value = serde_json::from_slice(body)?;
    let root = doc.as_object_mut().ok_or_else(|| {
        SockguardError::BadRequest("network create body must be a JSON object".into())
    })?;

    let name = root
        .get("Name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            SockguardError::BadRequest("failed to obtain network name from request".into())
        })?
        .to_string();

    insert_owner_label(root, owner);
    Ok((name, serde_json::to_vec(&doc)?))
}

fn host_config_mut<'a>(
    root: &'a mut Map<String, Value>,
) -> SockguardResult<&'a mut Map<String, Value>> {
    root.entry("HostConfig")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| SockguardError::BadRequest("HostConfig must be a JSON object".into()))
}

fn query_pairs(head: &RequestHead) -> Vec<(String, String)> {
    match head.query.as_deref() {
        Some(query) => form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        None => Vec::new(),
    }
}

fn pair_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: String) {
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value,
        None => pairs.push((key.to_string(), value)),
    }
}

/// Re-encode the query string with keys sorted, the way Go's `url.Values`
/// did for the clients this proxy was built against.
fn write_query(head: &mut RequestHead, mut pairs: Vec<(String, String)>) {
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    head.query = Some(serializer.finish());
}
