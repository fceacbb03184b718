//! HTTP client for the real Docker socket.
//!
//! Used for the proxy's own calls: ownership inspects, the synthetic network
//! connect/disconnect around network create/delete, and the startup sibling
//! pre-check. Each call dials a fresh connection and closes it afterwards;
//! the daemon is the source of truth, so nothing is cached.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::constants::API_VERSION;
use crate::error::{SockguardError, SockguardResult};
use crate::http::{head, read_body};

/// The kinds of resource the proxy gates access to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Image,
    Network,
    Volume,
}

impl ResourceKind {
    /// Inspect target for one resource, at the proxy's own API version.
    fn inspect_target(self, id: &str) -> String {
        match self {
            ResourceKind::Container => format!("/v{API_VERSION}/containers/{id}/json"),
            ResourceKind::Image => format!("/v{API_VERSION}/images/{id}/json"),
            ResourceKind::Network => format!("/v{API_VERSION}/networks/{id}"),
            ResourceKind::Volume => format!("/v{API_VERSION}/volumes/{id}"),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Container => "container",
            ResourceKind::Image => "image",
            ResourceKind::Network => "network",
            ResourceKind::Volume => "volume",
        })
    }
}

/// Result of an ownership inspect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InspectOutcome {
    /// The resource does not exist upstream. Callers forward the request and
    /// let the daemon produce its own 404.
    NotFound,
    /// The resource exists and carries these labels (possibly none).
    Labels(HashMap<String, String>),
}

/// Client for the upstream Docker socket. Cheap to clone; safe to share
/// between connection handlers.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    socket_path: PathBuf,
}

impl UpstreamClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Fetch the labels of one resource.
    pub async fn inspect_labels(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> SockguardResult<InspectOutcome> {
        let (status, payload) = self.request("GET", &kind.inspect_target(id), None).await?;
        match status {
            404 => Ok(InspectOutcome::NotFound),
            200 => Ok(InspectOutcome::Labels(parse_inspect_labels(
                kind, &payload,
            )?)),
            other => Err(SockguardError::Upstream(format!(
                "inspect of {kind} {id:?} failed with status {other}"
            ))),
        }
    }

    /// Attach `container` to `network`, optionally registering an alias.
    pub async fn connect_network(
        &self,
        network: &str,
        container: &str,
        alias: Option<&str>,
    ) -> SockguardResult<()> {
        let mut body = json!({ "Container": container });
        if let Some(alias) = alias {
            body["EndpointConfig"] = json!({ "Aliases": [alias] });
        }
        let target = format!("/v{API_VERSION}/networks/{network}/connect");
        let (status, _) = self
            .request("POST", &target, Some(serde_json::to_vec(&body)?))
            .await?;
        if status != 200 {
            return Err(SockguardError::BadRequest(format!(
                "expected 200 but got {status} attaching container '{container}' to network '{network}'"
            )));
        }
        Ok(())
    }

    /// Forcibly detach `container` from `network` so the network can be
    /// deleted out from under it.
    pub async fn disconnect_network(&self, network: &str, container: &str) -> SockguardResult<()> {
        let body = json!({ "Container": container, "Force": true });
        let target = format!("/v{API_VERSION}/networks/{network}/disconnect");
        let (status, _) = self
            .request("POST", &target, Some(serde_json::to_vec(&body)?))
            .await?;
        if status != 200 {
            return Err(SockguardError::BadRequest(format!(
                "expected 200 but got {status} detaching container '{container}' from network '{network}'"
            )));
        }
        Ok(())
    }

    /// Startup pre-check for the configured sibling container.
    pub async fn container_exists(&self, id: &str) -> SockguardResult<bool> {
        let target = format!("/v{API_VERSION}/containers/{id}/json");
        let (status, _) = self.request("GET", &target, None).await?;
        match status {
            200 => Ok(true),
            404 => Ok(false),
            other => Err(SockguardError::Upstream(format!(
                "unexpected status {other} checking whether container '{id}' exists"
            ))),
        }
    }

    /// One HTTP/1.1 exchange over a fresh connection.
    async fn request(
        &self,
        method: &str,
        target: &str,
        json_body: Option<Vec<u8>>,
    ) -> SockguardResult<(u16, Vec<u8>)> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            SockguardError::Upstream(format!(
                "failed to dial upstream socket {}: {e}",
                self.socket_path.display()
            ))
        })?;

        let mut message = format!("{method} {target} HTTP/1.1\r\nHost: docker\r\nConnection: close\r\n");
        if let Some(body) = &json_body {
            message.push_str("Content-Type: application/json\r\n");
            message.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        message.push_str("\r\n");

        stream.write_all(message.as_bytes()).await?;
        if let Some(body) = &json_body {
            stream.write_all(body).await?;
        }
        stream.flush().await?;

        let mut spill = Vec::new();
        let response = head::read_response_head(&mut stream, &mut spill).await?;
        let mode = response.body_mode()?;
        let payload = read_body(&mut stream, &mut spill, mode)
            .await
            .map_err(|e| SockguardError::Upstream(format!("reading upstream response: {e}")))?;
        Ok((response.status, payload))
    }
}

/// Pull the owner-label map out of an inspect document. Containers and
/// images keep labels under `Config.Labels`; networks and volumes at the top
/// level. A JSON `null` or absent map means no labels.
fn parse_inspect_labels(
    kind: ResourceKind,
    payload: &[u8],
) -> SockguardResult<HashMap<String, String>> {
    #[derive(Default, Deserialize)]
    struct NestedConfig {
        #[serde(default, rename = "Labels")]
        labels: Option<HashMap<String, String>>,
    }

    #[derive(Deserialize)]
    struct NestedInspect {
        #[serde(default, rename = "Config")]
        config: NestedConfig,
    }

    #[derive(Deserialize)]
    struct TopLevelInspect {
        #[serde(default, rename = "Labels")]
        labels: Option<HashMap<String, String>>,
    }

    let labels = match kind {
        ResourceKind::Container | ResourceKind::Image => {
            serde_json::from_slice::<NestedInspect>(payload)
                .map_err(|e| SockguardError::Upstream(format!("bad {kind} inspect document: {e}")))?
                .config
                .labels
        }
        ResourceKind::Network | ResourceKind::Volume => {
            serde_json::from_slice::<TopLevelInspect>(payload)
                .map_err(|e| SockguardError::Upstream(format!("bad {kind} inspect document: {e}")))?
                .labels
        }
    };
    Ok(labels.unwrap_or_default())
}
