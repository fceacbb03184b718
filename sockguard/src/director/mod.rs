//! The director: route classification, rewriting and policy.
//!
//! The proxy hands every parsed request to [`Director::direct`], which
//! returns either a [`Directive`] (forward this, possibly rewritten, and
//! maybe do follow-up work afterwards) or an error that is serialised to the
//! client as a JSON error document. All policy lives here; the proxy itself
//! only moves bytes.

pub mod link;
pub mod rewrite;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::constants::OWNER_LABEL_KEY;
use crate::error::{SockguardError, SockguardResult};
use crate::http::RequestHead;
use crate::upstream::{InspectOutcome, ResourceKind, UpstreamClient};

pub use routes::Action;

/// A request the director has cleared for forwarding.
#[derive(Debug)]
pub struct Directive {
    pub head: RequestHead,
    /// Replacement body, when the rewrite buffered and modified it. `None`
    /// means the original body bytes stream through untouched.
    pub body: Option<Vec<u8>>,
    /// Work to run after the upstream response has been relayed.
    pub follow_up: Option<FollowUp>,
}

impl Directive {
    fn forward(head: RequestHead) -> Self {
        Self {
            head,
            body: None,
            follow_up: None,
        }
    }

    fn with_body(mut head: RequestHead, body: Vec<u8>) -> Self {
        head.set_body_length(body.len());
        Self {
            head,
            body: Some(body),
            follow_up: None,
        }
    }
}

/// Side effects that must run only after the main response is on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FollowUp {
    /// Attach the configured sibling container to a network this request
    /// just created.
    ConnectSibling { network: String },
}

/// Classifies, rewrites and gates requests according to the configured
/// policy. Stateless between requests; every ownership decision re-reads the
/// daemon.
#[derive(Clone, Debug)]
pub struct Director {
    config: Arc<Config>,
    upstream: UpstreamClient,
}

impl Director {
    pub fn new(config: Config, upstream: UpstreamClient) -> Self {
        Self {
            config: Arc::new(config),
            upstream,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Match a request against the route table. `None` is an unmapped route
    /// and must be refused with 501.
    pub fn classify(&self, head: &RequestHead) -> Option<Action> {
        routes::classify(&head.method, routes::strip_version(&head.path))
    }

    /// Apply `action` to the request. `body` must be the buffered request
    /// body for actions where [`Action::needs_body`] is true.
    pub async fn direct(
        &self,
        action: Action,
        mut head: RequestHead,
        body: Option<Vec<u8>>,
    ) -> SockguardResult<Directive> {
        let owner = self.config.owner.as_str();
        match action {
            Action::PassThrough => Ok(Directive::forward(head)),
            Action::LabelQueryFilters => {
                rewrite::label_query_filters(&mut head, owner)?;
                Ok(Directive::forward(head))
            }
            Action::LabelBody => {
                let body = rewrite::label_body(&body.unwrap_or_default(), owner)?;
                Ok(Directive::with_body(head, body))
            }
            Action::Build => {
                rewrite::build(&mut head, &self.config)?;
                Ok(Directive::forward(head))
            }
            Action::ContainerCreate => {
                let body = rewrite::container_create(&body.unwrap_or_default(), &self.config)?;
                Ok(Directive::with_body(head, body))
            }
            Action::NetworkCreate => {
                let (network, body) =
                    rewrite::network_create(&body.unwrap_or_default(), owner)?;
                let mut directive = Directive::with_body(head, body);
                if self.config.sibling_container()?.is_some() {
                    directive.follow_up = Some(FollowUp::ConnectSibling { network });
                }
                Ok(directive)
            }
            Action::NetworkDelete => {
                let stripped = routes::strip_version(&head.path).to_string();
                let network = self
                    .check_owner(ResourceKind::Network, true, &stripped)
                    .await?;
                if let Some(sibling) = self.config.sibling_container()? {
                    // Detach before the delete forwards, or the daemon will
                    // refuse to remove a network with endpoints.
                    self.upstream.disconnect_network(&network, &sibling).await?;
                    tracing::info!(%network, container = %sibling, "detached sibling container before network delete");
                }
                Ok(Directive::forward(head))
            }
            Action::CheckOwner {
                kind,
                allow_missing_label,
            } => {
                let stripped = routes::strip_version(&head.path).to_string();
                self.check_owner(kind, allow_missing_label, &stripped).await?;
                Ok(Directive::forward(head))
            }
        }
    }

    /// Run deferred work once the main response has been written.
    pub async fn run_follow_up(&self, follow_up: &FollowUp) -> SockguardResult<()> {
        match follow_up {
            FollowUp::ConnectSibling { network } => {
                let Some(sibling) = self.config.sibling_container()? else {
                    return Ok(());
                };
                self.upstream
                    .connect_network(network, &sibling, self.config.sibling_alias())
                    .await?;
                tracing::info!(
                    %network,
                    container = %sibling,
                    alias = self.config.sibling_alias(),
                    "attached sibling container to new network"
                );
                Ok(())
            }
        }
    }

    /// Inspect the resource named in `path` and gate on its owner label.
    /// Returns the extracted identifier so callers can reuse it. A missing
    /// resource is allowed through: the daemon will serve the client the
    /// same 404 it served us.
    async fn check_owner(
        &self,
        kind: ResourceKind,
        allow_missing_label: bool,
        path: &str,
    ) -> SockguardResult<String> {
        let identifier = routes::extract_identifier(path).ok_or_else(|| {
            SockguardError::Upstream(format!("unable to find an identifier in {path}"))
        })?;

        match self.upstream.inspect_labels(kind, &identifier).await? {
            InspectOutcome::NotFound => {
                tracing::debug!(%kind, %identifier, "resource not found upstream, allowing");
                Ok(identifier)
            }
            InspectOutcome::Labels(labels) => match labels.get(OWNER_LABEL_KEY) {
                Some(actual) if actual == &self.config.owner => {
                    tracing::debug!(%kind, %identifier, "owner label matches, allowing");
                    Ok(identifier)
                }
                None if allow_missing_label => {
                    tracing::debug!(%kind, %identifier, "no owner label, allowing");
                    Ok(identifier)
                }
                actual => {
                    tracing::warn!(
                        %kind,
                        %identifier,
                        actual = actual.map(String::as_str),
                        wanted = %self.config.owner,
                        "owner label mismatch, denying"
                    );
                    Err(SockguardError::Denied(format!(
                        "Unauthorized access to {kind}"
                    )))
                }
            },
        }
    }
}
