//! Proxy configuration.
//!
//! All options are read once at startup and shared read-only between
//! connection handlers; nothing here mutates after [`Config::validate`].

use std::path::PathBuf;

use crate::director::link::DockerLink;
use crate::error::{SockguardError, SockguardResult};

/// Policy configuration for the director.
///
/// Field semantics follow the command line flags one-to-one; `None` means
/// the corresponding flag was not given.
#[derive(Clone, Debug)]
pub struct Config {
    /// Owner identifier written into the ownership label on create, and
    /// compared against on every subsequent operation.
    pub owner: String,

    /// Absolute path prefixes under which host binds are permitted. Host
    /// binds outside every prefix are refused on container create.
    pub allow_binds: Vec<PathBuf>,

    /// Permit `HostConfig.NetworkMode == "host"` on container create.
    pub allow_host_mode_networking: bool,

    /// Cgroup parent forced onto new containers and image builds. When
    /// unset, clients supplying their own cgroup parent are refused.
    pub cgroup_parent: Option<String>,

    /// User forced onto new containers.
    pub user: Option<String>,

    /// `name` or `name:alias` appended to `HostConfig.Links` on container
    /// create; the container part is also attached to networks created
    /// through the proxy. Mutually exclusive with `join_network`.
    pub docker_link: Option<String>,

    /// Container name/id connected to every network created through the
    /// proxy (and disconnected before delete).
    pub join_network: Option<String>,

    /// Network alias registered for `join_network` on those connects.
    pub join_network_alias: Option<String>,
}

impl Config {
    /// Configuration with the given owner and everything else off.
    pub fn with_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            allow_binds: Vec::new(),
            allow_host_mode_networking: false,
            cgroup_parent: None,
            user: None,
            docker_link: None,
            join_network: None,
            join_network_alias: None,
        }
    }

    /// Check cross-field consistency.
    ///
    /// `docker_link` and `join_network` both attach a sibling container to
    /// new networks; configuring both is ambiguous and refused. An alias
    /// only makes sense together with `join_network`, and a `docker_link`
    /// value must parse as `name` or `name:alias`.
    pub fn validate(&self) -> SockguardResult<()> {
        if self.docker_link.is_some() && self.join_network.is_some() {
            return Err(SockguardError::BadRequest(
                "docker-link and join-network cannot be used together".into(),
            ));
        }
        if self.join_network_alias.is_some() && self.join_network.is_none() {
            return Err(SockguardError::BadRequest(
                "join-network-alias requires join-network".into(),
            ));
        }
        if let Some(link) = &self.docker_link {
            DockerLink::parse(link)?;
        }
        Ok(())
    }

    /// The sibling container to connect to freshly created networks, if any:
    /// the container part of `docker_link`, or `join_network`.
    pub fn sibling_container(&self) -> SockguardResult<Option<String>> {
        if let Some(link) = &self.docker_link {
            return Ok(Some(DockerLink::parse(link)?.container));
        }
        Ok(self.join_network.clone())
    }

    /// Alias to register on synthetic network connects. Only meaningful for
    /// `join_network`; a docker link carries its alias in the link itself.
    pub fn sibling_alias(&self) -> Option<&str> {
        if self.join_network.is_some() {
            self.join_network_alias.as_deref()
        } else {
            None
        }
    }
}
