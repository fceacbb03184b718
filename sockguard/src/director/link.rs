//! Bind mount policy and docker-link parsing.

use std::path::{Component, Path, PathBuf};

use crate::error::{SockguardError, SockguardResult};

/// A `--link` target: container name or id, plus the alias it is linked as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DockerLink {
    pub container: String,
    pub alias: String,
}

impl DockerLink {
    /// Parse `name` or `name:alias`. A bare name is its own alias.
    pub fn parse(input: &str) -> SockguardResult<Self> {
        if input.is_empty() {
            return Err(SockguardError::BadRequest(
                "container link is empty, cannot proceed".into(),
            ));
        }
        let mut parts = input.split(':');
        let container = parts.next().unwrap_or_default().to_string();
        let alias = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(SockguardError::BadRequest(format!(
                "expected 'name-or-id' or 'name-or-id:alias', got {input:?}"
            )));
        }
        Ok(DockerLink {
            alias: alias.unwrap_or_else(|| container.clone()),
            container,
        })
    }
}

/// Decide whether a `Binds` entry may pass.
///
/// The source token of `src:dest[:ro]` is a host path iff it contains any of
/// `.`, `/` or `\`; everything else is a named volume and always permitted.
/// Host paths are cleaned to an absolute path and must start with one of the
/// allowed prefixes.
pub fn is_bind_allowed(bind: &str, allowed: &[PathBuf]) -> bool {
    let source = bind.split(':').next().unwrap_or_default();

    if !source.contains(['.', '/', '\\']) {
        // Named volume.
        return true;
    }

    let host_source = clean_host_path(source);
    allowed
        .iter()
        .any(|prefix| host_source.starts_with(&prefix.to_string_lossy().into_owned()))
}

/// Lexically resolve a host source to a rooted path: `..` pops, `.` and
/// redundant separators vanish. The result always begins with `/`, so
/// relative sources cannot sidestep the prefix check.
fn clean_host_path(source: &str) -> String {
    let mut cleaned = PathBuf::from("/");
    for component in Path::new(source).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    cleaned.to_string_lossy().into_owned()
}
