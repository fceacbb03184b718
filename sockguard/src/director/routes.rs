//! Route classification.
//!
//! Every inbound request is matched against an ordered table of
//! (methods, path pattern) rows; the first hit decides how the request is
//! handled. Order is load-bearing: `/containers/json` must be tried before
//! the generic `/containers/{id}` owner-check row, and `/networks/create`
//! before the `/networks/{id}` rows.

use std::sync::LazyLock;

use regex::Regex;

use crate::upstream::ResourceKind;

/// What the director does with a matched request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Forward untouched.
    PassThrough,
    /// Merge the owner label into the `filters` query parameter.
    LabelQueryFilters,
    /// Insert the owner label into the JSON body's `Labels` map.
    LabelBody,
    /// Container create: label plus the full containment policy.
    ContainerCreate,
    /// Image build: owner label in the `labels` query parameter plus the
    /// cgroup parent rules.
    Build,
    /// Network create, with the synthetic sibling attach afterwards.
    NetworkCreate,
    /// Network delete, with owner check and sibling detach first.
    NetworkDelete,
    /// Inspect the named resource upstream and gate on its owner label.
    CheckOwner {
        kind: ResourceKind,
        allow_missing_label: bool,
    },
}

impl Action {
    /// Whether the director needs the request body buffered before it can
    /// run this action.
    pub fn needs_body(&self) -> bool {
        matches!(
            self,
            Action::LabelBody | Action::ContainerCreate | Action::NetworkCreate
        )
    }
}

struct Route {
    /// Accepted methods; empty means any.
    methods: &'static [&'static str],
    pattern: Regex,
    action: Action,
}

fn route(methods: &'static [&'static str], pattern: &str, action: Action) -> Route {
    Route {
        methods,
        pattern: Regex::new(pattern).expect("route pattern"),
        action,
    }
}

static ROUTE_TABLE: LazyLock<Vec<Route>> = LazyLock::new(|| {
    use Action::*;
    vec![
        route(&["GET"], r"^/(_ping|version|info)$", PassThrough),
        route(&["GET"], r"^/events$", LabelQueryFilters),
        // Containers
        route(&["POST"], r"^/containers/create$", ContainerCreate),
        route(&["POST"], r"^/containers/prune$", LabelQueryFilters),
        route(&["GET"], r"^/containers/json$", LabelQueryFilters),
        route(
            &[],
            r"^/(containers|exec)/(\w+)\b",
            CheckOwner {
                kind: ResourceKind::Container,
                allow_missing_label: false,
            },
        ),
        // Builds
        route(&["POST"], r"^/build$", Build),
        route(&["POST"], r"^/build/prune$", LabelQueryFilters),
        // Images
        route(&["GET"], r"^/images/json$", LabelQueryFilters),
        route(&["POST"], r"^/images/prune$", LabelQueryFilters),
        route(
            &[],
            r"^/images/(\w+)\b",
            CheckOwner {
                kind: ResourceKind::Image,
                allow_missing_label: true,
            },
        ),
        // Networks
        route(&["GET"], r"^/networks$", LabelQueryFilters),
        route(&["POST"], r"^/networks/create$", NetworkCreate),
        route(&["POST"], r"^/networks/prune$", LabelQueryFilters),
        route(&["DELETE"], r"^/networks/(.+)$", NetworkDelete),
        route(
            &["GET", "POST"],
            r"^/networks/(.+?)(/(connect|disconnect))?$",
            CheckOwner {
                kind: ResourceKind::Network,
                allow_missing_label: true,
            },
        ),
        // Volumes
        route(&["GET"], r"^/volumes$", LabelQueryFilters),
        route(&["POST"], r"^/volumes/create$", LabelBody),
        route(&["POST"], r"^/volumes/prune$", LabelQueryFilters),
        route(
            &["GET", "DELETE"],
            r"^/volumes/(\w+)$",
            CheckOwner {
                kind: ResourceKind::Volume,
                allow_missing_label: true,
            },
        ),
    ]
});

static VERSION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v\d\.\d+\b").expect("version pattern"));

/// Strip a leading `/vX.Y` API version segment, if present.
pub fn strip_version(path: &str) -> &str {
    match VERSION_PREFIX.find(path) {
        Some(m) => &path[m.end()..],
        None => path,
    }
}

/// Match `(method, path)` against the route table. The path must already be
/// version-stripped. `None` means the route is not in the catalogue and the
/// request must be refused with 501.
pub fn classify(method: &str, path: &str) -> Option<Action> {
    ROUTE_TABLE
        .iter()
        .find(|route| {
            (route.methods.is_empty() || route.methods.contains(&method))
                && route.pattern.is_match(path)
        })
        .map(|route| route.action.clone())
}

/// Patterns used to pull a resource identifier out of an owner-checked path.
/// Tried in order; the first non-empty capture wins.
static IDENTIFIER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^/containers/(.+?)(?:/\w+)?$",
        r"^/networks/(.+?)(?:/\w+)?$",
        r"^/volumes/(\w+?)(?:/\w+)?$",
        r"^/images/(.+?)/(?:json|history|push|tag)$",
        r"^/images/([^/]+)$",
        r"^/images/(\w+/[^/]+)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("identifier pattern"))
    .collect()
});

/// Extract the resource identifier from a version-stripped path.
pub fn extract_identifier(path: &str) -> Option<String> {
    IDENTIFIER_PATTERNS.iter().find_map(|re| {
        re.captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|id| !id.is_empty())
    })
}
