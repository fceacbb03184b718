//! Constants shared across the proxy.
//!
//! These values are part of the proxy's observable behaviour: the label key
//! is written onto resources in the real Docker daemon, and the API version
//! is baked into the URLs of the synthetic calls the proxy issues itself.

/// Label key stamped onto every resource created through the proxy.
///
/// The value is the owner identifier chosen at startup.
pub const OWNER_LABEL_KEY: &str = "com.buildkite.sockguard.owner";

/// Docker API version used for the proxy's own upstream calls (inspects and
/// network connect/disconnect). Pass-through traffic keeps whatever version
/// the client asked for.
pub const API_VERSION: &str = "1.32";
