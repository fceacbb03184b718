//! sockguard - a guarding proxy for the Docker control socket.
//!
//! The proxy listens on a local unix socket and relays HTTP requests to the
//! real Docker socket, but only after enforcing an ownership and containment
//! policy: everything a client creates through the proxy is stamped with an
//! owner label, and later operations on named resources are refused unless
//! the resource carries the matching label. Requests are also rewritten on
//! the way through to strip dangerous capabilities (privileged containers,
//! host networking, arbitrary host binds, client-chosen cgroup parents).
//!
//! The crate is organised around three pieces:
//!
//! - [`director`]: classifies each request against a fixed route table and
//!   rewrites or refuses it.
//! - [`upstream`]: a small HTTP client for the real Docker socket, used for
//!   inspects and the synthetic network connect/disconnect calls.
//! - [`proxy`]: the listener loop and the hijacking byte pump that carries
//!   the (possibly rewritten) request to the upstream and shuttles the raw
//!   response bytes back, including attach/exec streams.

pub mod config;
pub mod constants;
pub mod director;
pub mod error;
pub mod http;
pub mod proxy;
pub mod upstream;

pub use config::Config;
pub use director::Director;
pub use error::{SockguardError, SockguardResult};
pub use proxy::SocketProxy;
pub use upstream::UpstreamClient;
