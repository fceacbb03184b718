//! Error types for the proxy.
//!
//! Errors are categorised by how they surface to the client:
//! - [`SockguardError::Denied`]: a policy rule refused the request (401)
//! - [`SockguardError::BadRequest`]: the client sent something unparseable (400)
//! - [`SockguardError::Upstream`]: the Docker daemon misbehaved or was
//!   unreachable (500)
//! - [`SockguardError::NotImplemented`]: the route is not in the catalogue (501)
//!
//! Every error that reaches the client is serialised as a JSON document of
//! the shape `{"message": "<text>"}` with the status from [`SockguardError::http_status`].

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type SockguardResult<T> = Result<T, SockguardError>;

/// Errors that can occur while directing or forwarding a request.
#[derive(Debug, Error)]
pub enum SockguardError {
    /// A containment or ownership rule refused the request.
    #[error("{0}")]
    Denied(String),

    /// The request could not be parsed or rewritten.
    #[error("{0}")]
    BadRequest(String),

    /// The upstream daemon was unreachable or returned something unexpected.
    #[error("{0}")]
    Upstream(String),

    /// The route is not part of the intercepted catalogue.
    #[error("{0} not implemented yet")]
    NotImplemented(String),

    /// Generic I/O error talking to either socket.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl SockguardError {
    /// HTTP status the error maps to in the client-facing error document.
    pub fn http_status(&self) -> u16 {
        match self {
            SockguardError::Denied(_) => 401,
            SockguardError::BadRequest(_) => 400,
            SockguardError::Upstream(_) | SockguardError::Io(_) => 500,
            SockguardError::NotImplemented(_) => 501,
        }
    }

    /// Message placed into the `{"message": ...}` error document.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

impl From<serde_json::Error> for SockguardError {
    fn from(err: serde_json::Error) -> Self {
        SockguardError::BadRequest(err.to_string())
    }
}
