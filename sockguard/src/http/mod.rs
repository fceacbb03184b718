//! Minimal HTTP/1.1 message layer.
//!
//! The proxy never needs a full HTTP stack: it parses exactly one request
//! head per client connection, optionally buffers a JSON body for rewriting,
//! and then degrades to a raw byte pump. This module provides the head
//! parsing/serialisation and body framing that supports that, over plain
//! buffered tokio streams.

pub mod body;
pub mod head;

pub use body::{BodyMode, read_body};
pub use head::{Header, RequestHead, ResponseHead, read_request_head, read_response_head};
