//! The socket proxy: accept loop and hijacking byte pump.
//!
//! Each accepted connection carries exactly one directed request. The head
//! is parsed, the director classifies and rewrites it, and then the proxy
//! degrades to a raw relay: the rewritten head (and any buffered body) is
//! written to a fresh upstream connection and both directions are pumped
//! until they close. Treating the tail of the connection as opaque bytes is
//! what makes attach and exec streams work without the proxy understanding
//! them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::director::{Directive, Director};
use crate::error::{SockguardError, SockguardResult};
use crate::http::{BodyMode, RequestHead, read_body, read_request_head};

/// Accepts client connections and relays directed requests upstream.
pub struct SocketProxy {
    director: Director,
    counter: AtomicU64,
}

impl SocketProxy {
    pub fn new(director: Director) -> Self {
        Self {
            director,
            counter: AtomicU64::new(0),
        }
    }

    /// Accept loop. Each connection gets an id (for log correlation only)
    /// and an independent handler task. Runs until the listener fails,
    /// which in practice means shutdown closed it.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> SockguardResult<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            let id = proxy.counter.fetch_add(1, Ordering::Relaxed) + 1;
            tokio::spawn(async move {
                proxy.handle_connection(stream, id).await;
            });
        }
    }

    async fn handle_connection(&self, mut client: UnixStream, id: u64) {
        let mut spill = Vec::new();
        let head = match read_request_head(&mut client, &mut spill).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                tracing::trace!(id, "client connected and closed without a request");
                return;
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "failed to read request head");
                let _ = write_error(&mut client, &err).await;
                return;
            }
        };

        tracing::info!(
            id,
            method = %head.method,
            target = %head.target(),
            content_length = head.header("Content-Length").unwrap_or("0"),
            "request"
        );

        if let Err(err) = self.serve_request(&mut client, &mut spill, head, id).await {
            tracing::warn!(id, status = err.http_status(), error = %err, "refusing request");
            let _ = write_error(&mut client, &err).await;
        }
    }

    async fn serve_request(
        &self,
        client: &mut UnixStream,
        spill: &mut Vec<u8>,
        head: RequestHead,
        id: u64,
    ) -> SockguardResult<()> {
        let Some(action) = self.director.classify(&head) else {
            return Err(SockguardError::NotImplemented(format!(
                "{} {}",
                head.method, head.path
            )));
        };
        tracing::debug!(id, ?action, "classified request");

        // Rewrites need the whole body up front; everything else leaves the
        // body on the wire for the pump.
        let mut consumed_body = false;
        let body = if action.needs_body() {
            let mode = head.body_mode()?;
            consumed_body = true;
            Some(read_body(client, spill, mode).await?)
        } else {
            None
        };

        let directive = self.director.direct(action, head, body).await?;
        self.forward(client, spill, directive, consumed_body, id)
            .await
    }

    /// Relay the directed request: serialise it onto a fresh upstream
    /// connection, then pump raw bytes both ways until both sides close.
    async fn forward(
        &self,
        client: &mut UnixStream,
        spill: &mut Vec<u8>,
        directive: Directive,
        consumed_body: bool,
        id: u64,
    ) -> SockguardResult<()> {
        let Directive {
            mut head,
            body,
            follow_up,
        } = directive;

        if !spill.is_empty() {
            // Buffered bytes past the parsed message are only legitimate
            // when they are body content still owed to this request. On a
            // bodyless route (or after the body was fully consumed for a
            // rewrite) they are a pipelined second request; relaying it
            // would bypass the director entirely, so the connection is
            // torn down instead.
            let body_follows = !consumed_body && head.body_mode()? != BodyMode::Empty;
            if !body_follows {
                tracing::error!(
                    id,
                    buffered = spill.len(),
                    "unexpected bytes buffered beyond the directed request, aborting connection"
                );
                return Ok(());
            }
        }

        let upstream_path = self.director.upstream().socket_path();
        let mut upstream = match UnixStream::connect(upstream_path).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(id, error = %err, path = %upstream_path.display(), "upstream dial failed");
                return Err(SockguardError::Upstream(
                    "Error contacting backend server.".into(),
                ));
            }
        };

        // Critical: without this a keep-alive client would pipeline its next
        // request straight into the upstream socket, bypassing the director.
        head.set_header("Connection", "close");

        upstream.write_all(&head.encode()).await?;
        if let Some(body) = &body {
            upstream.write_all(body).await?;
        }
        if !consumed_body && !spill.is_empty() {
            // Body bytes that arrived in the same read as the head.
            upstream.write_all(spill).await?;
            spill.clear();
        }
        upstream.flush().await?;

        // Hijack: both connections are raw byte streams from here on.
        let (mut client_read, mut client_write) = client.split();
        let (mut upstream_read, mut upstream_write) = upstream.split();

        let client_to_upstream = async {
            let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
            let _ = upstream_write.shutdown().await;
            copied
        };
        let upstream_to_client = async {
            let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            copied
        };

        let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
        match sent {
            Ok(bytes) => tracing::debug!(id, bytes, "client to upstream finished"),
            Err(err) => tracing::debug!(id, error = %err, "client to upstream aborted"),
        }
        match received {
            Ok(bytes) => tracing::debug!(id, bytes, "upstream to client finished"),
            Err(err) => tracing::debug!(id, error = %err, "upstream to client aborted"),
        }

        if let Some(follow_up) = follow_up {
            if let Err(err) = self.director.run_follow_up(&follow_up).await {
                tracing::error!(id, error = %err, "follow-up after relayed response failed");
                // The response is already on the wire; the best we can do is
                // append an error document the client may or may not read.
                let _ = write_error(client, &err).await;
            }
        }

        Ok(())
    }
}

/// Serialise an error as the JSON error document the Docker CLI understands.
async fn write_error<W>(stream: &mut W, err: &SockguardError) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = err.http_status();
    let reason = match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Error",
    };
    let body = serde_json::json!({ "message": err.client_message() }).to_string();
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}
