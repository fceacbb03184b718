//! Body framing.
//!
//! Bodies are only ever buffered when a rewrite needs them (JSON create
//! bodies, inspect responses); pass-through traffic goes straight to the
//! byte pump. Buffered reads are capped so a client cannot make the proxy
//! hold a build context in memory.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{SockguardError, SockguardResult};

/// Largest body the proxy will buffer for rewriting or inspection.
pub const MAX_BUFFERED_BODY_BYTES: usize = 16 * 1024 * 1024;

/// How a message body is framed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMode {
    /// No body at all.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the peer closes (responses only).
    UntilClose,
}

/// Read a complete body according to `mode`, consuming `spill` first.
pub async fn read_body<R>(
    stream: &mut R,
    spill: &mut Vec<u8>,
    mode: BodyMode,
) -> SockguardResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match mode {
        BodyMode::Empty => Ok(Vec::new()),
        BodyMode::Length(len) => {
            if len > MAX_BUFFERED_BODY_BYTES as u64 {
                return Err(SockguardError::BadRequest(format!(
                    "body of {len} bytes is too large to rewrite"
                )));
            }
            read_exact_buffered(stream, spill, len as usize).await
        }
        BodyMode::Chunked => read_chunked(stream, spill).await,
        BodyMode::UntilClose => {
            let mut body = std::mem::take(spill);
            loop {
                if body.len() > MAX_BUFFERED_BODY_BYTES {
                    return Err(SockguardError::BadRequest(
                        "close-delimited body too large to buffer".into(),
                    ));
                }
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(body);
                }
                body.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Take exactly `len` bytes, draining `spill` before touching the stream.
async fn read_exact_buffered<R>(
    stream: &mut R,
    spill: &mut Vec<u8>,
    len: usize,
) -> SockguardResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if spill.len() >= len {
        let rest = spill.split_off(len);
        return Ok(std::mem::replace(spill, rest));
    }

    let mut body = std::mem::take(spill);
    body.reserve(len - body.len());
    while body.len() < len {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SockguardError::BadRequest(
                "connection closed mid-body".into(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    // Anything past the declared length belongs to the next message.
    let rest = body.split_off(len);
    *spill = rest;
    Ok(body)
}

/// Decode a chunked body into its plain payload. Trailers are read and
/// discarded; chunk extensions are ignored.
async fn read_chunked<R>(stream: &mut R, spill: &mut Vec<u8>) -> SockguardResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream, spill).await?;
        let size_token = size_line
            .split(';')
            .next()
            .map(str::trim)
            .unwrap_or_default();
        let size = usize::from_str_radix(size_token, 16).map_err(|_| {
            SockguardError::BadRequest(format!("invalid chunk size {size_token:?}"))
        })?;

        if size == 0 {
            // Trailer section: header lines until a blank one.
            loop {
                if read_line(stream, spill).await?.is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len() + size > MAX_BUFFERED_BODY_BYTES {
            return Err(SockguardError::BadRequest(
                "chunked body too large to rewrite".into(),
            ));
        }
        body.extend_from_slice(&read_exact_buffered(stream, spill, size).await?);

        let terminator = read_exact_buffered(stream, spill, 2).await?;
        if terminator != b"\r\n" {
            return Err(SockguardError::BadRequest(
                "missing CRLF after chunk data".into(),
            ));
        }
    }
}

/// Read a CRLF-terminated line, without the terminator.
async fn read_line<R>(stream: &mut R, spill: &mut Vec<u8>) -> SockguardResult<String>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = spill.windows(2).position(|w| w == b"\r\n") {
            let rest = spill.split_off(pos + 2);
            let mut line = std::mem::replace(spill, rest);
            line.truncate(pos);
            return String::from_utf8(line)
                .map_err(|_| SockguardError::BadRequest("chunk line is not valid UTF-8".into()));
        }
        if spill.len() > 8 * 1024 {
            return Err(SockguardError::BadRequest("chunk line too long".into()));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SockguardError::BadRequest(
                "connection closed mid-chunk".into(),
            ));
        }
        spill.extend_from_slice(&chunk[..n]);
    }
}
