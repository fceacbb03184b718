//! HTTP/1.1 head parsing and serialisation.
//!
//! Heads are read from a stream into a caller-owned spill buffer; any bytes
//! beyond the blank line stay in the buffer for the body reader or the byte
//! pump. Head size is capped so a misbehaving client cannot grow the buffer
//! without bound.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{SockguardError, SockguardResult};
use crate::http::body::BodyMode;

/// Upper bound on a request or response head, including the blank line.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// HTTP versions the proxy speaks. Anything else is refused at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

/// A single header line. Name matching is case-insensitive everywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Parsed request line plus headers.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// First value of the named header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Replace every occurrence of the named header with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push(Header {
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Request target as it appears on the request line.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// How the request body is framed.
    pub fn body_mode(&self) -> SockguardResult<BodyMode> {
        if let Some(te) = self.header("Transfer-Encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyMode::Chunked);
            }
            return Err(SockguardError::BadRequest(format!(
                "unsupported transfer encoding {te:?}"
            )));
        }
        match self.header("Content-Length") {
            Some(raw) => {
                let len: u64 = raw.trim().parse().map_err(|_| {
                    SockguardError::BadRequest(format!("invalid Content-Length {raw:?}"))
                })?;
                if len == 0 {
                    Ok(BodyMode::Empty)
                } else {
                    Ok(BodyMode::Length(len))
                }
            }
            None => Ok(BodyMode::Empty),
        }
    }

    /// Install a replacement body: fixed Content-Length framing, any
    /// chunked encoding dropped.
    pub fn set_body_length(&mut self, len: usize) {
        self.remove_header("Transfer-Encoding");
        self.set_header("Content-Length", len.to_string());
    }

    /// Serialise the head, including the terminating blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.method,
            self.target(),
            self.version.as_str()
        );
        for header in &self.headers {
            out.push_str(&header.name);
            out.push_str(": ");
            out.push_str(&header.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Parsed response status line plus headers.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// How the response body is framed. Responses without explicit framing
    /// run until the peer closes the connection.
    pub fn body_mode(&self) -> SockguardResult<BodyMode> {
        if self.status / 100 == 1 || self.status == 204 || self.status == 304 {
            return Ok(BodyMode::Empty);
        }
        if let Some(te) = self.header("Transfer-Encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyMode::Chunked);
            }
            return Err(SockguardError::Upstream(format!(
                "unsupported transfer encoding {te:?} in upstream response"
            )));
        }
        match self.header("Content-Length") {
            Some(raw) => {
                let len: u64 = raw.trim().parse().map_err(|_| {
                    SockguardError::Upstream(format!(
                        "invalid Content-Length {raw:?} in upstream response"
                    ))
                })?;
                if len == 0 {
                    Ok(BodyMode::Empty)
                } else {
                    Ok(BodyMode::Length(len))
                }
            }
            None => Ok(BodyMode::UntilClose),
        }
    }
}

/// Read one request head from `stream`.
///
/// `spill` holds bytes read past the head; callers must hand the same buffer
/// to the body reader or forward it verbatim. Returns `None` on a clean EOF
/// before the first byte (client connected and went away).
pub async fn read_request_head<R>(
    stream: &mut R,
    spill: &mut Vec<u8>,
) -> SockguardResult<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    match read_head_bytes(stream, spill).await? {
        Some(raw) => Ok(Some(parse_request_head(&raw)?)),
        None => Ok(None),
    }
}

/// Read one response head from `stream`. EOF is an upstream error here:
/// the daemon hung up before answering.
pub async fn read_response_head<R>(
    stream: &mut R,
    spill: &mut Vec<u8>,
) -> SockguardResult<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    match read_head_bytes(stream, spill).await? {
        Some(raw) => parse_response_head(&raw),
        None => Err(SockguardError::Upstream(
            "upstream closed the connection before responding".into(),
        )),
    }
}

/// Accumulate bytes until the head terminator, splitting the head off the
/// front of `spill`.
async fn read_head_bytes<R>(stream: &mut R, spill: &mut Vec<u8>) -> SockguardResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut scan_from = 0;
    loop {
        if let Some(end) = find_head_end(&spill[scan_from..]).map(|i| scan_from + i) {
            let rest = spill.split_off(end + 4);
            let head = std::mem::replace(spill, rest);
            return Ok(Some(head));
        }
        if spill.len() > MAX_HEAD_BYTES {
            return Err(SockguardError::BadRequest("HTTP head too large".into()));
        }
        // The terminator can straddle a read boundary.
        scan_from = spill.len().saturating_sub(3);

        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if spill.is_empty() {
                return Ok(None);
            }
            return Err(SockguardError::BadRequest(
                "connection closed mid-header".into(),
            ));
        }
        spill.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_head(raw: &[u8]) -> SockguardResult<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| SockguardError::BadRequest("request head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| SockguardError::BadRequest("empty request head".into()))?;

    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => {
            return Err(SockguardError::BadRequest(format!(
                "malformed request line {request_line:?}"
            )));
        }
    };
    let version = Version::parse(version).ok_or_else(|| {
        SockguardError::BadRequest(format!("unsupported HTTP version {version:?}"))
    })?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    Ok(RequestHead {
        method: method.to_string(),
        path,
        query,
        version,
        headers: parse_header_lines(lines)?,
    })
}

fn parse_response_head(raw: &[u8]) -> SockguardResult<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| SockguardError::Upstream("response head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| SockguardError::Upstream("empty response head".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(Version::parse)
        .ok_or_else(|| SockguardError::Upstream(format!("malformed status line {status_line:?}")))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SockguardError::Upstream(format!("malformed status line {status_line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(lines)
        .map_err(|e| SockguardError::Upstream(format!("bad upstream response: {e}")))?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

fn parse_header_lines<'a, I>(lines: I) -> SockguardResult<Vec<Header>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            SockguardError::BadRequest(format!("malformed header line {line:?}"))
        })?;
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            return Err(SockguardError::BadRequest(format!(
                "malformed header name {name:?}"
            )));
        }
        headers.push(Header {
            name: name.to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(headers)
}
