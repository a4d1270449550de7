//! Pre-upgrade HTTP handling.
//!
//! The accept path reads the request head once to decide between three
//! outcomes: serve a plain request inline, reject an upgrade outside
//! the API namespace with 403, or hand the stream (rewound, so the
//! WebSocket handshake can re-read the head) to the protocol upgrade.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound on the request head; anything larger is abusive.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Parsed request line and headers of one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Value of one cookie from the Cookie header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header("cookie")?;
        raw.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.to_string())
    }

    /// Whether the client can hold cookies: it either sent some or
    /// identifies as a browser.
    pub fn is_cookie_capable(&self) -> bool {
        if self.header("cookie").is_some() {
            return true;
        }
        self.header("user-agent")
            .map(|ua| ua.starts_with("Mozilla"))
            .unwrap_or(false)
    }

    /// Whether the client identifies as the native app, which runs its
    /// own liveness and gets no server pings.
    pub fn is_native_client(&self, ua_prefix: &str) -> bool {
        !ua_prefix.is_empty()
            && self
                .header("user-agent")
                .map(|ua| ua.starts_with(ua_prefix))
                .unwrap_or(false)
    }
}

/// Reads the request head (through the blank line) and parses it.
///
/// Returns every byte consumed so the caller can rewind the stream for
/// the WebSocket handshake.
pub async fn read_head<S>(stream: &mut S) -> io::Result<(Vec<u8>, RequestHead)>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if find_head_end(&buf).is_some() {
            break;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    // find_head_end succeeded just above
    let head_len = find_head_end(&buf).unwrap_or(buf.len());
    let head = parse_head(&buf[..head_len]).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "malformed request head")
    })?;
    Ok((buf, head))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(bytes: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    parts.next()?; // HTTP version

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(RequestHead {
        method,
        target,
        headers,
    })
}

/// Serves a non-upgrade request inline and closes the stream.
///
/// Catalog rendering and static files live behind the reverse proxy;
/// the gateway only answers its own health route.
pub async fn serve_inline<S>(mut stream: S, head: &RequestHead) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (status, body) = match (head.method.as_str(), head.path()) {
        ("GET", "/healthz") => ("200 OK", "ok\n"),
        _ => ("404 Not Found", "not found\n"),
    };
    write_response(&mut stream, status, body).await
}

/// Rejects an upgrade outside the API namespace.
pub async fn reject_forbidden<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response(&mut stream, "403 Forbidden", "forbidden\n").await
}

async fn write_response<S>(stream: &mut S, status: &str, body: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Replays buffered bytes before reading from the inner stream, so the
/// WebSocket handshake can re-parse a head the sniffer already
/// consumed. Writes pass straight through.
pub struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
