//! Transport abstraction over the three accepted socket kinds.
//!
//! The kind is chosen once at bind time; after `establish` every caller
//! sees one [`Transport`] implementing `AsyncRead + AsyncWrite` and
//! never branches on the concrete kind again. TLS handshakes are
//! deferred out of the accept loop: the acceptor wraps the raw TCP
//! stream lazily and the protocol layer drives the handshake on first
//! use.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::debug;

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// Plain TCP.
    Tcp(SocketAddr),
    /// TLS over TCP.
    Tls(SocketAddr),
    /// Local-domain socket.
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Tls(addr) => write!(f, "tls://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A freshly accepted socket whose TLS handshake (if any) has not run yet.
pub enum RawTransport {
    Tcp(TcpStream),
    /// TCP stream plus the acceptor that will wrap it on `establish`.
    TlsPending(TcpStream, TlsAcceptor),
    Unix(UnixStream),
}

impl RawTransport {
    /// Completes whatever setup the kind requires and yields the
    /// established transport. For TLS this drives the server handshake.
    pub async fn establish(self) -> io::Result<Transport> {
        match self {
            Self::Tcp(stream) => Ok(Transport::Tcp(stream)),
            Self::TlsPending(stream, acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(Transport::Tls(Box::new(tls)))
            }
            Self::Unix(stream) => Ok(Transport::Unix(stream)),
        }
    }

    /// A printable peer label for logs.
    pub fn peer_label(&self) -> String {
        match self {
            Self::Tcp(s) | Self::TlsPending(s, _) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".into()),
            Self::Unix(_) => "unix".into(),
        }
    }
}

/// An established transport, the only I/O surface upper layers see.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound, listening socket of one transport kind.
pub enum BoundListener {
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
    Unix(UnixListener, PathBuf),
}

impl std::fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(listener) => f.debug_tuple("Tcp").field(listener).finish(),
            Self::Tls(listener, _) => {
                f.debug_tuple("Tls").field(listener).field(&"TlsAcceptor").finish()
            }
            Self::Unix(listener, path) => {
                f.debug_tuple("Unix").field(listener).field(path).finish()
            }
        }
    }
}

impl BoundListener {
    /// Binds and listens on `addr`.
    ///
    /// TCP sockets get SO_REUSEADDR (and SO_REUSEPORT on unix
    /// platforms); a dual-stack v6 address is restricted to v6-only
    /// when `ipv6_only` is set. TLS listeners additionally carry the
    /// acceptor built from the configured certificate.
    pub fn bind(
        addr: &ListenAddr,
        ipv6_only: bool,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, TransportError> {
        match addr {
            ListenAddr::Tcp(sock_addr) => {
                let listener = bind_tcp(*sock_addr, ipv6_only)?;
                Ok(Self::Tcp(listener))
            }
            ListenAddr::Tls(sock_addr) => {
                let acceptor = tls.ok_or(TransportError::MissingTlsConfig)?;
                let listener = bind_tcp(*sock_addr, ipv6_only)?;
                Ok(Self::Tls(listener, acceptor))
            }
            ListenAddr::Unix(path) => {
                let listener = bind_unix(path)?;
                Ok(Self::Unix(listener, path.clone()))
            }
        }
    }

    /// Accepts one connection, wrapping it in the raw transport for the
    /// listener's kind. TLS handshakes are not performed here.
    pub async fn accept(&self) -> io::Result<RawTransport> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(RawTransport::Tcp(stream))
            }
            Self::Tls(listener, acceptor) => {
                let (stream, _) = listener.accept().await?;
                Ok(RawTransport::TlsPending(stream, acceptor.clone()))
            }
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(RawTransport::Unix(stream))
            }
        }
    }

    /// The local address actually bound (useful when port 0 was asked).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(l) | Self::Tls(l, _) => l.local_addr().ok(),
            Self::Unix(..) => None,
        }
    }

    /// Removes the socket file of a unix listener.
    pub fn cleanup(&self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_tcp(addr: SocketAddr, ipv6_only: bool) -> Result<TcpListener, TransportError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| TransportError::Bind {
        addr: addr.to_string(),
        error: e.to_string(),
    })?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;
    #[cfg(unix)]
    socket
        .set_reuseport(true)
        .map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;

    if addr.is_ipv6() && ipv6_only {
        set_ipv6_only(&socket).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;
    }

    socket.bind(addr).map_err(|e| TransportError::Bind {
        addr: addr.to_string(),
        error: e.to_string(),
    })?;

    let listener = socket.listen(1024).map_err(|e| TransportError::Bind {
        addr: addr.to_string(),
        error: e.to_string(),
    })?;

    debug!(%addr, "tcp listener bound");
    Ok(listener)
}

/// Tokio exposes no IPV6_V6ONLY knob, so this reaches for the raw
/// socket option the same way the daemon reaches for `libc::kill`.
#[cfg(unix)]
fn set_ipv6_only(socket: &TcpSocket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_ipv6_only(_socket: &TcpSocket) -> io::Result<()> {
    Ok(())
}

fn bind_unix(path: &Path) -> Result<UnixListener, TransportError> {
    // Remove a stale socket file from a previous run
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| TransportError::Bind {
            addr: path.display().to_string(),
            error: e.to_string(),
        })?;
    }
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| TransportError::Bind {
                addr: path.display().to_string(),
                error: e.to_string(),
            })?;
        }
    }

    let listener = UnixListener::bind(path).map_err(|e| TransportError::Bind {
        addr: path.display().to_string(),
        error: e.to_string(),
    })?;

    debug!(path = %path.display(), "unix listener bound");
    Ok(listener)
}

/// Builds a TLS acceptor from PEM certificate and key files.
pub fn build_tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
) -> Result<TlsAcceptor, TransportError> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| TransportError::Tls {
        path: cert_path.to_path_buf(),
        error: e.to_string(),
    })?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| TransportError::Tls {
                path: cert_path.to_path_buf(),
                error: e.to_string(),
            })?;

    let key_file = std::fs::File::open(key_path).map_err(|e| TransportError::Tls {
        path: key_path.to_path_buf(),
        error: e.to_string(),
    })?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut io::BufReader::new(key_file))
            .map_err(|e| TransportError::Tls {
                path: key_path.to_path_buf(),
                error: e.to_string(),
            })?
            .ok_or_else(|| TransportError::Tls {
                path: key_path.to_path_buf(),
                error: "no private key found".into(),
            })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls {
            path: cert_path.to_path_buf(),
            error: e.to_string(),
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Errors raised while binding or configuring transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("tls listener configured without certificate")]
    MissingTlsConfig,

    #[error("failed to load tls material from {path}: {error}")]
    Tls { path: PathBuf, error: String },
}
