use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;

use crate::tungate::profile_store::Profile;

/// A bidirectional async byte stream, boxed so the gateway can hold a SOCKS5 or HTTP-CONNECT
/// session behind one type regardless of which handshake produced it.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Wraps a boxed stream with bytes already pulled off the wire that must be handed back to the
/// reader before anything further is read from the inner stream. Some HTTP CONNECT proxies
/// pipeline the first bytes of the tunneled session right after the header terminator; this lets
/// the gateway replay them instead of dropping them.
pub struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedStream,
}

impl PrefixedStream {
    pub fn new(prefix: Vec<u8>, inner: BoxedStream) -> Self {
        PrefixedStream { prefix, pos: 0, inner }
    }
}

impl tokio::io::AsyncRead for PrefixedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for PrefixedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Wraps `inner` in a `PrefixedStream` only if there's actually a prefix to replay.
pub fn prefixed(prefix: Vec<u8>, inner: BoxedStream) -> BoxedStream {
    if prefix.is_empty() {
        inner
    } else {
        Box::new(PrefixedStream::new(prefix, inner))
    }
}

#[derive(Debug, Clone)]
pub enum ProxyTarget {
    Ip(std::net::Ipv4Addr, u16),
    Domain(String, u16),
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyTarget::Ip(ip, port) => write!(f, "{ip}:{port}"),
            ProxyTarget::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyHandshakeError {
    #[error("proxy server unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("proxy authentication failed")]
    AuthFailed,
    #[error("proxy rejected the connection: {0}")]
    Rejected(String),
    #[error("proxy handshake timed out")]
    Timeout,
    #[error("proxy handshake protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait ProxyDialer: Send + Sync {
    /// Establishes a TCP session to `target` through the configured upstream proxy and returns
    /// a stream ready for the caller to read/write the tunneled payload on.
    async fn dial(&self, target: &ProxyTarget) -> Result<BoxedStream, ProxyHandshakeError>;
}

pub fn dialer_for_profile(
    profile: &Profile,
    handshake_timeout: std::time::Duration,
) -> Box<dyn ProxyDialer> {
    use crate::tungate::profile_store::ProxyKind;
    match profile.proxy_kind {
        ProxyKind::Socks5 => Box::new(super::socks5::Socks5Dialer::new(
            profile.host.clone(),
            profile.port,
            profile.username.clone(),
            profile.password.clone(),
            handshake_timeout,
        )),
        ProxyKind::HttpConnect => Box::new(super::http_connect::HttpConnectDialer::new(
            profile.host.clone(),
            profile.port,
            profile.username.clone(),
            profile.password.clone(),
            handshake_timeout,
        )),
    }
}
