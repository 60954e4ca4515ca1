//! HTTP/1.1 CONNECT client handshake (RFC 9110 §9.3.6), with Basic proxy authentication.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use super::dialer::{BoxedStream, ProxyDialer, ProxyHandshakeError, ProxyTarget};

pub struct HttpConnectDialer {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    handshake_timeout: Duration,
}

impl HttpConnectDialer {
    pub fn new(
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        handshake_timeout: Duration,
    ) -> Self {
        HttpConnectDialer {
            host,
            port,
            username,
            password,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl ProxyDialer for HttpConnectDialer {
    async fn dial(&self, target: &ProxyTarget) -> Result<BoxedStream, ProxyHandshakeError> {
        let stream = timeout(
            self.handshake_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ProxyHandshakeError::Timeout)?
        .map_err(ProxyHandshakeError::Unreachable)?;

        let mut stream = stream;
        let trailing = timeout(self.handshake_timeout, handshake(&mut stream, self, target))
            .await
            .map_err(|_| ProxyHandshakeError::Timeout)??;

        Ok(super::dialer::prefixed(trailing, Box::new(stream)))
    }
}

async fn handshake(
    stream: &mut TcpStream,
    dialer: &HttpConnectDialer,
    target: &ProxyTarget,
) -> Result<Vec<u8>, ProxyHandshakeError> {
    let host_port = target.to_string();

    let mut req = format!(
        "CONNECT {host_port} HTTP/1.1\r\nHost: {host_port}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(user) = &dialer.username {
        let pass = dialer.password.clone().unwrap_or_default();
        let token = STANDARD.encode(format!("{user}:{pass}"));
        req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    req.push_str("\r\n");

    stream
        .write_all(req.as_bytes())
        .await
        .map_err(ProxyHandshakeError::Unreachable)?;

    let (status, trailing) = read_response_head(stream).await?;

    if status == 407 {
        return Err(ProxyHandshakeError::AuthFailed);
    }
    if !(200..300).contains(&status) {
        return Err(ProxyHandshakeError::Rejected(format!(
            "proxy returned HTTP {status}"
        )));
    }

    Ok(trailing)
}

/// Reads up to and including the blank line ending the HTTP response headers, returning the
/// status code. Any bytes read past the header terminator belong to the tunneled session and
/// are returned so the caller can still deliver them (most proxies don't send any here, but a
/// pipelining-capable one might).
async fn read_response_head(
    stream: &mut TcpStream,
) -> Result<(u16, Vec<u8>), ProxyHandshakeError> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(ProxyHandshakeError::Unreachable)?;
        if n == 0 {
            return Err(ProxyHandshakeError::Protocol(
                "proxy closed connection before sending a response".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_header_terminator(&buf) {
            let head = &buf[..pos];
            let trailing = buf[pos + 4..].to_vec();
            let status = parse_status_line(head)?;
            return Ok((status, trailing));
        }

        if buf.len() > 64 * 1024 {
            return Err(ProxyHandshakeError::Protocol(
                "proxy response headers exceeded size limit".into(),
            ));
        }
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(head: &[u8]) -> Result<u16, ProxyHandshakeError> {
    let line_end = head
        .iter()
        .position(|&b| b == b'\r')
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| ProxyHandshakeError::Protocol("non-UTF8 status line".into()))?;

    let mut parts = line.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| ProxyHandshakeError::Protocol("empty status line".into()))?;
    let code = parts
        .next()
        .ok_or_else(|| ProxyHandshakeError::Protocol("missing status code".into()))?;
    code.parse::<u16>()
        .map_err(|_| ProxyHandshakeError::Protocol(format!("bad status code {code:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_success_reads_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1"));
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = HttpConnectDialer::new(
            addr.ip().to_string(),
            addr.port(),
            None,
            None,
            Duration::from_secs(2),
        );
        let target = ProxyTarget::Domain("example.com".into(), 443);
        assert!(dialer.dial(&target).await.is_ok());
    }

    #[tokio::test]
    async fn proxy_auth_required_surfaces_auth_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = HttpConnectDialer::new(
            addr.ip().to_string(),
            addr.port(),
            Some("bob".into()),
            Some("secret".into()),
            Duration::from_secs(2),
        );
        let target = ProxyTarget::Ip(std::net::Ipv4Addr::new(1, 2, 3, 4), 80);
        let err = dialer.dial(&target).await.unwrap_err();
        assert!(matches!(err, ProxyHandshakeError::AuthFailed));
    }
}
