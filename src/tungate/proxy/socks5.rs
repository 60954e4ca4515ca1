//! RFC 1928 SOCKS5 client handshake, with RFC 1929 username/password auth.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use super::dialer::{BoxedStream, ProxyDialer, ProxyHandshakeError, ProxyTarget};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

pub struct Socks5Dialer {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    handshake_timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        handshake_timeout: Duration,
    ) -> Self {
        Socks5Dialer {
            host,
            port,
            username,
            password,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl ProxyDialer for Socks5Dialer {
    async fn dial(&self, target: &ProxyTarget) -> Result<BoxedStream, ProxyHandshakeError> {
        let stream = timeout(
            self.handshake_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ProxyHandshakeError::Timeout)?
        .map_err(ProxyHandshakeError::Unreachable)?;

        let mut stream = stream;
        timeout(self.handshake_timeout, handshake(&mut stream, self, target))
            .await
            .map_err(|_| ProxyHandshakeError::Timeout)??;

        Ok(Box::new(stream))
    }
}

async fn handshake(
    stream: &mut TcpStream,
    dialer: &Socks5Dialer,
    target: &ProxyTarget,
) -> Result<(), ProxyHandshakeError> {
    let want_userpass = dialer.username.is_some();

    let methods: &[u8] = if want_userpass {
        &[AUTH_NONE, AUTH_USERPASS]
    } else {
        &[AUTH_NONE]
    };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream
        .write_all(&greeting)
        .await
        .map_err(ProxyHandshakeError::Unreachable)?;

    let mut chosen = [0u8; 2];
    stream
        .read_exact(&mut chosen)
        .await
        .map_err(ProxyHandshakeError::Unreachable)?;
    if chosen[0] != VERSION {
        return Err(ProxyHandshakeError::Protocol(format!(
            "unexpected SOCKS version {}",
            chosen[0]
        )));
    }

    match chosen[1] {
        AUTH_NONE => {}
        AUTH_USERPASS => {
            let user = dialer.username.clone().unwrap_or_default();
            let pass = dialer.password.clone().unwrap_or_default();
            if user.len() > 255 || pass.len() > 255 {
                return Err(ProxyHandshakeError::Protocol(
                    "username/password exceed 255 bytes".into(),
                ));
            }
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01); // auth sub-negotiation version
            req.push(user.len() as u8);
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream
                .write_all(&req)
                .await
                .map_err(ProxyHandshakeError::Unreachable)?;

            let mut resp = [0u8; 2];
            stream
                .read_exact(&mut resp)
                .await
                .map_err(ProxyHandshakeError::Unreachable)?;
            if resp[1] != 0x00 {
                return Err(ProxyHandshakeError::AuthFailed);
            }
        }
        AUTH_NO_ACCEPTABLE => return Err(ProxyHandshakeError::AuthFailed),
        other => {
            return Err(ProxyHandshakeError::Protocol(format!(
                "proxy selected unsupported auth method {other}"
            )))
        }
    }

    let mut req = Vec::with_capacity(10);
    req.push(VERSION);
    req.push(CMD_CONNECT);
    req.push(0x00); // reserved
    match target {
        ProxyTarget::Ip(ip, port) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
            req.extend_from_slice(&port.to_be_bytes());
        }
        ProxyTarget::Domain(host, port) => {
            if host.len() > 255 {
                return Err(ProxyHandshakeError::Protocol("domain name too long".into()));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
            req.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream
        .write_all(&req)
        .await
        .map_err(ProxyHandshakeError::Unreachable)?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(ProxyHandshakeError::Unreachable)?;
    if head[0] != VERSION {
        return Err(ProxyHandshakeError::Protocol(format!(
            "unexpected SOCKS version {} in reply",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(ProxyHandshakeError::Rejected(reply_code_name(head[1]).into()));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            stream
                .read_exact(&mut rest)
                .await
                .map_err(ProxyHandshakeError::Unreachable)?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(ProxyHandshakeError::Unreachable)?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream
                .read_exact(&mut rest)
                .await
                .map_err(ProxyHandshakeError::Unreachable)?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream
                .read_exact(&mut rest)
                .await
                .map_err(ProxyHandshakeError::Unreachable)?;
        }
        other => {
            return Err(ProxyHandshakeError::Protocol(format!(
                "unsupported bound-address type {other}"
            )))
        }
    }

    Ok(())
}

fn reply_code_name(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn mock_server_success(listener: TcpListener) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        sock.read_exact(&mut greeting).await.unwrap();
        sock.write_all(&[VERSION, AUTH_NONE]).await.unwrap();

        let mut head = [0u8; 4];
        sock.read_exact(&mut head).await.unwrap();
        assert_eq!(head[3], ATYP_IPV4);
        let mut addr = [0u8; 6];
        sock.read_exact(&mut addr).await.unwrap();

        sock.write_all(&[VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_ipv4_target_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_server_success(listener));

        let dialer = Socks5Dialer::new(
            addr.ip().to_string(),
            addr.port(),
            None,
            None,
            Duration::from_secs(2),
        );
        let target = ProxyTarget::Ip(std::net::Ipv4Addr::new(93, 184, 216, 34), 80);
        let result = dialer.dial(&target).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn auth_required_but_rejected_surfaces_auth_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[VERSION, AUTH_USERPASS]).await.unwrap();

            let mut up_head = [0u8; 2];
            sock.read_exact(&mut up_head).await.unwrap();
            let mut rest = vec![0u8; up_head[1] as usize];
            sock.read_exact(&mut rest).await.unwrap();
            let mut pw_len = [0u8; 1];
            sock.read_exact(&mut pw_len).await.unwrap();
            let mut pw = vec![0u8; pw_len[0] as usize];
            sock.read_exact(&mut pw).await.unwrap();

            sock.write_all(&[0x01, 0x01]).await.unwrap(); // auth failure
        });

        let dialer = Socks5Dialer::new(
            addr.ip().to_string(),
            addr.port(),
            Some("bob".into()),
            Some("wrong".into()),
            Duration::from_secs(2),
        );
        let target = ProxyTarget::Domain("example.com".into(), 443);
        let err = dialer.dial(&target).await.unwrap_err();
        assert!(matches!(err, ProxyHandshakeError::AuthFailed));
    }
}
