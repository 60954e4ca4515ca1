//! Relays DNS queries seen on the TUN device to a real resolver and synthesizes the UDP/IP
//! reply addressed back to the tunneled client. Runs off the TUN I/O loop rather than its own
//! listening socket: every query is a one-shot fire-and-forget task keyed by the tuple that
//! uniquely identifies it on the wire.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};

use crate::tungate::net::packet::{build_ipv4, build_udp_datagram, IpProtocol};
use crate::tungate::telemetry;

const DNS_RESPONSE_BUF: usize = 4096;

/// (client_ip, client_port, DNS transaction id) — uniquely identifies one in-flight query so a
/// retransmitted client request while the first attempt is still outstanding doesn't fan out
/// into a second resolver round-trip.
type PendingKey = (Ipv4Addr, u16, u16);

pub struct DnsRelay {
    primary: SocketAddr,
    secondary: Option<SocketAddr>,
    query_timeout: Duration,
    pending: DashMap<PendingKey, ()>,
}

impl DnsRelay {
    pub fn new(primary: SocketAddr, secondary: Option<SocketAddr>, query_timeout: Duration) -> Self {
        DnsRelay {
            primary,
            secondary,
            query_timeout,
            pending: DashMap::new(),
        }
    }

    /// Dispatches a query payload seen from `client_ip:client_port` addressed to the gateway's
    /// synthetic DNS listener. `gateway_ip` is the address the reply's source should carry (the
    /// TUN device's own address, so the client sees a reply from the resolver it queried).
    pub fn spawn_query(
        self: &Arc<Self>,
        gateway_ip: Ipv4Addr,
        client_ip: Ipv4Addr,
        client_port: u16,
        query: Vec<u8>,
        write_tx: mpsc::Sender<Vec<u8>>,
    ) {
        let txid = if query.len() >= 2 {
            u16::from_be_bytes([query[0], query[1]])
        } else {
            0
        };
        let key = (client_ip, client_port, txid);

        if self.pending.insert(key, ()).is_some() {
            return;
        }

        let relay = self.clone();
        tokio::spawn(async move {
            let result = relay.resolve(&query).await;
            relay.pending.remove(&key);

            match result {
                Ok(response) => {
                    telemetry::record_dns_query();
                    let udp = build_udp_datagram(gateway_ip, client_ip, 53, client_port, &response);
                    let frame = build_ipv4(gateway_ip, client_ip, IpProtocol::Udp, txid, 64, &udp);
                    let _ = write_tx.send(frame).await;
                }
                Err(err) => {
                    tracing::debug!(
                        client = %client_ip, port = client_port, error = %err,
                        "dns_relay: query failed"
                    );
                }
            }
        });
    }

    async fn resolve(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        match timeout(self.query_timeout, query_resolver(self.primary, query)).await {
            Ok(Ok(resp)) => return Ok(resp),
            _ => {}
        }

        if let Some(secondary) = self.secondary {
            return timeout(self.query_timeout, query_resolver(secondary, query))
                .await
                .map_err(|_| anyhow::anyhow!("dns_relay: secondary resolver timed out"))?;
        }

        anyhow::bail!("dns_relay: primary resolver timed out and no secondary configured")
    }
}

async fn query_resolver(resolver: SocketAddr, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
    sock.connect(resolver).await?;
    sock.send(query).await?;

    let mut buf = vec![0u8; DNS_RESPONSE_BUF];
    let n = sock.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn spawn_query_replies_through_write_channel() {
        let upstream = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..2], &[0x12, 0x34]);
            let _ = n;
            upstream
                .send_to(&[0x12, 0x34, 0x81, 0x80], peer)
                .await
                .unwrap();
        });

        let relay = Arc::new(DnsRelay::new(upstream_addr, None, Duration::from_secs(2)));
        let (tx, mut rx) = mpsc::channel(4);

        relay.spawn_query(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 5),
            44000,
            vec![0x12, 0x34, 0x01, 0x00],
            tx,
        );

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply within timeout")
            .expect("channel open");
        assert!(!frame.is_empty());
    }

    #[tokio::test]
    async fn duplicate_inflight_query_is_deduped() {
        let relay = Arc::new(DnsRelay::new(
            "127.0.0.1:1".parse().unwrap(),
            None,
            Duration::from_millis(50),
        ));
        let (tx, _rx) = mpsc::channel(4);

        relay.spawn_query(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 5),
            1111,
            vec![0xaa, 0xbb, 0x01, 0x00],
            tx.clone(),
        );
        assert!(relay.pending.contains_key(&(Ipv4Addr::new(10, 0, 0, 5), 1111, 0xaabb)));

        relay.spawn_query(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 5),
            1111,
            vec![0xaa, 0xbb, 0x01, 0x00],
            tx,
        );
        // Still only one entry: the duplicate is a no-op, not a second task.
        assert_eq!(relay.pending.len(), 1);
    }
}
