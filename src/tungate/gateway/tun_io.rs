//! The TUN I/O loop: one task reads raw frames off the device and dispatches them to the TCP
//! flow engine or the DNS relay, one task serializes every outbound frame (synthesized replies,
//! proxied payload) back onto the device. Per-flow proxy sockets are driven by their own tasks,
//! communicating with the reader via a small inbound channel and with the writer via a shared
//! outbound channel.

use std::net::Ipv4Addr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tungate::config::{Config, TunPrefix};
use crate::tungate::device::{TunReader, TunWriter};
use crate::tungate::net::flow_key::Protocol;
use crate::tungate::net::packet::{
    self, build_ipv4, build_tcp_segment, parse_ipv4, parse_tcp, parse_udp, tcp_flags, IpProtocol,
    ParseError,
};
use crate::tungate::net::FlowKey;
use crate::tungate::proxy::dialer::{ProxyDialer, ProxyTarget};
use crate::tungate::telemetry::{self, SharedSessionCounters};

use super::dns_relay::DnsRelay;
use super::flow_table::{Flow, FlowHandle, FlowTable, TcpFlowHandle};
use super::tcp_flow::{seq_gt, TcpFlow};

pub const WRITE_CHANNEL_CAPACITY: usize = 1024;
const PROXY_INBOUND_CAPACITY: usize = 256;
const PROXY_READ_BUF: usize = 16 * 1024;

pub struct TunIoLoop {
    flow_table: Arc<FlowTable>,
    dns_relay: Arc<DnsRelay>,
    dialer: Arc<dyn ProxyDialer>,
    gateway_ip: Ipv4Addr,
    mtu: usize,
    prefix: TunPrefix,
    write_tx: mpsc::Sender<Vec<u8>>,
    flow_idle_timeout: Duration,
    flow_backlog_cap: u64,
    counters: SharedSessionCounters,
}

impl TunIoLoop {
    pub fn new(
        cfg: &Config,
        dns_relay: Arc<DnsRelay>,
        dialer: Arc<dyn ProxyDialer>,
        write_tx: mpsc::Sender<Vec<u8>>,
        counters: SharedSessionCounters,
    ) -> anyhow::Result<Arc<Self>> {
        let gateway_ip: Ipv4Addr = cfg
            .tun
            .address
            .parse()
            .map_err(|_| anyhow::anyhow!("tun_io: invalid tun.address {:?}", cfg.tun.address))?;

        Ok(Arc::new(TunIoLoop {
            flow_table: Arc::new(FlowTable::new()),
            dns_relay,
            dialer,
            gateway_ip,
            mtu: cfg.tun.mtu as usize,
            prefix: cfg.tun.prefix,
            write_tx,
            flow_idle_timeout: cfg.timeouts.flow_idle_timeout,
            flow_backlog_cap: cfg.flow_backlog_cap as u64,
            counters,
        }))
    }

    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.flow_table.clone()
    }

    /// The writer task body. The caller spawns this into its own `JoinSet` entry rather than
    /// getting a handle back, so it's tracked alongside the reader and sweeper tasks uniformly.
    pub async fn run_writer(
        mut writer: TunWriter,
        mut write_rx: mpsc::Receiver<Vec<u8>>,
        prefix: TunPrefix,
    ) {
        while let Some(frame) = write_rx.recv().await {
            let res = if prefix == TunPrefix::Four {
                let mut out = Vec::with_capacity(frame.len() + 4);
                out.extend_from_slice(&[0, 0, 0, libc_af_inet()]);
                out.extend_from_slice(&frame);
                writer.write_all(&out).await
            } else {
                writer.write_all(&frame).await
            };
            if let Err(err) = res {
                tracing::warn!(error = %err, "tun_io: write failed");
            }
        }
    }

    /// Runs the reader loop until cancelled. Each IP frame is parsed and dispatched inline;
    /// heavier work (proxy dial, bidirectional copy) is handed off to a per-flow task so the
    /// reader never blocks on a slow proxy.
    pub async fn run_reader(
        self: Arc<Self>,
        mut reader: TunReader,
        cancel: CancellationToken,
    ) {
        let prefix_len = if self.prefix == TunPrefix::Four { 4 } else { 0 };
        let mut buf = vec![0u8; self.mtu + prefix_len + 64];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = reader.read(&mut buf) => {
                    match res {
                        Ok(0) => break,
                        Ok(n) => {
                            let frame = &buf[prefix_len.min(n)..n];
                            self.dispatch(frame).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "tun_io: read failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: &[u8]) {
        let ip = match parse_ipv4(frame) {
            Ok(ip) => ip,
            Err(ParseError::NotIpv4(_)) => return, // IPv6 etc: silently ignored, out of scope
            Err(err) => {
                telemetry::record_parse_error();
                tracing::trace!(error = %err, "tun_io: malformed frame dropped");
                return;
            }
        };

        match ip.protocol {
            IpProtocol::Tcp => {
                let tcp = match parse_tcp(&ip) {
                    Ok(t) => t,
                    Err(_) => {
                        telemetry::record_parse_error();
                        return;
                    }
                };
                self.handle_tcp(ip.src, ip.dst, tcp).await;
            }
            IpProtocol::Udp => {
                let udp = match parse_udp(&ip) {
                    Ok(u) => u,
                    Err(_) => {
                        telemetry::record_parse_error();
                        return;
                    }
                };
                if udp.dst_port == 53 {
                    self.counters.add_up(udp.payload.len() as u64);
                    self.dns_relay.spawn_query(
                        self.gateway_ip,
                        ip.src,
                        udp.src_port,
                        udp.payload.to_vec(),
                        self.write_tx.clone(),
                    );
                }
                // Non-DNS UDP is out of scope: dropped.
            }
            IpProtocol::Other(_) => {}
        }
    }

    async fn handle_tcp(
        self: &Arc<Self>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        tcp: packet::TcpSegment<'_>,
    ) {
        let key = FlowKey::new(Protocol::Tcp, src, tcp.src_port, dst, tcp.dst_port);
        self.counters.touch();

        if tcp.has_flag(tcp_flags::RST) {
            if let Some(flow) = self.flow_table.remove(&key) {
                flow.cancel.cancel();
            }
            return;
        }

        if tcp.has_flag(tcp_flags::SYN) && !tcp.has_flag(tcp_flags::ACK) {
            if let Some(entry) = self.flow_table.get(&key) {
                // Retransmitted SYN for a flow already being set up: re-send the same SYN-ACK
                // rather than disturbing the flow's state or dialing a second time.
                let FlowHandle::Tcp(handle) = &entry.handle;
                let frame = handle.synack_frame.clone();
                drop(entry);
                let _ = self.write_tx.send(frame).await;
                return;
            }
            self.open_flow(key, src, dst, tcp.src_port, tcp.dst_port, tcp.seq, tcp.window)
                .await;
            return;
        }

        let Some(entry) = self.flow_table.get(&key) else {
            self.send_rst(dst, src, tcp.dst_port, tcp.src_port, tcp.ack, tcp.seq.wrapping_add(1));
            return;
        };

        let FlowHandle::Tcp(handle) = &entry.handle;
        let handle = handle.clone();
        drop(entry);

        let mut state = handle.state.lock().await;

        // Ack covering bytes we never sent: the peer is confused or stale. Drop the segment and
        // count it, but don't tear the flow down over it.
        if tcp.has_flag(tcp_flags::ACK) && seq_gt(tcp.ack, state.server_next_seq) {
            telemetry::record_invalid_ack();
            return;
        }

        if tcp.has_flag(tcp_flags::FIN) {
            state.on_client_fin();
        }

        let mut deliver = None;
        if !tcp.payload.is_empty() {
            if !state.handshake_done() {
                // Data arriving before the handshake completed: drop silently.
            } else if tcp.seq == state.client_next_seq {
                state.on_data(tcp.payload.len() as u32);
                deliver = Some(tcp.payload.to_vec());
            }
            // Otherwise this is a retransmit (or out-of-order) segment: already-delivered bytes
            // are not redelivered to the proxy socket and `client_next_seq` is left untouched.
        }
        if tcp.has_flag(tcp_flags::ACK) {
            // Both transitions are idempotent (guarded on the prior state), so it's safe to
            // call both on every ACKed segment regardless of whether it carries a payload.
            state.on_established();
            state.on_last_ack_acked();
        }
        let terminal = state.is_terminal();
        let (seq, ack) = (state.server_next_seq, state.client_next_seq);
        drop(state);

        if let Some(payload) = deliver {
            let n = payload.len() as u64;
            let prev = handle.buffered_bytes.fetch_add(n, Ordering::SeqCst);
            if prev + n > self.flow_backlog_cap {
                handle.buffered_bytes.fetch_sub(n, Ordering::SeqCst);
                tracing::debug!(%key, "tun_io: flow backlog cap exceeded, resetting");
                self.send_rst(dst, src, tcp.dst_port, tcp.src_port, seq, ack);
                if let Some(flow) = self.flow_table.remove(&key) {
                    flow.cancel.cancel();
                }
                telemetry::record_flow_closed();
                return;
            }
            match handle.to_proxy_tx.try_send(payload) {
                Ok(()) => self.counters.add_up(n),
                Err(_) => {
                    handle.buffered_bytes.fetch_sub(n, Ordering::SeqCst);
                }
            }
        }

        if terminal {
            if let Some(flow) = self.flow_table.remove(&key) {
                flow.cancel.cancel();
            }
        }
    }

    async fn open_flow(
        self: &Arc<Self>,
        key: FlowKey,
        client_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        client_port: u16,
        dst_port: u16,
        client_isn: u32,
        client_window: u16,
    ) {
        let flow = TcpFlow::new(client_isn, client_window);
        let server_isn = flow.server_isn;
        let ack = flow.client_next_seq;

        let (to_proxy_tx, to_proxy_rx) = mpsc::channel::<Vec<u8>>(PROXY_INBOUND_CAPACITY);
        let state = Arc::new(tokio::sync::Mutex::new(flow));
        let cancel = CancellationToken::new();

        let synack = build_tcp_segment(
            target_ip,
            client_ip,
            dst_port,
            client_port,
            server_isn,
            ack,
            tcp_flags::SYN | tcp_flags::ACK,
            u16::MAX,
            None,
            &[],
        );
        let frame = build_ipv4(target_ip, client_ip, IpProtocol::Tcp, 0, 64, &synack);
        let buffered_bytes = Arc::new(AtomicU64::new(0));

        self.flow_table.get_or_create(key, || Flow {
            handle: FlowHandle::Tcp(TcpFlowHandle {
                state: state.clone(),
                to_proxy_tx,
                synack_frame: frame.clone(),
                buffered_bytes: buffered_bytes.clone(),
            }),
            cancel: cancel.clone(),
        });

        telemetry::record_flow_opened();

        let _ = self.write_tx.send(frame).await;

        let loop_self = self.clone();
        let target = ProxyTarget::Ip(target_ip, dst_port);
        tokio::spawn(async move {
            loop_self
                .drive_flow(
                    key, client_ip, target_ip, client_port, dst_port, state, to_proxy_rx,
                    buffered_bytes, cancel, target,
                )
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_flow(
        self: Arc<Self>,
        key: FlowKey,
        client_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        client_port: u16,
        dst_port: u16,
        state: Arc<tokio::sync::Mutex<TcpFlow>>,
        mut to_proxy_rx: mpsc::Receiver<Vec<u8>>,
        buffered_bytes: Arc<AtomicU64>,
        cancel: CancellationToken,
        target: ProxyTarget,
    ) {
        let mut stream = match self.dialer.dial(&target).await {
            Ok(s) => s,
            Err(err) => {
                telemetry::record_proxy_dial_failure();
                tracing::debug!(target = %target, error = %err, "tun_io: proxy dial failed");
                self.reset_and_forget(key, target_ip, client_ip, dst_port, client_port, &state)
                    .await;
                return;
            }
        };

        let mut read_buf = vec![0u8; PROXY_READ_BUF];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = to_proxy_rx.recv() => {
                    match maybe {
                        Some(bytes) => {
                            buffered_bytes.fetch_sub(bytes.len() as u64, Ordering::SeqCst);
                            if tokio::io::AsyncWriteExt::write_all(&mut stream, &bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                res = stream.read(&mut read_buf) => {
                    match res {
                        Ok(0) => {
                            let mut st = state.lock().await;
                            st.on_remote_eof();
                            let (seq, ack) = (st.server_next_seq, st.client_next_seq);
                            drop(st);
                            self.send_segment(target_ip, client_ip, dst_port, client_port, seq, ack, tcp_flags::FIN | tcp_flags::ACK, &[]).await;
                            let mut st = state.lock().await;
                            st.on_server_bytes_sent(1);
                            drop(st);
                        }
                        Ok(n) => {
                            let payload = read_buf[..n].to_vec();
                            let mut st = state.lock().await;
                            let (seq, ack) = (st.server_next_seq, st.client_next_seq);
                            drop(st);
                            self.counters.add_down(n as u64);
                            self.send_segment(target_ip, client_ip, dst_port, client_port, seq, ack, tcp_flags::PSH | tcp_flags::ACK, &payload).await;
                            let mut st = state.lock().await;
                            st.on_server_bytes_sent(n as u32);
                            drop(st);
                        }
                        Err(_) => break,
                    }
                }
            }

            if state.lock().await.is_terminal() {
                break;
            }
        }

        self.flow_table.remove(&key);
        telemetry::record_flow_closed();
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_segment(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) {
        let tcp = build_tcp_segment(src, dst, src_port, dst_port, seq, ack, flags, u16::MAX, None, payload);
        let frame = build_ipv4(src, dst, IpProtocol::Tcp, 0, 64, &tcp);
        let _ = self.write_tx.send(frame).await;
    }

    /// Builds and sends a RST|ACK segment. `seq`/`ack` are the values to stamp directly onto the
    /// outgoing segment: callers that are echoing an unrecognized incoming segment pass
    /// `incoming.ack`/`incoming.seq + 1`, callers acting on a known flow pass its own
    /// `server_next_seq`/`client_next_seq`.
    fn send_rst(&self, src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, seq: u32, ack: u32) {
        let tcp = build_tcp_segment(
            src,
            dst,
            src_port,
            dst_port,
            seq,
            ack,
            tcp_flags::RST | tcp_flags::ACK,
            0,
            None,
            &[],
        );
        let frame = build_ipv4(src, dst, IpProtocol::Tcp, 0, 64, &tcp);
        let _ = self.write_tx.try_send(frame);
    }

    async fn reset_and_forget(
        &self,
        key: FlowKey,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        state: &Arc<tokio::sync::Mutex<TcpFlow>>,
    ) {
        let (seq, ack) = {
            let st = state.lock().await;
            (st.server_next_seq, st.client_next_seq)
        };
        self.send_rst(src, dst, src_port, dst_port, seq, ack);
        self.flow_table.remove(&key);
        telemetry::record_flow_closed();
    }

    /// Periodically sweeps the flow table for flows idle past the configured timeout or past
    /// TIME_WAIT expiry, resetting the client side and cancelling their driver task.
    pub async fn run_idle_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let now = std::time::Instant::now();
                    for key in self.flow_table.keys() {
                        let Some(entry) = self.flow_table.get(&key) else { continue };
                        let FlowHandle::Tcp(handle) = &entry.handle;
                        let st = handle.state.lock().await;
                        let expired = st.idle_for(now) > self.flow_idle_timeout || st.is_time_wait_expired(now);
                        let (seq, ack) = (st.server_next_seq, st.client_next_seq);
                        drop(st);
                        if expired {
                            // key.dst_* is the remote/target side (our source for this RST);
                            // key.src_* is the tunneled client (our destination).
                            self.send_rst(key.dst_ip, key.src_ip, key.dst_port, key.src_port, seq, ack);
                            entry.cancel.cancel();
                            drop(entry);
                            self.flow_table.remove(&key);
                        }
                    }
                }
            }
        }
    }
}

/// AF_INET, the value the `utun`/`tun` 4-byte packet-information prefix carries on the
/// platforms that use one.
fn libc_af_inet() -> u8 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tungate::config::{HealthCheckConfig, LoggingConfig, PublicIpProbeConfig, TunConfig, Timeouts};
    use crate::tungate::proxy::dialer::{BoxedStream, ProxyHandshakeError};
    use async_trait::async_trait;

    fn test_config() -> Config {
        Config {
            admin_addr: "127.0.0.1:0".into(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "discard".into(),
                add_source: false,
            },
            tun: TunConfig {
                name: "tun-test".into(),
                address: "10.0.0.2".into(),
                netmask: "255.255.255.0".into(),
                mtu: 1500,
                prefix: TunPrefix::None,
            },
            timeouts: Timeouts {
                proxy_handshake_timeout: Duration::from_millis(100),
                proxy_dial_timeout: Duration::from_millis(100),
                flow_idle_timeout: Duration::from_secs(600),
                dns_query_timeout: Duration::from_millis(100),
            },
            buffer_size: 32 * 1024,
            flow_backlog_cap: 1024,
            health_check: HealthCheckConfig {
                interval: Duration::from_secs(10),
                dead_threshold: Duration::from_secs(600),
                reconnect_delay: Duration::from_secs(2),
            },
            public_ip_probe: PublicIpProbeConfig {
                enabled: false,
                host: "example.invalid".into(),
                port: 443,
                path: "/".into(),
                interval: Duration::from_secs(60),
                timeout: Duration::from_secs(10),
            },
        }
    }

    struct AlwaysRejectDialer;

    #[async_trait]
    impl ProxyDialer for AlwaysRejectDialer {
        async fn dial(&self, _target: &ProxyTarget) -> Result<BoxedStream, ProxyHandshakeError> {
            Err(ProxyHandshakeError::Rejected("test dialer always rejects".into()))
        }
    }

    fn syn_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let tcp = build_tcp_segment(src, dst, src_port, dst_port, 1000, 0, tcp_flags::SYN, 65535, Some(packet::TCP_MSS_DEFAULT), &[]);
        build_ipv4(src, dst, IpProtocol::Tcp, 1, 64, &tcp)
    }

    #[tokio::test]
    async fn syn_triggers_synack_then_rst_after_dial_failure() {
        let cfg = test_config();
        let dns = Arc::new(DnsRelay::new("127.0.0.1:1".parse().unwrap(), None, Duration::from_millis(50)));
        let dialer: Arc<dyn ProxyDialer> = Arc::new(AlwaysRejectDialer);
        let (write_tx, mut write_rx) = mpsc::channel(16);

        let counters = telemetry::SessionCounters::new();
        let io_loop = TunIoLoop::new(&cfg, dns, dialer, write_tx, counters).expect("construct loop");
        io_loop.dispatch(&syn_frame(5555, 80)).await;

        let synack_frame = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
            .await
            .expect("synack within timeout")
            .expect("channel open");
        let ip = parse_ipv4(&synack_frame).expect("parse synack ip");
        let tcp = parse_tcp(&ip).expect("parse synack tcp");
        assert!(tcp.has_flag(tcp_flags::SYN) && tcp.has_flag(tcp_flags::ACK));

        let rst_frame = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
            .await
            .expect("rst within timeout")
            .expect("channel open");
        let ip = parse_ipv4(&rst_frame).expect("parse rst ip");
        let tcp = parse_tcp(&ip).expect("parse rst tcp");
        assert!(tcp.has_flag(tcp_flags::RST));
    }

    #[tokio::test]
    async fn duplicate_syn_for_pending_flow_resends_synack() {
        let cfg = test_config();
        let dns = Arc::new(DnsRelay::new("127.0.0.1:1".parse().unwrap(), None, Duration::from_millis(50)));
        let dialer: Arc<dyn ProxyDialer> = Arc::new(AlwaysRejectDialer);
        let (write_tx, mut write_rx) = mpsc::channel(16);

        let counters = telemetry::SessionCounters::new();
        let io_loop = TunIoLoop::new(&cfg, dns, dialer, write_tx, counters).expect("construct loop");
        io_loop.dispatch(&syn_frame(6666, 80)).await;
        assert_eq!(io_loop.flow_table.len(), 1);

        let first_synack = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
            .await
            .expect("first synack within timeout")
            .expect("channel open");

        io_loop.dispatch(&syn_frame(6666, 80)).await;
        assert_eq!(io_loop.flow_table.len(), 1, "retransmitted SYN must not open a second flow");

        let second_synack = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
            .await
            .expect("second synack within timeout")
            .expect("channel open");

        assert_eq!(first_synack, second_synack, "retransmitted SYN must get the identical SYN-ACK back");
        let ip = parse_ipv4(&second_synack).expect("parse synack ip");
        let tcp = parse_tcp(&ip).expect("parse synack tcp");
        assert!(tcp.has_flag(tcp_flags::SYN) && tcp.has_flag(tcp_flags::ACK));
    }

    #[tokio::test]
    async fn payload_beyond_backlog_cap_resets_flow() {
        let mut cfg = test_config();
        cfg.flow_backlog_cap = 4;
        let dns = Arc::new(DnsRelay::new("127.0.0.1:1".parse().unwrap(), None, Duration::from_millis(50)));
        let dialer: Arc<dyn ProxyDialer> = Arc::new(AlwaysRejectDialer);
        let (write_tx, mut write_rx) = mpsc::channel(16);

        let counters = telemetry::SessionCounters::new();
        let io_loop = TunIoLoop::new(&cfg, dns, dialer, write_tx, counters).expect("construct loop");
        io_loop.dispatch(&syn_frame(7777, 80)).await;
        assert_eq!(io_loop.flow_table.len(), 1);
        let _synack = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
            .await
            .expect("synack within timeout");

        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let key = FlowKey::new(Protocol::Tcp, src, 7777, dst, 80);
        let (client_next_seq, server_next_seq) = {
            let entry = io_loop.flow_table.get(&key).expect("flow present");
            let FlowHandle::Tcp(handle) = &entry.handle;
            let st = handle.state.lock().await;
            (st.client_next_seq, st.server_next_seq)
        };

        // Complete the handshake first: data arriving before it finishes is dropped silently
        // rather than counted against the backlog.
        let handshake_ack = build_tcp_segment(src, dst, 7777, 80, client_next_seq, server_next_seq, tcp_flags::ACK, 65535, None, &[]);
        io_loop.dispatch(&build_ipv4(src, dst, IpProtocol::Tcp, 2, 64, &handshake_ack)).await;

        let payload = b"far more than four bytes of payload";
        let tcp = build_tcp_segment(
            src, dst, 7777, 80, client_next_seq, server_next_seq,
            tcp_flags::PSH | tcp_flags::ACK, 65535, None, payload,
        );
        let frame = build_ipv4(src, dst, IpProtocol::Tcp, 3, 64, &tcp);
        io_loop.dispatch(&frame).await;

        assert!(io_loop.flow_table.is_empty(), "flow must be reset once the backlog cap is exceeded");
        let rst_frame = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
            .await
            .expect("rst within timeout")
            .expect("channel open");
        let ip = parse_ipv4(&rst_frame).expect("parse rst ip");
        let tcp = parse_tcp(&ip).expect("parse rst tcp");
        assert!(tcp.has_flag(tcp_flags::RST));
    }
}
