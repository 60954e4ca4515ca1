//! Session lifecycle: brings the TUN device up against a selected profile, drives health
//! checks and the public-IP probe, and tears everything down again on stop/disconnect.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::pki_types::ServerName;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::tungate::config::Config;
use crate::tungate::control::{Command, SessionState, StatusEvent};
use crate::tungate::gateway::dns_relay::DnsRelay;
use crate::tungate::gateway::tun_io::TunIoLoop;
use crate::tungate::profile_store::{Profile, ProfileStore};
use crate::tungate::proxy::dialer::{dialer_for_profile, ProxyDialer};
use crate::tungate::telemetry::{self, SessionCounters};
use crate::tungate::{device, GatewayExit};

struct SessionRuntime {
    profile_id: String,
    flow_table: Arc<crate::tungate::gateway::FlowTable>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    counters: Arc<SessionCounters>,
}

pub struct Supervisor {
    cfg: Config,
    profile_store: Arc<ProfileStore>,
    status_tx: watch::Sender<StatusEvent>,
    session: Mutex<Option<SessionRuntime>>,
}

impl Supervisor {
    pub fn new(cfg: Config, profile_store: Arc<ProfileStore>, status_tx: watch::Sender<StatusEvent>) -> Arc<Self> {
        Arc::new(Supervisor {
            cfg,
            profile_store,
            status_tx,
            session: Mutex::new(None),
        })
    }

    fn set_status(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    pub fn status(&self) -> StatusEvent {
        self.status_tx.borrow().clone()
    }

    pub async fn run_command_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Start { profile_id, reply } => {
                    let res = self.clone().start(profile_id).await;
                    let _ = reply.send(res);
                }
                Command::Stop { force, reply } => {
                    let res = self.clone().stop(force).await;
                    let _ = reply.send(res);
                }
                Command::StatusQuery { reply } => {
                    let _ = reply.send(self.status());
                }
            }
        }
    }

    pub async fn start(self: Arc<Self>, profile_id: String) -> anyhow::Result<()> {
        {
            let guard = self.session.lock().await;
            if guard.is_some() {
                anyhow::bail!(GatewayExit::BadProfile(
                    "a session is already active; stop it first".into()
                ));
            }
        }

        let mut profile = self.profile_store.get(&profile_id).ok_or_else(|| {
            GatewayExit::BadProfile(format!("no profile with id {profile_id:?}"))
        })?;

        self.set_status(status_event(
            SessionState::Connecting,
            Some(profile_id.clone()),
            None,
            None,
            None,
        ));

        let (reader, writer) = device::open(&self.cfg.tun).map_err(|err| {
            GatewayExit::TunnelSetupFailed(format!("{err:#}"))
        })?;

        self.set_status(status_event(
            SessionState::Handshaking,
            Some(profile_id.clone()),
            None,
            None,
            None,
        ));

        resolve_proxy_host(&mut profile, &self.profile_store)
            .await
            .map_err(|err| GatewayExit::ProxyHandshakeFailed(format!("{err:#}")))?;

        let dialer: Arc<dyn ProxyDialer> =
            dialer_for_profile(&profile, self.cfg.timeouts.proxy_handshake_timeout).into();

        // Handshake-confirm against the upstream proxy before declaring the tunnel up: a dead or
        // misconfigured proxy should fail fast rather than silently blackhole every flow.
        probe_proxy_handshake(dialer.as_ref()).await.map_err(|err| {
            GatewayExit::ProxyHandshakeFailed(format!("{err}"))
        })?;

        let (write_tx, write_rx) = mpsc::channel(crate::tungate::gateway::tun_io::WRITE_CHANNEL_CAPACITY);

        let (primary_dns, secondary_dns) = default_resolvers(&profile);
        let dns_relay = Arc::new(DnsRelay::new(primary_dns, secondary_dns, self.cfg.timeouts.dns_query_timeout));

        let counters = SessionCounters::new();

        let io_loop = TunIoLoop::new(&self.cfg, dns_relay, dialer.clone(), write_tx, counters.clone())
            .map_err(|err| GatewayExit::TunnelSetupFailed(format!("{err:#}")))?;

        let flow_table = io_loop.flow_table();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        {
            let prefix = self.cfg.tun.prefix;
            tasks.spawn(async move {
                TunIoLoop::run_writer(writer, write_rx, prefix).await;
            });
        }
        {
            let io_loop = io_loop.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                io_loop.run_reader(reader, cancel).await;
            });
        }
        {
            let io_loop = io_loop.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                io_loop.run_idle_sweeper(cancel).await;
            });
        }

        if self.cfg.public_ip_probe.enabled {
            let sup = self.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            let counters = counters.clone();
            tasks.spawn(async move {
                sup.run_public_ip_probe(dialer, cancel, counters).await;
            });
        }

        {
            let sup = self.clone();
            let cancel = cancel.clone();
            let counters = counters.clone();
            let profile_id = profile_id.clone();
            tasks.spawn(async move {
                sup.run_health_check(cancel, counters, profile_id).await;
            });
        }

        *self.session.lock().await = Some(SessionRuntime {
            profile_id: profile_id.clone(),
            flow_table,
            tasks,
            cancel,
            counters: counters.clone(),
        });

        self.profile_store.set_last_connected_profile_id(Some(profile_id.clone()))?;
        self.profile_store.set_manually_disconnected(false)?;

        if !self.cfg.public_ip_probe.enabled {
            // No probe configured to confirm the proxy is actually forwarding traffic beyond the
            // handshake: declare Connected right away. When the probe is enabled,
            // `run_public_ip_probe` makes the Connected transition itself on its first success.
            self.set_status(status_event(
                SessionState::Connected,
                Some(profile_id),
                None,
                None,
                Some(&counters),
            ));
        }

        Ok(())
    }

    pub async fn stop(self: Arc<Self>, force: bool) -> anyhow::Result<()> {
        if !force && self.profile_store.automation_session_active() {
            anyhow::bail!(GatewayExit::PermissionDenied(
                "an automation session is active; pass force to override".into()
            ));
        }

        let runtime = self.session.lock().await.take();
        let Some(mut runtime) = runtime else {
            return Ok(());
        };

        runtime.cancel.cancel();
        runtime.flow_table.clear();

        if force {
            runtime.tasks.abort_all();
        }
        let drain = async {
            while runtime.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            runtime.tasks.abort_all();
            while runtime.tasks.join_next().await.is_some() {}
        }

        self.profile_store.set_manually_disconnected(true)?;

        self.set_status(status_event(
            SessionState::Disconnected,
            Some(runtime.profile_id),
            None,
            None,
            Some(&runtime.counters),
        ));

        Ok(())
    }

    async fn run_health_check(
        self: Arc<Self>,
        cancel: CancellationToken,
        counters: Arc<SessionCounters>,
        profile_id: String,
    ) {
        let mut interval = tokio::time::interval(self.cfg.health_check.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let idle = Duration::from_millis(counters.idle_ms());
                    if idle > self.cfg.health_check.dead_threshold {
                        tracing::warn!(
                            profile_id = %profile_id,
                            idle_ms = counters.idle_ms(),
                            "supervisor: flow idle past dead threshold, reconnecting",
                        );
                        // Run the reconnect sequence on a detached task rather than inline: `stop`
                        // aborts every task in this session's JoinSet, which includes the health
                        // check task currently running this loop. Spawning first and breaking
                        // immediately after means that abort can't cut the reconnect off mid-way.
                        let sup = self.clone();
                        let reconnect_delay = self.cfg.health_check.reconnect_delay;
                        let reconnect_profile_id = profile_id.clone();
                        tokio::spawn(async move {
                            if let Err(err) = sup.clone().stop(true).await {
                                tracing::warn!(error = %err, "supervisor: auto-reconnect stop failed");
                                return;
                            }
                            tokio::time::sleep(reconnect_delay).await;
                            if let Err(err) = sup.start(reconnect_profile_id).await {
                                tracing::warn!(error = %err, "supervisor: auto-reconnect start failed");
                            }
                        });
                        break;
                    }

                    let mut current = self.status();
                    current.is_connected = current.state == SessionState::Connected;
                    current.duration_ms = counters.duration_ms();
                    current.bytes_up = counters.bytes_up();
                    current.bytes_down = counters.bytes_down();
                    self.set_status(current);
                }
            }
        }
    }

    async fn run_public_ip_probe(
        self: Arc<Self>,
        dialer: Arc<dyn ProxyDialer>,
        cancel: CancellationToken,
        counters: Arc<SessionCounters>,
    ) {
        let mut interval = tokio::time::interval(self.cfg.public_ip_probe.interval);
        let mut announced_connected = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match probe_public_ip(&self.cfg, dialer.as_ref()).await {
                        Ok(ip) => {
                            let mut current = self.status();
                            current.public_ip = Some(ip);
                            if !announced_connected {
                                current.state = SessionState::Connected;
                                announced_connected = true;
                            }
                            current.is_connected = current.state == SessionState::Connected;
                            current.duration_ms = counters.duration_ms();
                            current.bytes_up = counters.bytes_up();
                            current.bytes_down = counters.bytes_down();
                            self.set_status(current);
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "supervisor: public ip probe failed");
                        }
                    }
                }
            }
        }
    }
}

/// Builds a `StatusEvent`, pulling bytes/duration from `counters` when a session is already up.
/// Call sites that run before the session exists (Connecting/Handshaking) pass `None`.
fn status_event(
    state: SessionState,
    profile_id: Option<String>,
    public_ip: Option<String>,
    message: Option<String>,
    counters: Option<&SessionCounters>,
) -> StatusEvent {
    let (duration_ms, bytes_up, bytes_down) = counters
        .map(|c| (c.duration_ms(), c.bytes_up(), c.bytes_down()))
        .unwrap_or((0, 0, 0));
    StatusEvent {
        is_connected: state == SessionState::Connected,
        state,
        profile_id,
        public_ip,
        duration_ms,
        bytes_up,
        bytes_down,
        message,
        since_unix_ms: telemetry::now_unix_ms(),
    }
}

/// Resolves `profile.host` to a literal IP once and caches it in `resolved_host`, so later dials
/// skip re-resolving the hostname. A literal IP in `host` is left untouched; a cached
/// `resolved_host` from a previous session is reused without a fresh lookup.
async fn resolve_proxy_host(profile: &mut Profile, store: &ProfileStore) -> anyhow::Result<()> {
    if profile.host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    if let Some(cached) = profile.resolved_host.clone() {
        profile.host = cached;
        return Ok(());
    }

    let lookup_target = format!("{}:{}", profile.host, profile.port);
    let mut addrs = tokio::net::lookup_host(&lookup_target)
        .await
        .with_context(|| format!("resolve proxy host {:?}", profile.host))?;
    let resolved = addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for proxy host {:?}", profile.host))?;

    let ip = resolved.ip().to_string();
    let mut persisted = profile.clone();
    persisted.resolved_host = Some(ip.clone());
    store.upsert(persisted)?;

    profile.resolved_host = Some(ip.clone());
    profile.host = ip;
    Ok(())
}

async fn probe_proxy_handshake(dialer: &dyn ProxyDialer) -> anyhow::Result<()> {
    use crate::tungate::proxy::dialer::ProxyTarget;
    // Dial a throwaway TLS port on the probe host; this confirms the proxy itself is reachable
    // and willing to negotiate without depending on a specific site being up.
    dialer
        .dial(&ProxyTarget::Domain("api.ipify.org".into(), 443))
        .await
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("{err}"))
}

async fn probe_public_ip(cfg: &Config, dialer: &dyn ProxyDialer) -> anyhow::Result<String> {
    use crate::tungate::proxy::dialer::ProxyTarget;

    let stream = dialer
        .dial(&ProxyTarget::Domain(
            cfg.public_ip_probe.host.clone(),
            cfg.public_ip_probe.port,
        ))
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(cfg.public_ip_probe.host.clone())
        .map_err(|_| anyhow::anyhow!("invalid server name for TLS probe"))?;

    let mut tls = tokio::time::timeout(
        cfg.public_ip_probe.timeout,
        connector.connect(server_name, stream),
    )
    .await??;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        cfg.public_ip_probe.path, cfg.public_ip_probe.host
    );
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    tls.write_all(request.as_bytes()).await?;

    let mut body = Vec::new();
    tokio::time::timeout(cfg.public_ip_probe.timeout, tls.read_to_end(&mut body)).await??;

    let text = String::from_utf8_lossy(&body);
    let split_at = text.find("\r\n\r\n").map(|i| i + 4).unwrap_or(0);
    let json_text = &text[split_at..];

    #[derive(serde::Deserialize)]
    struct IpResponse {
        ip: String,
    }
    let parsed: IpResponse = serde_json::from_str(json_text.trim())
        .map_err(|err| anyhow::anyhow!("public ip probe: unexpected response body: {err}"))?;

    Ok(parsed.ip)
}

/// Picks the DNS resolvers the relay should query: the profile's configured `dns1`/`dns2` when
/// present and parseable, a public default otherwise.
fn default_resolvers(profile: &Profile) -> (std::net::SocketAddr, Option<std::net::SocketAddr>) {
    let parse = |s: &str| -> Option<std::net::SocketAddr> {
        s.parse::<std::net::IpAddr>().ok().map(|ip| std::net::SocketAddr::new(ip, 53))
    };

    let primary = profile
        .dns1
        .as_deref()
        .and_then(parse)
        .unwrap_or_else(|| std::net::SocketAddr::new(Ipv4Addr::new(1, 1, 1, 1).into(), 53));
    let secondary = profile
        .dns2
        .as_deref()
        .and_then(parse)
        .or_else(|| Some(std::net::SocketAddr::new(Ipv4Addr::new(8, 8, 8, 8).into(), 53)));
    (primary, secondary)
}
