use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

pub const METRIC_FLOWS_TOTAL: &str = "tungate_flows_total";
pub const METRIC_ACTIVE_FLOWS: &str = "tungate_active_flows";
pub const METRIC_BYTES_UP_TOTAL: &str = "tungate_bytes_up_total";
pub const METRIC_BYTES_DOWN_TOTAL: &str = "tungate_bytes_down_total";
pub const METRIC_DNS_QUERIES_TOTAL: &str = "tungate_dns_queries_total";
pub const METRIC_PARSE_ERRORS_TOTAL: &str = "tungate_parse_errors_total";
pub const METRIC_PROXY_DIAL_FAILURES_TOTAL: &str = "tungate_proxy_dial_failures_total";
pub const METRIC_INVALID_ACKS_TOTAL: &str = "tungate_invalid_acks_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn record_flow_opened() {
    counter!(METRIC_FLOWS_TOTAL).increment(1);
    gauge!(METRIC_ACTIVE_FLOWS).increment(1.0);
}

pub fn record_flow_closed() {
    gauge!(METRIC_ACTIVE_FLOWS).decrement(1.0);
}

pub fn record_bytes_up(n: u64) {
    counter!(METRIC_BYTES_UP_TOTAL).increment(n);
}

pub fn record_bytes_down(n: u64) {
    counter!(METRIC_BYTES_DOWN_TOTAL).increment(n);
}

pub fn record_dns_query() {
    counter!(METRIC_DNS_QUERIES_TOTAL).increment(1);
}

pub fn record_parse_error() {
    counter!(METRIC_PARSE_ERRORS_TOTAL).increment(1);
}

pub fn record_proxy_dial_failure() {
    counter!(METRIC_PROXY_DIAL_FAILURES_TOTAL).increment(1);
}

/// An ACK was observed covering bytes we never sent (ack beyond `server_next_seq`). The segment
/// is dropped rather than RST, matching a real stack's tolerance of a confused/buggy peer.
pub fn record_invalid_ack() {
    counter!(METRIC_INVALID_ACKS_TOTAL).increment(1);
}

/// Per-session byte/liveness counters, readable back by the supervisor for status reporting and
/// dead-session detection. The `metrics` crate's recorders are write-only from here, so this
/// keeps its own atomics alongside pushing into the Prometheus counters.
pub struct SessionCounters {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    started_at_ms: u64,
    last_packet_ms: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Arc<Self> {
        let now = now_unix_ms();
        Arc::new(SessionCounters {
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            started_at_ms: now,
            last_packet_ms: AtomicU64::new(now),
        })
    }

    pub fn add_up(&self, n: u64) {
        record_bytes_up(n);
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_down(&self, n: u64) {
        record_bytes_down(n);
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_packet_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration_ms(&self) -> u64 {
        now_unix_ms().saturating_sub(self.started_at_ms)
    }

    pub fn idle_ms(&self) -> u64 {
        now_unix_ms().saturating_sub(self.last_packet_ms.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowInfo {
    pub key: String,
    pub proto: &'static str,
    pub src: String,
    pub dst: String,
    pub state: String,
    pub opened_at_unix_ms: u64,
}

#[derive(Debug)]
pub struct FlowRegistry {
    flows: DashMap<String, FlowInfo>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    pub fn insert(&self, f: FlowInfo) {
        self.flows.insert(f.key.clone(), f);
    }

    pub fn update_state(&self, key: &str, state: impl Into<String>) {
        if let Some(mut f) = self.flows.get_mut(key) {
            f.state = state.into();
        }
    }

    pub fn remove(&self, key: &str) {
        self.flows.remove(key);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn snapshot(&self) -> Vec<FlowInfo> {
        let mut out = Vec::with_capacity(self.flows.len());
        for f in self.flows.iter() {
            out.push(f.value().clone());
        }
        out.sort_by(|a, b| a.opened_at_unix_ms.cmp(&b.opened_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_flow_seq() -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    SEQ.fetch_add(1, Ordering::Relaxed)
}

pub type SharedFlowRegistry = Arc<FlowRegistry>;
pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
pub type SharedSessionCounters = Arc<SessionCounters>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_insert_and_remove() {
        let reg = FlowRegistry::new();
        reg.insert(FlowInfo {
            key: "k1".into(),
            proto: "tcp",
            src: "10.0.0.2:1111".into(),
            dst: "93.184.216.34:80".into(),
            state: "established".into(),
            opened_at_unix_ms: now_unix_ms(),
        });
        assert_eq!(reg.len(), 1);
        reg.update_state("k1", "close_wait");
        assert_eq!(reg.snapshot()[0].state, "close_wait");
        reg.remove("k1");
        assert!(reg.is_empty());
    }

    #[test]
    fn session_counters_accumulate_and_report_idle() {
        let counters = SessionCounters::new();
        counters.add_up(100);
        counters.add_down(40);
        assert_eq!(counters.bytes_up(), 100);
        assert_eq!(counters.bytes_down(), 40);
        assert!(counters.idle_ms() < 1000);
    }
}
