use std::sync::{atomic::AtomicU64, Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio_util::sync::CancellationToken;

use crate::tungate::net::FlowKey;

use super::tcp_flow::TcpFlow;

/// A handle to one in-flight flow. TCP flows carry their full state machine plus the channel
/// that feeds client-sent payload bytes to the task driving the proxy socket; UDP traffic never
/// reaches this table (DNS, the only UDP case in scope, is handled by the relay directly).
pub enum FlowHandle {
    Tcp(TcpFlowHandle),
}

#[derive(Clone)]
pub struct TcpFlowHandle {
    pub state: Arc<tokio::sync::Mutex<TcpFlow>>,
    pub to_proxy_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    /// The last SYN-ACK frame sent for this flow, kept so a retransmitted client SYN can be
    /// answered again without disturbing the flow's state.
    pub synack_frame: Vec<u8>,
    /// Client payload bytes currently sitting in `to_proxy_tx`'s channel, counted in bytes
    /// rather than messages so the per-flow backlog cap matches the spec's byte budget.
    pub buffered_bytes: Arc<AtomicU64>,
}

pub struct Flow {
    pub handle: FlowHandle,
    pub cancel: CancellationToken,
}

/// Concurrent flow table keyed by 4-tuple. `get_or_create` guarantees single-writer-wins: if
/// two tasks race to create the same key, only one `create` closure's result is kept and the
/// loser observes the winner's handle instead.
#[derive(Default)]
pub struct FlowTable {
    flows: DashMap<FlowKey, Flow>,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            flows: DashMap::new(),
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<dashmap::mapref::one::Ref<'_, FlowKey, Flow>> {
        self.flows.get(key)
    }

    /// Returns the existing flow for `key`, or inserts the one built by `create` if absent.
    /// `create` only runs when the entry is actually vacant, so it never races against itself.
    pub fn get_or_create<F>(&self, key: FlowKey, create: F) -> dashmap::mapref::one::RefMut<'_, FlowKey, Flow>
    where
        F: FnOnce() -> Flow,
    {
        match self.flows.entry(key) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(e) => e.insert_entry(create()).into_ref(),
        }
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Flow> {
        self.flows.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Cancels and drops every tracked flow. Used on session stop/disconnect.
    pub fn clear(&self) {
        for entry in self.flows.iter() {
            entry.value().cancel.cancel();
        }
        self.flows.clear();
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.flows.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            crate::tungate::net::flow_key::Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 2),
            port,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        )
    }

    fn test_flow() -> Flow {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        Flow {
            handle: FlowHandle::Tcp(TcpFlowHandle {
                state: Arc::new(tokio::sync::Mutex::new(TcpFlow::new_for_test())),
                to_proxy_tx: tx,
                synack_frame: Vec::new(),
                buffered_bytes: Arc::new(AtomicU64::new(0)),
            }),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn get_or_create_is_single_writer_wins() {
        let table = FlowTable::new();
        let k = key(1111);

        let created_count = std::cell::Cell::new(0);
        {
            let _f = table.get_or_create(k, || {
                created_count.set(created_count.get() + 1);
                test_flow()
            });
        }
        {
            let _f = table.get_or_create(k, || {
                created_count.set(created_count.get() + 1);
                test_flow()
            });
        }
        assert_eq!(created_count.get(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_drops_entry() {
        let table = FlowTable::new();
        let k = key(2222);
        table.get_or_create(k, test_flow);
        assert!(table.remove(&k).is_some());
        assert!(table.is_empty());
    }
}
