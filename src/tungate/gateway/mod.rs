pub mod dns_relay;
pub mod flow_table;
pub mod tcp_flow;
pub mod tun_io;

pub use flow_table::FlowTable;
