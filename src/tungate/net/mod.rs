pub mod checksum;
pub mod flow_key;
pub mod packet;

pub use flow_key::FlowKey;
