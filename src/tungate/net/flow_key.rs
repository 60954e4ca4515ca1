use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Identifies one flow by its 4-tuple plus protocol, as seen from the TUN device's side
/// (src is always the local tunneled client, dst the remote endpoint the client is reaching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(
        protocol: Protocol,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        FlowKey {
            protocol,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    pub fn reversed(&self) -> Self {
        FlowKey {
            protocol: self.protocol,
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(
            f,
            "{proto}:{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_swaps_src_and_dst() {
        let k = FlowKey::new(
            Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 2),
            5555,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        );
        let r = k.reversed();
        assert_eq!(r.src_ip, k.dst_ip);
        assert_eq!(r.src_port, k.dst_port);
        assert_eq!(r.dst_ip, k.src_ip);
        assert_eq!(r.dst_port, k.src_port);
    }

    #[test]
    fn display_formats_as_proto_src_dst() {
        let k = FlowKey::new(
            Protocol::Udp,
            Ipv4Addr::new(10, 0, 0, 2),
            53000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        );
        assert_eq!(k.to_string(), "udp:10.0.0.2:53000->8.8.8.8:53");
    }
}
