use tokio::io::{ReadHalf, WriteHalf};

use crate::tungate::config::{TunConfig, TunPrefix};

pub type TunReader = ReadHalf<tun::AsyncDevice>;
pub type TunWriter = WriteHalf<tun::AsyncDevice>;

/// Brings up the TUN interface described by `cfg` and splits it into an owned reader/writer
/// pair, matching how the TUN I/O loop wants to hand the halves to two independent tasks.
pub fn open(cfg: &TunConfig) -> anyhow::Result<(TunReader, TunWriter)> {
    let address: std::net::Ipv4Addr = cfg
        .address
        .parse()
        .map_err(|_| anyhow::anyhow!("device: invalid tun.address {:?}", cfg.address))?;
    let netmask: std::net::Ipv4Addr = cfg
        .netmask
        .parse()
        .map_err(|_| anyhow::anyhow!("device: invalid tun.netmask {:?}", cfg.netmask))?;

    let mut config = tun::Configuration::default();
    config
        .tun_name(&cfg.name)
        .address(address)
        .netmask(netmask)
        .mtu(cfg.mtu as i32)
        .up();

    let want_prefix = cfg.prefix == TunPrefix::Four;
    #[cfg(target_os = "linux")]
    config.platform_config(|platform| {
        platform.packet_information(want_prefix);
    });
    #[cfg(not(target_os = "linux"))]
    let _ = want_prefix;

    let dev = tun::create_as_async(&config)
        .map_err(|e| anyhow::anyhow!("device: create tun device {:?}: {e}", cfg.name))?;

    let (reader, writer) = tokio::io::split(dev);
    Ok((reader, writer))
}
