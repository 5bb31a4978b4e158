use anyhow::{anyhow, Result};
use get_if_addrs::{get_if_addrs, IfAddr, Interface};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

pub fn get_first_non_loopback_interface() -> Result<IpAddr> {
    first_ipv4(&get_if_addrs()?).ok_or_else(|| anyhow!("No IPv4 address found"))
}

fn first_ipv4(interfaces: &[Interface]) -> Option<IpAddr> {
    interfaces
        .iter()
        .filter(|i| !i.is_loopback())
        .find_map(|i| match i.addr {
            IfAddr::V4(ref addr) => Some(IpAddr::V4(addr.ip)),
            IfAddr::V6(_) => None,
        })
}

/// The address to advertise in Via/Contact/SDP for a bound socket.
///
/// Sockets bound to the unspecified address report `0.0.0.0`; those are
/// replaced with the first non-loopback interface when one exists.
pub fn advertised_ip(local: IpAddr) -> IpAddr {
    if !local.is_unspecified() {
        return local;
    }
    match get_first_non_loopback_interface() {
        Ok(ip) => ip,
        Err(e) => {
            debug!("no interface to advertise, keeping {}: {}", local, e);
            local
        }
    }
}

/// Resolve `host:port`, preferring IPv4.
pub async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| anyhow!("failed to resolve {}:{}: {}", host, port, e))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("no address found for {}:{}", host, port))
}
