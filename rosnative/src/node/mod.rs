//! The node runtime: identity, endpoint ownership, the slave XML-RPC
//! server, and the public [NodeHandle] facade.

pub(crate) mod actor;
mod handle;
mod xmlrpc;

pub use handle::{
    AdvertiseOptions, NodeHandle, NodeOptions, ServiceClientOptions, SubscribeOptions,
};

use rosnative_common::{Error, Result};
use std::net::Ipv4Addr;

/// Determines the address this node binds its servers on and the hostname
/// it advertises to the rest of the graph.
///
/// An explicit override wins, then `ROS_IP`, then `ROS_HOSTNAME`, then the
/// machine's hostname.
fn determine_addr(hostname_override: Option<&str>) -> Result<(Ipv4Addr, String)> {
    if let Some(host) = hostname_override {
        // An override that is an address is also used for binding
        let bind_addr = host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
        return Ok((bind_addr, host.to_string()));
    }
    if let Ok(ip_str) = std::env::var("ROS_IP") {
        let ip = ip_str
            .parse()
            .map_err(|_| Error::Config(format!("ROS_IP is not a valid IPv4 address: {ip_str}")))?;
        return Ok((ip, ip_str));
    }
    if let Ok(name) = std::env::var("ROS_HOSTNAME") {
        if !name.is_empty() {
            return Ok((Ipv4Addr::UNSPECIFIED, name));
        }
    }
    let name = gethostname::gethostname()
        .into_string()
        .map_err(|_| Error::Config("machine hostname is not valid unicode".to_string()))?;
    Ok((Ipv4Addr::UNSPECIFIED, name))
}
