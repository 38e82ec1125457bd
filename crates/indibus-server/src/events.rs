//! Collaborator hooks: accept policies and lifecycle observers.

use std::net::{IpAddr, SocketAddr};

use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

/// Identifies one connection or device backend inside the broker.
pub type PeerId = u64;

/// What the broker knows about an incoming socket before accepting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

/// Decides whether an incoming connection becomes a client.
///
/// Policies are consulted in order; the first rejection wins.
pub trait AcceptPolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn accept(&self, info: &ConnectionInfo) -> bool;
}

/// Accepts connections from a fixed set of hosts.
#[derive(Debug, Clone, Default)]
pub struct HostAllowList {
    hosts: Vec<IpAddr>,
    loopback: bool,
}

impl HostAllowList {
    /// Builds the list from addresses; `localhost` matches any loopback
    /// address.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for entries that are not IP addresses.
    pub fn new<S: AsRef<str>>(hosts: &[S]) -> ServerResult<Self> {
        let mut list = Self::default();
        for host in hosts {
            let host = host.as_ref().trim();
            if host.eq_ignore_ascii_case("localhost") {
                list.loopback = true;
                continue;
            }
            let ip = host
                .parse::<IpAddr>()
                .map_err(|_| ServerError::config(format!("invalid allowed host {host:?}")))?;
            list.hosts.push(ip);
        }
        Ok(list)
    }

    fn allows(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        (self.loopback && ip.is_loopback()) || self.hosts.contains(&ip)
    }
}

impl AcceptPolicy for HostAllowList {
    fn name(&self) -> &str {
        "allowed_hosts"
    }

    fn accept(&self, info: &ConnectionInfo) -> bool {
        self.allows(info.peer.ip())
    }
}

/// Observer of broker lifecycle events. It has no influence on routing.
pub trait ServerEventHandler: Send + Sync {
    fn connection_established(&self, _peer: PeerId, _address: SocketAddr) {}

    fn connection_rejected(&self, _address: SocketAddr, _policy: &str) {}

    fn connection_broken(&self, _peer: PeerId) {}

    fn device_registered(&self, _peer: PeerId, _identifiers: &[String]) {}

    /// A device backend went away; `devices` lists the names it had announced.
    fn driver_disconnected(&self, _peer: PeerId, _identifiers: &[String], _devices: &[String]) {}
}

/// Writes lifecycle events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

impl ServerEventHandler for LoggingEventHandler {
    fn connection_established(&self, peer: PeerId, address: SocketAddr) {
        info!(peer, %address, "Client connected");
    }

    fn connection_rejected(&self, address: SocketAddr, policy: &str) {
        warn!(%address, policy, "Client rejected");
    }

    fn connection_broken(&self, peer: PeerId) {
        info!(peer, "Client disconnected");
    }

    fn device_registered(&self, peer: PeerId, identifiers: &[String]) {
        info!(peer, identifiers = ?identifiers, "Device registered");
    }

    fn driver_disconnected(&self, peer: PeerId, identifiers: &[String], devices: &[String]) {
        info!(peer, identifiers = ?identifiers, devices = ?devices, "Device disconnected");
    }
}
