//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use indibus_protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the wire protocol listener binds to.
    pub listen_address: IpAddr,

    /// Wire protocol port. 0 picks a free port.
    pub port: u16,

    /// Maximum concurrent client connections.
    pub max_clients: usize,

    /// Path to the administrative Unix socket.
    pub control_socket_path: PathBuf,

    /// Whether to remove a stale control socket on startup.
    pub cleanup_stale_socket: bool,

    /// Timeout for a single control request or response.
    pub control_timeout: Duration,

    /// Frames larger than this are discarded.
    pub max_frame_size: usize,

    /// Hosts allowed to connect. Empty accepts everyone.
    pub allowed_hosts: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_clients: 100,
            control_socket_path: default_socket_path(),
            cleanup_stale_socket: true,
            control_timeout: Duration::from_secs(30),
            max_frame_size: MAX_FRAME_SIZE,
            allowed_hosts: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the given control socket path.
    pub fn new(control_socket_path: impl Into<PathBuf>) -> Self {
        Self {
            control_socket_path: control_socket_path.into(),
            ..Default::default()
        }
    }

    pub fn with_listen_address(mut self, address: IpAddr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    /// Socket address of the wire protocol listener.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }
}

/// Returns the default control socket path.
///
/// Uses `$XDG_RUNTIME_DIR/indibus.sock` if available,
/// otherwise falls back to `/tmp/indibus-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("indibus.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/indibus-{}.sock", uid))
    }
}
