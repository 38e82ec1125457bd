//! Serve command: runs the broker in the foreground.
//!
//! Wires together the components of a broker process:
//! - the routing core with its accept policy and event log
//! - the built-in driver registry
//! - the control socket (claimed first, so a second broker fails early)
//! - the wire protocol listener
//! - startup drivers from the config file and the command line

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{info, warn};

use indibus_protocol::DriverSpec;
use indibus_server::{
    Broker, BrokerListener, ControlServer, Driver, DriverRegistry, HostAllowList, LoggingEventHandler,
    ServerConfig, ServerState, SharedState, SignalHandler, make_connection_handler,
};

use crate::cli::Cli;
use crate::config::CliConfig;
use crate::demo::{DEMO_CAMERA_ID, DemoCamera};
use crate::error::ClientResult;

/// Command-line overrides for the serve command.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub drivers: Vec<DriverSpec>,
}

/// Registry of the drivers compiled into this binary.
pub fn builtin_drivers() -> DriverRegistry {
    DriverRegistry::new()
        .with_driver(DEMO_CAMERA_ID, || Box::new(DemoCamera::new()) as Box<dyn Driver>)
}

/// A broker whose sockets are bound but which is not serving yet.
pub struct Daemon {
    state: SharedState,
    listener: BrokerListener,
    control: ControlServer,
    signals: SignalHandler,
}

impl Daemon {
    /// Binds the control socket and the wire listener.
    pub async fn bind(server_config: &ServerConfig) -> ClientResult<Self> {
        let mut broker = Broker::new().with_event_handler(Arc::new(LoggingEventHandler));
        if !server_config.allowed_hosts.is_empty() {
            broker = broker.with_accept_policy(HostAllowList::new(&server_config.allowed_hosts)?);
        }
        let broker = Arc::new(broker);

        let control = ControlServer::new(server_config).await?;
        let listener = BrokerListener::bind(server_config, broker.clone()).await?;
        let port = listener.local_addr()?.port();

        let signals = SignalHandler::new();
        let drivers = builtin_drivers().with_max_frame_size(server_config.max_frame_size);
        let state = Arc::new(
            ServerState::new(broker, drivers, signals.shutdown_handle()).with_port(port),
        );

        Ok(Self {
            state,
            listener,
            control,
            signals,
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn local_addr(&self) -> ClientResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    /// Loads each driver in turn; a failing driver is logged and skipped.
    pub async fn load_drivers(&self, specs: &[DriverSpec]) -> usize {
        let mut loaded = 0;
        for spec in specs {
            match self.state.load_driver(spec).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(driver = %spec, error = %e, "Startup driver failed to load"),
            }
        }
        loaded
    }

    /// Serves clients and control requests until shutdown is signalled,
    /// then disconnects everyone and destroys every backend.
    pub async fn run(self) -> ClientResult<()> {
        let handler = make_connection_handler(self.state.clone());
        let shutdown = self.signals.shutdown();
        let (wire, control) = tokio::join!(
            self.listener.run_until_shutdown(self.signals.shutdown_handle()),
            self.control.run_until_shutdown(handler, shutdown.wait()),
        );

        info!("Shutting down...");
        self.state.broker().shutdown();
        wire?;
        control?;
        info!("Broker stopped");
        Ok(())
    }
}

/// Starts the broker in the foreground.
///
/// Blocks until SIGTERM/SIGINT or a control `stop` request.
pub async fn run(cli: &Cli, config: &CliConfig, options: ServeOptions) -> ClientResult<()> {
    let mut config = config.clone();
    if let Some(listen) = options.listen {
        config.server.listen = listen;
    }
    if let Some(port) = options.port {
        config.server.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.server.timeout = timeout;
    }

    let socket_path = config.socket_path(cli.socket.as_deref());
    let server_config = config.server_config(socket_path);
    let daemon = Daemon::bind(&server_config).await?;
    daemon.signals().spawn_listener();

    let mut specs: Vec<DriverSpec> = config.drivers.iter().map(DriverSpec::from).collect();
    specs.extend(options.drivers);
    let loaded = daemon.load_drivers(&specs).await;

    info!(
        address = %daemon.local_addr()?,
        control = %server_config.control_socket_path.display(),
        drivers = loaded,
        "Broker ready"
    );
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::ControlClient;
    use indibus_protocol::{ControlRequest, ControlResponse};
    use std::time::Duration;
    use tempfile::tempdir;

    fn server_config(socket: &std::path::Path) -> ServerConfig {
        ServerConfig::new(socket)
            .with_listen_address("127.0.0.1".parse().unwrap())
            .with_port(0)
    }

    #[test]
    fn demo_camera_is_builtin() {
        let registry = builtin_drivers();
        let ids: Vec<&str> = registry.builtin_ids().collect();
        assert_eq!(ids, vec![DEMO_CAMERA_ID]);
    }

    #[tokio::test]
    async fn daemon_serves_control_requests_until_stopped() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("indibus.sock");
        let daemon = Daemon::bind(&server_config(&socket)).await.unwrap();
        let port = daemon.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let loaded = daemon
            .load_drivers(&[
                DriverSpec::builtin(DEMO_CAMERA_ID),
                DriverSpec::builtin("no_such_driver"),
            ])
            .await;
        assert_eq!(loaded, 1);

        let state = daemon.state().clone();
        let task = tokio::spawn(daemon.run());

        let client = ControlClient::new(&socket, Duration::from_secs(5));
        match client.request(ControlRequest::Status).await.unwrap() {
            ControlResponse::Status { info } => {
                assert_eq!(info.port, port);
                assert_eq!(info.backends, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        client.request(ControlRequest::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        // Route loops deregister the destroyed backends as they wind down.
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.broker().backend_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn second_daemon_on_the_same_socket_fails() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("indibus.sock");
        let _first = Daemon::bind(&server_config(&socket)).await.unwrap();
        assert!(Daemon::bind(&server_config(&socket)).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_allowed_hosts() {
        let dir = tempdir().unwrap();
        let config = server_config(&dir.path().join("indibus.sock"))
            .with_allowed_hosts(vec!["observatory.local".into()]);
        assert!(Daemon::bind(&config).await.is_err());
    }
}
