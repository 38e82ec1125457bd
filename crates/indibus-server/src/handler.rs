//! Control request dispatch.

use std::sync::Arc;
use std::{future::Future, pin::Pin};

use tracing::{debug, info, warn};

use indibus_protocol::{ControlRequest, ControlResponse, DriverSpec, StatusInfo};

use crate::broker::Broker;
use crate::connection::attach_device;
use crate::drivers::DriverRegistry;
use crate::error::{ServerError, ServerResult};
use crate::events::PeerId;
use crate::signals::ShutdownHandle;
use crate::socket::Connection;

/// Broker state shared by the control handlers.
pub struct ServerState {
    broker: Arc<Broker>,
    drivers: DriverRegistry,
    shutdown: ShutdownHandle,
    port: u16,
}

impl ServerState {
    pub fn new(broker: Arc<Broker>, drivers: DriverRegistry, shutdown: ShutdownHandle) -> Self {
        Self {
            broker,
            drivers,
            shutdown,
            port: 0,
        }
    }

    /// Records the port the wire listener actually bound.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn status_info(&self) -> StatusInfo {
        StatusInfo {
            uptime_seconds: self.broker.uptime_seconds(),
            started_at: self.broker.started_at(),
            port: self.port,
            clients: self.broker.client_count(),
            backends: self.broker.backend_count(),
            devices: self.broker.device_count(),
        }
    }

    /// Builds, starts and registers the backend described by `spec`.
    ///
    /// # Errors
    ///
    /// `AlreadyLoaded` if a running backend shares an identifier, otherwise
    /// whatever building or starting the backend reports.
    pub async fn load_driver(&self, spec: &DriverSpec) -> ServerResult<PeerId> {
        if self.shutdown.is_shutdown() {
            return Err(ServerError::Shutdown);
        }
        let backend = self.drivers.backend(spec)?;
        let _claim = self.broker.claim_identifiers(&backend.identifiers())?;
        let id = attach_device(self.broker.clone(), backend).await?;
        info!(driver = %spec, peer = id, "Driver loaded");
        Ok(id)
    }

    /// Destroys every backend matching `identifier`.
    ///
    /// # Errors
    ///
    /// `UnknownDriver` when nothing matches.
    pub fn unload_driver(&self, identifier: &str) -> ServerResult<usize> {
        match self.broker.unload_by_identifier(identifier) {
            0 => Err(ServerError::unknown_driver(identifier)),
            n => Ok(n),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_shutdown()
    }
}

pub type SharedState = Arc<ServerState>;

/// Handles control requests against a [`SharedState`].
#[derive(Clone)]
pub struct RequestHandler {
    state: SharedState,
}

impl RequestHandler {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handles a single request.
    #[tracing::instrument(skip(self))]
    pub async fn handle(&self, request: &ControlRequest) -> ControlResponse {
        let start = std::time::Instant::now();

        let response = match request {
            ControlRequest::Ping => ControlResponse::Pong,
            ControlRequest::Status => ControlResponse::Status {
                info: self.state.status_info(),
            },
            ControlRequest::ListDevices => ControlResponse::Devices {
                devices: self.state.broker().device_infos(),
            },
            ControlRequest::LoadDriver { spec } => match self.state.load_driver(spec).await {
                Ok(_) => ControlResponse::Ok,
                Err(e) => {
                    warn!(driver = %spec, error = %e, "Driver load failed");
                    ControlResponse::error(e.code(), e.to_string())
                }
            },
            ControlRequest::UnloadDriver { identifier } => {
                match self.state.unload_driver(identifier) {
                    Ok(count) => {
                        info!(identifier = %identifier, count, "Driver unloaded");
                        ControlResponse::Ok
                    }
                    Err(e) => ControlResponse::error(e.code(), e.to_string()),
                }
            }
            ControlRequest::Shutdown => {
                info!("Shutdown requested over the control socket");
                self.state.request_shutdown();
                ControlResponse::Ok
            }
        };

        debug!(
            request = ?request,
            duration_ms = start.elapsed().as_millis(),
            "Control request handled"
        );
        response
    }

    /// Serves requests until the client disconnects or asks for shutdown.
    pub async fn handle_connection(&self, mut conn: Connection) -> ServerResult<()> {
        loop {
            match conn.read_request().await {
                Ok(Some(envelope)) => {
                    let response = self.handle(&envelope.payload).await;
                    conn.respond(&envelope.request_id, response).await?;

                    if self.state.shutdown_requested() {
                        return Err(ServerError::Shutdown);
                    }
                }
                Ok(None) => {
                    debug!("Control client disconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Error reading control request");
                    return Err(e);
                }
            }
        }
    }
}

/// Creates the per-connection closure for
/// [`ControlServer::run_until_shutdown`](crate::ControlServer::run_until_shutdown).
pub fn make_connection_handler(
    state: SharedState,
) -> impl Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
    move |conn| {
        let handler = RequestHandler::new(state.clone());
        Box::pin(async move {
            if let Err(e) = handler.handle_connection(conn).await
                && !matches!(e, ServerError::Shutdown)
            {
                warn!(error = %e, "Control connection error");
            }
        })
    }
}
