//! Unix socket listener for the administrative control protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use indibus_protocol::{
    CONTROL_PROTOCOL_VERSION, ControlRequest, ControlResponse, Envelope, read_control,
    write_control,
};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Control connections served at once; administrative traffic is light.
const MAX_CONTROL_CONNECTIONS: usize = 8;

/// Unix socket server for administrative clients.
pub struct ControlServer {
    socket_path: PathBuf,
    timeout: Duration,
    listener: UnixListener,
    connection_semaphore: Arc<Semaphore>,
}

impl ControlServer {
    /// Binds the control socket.
    ///
    /// A leftover socket file is removed when `cleanup_stale_socket` is set
    /// and nothing answers on it; a live socket means another broker owns
    /// the path.
    pub async fn new(config: &ServerConfig) -> ServerResult<Self> {
        let socket_path = &config.control_socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if socket_path.exists() {
            if !config.cleanup_stale_socket {
                return Err(ServerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ServerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            info!(path = %socket_path.display(), "Removing stale control socket");
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Control socket listening");

        Ok(Self {
            socket_path: socket_path.clone(),
            timeout: config.control_timeout,
            listener,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONTROL_CONNECTIONS)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts a single connection.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;

        let (stream, _addr) = self.listener.accept().await?;
        debug!("Accepted control connection");

        Ok(Connection {
            stream,
            timeout: self.timeout,
            _permit: permit,
        })
    }

    /// Runs the accept loop, spawning `handler` for each connection.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(connection) => {
                    tokio::spawn(handler(connection));
                }
                Err(ServerError::Shutdown) => return Ok(()),
                Err(e) => error!(error = %e, "Failed to accept control connection"),
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
        S: std::future::Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("Control socket stopping");
                Ok(())
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    path = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove control socket"
                );
            } else {
                debug!(path = %self.socket_path.display(), "Removed control socket");
            }
        }
    }
}

/// An administrative client connection.
pub struct Connection {
    stream: UnixStream,
    timeout: Duration,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Connection {
    /// Reads the next request envelope.
    ///
    /// Returns `Ok(None)` if the client closed the connection.
    pub async fn read_request(&mut self) -> ServerResult<Option<Envelope<ControlRequest>>> {
        let envelope: Option<Envelope<ControlRequest>> =
            read_control(&mut self.stream, self.timeout).await?;
        if let Some(envelope) = &envelope
            && !envelope.is_compatible()
        {
            warn!(
                version = %envelope.protocol_version,
                expected = %CONTROL_PROTOCOL_VERSION,
                "Incompatible control protocol version"
            );
        }
        Ok(envelope)
    }

    /// Sends the response to request `request_id`.
    pub async fn respond(
        &mut self,
        request_id: impl Into<String>,
        response: ControlResponse,
    ) -> ServerResult<()> {
        let envelope = Envelope::new(request_id, response);
        write_control(&mut self.stream, &envelope, self.timeout).await?;
        Ok(())
    }
}
