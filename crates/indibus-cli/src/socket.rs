//! Unix socket client for the broker's control socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{debug, warn};
use uuid::Uuid;

use indibus_protocol::{ControlRequest, ControlResponse, Envelope, read_control, write_control};

use crate::error::{ClientError, ClientResult};

/// Client for administrative requests over the control socket.
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Creates a client for the default socket path.
    pub fn with_defaults() -> Self {
        Self::new(indibus_server::default_socket_path(), Duration::from_secs(5))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Sends a request and waits for its response.
    pub async fn send(&self, request: ControlRequest) -> ClientResult<ControlResponse> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(&request_id, request);

        debug!(
            socket = %self.socket_path.display(),
            request_id = %request_id,
            "connecting to broker"
        );

        let mut stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "connection timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                ClientError::Connection(format!(
                    "failed to connect to {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;

        write_control(&mut stream, &envelope, self.timeout).await?;
        let response: Envelope<ControlResponse> = read_control(&mut stream, self.timeout)
            .await?
            .ok_or_else(|| ClientError::Connection("broker closed the connection".into()))?;

        if response.request_id != request_id {
            warn!(
                expected = %request_id,
                received = %response.request_id,
                "response request_id mismatch"
            );
        }
        if !response.is_compatible() {
            warn!(version = %response.protocol_version, "broker speaks another control protocol version");
        }

        Ok(response.payload)
    }

    /// Sends a request and turns an error response into [`ClientError::Broker`].
    pub async fn request(&self, request: ControlRequest) -> ClientResult<ControlResponse> {
        match self.send(request).await? {
            ControlResponse::Error { error } => Err(ClientError::Broker(error.to_string())),
            response => Ok(response),
        }
    }

    /// Checks whether a broker answers on the socket.
    pub async fn ping(&self) -> bool {
        matches!(self.send(ControlRequest::Ping).await, Ok(ControlResponse::Pong))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indibus_protocol::ErrorCode;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    #[test]
    fn client_creation() {
        let client = ControlClient::new("/tmp/test.sock", Duration::from_secs(10));
        assert_eq!(client.socket_path(), Path::new("/tmp/test.sock"));
        assert!(!client.socket_exists());
    }

    #[test]
    fn default_client() {
        let client = ControlClient::with_defaults();
        assert!(client.socket_path().to_string_lossy().contains("indibus"));
    }

    #[tokio::test]
    async fn missing_socket_is_a_connection_error() {
        let dir = tempdir().unwrap();
        let client = ControlClient::new(dir.path().join("none.sock"), Duration::from_secs(1));
        assert!(!client.ping().await);
        assert!(matches!(
            client.send(ControlRequest::Status).await,
            Err(ClientError::Connection(_))
        ));
    }

    /// Answers one request with `response`, echoing its id.
    fn serve_once(listener: UnixListener, response: ControlResponse) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: Envelope<ControlRequest> =
                read_control(&mut stream, Duration::from_secs(5))
                    .await
                    .unwrap()
                    .unwrap();
            let reply = Envelope::new(request.request_id, response);
            write_control(&mut stream, &reply, Duration::from_secs(5))
                .await
                .unwrap();
        })
    }

    #[tokio::test]
    async fn exchanges_with_a_broker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("indibus.sock");
        let server = serve_once(UnixListener::bind(&path).unwrap(), ControlResponse::Pong);

        let client = ControlClient::new(&path, Duration::from_secs(5));
        assert!(client.ping().await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_responses_become_broker_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("indibus.sock");
        let server = serve_once(
            UnixListener::bind(&path).unwrap(),
            ControlResponse::error(ErrorCode::UnknownDriver, "focuser"),
        );

        let client = ControlClient::new(&path, Duration::from_secs(5));
        let result = client
            .request(ControlRequest::UnloadDriver {
                identifier: "focuser".into(),
            })
            .await;
        match result {
            Err(ClientError::Broker(message)) => assert!(message.contains("focuser")),
            other => panic!("unexpected result: {other:?}"),
        }
        server.await.unwrap();
    }
}
