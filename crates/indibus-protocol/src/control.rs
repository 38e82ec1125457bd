//! Administrative control protocol.
//!
//! The broker exposes a local control socket for `indibus status`,
//! `indibus load` and friends. Messages are length-prefixed JSON:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON payload    |
//! +----------------+------------------+
//! ```
//!
//! Every payload is wrapped in an [`Envelope`] carrying the control protocol
//! version and a request id used to correlate responses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Control protocol version.
pub const CONTROL_PROTOCOL_VERSION: &str = "1";

/// Maximum control message size (1 MB).
pub const MAX_CONTROL_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Message envelope for control requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub protocol_version: String,
    pub request_id: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            protocol_version: CONTROL_PROTOCOL_VERSION.to_string(),
            request_id: request_id.into(),
            payload,
        }
    }

    /// Checks if this envelope uses a compatible protocol version.
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == CONTROL_PROTOCOL_VERSION
    }
}

/// Requests sent by the administrative client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Ping,
    /// Broker uptime and connection counts.
    Status,
    /// Loaded backends and the device names learned from them.
    ListDevices,
    LoadDriver {
        #[serde(flatten)]
        spec: DriverSpec,
    },
    /// Destroys every backend matching the identifier.
    UnloadDriver { identifier: String },
    Shutdown,
}

/// Backend kinds that can be loaded at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// A driver compiled into the broker, looked up by id.
    Builtin,
    /// An executable speaking the wire protocol on stdin/stdout.
    Process,
    /// Another broker reached at `host:port`.
    Network,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Process => "process",
            Self::Network => "network",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "builtin" => Ok(Self::Builtin),
            "process" => Ok(Self::Process),
            "network" => Ok(Self::Network),
            other => Err(format!(
                "unknown driver kind {other:?} (expected builtin, process or network)"
            )),
        }
    }
}

/// What to load: a backend kind and its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverSpec {
    pub kind: DriverKind,
    /// Driver id, executable path, or `host:port`.
    pub target: String,
}

impl DriverSpec {
    pub fn builtin(id: impl Into<String>) -> Self {
        Self {
            kind: DriverKind::Builtin,
            target: id.into(),
        }
    }

    pub fn process(path: impl Into<String>) -> Self {
        Self {
            kind: DriverKind::Process,
            target: path.into(),
        }
    }

    pub fn network(address: impl Into<String>) -> Self {
        Self {
            kind: DriverKind::Network,
            target: address.into(),
        }
    }
}

impl std::fmt::Display for DriverSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

/// Responses sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Pong,
    Ok,
    Status {
        #[serde(flatten)]
        info: StatusInfo,
    },
    Devices {
        devices: Vec<DeviceInfo>,
    },
    Error {
        #[serde(flatten)]
        error: ErrorResponse,
    },
}

impl ControlResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorResponse {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }

    pub fn as_error(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Broker status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
    /// Wire protocol listening port.
    pub port: u16,
    pub clients: usize,
    pub backends: usize,
    /// Device names learned so far.
    pub devices: usize,
}

/// One loaded backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Broker-assigned peer id.
    pub id: u64,
    pub kind: DriverKind,
    pub identifiers: Vec<String>,
    /// Device names announced by the backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
}

/// Error codes for control errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InternalError,
    InvalidRequest,
    /// No driver registered under the requested id.
    UnknownDriver,
    /// A backend with the same identifier is already running.
    AlreadyLoaded,
    /// The backend could not be started.
    DriverFailed,
    NotFound,
    ShuttingDown,
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::InternalError => "An internal error occurred",
            Self::InvalidRequest => "The request was invalid",
            Self::UnknownDriver => "No such driver",
            Self::AlreadyLoaded => "Driver is already loaded",
            Self::DriverFailed => "Driver failed to start",
            Self::NotFound => "Requested resource not found",
            Self::ShuttingDown => "Broker is shutting down",
        }
    }
}

/// Error details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Encodes a control message with its length prefix.
pub fn encode_control<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let len = u32::try_from(json.len()).unwrap_or(u32::MAX);
    if len > MAX_CONTROL_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_CONTROL_MESSAGE_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(4 + json.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes one complete length-prefixed control message.
pub fn decode_control<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    let Some((prefix, rest)) = data.split_first_chunk::<4>() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4,
            received: data.len(),
        });
    };
    let len = checked_len(u32::from_be_bytes(*prefix))?;
    if rest.len() < len {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4 + len,
            received: data.len(),
        });
    }
    Ok(serde_json::from_slice(&rest[..len])?)
}

fn checked_len(len: u32) -> ProtocolResult<usize> {
    if len > MAX_CONTROL_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_CONTROL_MESSAGE_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(len as usize)
}

/// Reads one control message, giving up after `timeout`.
///
/// Returns `Ok(None)` if the peer closed the stream before a new message.
pub async fn read_control<R, T>(reader: &mut R, timeout: Duration) -> ProtocolResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match tokio::time::timeout(timeout, reader.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ProtocolError::timeout("read control message length")),
    }

    let len = checked_len(u32::from_be_bytes(len_buf))?;
    let mut payload = vec![0u8; len];
    match tokio::time::timeout(timeout, reader.read_exact(&mut payload)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ProtocolError::timeout("read control message payload")),
    }
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Writes one control message, giving up after `timeout`.
pub async fn write_control<W, T>(writer: &mut W, message: &T, timeout: Duration) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buffer = encode_control(message)?;
    let write = async {
        writer.write_all(&buffer).await?;
        writer.flush().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::timeout("write control message")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_shape() {
        let request = ControlRequest::LoadDriver {
            spec: DriverSpec::process("/usr/bin/indi_simulator_ccd"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "load_driver");
        assert_eq!(json["kind"], "process");
        assert_eq!(json["target"], "/usr/bin/indi_simulator_ccd");

        let unload: ControlRequest =
            serde_json::from_str(r#"{"type":"unload_driver","identifier":"localhost:7625"}"#)
                .unwrap();
        assert_eq!(
            unload,
            ControlRequest::UnloadDriver {
                identifier: "localhost:7625".into()
            }
        );
    }

    #[test]
    fn error_response_is_flattened() {
        let response = ControlResponse::error(ErrorCode::AlreadyLoaded, "demo");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "already_loaded");
        assert_eq!(json["message"], "demo");
        assert!(!response.is_success());
        assert_eq!(
            response.as_error().unwrap().to_string(),
            "Driver is already loaded: demo"
        );
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new("req-1", ControlRequest::Status);
        let bytes = encode_control(&envelope).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);

        let decoded: Envelope<ControlRequest> = decode_control(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.is_compatible());
    }

    #[test]
    fn decode_rejects_short_and_oversized_input() {
        let short: ProtocolResult<Envelope<ControlRequest>> = decode_control(&[0, 0]);
        assert!(matches!(
            short,
            Err(ProtocolError::IncompleteMessage { expected: 4, .. })
        ));

        let huge = (MAX_CONTROL_MESSAGE_SIZE + 1).to_be_bytes();
        let result: ProtocolResult<Envelope<ControlRequest>> = decode_control(&huge);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));

        let mut truncated = vec![0, 0, 0, 100];
        truncated.extend_from_slice(&[b' '; 10]);
        let result: ProtocolResult<Envelope<ControlRequest>> = decode_control(&truncated);
        assert!(matches!(result, Err(ProtocolError::IncompleteMessage { .. })));
    }

    #[test]
    fn driver_kind_parsing() {
        assert_eq!("Network".parse::<DriverKind>().unwrap(), DriverKind::Network);
        assert!("jar".parse::<DriverKind>().is_err());
        assert_eq!(DriverSpec::builtin("demo").to_string(), "builtin:demo");
    }

    #[tokio::test]
    async fn async_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let timeout = Duration::from_secs(1);

        let envelope = Envelope::new("req-9", ControlRequest::ListDevices);
        write_control(&mut client, &envelope, timeout).await.unwrap();
        let received: Envelope<ControlRequest> =
            read_control(&mut server, timeout).await.unwrap().unwrap();
        assert_eq!(received, envelope);

        drop(client);
        let eof: Option<Envelope<ControlRequest>> = read_control(&mut server, timeout).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let result: ProtocolResult<Option<Envelope<ControlRequest>>> =
            read_control(&mut server, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout { .. })));
    }
}
