//! Device backends.
//!
//! A backend is whatever produces device messages: a driver running inside
//! the broker, a child process speaking the wire protocol on its standard
//! streams, or another broker reached over TCP. The broker only sees the
//! [`DeviceBackend`] contract and the [`DeviceLink`] returned by `start`.

mod local;
mod network;
mod process;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use indibus_core::Message;
use indibus_protocol::{DriverKind, FrameReader, FrameWriter, ProtocolError};

use crate::error::ServerResult;

pub use local::{Driver, DriverContext, DriverFactory, LocalBackend};
pub use network::NetworkBackend;
pub use process::ProcessBackend;

/// I/O channels of a running backend.
pub struct DeviceLink {
    /// Messages emitted by the device. Closing marks the device as gone.
    pub incoming: mpsc::UnboundedReceiver<Message>,
    /// Messages to deliver to the device.
    pub outgoing: mpsc::UnboundedSender<Arc<Message>>,
}

impl DeviceLink {
    /// Creates a link plus the backend-side ends of both channels.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Arc<Message>>,
    ) {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        (Self { incoming, outgoing }, incoming_tx, outgoing_rx)
    }
}

/// Common contract of the three device transports.
pub trait DeviceBackend: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Strings an unload request may use to target this backend.
    fn identifiers(&self) -> Vec<String>;

    /// Starts the backend and returns its channels.
    fn start(&self) -> BoxFuture<'_, ServerResult<DeviceLink>>;

    /// Tears the backend down. The link's incoming channel closes once its
    /// I/O tasks notice.
    fn destroy(&self);
}

/// Decodes frames from `reader` into `incoming` until EOF, a fatal error,
/// or the broker dropping the link.
pub(crate) async fn pump_incoming<R>(
    mut reader: FrameReader<R>,
    incoming: mpsc::UnboundedSender<Message>,
    target: &str,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => {
                if incoming.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(target_name = %target, "Device stream closed");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(target_name = %target, error = %e, "Skipping malformed frame from device");
            }
            Err(e) => {
                warn!(target_name = %target, error = %e, "Device stream failed");
                break;
            }
        }
    }
}

/// Encodes queued messages onto `writer` until the queue closes or a write
/// fails.
pub(crate) async fn pump_outgoing<W>(
    mut writer: FrameWriter<W>,
    mut outgoing: mpsc::UnboundedReceiver<Arc<Message>>,
    target: &str,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        match writer.write_message(&message).await {
            Ok(()) => {}
            Err(ProtocolError::Io(e)) => {
                debug!(target_name = %target, error = %e, "Device write failed");
                break;
            }
            Err(e) => warn!(target_name = %target, error = %e, "Dropping unencodable message"),
        }
    }
}
