//! Remote brokers chained over TCP.

use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::info;

use indibus_protocol::{
    DEFAULT_PORT, DriverKind, FrameReader, FrameWriter, MAX_FRAME_SIZE, StreamDecoder,
};

use super::{DeviceBackend, DeviceLink, pump_incoming, pump_outgoing};
use crate::error::{ServerError, ServerResult};

/// Backend relaying the devices of another broker.
pub struct NetworkBackend {
    host: String,
    port: u16,
    max_frame_size: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl NetworkBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_frame_size: MAX_FRAME_SIZE,
            shutdown: Mutex::new(None),
        }
    }

    /// Parses `host:port`; the port defaults to the protocol port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty host or a bad port.
    pub fn parse(address: &str) -> ServerResult<Self> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ServerError::config(format!("invalid port in {address:?}")))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };
        if host.trim().is_empty() {
            return Err(ServerError::config(format!("missing host in {address:?}")));
        }
        Ok(Self::new(host.trim(), port))
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DeviceBackend for NetworkBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Network
    }

    fn identifiers(&self) -> Vec<String> {
        vec![self.address()]
    }

    fn start(&self) -> BoxFuture<'_, ServerResult<DeviceLink>> {
        Box::pin(async move {
            let address = self.address();
            let stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| ServerError::device_start(&address, e))?;
            let _ = stream.set_nodelay(true);
            info!(address = %address, "Connected to remote broker");

            let (stop_tx, mut stop_rx) = watch::channel(false);
            match self.shutdown.lock() {
                Ok(mut slot) => *slot = Some(stop_tx),
                Err(_) => return Err(ServerError::device_start(&address, "backend state poisoned")),
            }

            let (read_half, write_half) = stream.into_split();
            let (link, incoming_tx, outgoing_rx) = DeviceLink::pair();
            let reader = FrameReader::with_decoder(
                read_half,
                StreamDecoder::with_max_frame_size(self.max_frame_size),
            );

            // Closing either task drops its half; destroy stops the reader,
            // which closes the incoming channel and triggers deregistration.
            let target = address.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = pump_incoming(reader, incoming_tx, &target) => {}
                    _ = stop_rx.changed() => info!(address = %target, "Remote broker link closed"),
                }
            });
            tokio::spawn(async move {
                pump_outgoing(FrameWriter::new(write_half), outgoing_rx, &address).await
            });

            Ok(link)
        })
    }

    fn destroy(&self) {
        if let Ok(mut slot) = self.shutdown.lock()
            && let Some(tx) = slot.take()
        {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indibus_core::{DelProperty, GetProperties, Message};
    use tokio::net::TcpListener;

    #[test]
    fn parses_addresses() {
        let backend = NetworkBackend::parse("observatory:7625").unwrap();
        assert_eq!(backend.identifiers(), vec!["observatory:7625".to_string()]);
        assert_eq!(
            NetworkBackend::parse("observatory").unwrap().address(),
            "observatory:7624"
        );
        assert!(NetworkBackend::parse(":7624").is_err());
        assert!(NetworkBackend::parse("host:port").is_err());
    }

    #[tokio::test]
    async fn relays_frames_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = NetworkBackend::new("127.0.0.1", port);
        let mut link = backend.start().await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut remote_reader = FrameReader::new(read_half);
        let mut remote_writer = FrameWriter::new(write_half);

        link.outgoing
            .send(std::sync::Arc::new(Message::GetProperties(GetProperties::all())))
            .unwrap();
        assert!(matches!(
            remote_reader.read_message().await.unwrap(),
            Some(Message::GetProperties(_))
        ));

        remote_writer
            .write_message(&Message::Delete(DelProperty::device("Remote")))
            .await
            .unwrap();
        assert!(matches!(
            link.incoming.recv().await,
            Some(Message::Delete(d)) if d.device == "Remote"
        ));

        backend.destroy();
        assert!(link.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_remote_fails_to_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let backend = NetworkBackend::new("127.0.0.1", port);
        assert!(matches!(
            backend.start().await,
            Err(ServerError::DeviceStart { .. })
        ));
    }
}
