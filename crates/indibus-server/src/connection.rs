//! Connection I/O layer.
//!
//! Every peer gets one reader loop feeding [`Broker::route`] and one writer
//! task draining its outbox. Whichever loop ends first, the peer is
//! deregistered exactly once.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use indibus_core::Message;
use indibus_protocol::{FrameReader, FrameWriter, StreamDecoder};

use crate::backend::DeviceBackend;
use crate::broker::{Broker, ClientRegistration};
use crate::error::{ServerError, ServerResult};
use crate::events::PeerId;
use crate::signals::ShutdownSignal;

/// Serves one accepted client until it disconnects, fails, or the broker
/// shuts down.
pub async fn serve_client(
    broker: Arc<Broker>,
    stream: TcpStream,
    registration: ClientRegistration,
    max_frame_size: usize,
    shutdown: ShutdownSignal,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = registration.id, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let reader = FrameReader::with_decoder(read_half, StreamDecoder::with_max_frame_size(max_frame_size));
    let ClientRegistration { id, outbox } = registration;

    let writer = tokio::spawn(write_loop(FrameWriter::new(write_half), outbox, id));

    tokio::select! {
        _ = read_loop(&broker, reader, id) => {}
        _ = shutdown.wait() => debug!(peer = id, "Closing client for shutdown"),
    }

    broker.deregister(id);
    // Deregistration drops the outbox sender; the writer flushes what was
    // queued and exits.
    if let Err(e) = writer.await {
        warn!(peer = id, error = %e, "Client writer task failed");
    }
}

/// Reads frames from `reader` and routes them until EOF or a fatal error.
async fn read_loop<R>(broker: &Broker, mut reader: FrameReader<R>, peer: PeerId)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => broker.route(peer, message),
            Ok(None) => {
                debug!(peer, "Peer closed the stream");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(peer, error = %e, "Skipping malformed frame");
            }
            Err(e) => {
                info!(peer, error = %e, "Connection failed");
                break;
            }
        }
    }
}

/// Writes queued messages in order until the queue closes or the socket
/// fails.
async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbox: mpsc::UnboundedReceiver<Arc<Message>>,
    peer: PeerId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox.recv().await {
        if let Err(e) = writer.write_message(&message).await {
            if e.is_recoverable() {
                warn!(peer, error = %e, "Dropping unencodable message");
                continue;
            }
            debug!(peer, error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Starts `backend`, registers it and spawns the loop routing what it emits.
///
/// # Errors
///
/// Returns the start error of the backend; nothing is registered then.
pub async fn attach_device(broker: Arc<Broker>, backend: Arc<dyn DeviceBackend>) -> ServerResult<PeerId> {
    let mut link = backend.start().await?;
    let Some(id) = broker.register_device(backend.clone(), link.outgoing.clone()) else {
        backend.destroy();
        return Err(ServerError::Shutdown);
    };
    drop(link.outgoing);

    tokio::spawn(async move {
        while let Some(message) = link.incoming.recv().await {
            broker.route(id, message);
        }
        broker.deregister(id);
    });
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalHandler;
    use indibus_core::GetProperties;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpStream::connect(address).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn info_for(stream: &TcpStream) -> crate::events::ConnectionInfo {
        crate::events::ConnectionInfo {
            peer: stream.peer_addr().unwrap(),
            local: stream.local_addr().unwrap(),
        }
    }

    #[tokio::test]
    async fn malformed_frames_do_not_drop_the_client() {
        use crate::backend::{Driver, DriverContext, LocalBackend};

        struct Quiet;
        impl Driver for Quiet {
            fn handle(&mut self, _message: &Message, _ctx: &DriverContext) {}
        }

        let broker = Arc::new(Broker::new());
        let backend = Arc::new(LocalBackend::new(
            "quiet",
            Arc::new(|| Box::new(Quiet) as Box<dyn Driver>),
        ));
        let (device_tx, mut device_rx) = mpsc::unbounded_channel();
        broker.register_device(backend, device_tx).unwrap();
        assert!(matches!(
            device_rx.recv().await.as_deref(),
            Some(Message::GetProperties(_))
        ));

        let (mut client, server) = pair().await;
        let registration = broker.accept_connection(&info_for(&server)).unwrap();
        let id = registration.id;
        let signals = SignalHandler::new();
        let task = tokio::spawn(serve_client(
            broker.clone(),
            server,
            registration,
            1024,
            signals.shutdown(),
        ));

        client
            .write_all(
                b"<getProperties version='1.7' device='Mount'/>\
                  <enableBLOB>Sometimes</enableBLOB>\
                  <getProperties version='1.7' device='Camera'/>",
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(5), device_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Message::GetProperties(GetProperties { device, .. }) = message.as_ref() {
                seen.push(device.clone().unwrap_or_default());
            }
        }
        assert_eq!(seen, vec!["Mount".to_string(), "Camera".to_string()]);

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(broker.client_count(), 0);
        // Deregistering again is a no-op.
        broker.deregister(id);
    }

    #[tokio::test]
    async fn shutdown_closes_the_client() {
        let broker = Arc::new(Broker::new());
        let (mut client, server) = pair().await;
        let registration = broker.accept_connection(&info_for(&server)).unwrap();
        let signals = SignalHandler::new();
        let task = tokio::spawn(serve_client(
            broker.clone(),
            server,
            registration,
            1024,
            signals.shutdown(),
        ));

        signals.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(broker.client_count(), 0);

        let mut buf = [0u8; 16];
        let read = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn attached_device_deregisters_when_destroyed() {
        use crate::backend::{Driver, DriverContext, LocalBackend};

        struct Quiet;
        impl Driver for Quiet {
            fn handle(&mut self, _message: &Message, _ctx: &DriverContext) {}
        }

        let broker = Arc::new(Broker::new());
        let backend: Arc<dyn DeviceBackend> = Arc::new(LocalBackend::new(
            "quiet",
            Arc::new(|| Box::new(Quiet) as Box<dyn Driver>),
        ));
        attach_device(broker.clone(), backend).await.unwrap();
        assert!(broker.is_loaded("quiet"));

        assert_eq!(broker.unload_by_identifier("class+-+quiet"), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.backend_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!broker.is_loaded("quiet"));
    }
}
