//! Wire protocol listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::connection::serve_client;
use crate::error::{ServerError, ServerResult};
use crate::events::ConnectionInfo;
use crate::signals::ShutdownHandle;

/// TCP listener accepting protocol clients into a [`Broker`].
pub struct BrokerListener {
    listener: TcpListener,
    broker: Arc<Broker>,
    connection_semaphore: Arc<Semaphore>,
    max_frame_size: usize,
}

impl BrokerListener {
    /// Binds the configured address.
    pub async fn bind(config: &ServerConfig, broker: Arc<Broker>) -> ServerResult<Self> {
        let address = config.listen_addr();
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "Broker listening");

        Ok(Self {
            listener,
            broker,
            connection_semaphore: Arc::new(Semaphore::new(config.max_clients)),
            max_frame_size: config.max_frame_size,
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one socket, waiting for a free client slot first.
    async fn accept(&self) -> ServerResult<(TcpStream, ConnectionInfo, OwnedSemaphorePermit)> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;
        let (stream, peer) = self.listener.accept().await?;
        let local = stream.local_addr()?;
        debug!(%peer, "Accepted TCP connection");
        Ok((stream, ConnectionInfo { peer, local }, permit))
    }

    /// Runs the accept loop until `shutdown` fires.
    ///
    /// Rejected sockets are closed without any protocol exchange. On
    /// shutdown every client is disconnected.
    pub async fn run_until_shutdown(&self, shutdown: ShutdownHandle) -> ServerResult<()> {
        let stop = shutdown.wait();
        let accept_loop = async {
            loop {
                match self.accept().await {
                    Ok((stream, info, permit)) => {
                        let Some(registration) = self.broker.accept_connection(&info) else {
                            drop(stream);
                            continue;
                        };
                        let broker = self.broker.clone();
                        let signal = shutdown.wait();
                        let max_frame_size = self.max_frame_size;
                        tokio::spawn(async move {
                            serve_client(broker, stream, registration, max_frame_size, signal).await;
                            drop(permit);
                        });
                    }
                    Err(ServerError::Shutdown) => break,
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = stop.wait() => info!("Broker listener stopping"),
        }
        self.connection_semaphore.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AcceptPolicy;
    use crate::signals::SignalHandler;
    use indibus_core::Message;
    use indibus_protocol::{FrameReader, FrameWriter};
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig::default()
            .with_listen_address("127.0.0.1".parse().unwrap())
            .with_port(0)
            .with_max_clients(4)
    }

    #[tokio::test]
    async fn accepts_and_registers_clients() {
        let broker = Arc::new(Broker::new());
        let listener = BrokerListener::bind(&config(), broker.clone()).await.unwrap();
        let address = listener.local_addr().unwrap();
        let signals = SignalHandler::new();
        let handle = signals.shutdown_handle();
        let server = tokio::spawn(async move { listener.run_until_shutdown(handle).await });

        let stream = TcpStream::connect(address).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.client_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        signals.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let (read_half, _write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let end = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .unwrap()
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn rejected_clients_are_closed() {
        struct Nobody;
        impl AcceptPolicy for Nobody {
            fn name(&self) -> &str {
                "nobody"
            }
            fn accept(&self, _info: &ConnectionInfo) -> bool {
                false
            }
        }

        let broker = Arc::new(Broker::new().with_accept_policy(Nobody));
        let listener = BrokerListener::bind(&config(), broker.clone()).await.unwrap();
        let address = listener.local_addr().unwrap();
        let signals = SignalHandler::new();
        let handle = signals.shutdown_handle();
        tokio::spawn(async move { listener.run_until_shutdown(handle).await });

        let stream = TcpStream::connect(address).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut writer = FrameWriter::new(write_half);
        // The write may or may not land before the close; only the EOF matters.
        let _ = writer
            .write_message(&Message::GetProperties(indibus_core::GetProperties::all()))
            .await;
        let mut reader = FrameReader::new(read_half);
        let end = tokio::time::timeout(Duration::from_secs(5), reader.read_message()).await.unwrap();
        assert!(matches!(end, Ok(None) | Err(_)));
        assert_eq!(broker.client_count(), 0);
        signals.trigger_shutdown();
    }
}
