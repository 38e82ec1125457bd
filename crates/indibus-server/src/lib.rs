//! Broker: routing core, device backends, TCP and control listeners.
//!
//! The [`Broker`] routes wire protocol messages between clients and device
//! backends. [`BrokerListener`] feeds it TCP clients; [`attach_device`]
//! starts a [`DeviceBackend`] and feeds it the backend's messages. The
//! administrative surface runs on a Unix socket through [`ControlServer`]
//! and [`RequestHandler`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use indibus_server::{Broker, BrokerListener, ServerConfig, SignalHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let broker = Arc::new(Broker::new());
//!     let listener = BrokerListener::bind(&config, broker.clone()).await?;
//!
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener();
//!     listener.run_until_shutdown(signals.shutdown_handle()).await?;
//!     broker.shutdown();
//!     Ok(())
//! }
//! ```

mod backend;
mod broker;
mod config;
mod connection;
mod drivers;
mod error;
mod events;
mod handler;
mod listener;
mod signals;
mod socket;
mod tcp;

pub use backend::{
    DeviceBackend, DeviceLink, Driver, DriverContext, DriverFactory, LocalBackend, NetworkBackend,
    ProcessBackend,
};
pub use broker::{Broker, ClientRegistration, IdentifierClaim};
pub use config::{ServerConfig, default_socket_path};
pub use connection::{attach_device, serve_client};
pub use drivers::DriverRegistry;
pub use error::{ServerError, ServerResult};
pub use events::{
    AcceptPolicy, ConnectionInfo, HostAllowList, LoggingEventHandler, PeerId, ServerEventHandler,
};
pub use handler::{RequestHandler, ServerState, SharedState, make_connection_handler};
pub use listener::{Listener, Outbox};
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
pub use socket::{Connection, ControlServer};
pub use tcp::BrokerListener;
