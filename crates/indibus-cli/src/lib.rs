//! CLI, control socket client, property watcher and the demo driver.
//!
//! This crate provides the `indibus` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;
pub mod socket;

pub use cli::Cli;
pub use error::{ClientError, ClientResult};
pub use socket::ControlClient;
