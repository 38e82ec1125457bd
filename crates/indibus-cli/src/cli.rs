//! Command-line interface definition.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use indibus_protocol::{DEFAULT_PORT, DriverKind, DriverSpec};

/// indibus - INDI message broker
#[derive(Debug, Parser)]
#[command(name = "indibus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "INDIBUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Path to the broker control socket
    #[arg(long, env = "INDIBUS_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Control request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker in the foreground
    Serve {
        /// Address to listen on
        #[arg(long)]
        listen: Option<IpAddr>,

        /// Port to listen on
        #[arg(long, short)]
        port: Option<u16>,

        /// Driver to load at startup as kind:target (can be repeated)
        #[arg(long = "driver", short = 'd', value_parser = parse_driver_spec)]
        drivers: Vec<DriverSpec>,
    },

    /// Show broker status
    Status,

    /// List loaded drivers and the devices they announced
    Devices,

    /// Load a driver into the running broker
    Load {
        /// builtin, process or network
        kind: DriverKind,

        /// Built-in id, executable path (with arguments) or host:port
        target: String,
    },

    /// Unload every driver matching an identifier
    Unload {
        /// Identifier as shown by `indibus devices`
        identifier: String,
    },

    /// Stop the running broker
    Stop,

    /// Print property updates from a broker
    Watch {
        #[command(flatten)]
        remote: Remote,

        /// Only watch this device
        #[arg(long)]
        device: Option<String>,

        /// Only watch this property (requires --device)
        #[arg(long, requires = "device")]
        property: Option<String>,

        /// Also receive BLOB payloads
        #[arg(long)]
        blobs: bool,
    },

    /// Change a property: Device.PROPERTY.ELEMENT=value (can be repeated)
    Set {
        #[command(flatten)]
        remote: Remote,

        /// Assignments; all must target the same property
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<Assignment>,

        /// Seconds to wait for the property definition
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump the current configuration
    Dump,
    /// Validate the configuration
    Validate,
    /// Show the configuration file path
    Path,
}

/// Broker address for the wire protocol commands.
#[derive(Debug, Clone, clap::Args)]
pub struct Remote {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Broker port
    #[arg(long, short, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

/// One `Device.PROPERTY.ELEMENT=value` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub device: String,
    pub property: String,
    pub element: String,
    pub value: String,
}

/// Parses `kind:target`, e.g. `builtin:demo_camera` or
/// `network:observatory:7624`.
pub fn parse_driver_spec(s: &str) -> Result<DriverSpec, String> {
    let (kind, target) = s
        .split_once(':')
        .ok_or_else(|| format!("expected kind:target, got {s:?}"))?;
    let kind: DriverKind = kind.parse()?;
    if target.trim().is_empty() {
        return Err(format!("missing {kind} driver target"));
    }
    Ok(DriverSpec {
        kind,
        target: target.to_string(),
    })
}

/// Parses `Device.PROPERTY.ELEMENT=value`.
///
/// Device names may contain dots; the last two dot-separated parts before
/// `=` are the property and the element.
pub fn parse_assignment(s: &str) -> Result<Assignment, String> {
    let (path, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected Device.PROPERTY.ELEMENT=value, got {s:?}"))?;
    let mut parts = path.rsplitn(3, '.');
    let (Some(element), Some(property), Some(device)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected Device.PROPERTY.ELEMENT=value, got {s:?}"));
    };
    if [device, property, element].iter().any(|p| p.is_empty()) {
        return Err(format!("empty name in {path:?}"));
    }
    Ok(Assignment {
        device: device.to_string(),
        property: property.to_string(),
        element: element.to_string(),
        value: value.to_string(),
    })
}
