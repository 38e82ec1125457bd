//! Administrative commands against a running broker.

use std::fmt::Write as _;

use chrono::Local;

use indibus_protocol::{ControlRequest, ControlResponse, DeviceInfo, DriverSpec, StatusInfo};

use crate::error::{ClientError, ClientResult};
use crate::socket::ControlClient;

pub async fn status(client: &ControlClient) -> ClientResult<()> {
    match client.request(ControlRequest::Status).await? {
        ControlResponse::Status { info } => {
            print!("{}", format_status(&info));
            Ok(())
        }
        other => Err(unexpected(&other)),
    }
}

pub async fn devices(client: &ControlClient) -> ClientResult<()> {
    match client.request(ControlRequest::ListDevices).await? {
        ControlResponse::Devices { devices } => {
            print!("{}", format_devices(&devices));
            Ok(())
        }
        other => Err(unexpected(&other)),
    }
}

pub async fn load(client: &ControlClient, spec: DriverSpec) -> ClientResult<()> {
    let label = spec.to_string();
    client.request(ControlRequest::LoadDriver { spec }).await?;
    println!("loaded {}", label);
    Ok(())
}

pub async fn unload(client: &ControlClient, identifier: String) -> ClientResult<()> {
    client
        .request(ControlRequest::UnloadDriver {
            identifier: identifier.clone(),
        })
        .await?;
    println!("unloaded {}", identifier);
    Ok(())
}

pub async fn stop(client: &ControlClient) -> ClientResult<()> {
    client.request(ControlRequest::Shutdown).await?;
    println!("broker stopping");
    Ok(())
}

fn unexpected(response: &ControlResponse) -> ClientError {
    ClientError::Protocol(format!("unexpected response: {:?}", response))
}

/// Renders broker status for the terminal.
pub fn format_status(info: &StatusInfo) -> String {
    let mut out = String::new();
    let started = info.started_at.with_timezone(&Local);
    let _ = writeln!(out, "port:     {}", info.port);
    let _ = writeln!(
        out,
        "uptime:   {} (since {})",
        format_uptime(info.uptime_seconds),
        started.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "clients:  {}", info.clients);
    let _ = writeln!(out, "drivers:  {}", info.backends);
    let _ = writeln!(out, "devices:  {}", info.devices);
    out
}

/// Renders the driver list, one driver per line followed by its devices.
pub fn format_devices(devices: &[DeviceInfo]) -> String {
    if devices.is_empty() {
        return "no drivers loaded\n".to_string();
    }
    let mut out = String::new();
    for device in devices {
        let _ = writeln!(
            out,
            "[{}] {} {}",
            device.id,
            device.kind,
            device.identifiers.join(", ")
        );
        for name in &device.devices {
            let _ = writeln!(out, "    {}", name);
        }
    }
    out
}

fn format_uptime(seconds: u64) -> String {
    let (hours, rest) = (seconds / 3600, seconds % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indibus_protocol::DriverKind;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(125), "2m05s");
        assert_eq!(format_uptime(3 * 3600 + 61), "3h01m01s");
    }

    #[test]
    fn status_lists_counts() {
        let info = StatusInfo {
            uptime_seconds: 90,
            started_at: Utc::now(),
            port: 7624,
            clients: 2,
            backends: 1,
            devices: 3,
        };
        let text = format_status(&info);
        assert!(text.contains("port:     7624"));
        assert!(text.contains("1m30s"));
        assert!(text.contains("clients:  2"));
        assert!(text.contains("devices:  3"));
    }

    #[test]
    fn device_listing() {
        assert_eq!(format_devices(&[]), "no drivers loaded\n");

        let listing = format_devices(&[DeviceInfo {
            id: 4,
            kind: DriverKind::Builtin,
            identifiers: vec!["class+-+demo_camera".into(), "demo_camera".into()],
            devices: vec!["Demo Camera".into()],
        }]);
        assert_eq!(
            listing,
            "[4] builtin class+-+demo_camera, demo_camera\n    Demo Camera\n"
        );
    }
}
