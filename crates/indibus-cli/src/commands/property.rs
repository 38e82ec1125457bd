//! Wire protocol commands: watching and changing device properties.
//!
//! Both connect to a broker as an ordinary client, so they work against
//! any INDI server, not only indibus.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use indibus_core::{
    BlobEnable, EnableBlob, GetProperties, Message, NewVector, OneElement, Property,
    PropertyState,
};
use indibus_protocol::{FrameReader, FrameWriter};

use crate::cli::{Assignment, Remote};
use crate::error::{ClientError, ClientResult};

/// Local copy of the properties seen on a connection.
#[derive(Debug, Default)]
pub struct PropertyMirror {
    properties: BTreeMap<(String, String), Property>,
}

impl PropertyMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &str, name: &str) -> Option<&Property> {
        self.properties.get(&(device.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Applies one message and returns the lines worth printing.
    pub fn apply(&mut self, message: &Message) -> Vec<String> {
        match message {
            Message::Define(def) => match Property::from_def(def) {
                Ok(property) => {
                    let line = format!("def {}", render_property(&property, None));
                    self.properties
                        .insert((def.device.clone(), def.name.clone()), property);
                    vec![line]
                }
                Err(e) => {
                    debug!(device = %def.device, property = %def.name, error = %e, "Ignoring bad definition");
                    Vec::new()
                }
            },
            Message::Set(update) => {
                let key = (update.device.clone(), update.name.clone());
                let Some(property) = self.properties.get_mut(&key) else {
                    debug!(device = %update.device, property = %update.name, "Update for unknown property");
                    return Vec::new();
                };
                match property.apply_set(update) {
                    Ok(changed) => {
                        let mut lines = vec![format!("set {}", render_property(property, Some(&changed)))];
                        if let Some(text) = &update.message {
                            lines.push(format!("    {}", text));
                        }
                        lines
                    }
                    Err(e) => {
                        debug!(device = %update.device, property = %update.name, error = %e, "Ignoring bad update");
                        Vec::new()
                    }
                }
            }
            Message::Delete(del) => {
                match &del.name {
                    Some(name) => {
                        self.properties.remove(&(del.device.clone(), name.clone()));
                    }
                    None => self.properties.retain(|(device, _), _| *device != del.device),
                }
                let target = match &del.name {
                    Some(name) => format!("{}.{}", del.device, name),
                    None => del.device.clone(),
                };
                vec![format!("del {}", target)]
            }
            Message::Notify(note) => {
                let stamp = note.timestamp.as_deref().unwrap_or("-");
                let line = match &note.device {
                    Some(device) => format!("msg {} {}: {}", stamp, device, note.message),
                    None => format!("msg {} {}", stamp, note.message),
                };
                vec![line]
            }
            _ => Vec::new(),
        }
    }
}

/// One-line rendering: `Device.NAME [State] EL=value ...`.
///
/// With `only`, just the listed elements are shown.
pub fn render_property(property: &Property, only: Option<&[String]>) -> String {
    let values: Vec<String> = property
        .elements()
        .iter()
        .filter(|e| only.is_none_or(|names| names.iter().any(|n| n == e.name())))
        .map(|e| format!("{}={}", e.name(), e.display_value()))
        .collect();
    let mut line = format!(
        "{}.{} [{}]",
        property.device(),
        property.name(),
        property.state().as_str()
    );
    if !values.is_empty() {
        line.push(' ');
        line.push_str(&values.join(" "));
    }
    line
}

async fn connect(remote: &Remote) -> ClientResult<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    let address = format!("{}:{}", remote.host, remote.port);
    let stream = TcpStream::connect(&address)
        .await
        .map_err(|e| ClientError::Connection(format!("failed to connect to {}: {}", address, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(address = %address, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    Ok((FrameReader::new(read_half), FrameWriter::new(write_half)))
}

/// Prints definitions and updates until the broker closes or Ctrl+C.
pub async fn watch(
    remote: &Remote,
    device: Option<String>,
    property: Option<String>,
    blobs: bool,
) -> ClientResult<()> {
    let (mut reader, mut writer) = connect(remote).await?;

    let request = match (&device, &property) {
        (Some(device), Some(property)) => GetProperties::property(device, property),
        (Some(device), None) => GetProperties::device(device),
        _ => GetProperties::all(),
    };
    writer.write_message(&Message::GetProperties(request)).await?;
    if blobs {
        writer
            .write_message(&Message::EnableBlob(EnableBlob {
                device: device.clone(),
                name: property.clone(),
                policy: BlobEnable::Also,
            }))
            .await?;
    }

    let mut mirror = PropertyMirror::new();
    let stream = async {
        loop {
            match reader.read_message().await {
                Ok(Some(message)) => {
                    for line in mirror.apply(&message) {
                        println!("{}", line);
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_recoverable() => debug!(error = %e, "Skipping malformed frame"),
                Err(e) => return Err(ClientError::from(e)),
            }
        }
    };

    tokio::select! {
        result = stream => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}

/// Builds the change request for `assignments`, validated against the
/// property definition.
///
/// # Errors
///
/// Fails if the assignments target different properties, or if the
/// property would refuse them (read-only, unknown element, bad value).
pub fn build_change(property: &Property, assignments: &[Assignment]) -> ClientResult<NewVector> {
    let mut request = NewVector::new(property.kind(), property.device(), property.name());
    for assignment in assignments {
        if assignment.device != property.device() || assignment.property != property.name() {
            return Err(ClientError::Config(format!(
                "{}.{} does not belong to {}.{}",
                assignment.device,
                assignment.property,
                property.device(),
                property.name()
            )));
        }
        request = request.with_element(OneElement::scalar(&assignment.element, &assignment.value));
    }

    // Dry run on a copy: the device applies the same rules.
    property
        .clone()
        .apply_change(&request)
        .map_err(|e| ClientError::Device(e.to_string()))?;
    Ok(request)
}

/// Sends a change and prints updates until the property settles.
pub async fn set(remote: &Remote, assignments: &[Assignment], wait: Duration) -> ClientResult<()> {
    let Some(first) = assignments.first() else {
        return Err(ClientError::Config("nothing to set".into()));
    };
    let (mut reader, mut writer) = connect(remote).await?;
    writer
        .write_message(&Message::GetProperties(GetProperties::property(
            &first.device,
            &first.property,
        )))
        .await?;

    let settled = tokio::time::timeout(
        wait,
        exchange(&mut reader, &mut writer, first, assignments),
    )
    .await;

    match settled {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(format!(
            "no answer for {}.{} within {}s",
            first.device,
            first.property,
            wait.as_secs()
        ))),
    }
}

async fn exchange(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    first: &Assignment,
    assignments: &[Assignment],
) -> ClientResult<()> {
    let mut mirror = PropertyMirror::new();
    let property = loop {
        let message = next_message(reader).await?;
        mirror.apply(&message);
        if let Some(property) = mirror.get(&first.device, &first.property) {
            break property.clone();
        }
    };

    let request = build_change(&property, assignments)?;
    writer.write_message(&Message::New(request)).await?;

    loop {
        let message = next_message(reader).await?;
        let touches = message.device() == Some(first.device.as_str())
            && message.property() == Some(first.property.as_str());
        for line in mirror.apply(&message) {
            if touches || matches!(message, Message::Notify(_)) {
                println!("{}", line);
            }
        }
        if !touches || !matches!(message, Message::Set(_)) {
            continue;
        }
        match mirror.get(&first.device, &first.property).map(Property::state) {
            Some(PropertyState::Busy) => continue,
            Some(PropertyState::Alert) => {
                return Err(ClientError::Device(format!(
                    "{}.{} reported Alert",
                    first.device, first.property
                )));
            }
            _ => return Ok(()),
        }
    }
}

async fn next_message(reader: &mut FrameReader<OwnedReadHalf>) -> ClientResult<Message> {
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => return Ok(message),
            Ok(None) => return Err(ClientError::Connection("broker closed the connection".into())),
            Err(e) if e.is_recoverable() => debug!(error = %e, "Skipping malformed frame"),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::parse_assignment;
    use crate::commands::serve::Daemon;
    use crate::demo::{DEMO_CAMERA_DEVICE, DEMO_CAMERA_ID};
    use indibus_core::{
        DefVector, DelProperty, Device, Element, PropertyKind, SetVector, SwitchRule,
        SwitchStatus, TextMessage,
    };
    use indibus_protocol::DriverSpec;
    use indibus_server::ServerConfig;
    use tempfile::tempdir;

    fn expose_def() -> DefVector {
        let device = Device::new("Camera");
        device
            .property_builder("EXPOSE", PropertyKind::Switch)
            .with_rule(SwitchRule::OneOfMany)
            .with_element(Element::switch("START", "Start", SwitchStatus::Off))
            .with_element(Element::switch("STOP", "Stop", SwitchStatus::On))
            .build()
            .unwrap()
            .to_def()
    }

    fn expose_set(state: PropertyState, start: SwitchStatus) -> SetVector {
        SetVector {
            kind: PropertyKind::Switch,
            device: "Camera".into(),
            name: "EXPOSE".into(),
            state: Some(state),
            timeout: None,
            timestamp: None,
            message: None,
            elements: vec![OneElement::switch("START", start)],
        }
    }

    #[test]
    fn mirror_tracks_definitions_updates_and_deletes() {
        let mut mirror = PropertyMirror::new();
        let lines = mirror.apply(&Message::Define(expose_def()));
        assert_eq!(lines, vec!["def Camera.EXPOSE [Idle] START=Off STOP=On".to_string()]);

        let lines = mirror.apply(&Message::Set(expose_set(PropertyState::Busy, SwitchStatus::On)));
        assert_eq!(lines, vec!["set Camera.EXPOSE [Busy] START=On".to_string()]);
        assert_eq!(
            mirror.get("Camera", "EXPOSE").map(Property::state),
            Some(PropertyState::Busy)
        );

        let lines = mirror.apply(&Message::Delete(DelProperty::device("Camera")));
        assert_eq!(lines, vec!["del Camera".to_string()]);
        assert!(mirror.is_empty());
    }

    #[test]
    fn mirror_ignores_updates_for_unknown_properties() {
        let mut mirror = PropertyMirror::new();
        assert!(
            mirror
                .apply(&Message::Set(expose_set(PropertyState::Ok, SwitchStatus::On)))
                .is_empty()
        );
        assert_eq!(mirror.len(), 0);
    }

    #[test]
    fn mirror_prints_notifications() {
        let mut mirror = PropertyMirror::new();
        let lines = mirror.apply(&Message::Notify(TextMessage {
            device: Some("Camera".into()),
            timestamp: Some("2024-01-01T00:00:00".into()),
            message: "Cooling".into(),
        }));
        assert_eq!(lines, vec!["msg 2024-01-01T00:00:00 Camera: Cooling".to_string()]);
    }

    #[test]
    fn change_is_validated_locally() {
        let property = Property::from_def(&expose_def()).unwrap();

        let ok = build_change(&property, &[parse_assignment("Camera.EXPOSE.START=On").unwrap()])
            .unwrap();
        assert_eq!(ok.kind, PropertyKind::Switch);
        assert_eq!(ok.elements, vec![OneElement::scalar("START", "On")]);

        let unknown = build_change(&property, &[parse_assignment("Camera.EXPOSE.PAUSE=On").unwrap()]);
        assert!(matches!(unknown, Err(ClientError::Device(_))));

        let elsewhere = build_change(
            &property,
            &[
                parse_assignment("Camera.EXPOSE.START=On").unwrap(),
                parse_assignment("Mount.PARK.PARK=On").unwrap(),
            ],
        );
        assert!(matches!(elsewhere, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn set_drives_the_demo_camera() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::new(dir.path().join("indibus.sock"))
            .with_listen_address("127.0.0.1".parse().unwrap())
            .with_port(0);
        let daemon = Daemon::bind(&config).await.unwrap();
        daemon
            .load_drivers(&[DriverSpec::builtin(DEMO_CAMERA_ID)])
            .await;
        let remote = Remote {
            host: "127.0.0.1".into(),
            port: daemon.local_addr().unwrap().port(),
        };
        let signals = daemon.signals().shutdown_handle();
        let task = tokio::spawn(daemon.run());

        let connect = parse_assignment(&format!("{DEMO_CAMERA_DEVICE}.CONNECTION.CONNECT=On")).unwrap();
        set(&remote, &[connect], Duration::from_secs(5)).await.unwrap();

        let bad = parse_assignment(&format!("{DEMO_CAMERA_DEVICE}.CCD_EXPOSURE.CCD_EXPOSURE_VALUE=9999"))
            .unwrap();
        assert!(matches!(
            set(&remote, &[bad], Duration::from_secs(5)).await,
            Err(ClientError::Device(_))
        ));

        let missing = parse_assignment("Nobody.CONNECTION.CONNECT=On").unwrap();
        assert!(matches!(
            set(&remote, &[missing], Duration::from_millis(200)).await,
            Err(ClientError::Timeout(_))
        ));

        signals.trigger();
        task.await.unwrap().unwrap();
    }
}
