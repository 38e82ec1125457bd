//! Per-connection subscription table and BLOB policy.
//!
//! Clients and devices both embed a [`Listener`]: devices listen to other
//! devices when they snoop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use indibus_core::{BlobEnable, EnableBlob, GetProperties, Message};

use crate::events::PeerId;

/// Outbound queue of one connection.
///
/// A single writer task drains the queue, so frames to one peer are never
/// interleaved or reordered.
#[derive(Debug, Clone)]
pub struct Outbox {
    peer: PeerId,
    tx: mpsc::UnboundedSender<Arc<Message>>,
}

impl Outbox {
    /// Creates an outbox and the receiving end for its writer task.
    pub fn channel(peer: PeerId) -> (Self, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peer, tx }, rx)
    }

    pub fn from_sender(peer: PeerId, tx: mpsc::UnboundedSender<Arc<Message>>) -> Self {
        Self { peer, tx }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Queues a message. Returns false if the writer is gone.
    pub fn send(&self, message: Arc<Message>) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// What a peer asked to receive.
///
/// Subscriptions only grow through discovery requests and are never widened
/// implicitly: a single-property subscription does not turn into a
/// device-wide one.
#[derive(Debug, Clone, Default)]
pub struct Listener {
    all_devices: bool,
    devices: HashSet<String>,
    properties: HashSet<(String, String)>,
    default_blob: BlobEnable,
    device_blob: HashMap<String, BlobEnable>,
    property_blob: HashMap<(String, String), BlobEnable>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the scope of a discovery request.
    pub fn listen(&mut self, request: &GetProperties) {
        match (&request.device, &request.name) {
            (None, _) => self.all_devices = true,
            (Some(device), None) => {
                self.devices.insert(device.clone());
            }
            (Some(device), Some(name)) => {
                self.properties.insert((device.clone(), name.clone()));
            }
        }
    }

    /// True if every property of `device` is wanted.
    pub fn listens_to_device(&self, device: &str) -> bool {
        self.all_devices || self.devices.contains(device)
    }

    /// True if `device.property` is wanted, through any subscription.
    pub fn listens_to_property(&self, device: &str, property: &str) -> bool {
        self.listens_to_device(device)
            || self
                .properties
                .contains(&(device.to_string(), property.to_string()))
    }

    /// True if anything of `device` is wanted.
    pub fn listens_to_any_of(&self, device: &str) -> bool {
        self.listens_to_device(device) || self.properties.iter().any(|(d, _)| d == device)
    }

    /// Drops single-property subscriptions to a removed property, or to
    /// every property of a removed device when `property` is `None`.
    pub fn prune(&mut self, device: &str, property: Option<&str>) {
        self.properties
            .retain(|(d, p)| d != device || property.is_some_and(|name| name != p));
    }

    /// Applies an `enableBLOB` request.
    ///
    /// Without a device it sets the default; a device-wide policy replaces
    /// any property-level policies of that device.
    pub fn set_blob_policy(&mut self, request: &EnableBlob) {
        match (&request.device, &request.name) {
            (None, _) => self.default_blob = request.policy,
            (Some(device), None) => {
                self.property_blob.retain(|(d, _), _| d != device);
                self.device_blob.insert(device.clone(), request.policy);
            }
            (Some(device), Some(name)) => {
                self.property_blob
                    .insert((device.clone(), name.clone()), request.policy);
            }
        }
    }

    /// Returns the policy in effect for `device` and optionally a property.
    pub fn blob_policy(&self, device: &str, property: Option<&str>) -> BlobEnable {
        property
            .and_then(|name| {
                self.property_blob
                    .get(&(device.to_string(), name.to_string()))
            })
            .or_else(|| self.device_blob.get(device))
            .copied()
            .unwrap_or(self.default_blob)
    }

    /// True if the BLOB policy lets `message` through. Deletions always
    /// pass.
    pub fn admits(&self, message: &Message) -> bool {
        if matches!(message, Message::Delete(_)) {
            return true;
        }
        let Some(device) = message.device() else {
            return true;
        };
        let policy = self.blob_policy(device, message.property());
        if message.carries_blob() {
            policy.accepts_blobs()
        } else {
            policy.accepts_non_blobs()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indibus_core::{
        BlobValue, DelProperty, OneElement, PropertyKind, SetVector, TextMessage,
    };

    fn blob_set(device: &str, name: &str) -> Message {
        Message::Set(SetVector {
            kind: PropertyKind::Blob,
            device: device.into(),
            name: name.into(),
            state: None,
            timeout: None,
            timestamp: None,
            message: None,
            elements: vec![OneElement::blob("FRAME", BlobValue::new(".fits", vec![0; 4]))],
        })
    }

    fn text_set(device: &str, name: &str) -> Message {
        Message::Set(SetVector {
            kind: PropertyKind::Text,
            device: device.into(),
            name: name.into(),
            state: None,
            timeout: None,
            timestamp: None,
            message: None,
            elements: vec![OneElement::scalar("NAME", "x")],
        })
    }

    fn enable(device: Option<&str>, name: Option<&str>, policy: BlobEnable) -> EnableBlob {
        EnableBlob {
            device: device.map(str::to_string),
            name: name.map(str::to_string),
            policy,
        }
    }

    #[test]
    fn subscription_scopes() {
        let mut listener = Listener::new();
        assert!(!listener.listens_to_any_of("Camera"));

        listener.listen(&GetProperties::property("Camera", "EXPOSE"));
        assert!(listener.listens_to_property("Camera", "EXPOSE"));
        assert!(!listener.listens_to_property("Camera", "TEMP"));
        assert!(!listener.listens_to_device("Camera"));
        assert!(listener.listens_to_any_of("Camera"));

        listener.listen(&GetProperties::device("Mount"));
        assert!(listener.listens_to_property("Mount", "PARK"));
        assert!(!listener.listens_to_device("Focuser"));

        listener.listen(&GetProperties::all());
        assert!(listener.listens_to_device("Focuser"));
    }

    #[test]
    fn pruning_removes_property_subscriptions_only() {
        let mut listener = Listener::new();
        listener.listen(&GetProperties::property("Camera", "EXPOSE"));
        listener.listen(&GetProperties::property("Camera", "TEMP"));
        listener.listen(&GetProperties::device("Mount"));

        listener.prune("Camera", Some("EXPOSE"));
        assert!(!listener.listens_to_property("Camera", "EXPOSE"));
        assert!(listener.listens_to_property("Camera", "TEMP"));

        listener.prune("Camera", None);
        assert!(!listener.listens_to_any_of("Camera"));

        listener.prune("Mount", None);
        assert!(listener.listens_to_device("Mount"));
    }

    #[test]
    fn blob_policy_defaults_to_never() {
        let listener = Listener::new();
        assert!(!listener.admits(&blob_set("Camera", "IMAGE")));
        assert!(listener.admits(&text_set("Camera", "DRIVER")));
    }

    #[test]
    fn blob_policy_only_and_also() {
        let mut listener = Listener::new();
        listener.set_blob_policy(&enable(Some("Camera"), None, BlobEnable::Only));
        assert!(listener.admits(&blob_set("Camera", "IMAGE")));
        assert!(!listener.admits(&text_set("Camera", "DRIVER")));
        assert!(listener.admits(&text_set("Mount", "PARK")));

        listener.set_blob_policy(&enable(Some("Camera"), None, BlobEnable::Also));
        assert!(listener.admits(&blob_set("Camera", "IMAGE")));
        assert!(listener.admits(&text_set("Camera", "DRIVER")));
    }

    #[test]
    fn property_policy_overrides_device_policy() {
        let mut listener = Listener::new();
        listener.set_blob_policy(&enable(Some("Camera"), None, BlobEnable::Also));
        listener.set_blob_policy(&enable(Some("Camera"), Some("PREVIEW"), BlobEnable::Never));
        assert!(listener.admits(&blob_set("Camera", "IMAGE")));
        assert!(!listener.admits(&blob_set("Camera", "PREVIEW")));

        // A new device-wide policy clears the property override.
        listener.set_blob_policy(&enable(Some("Camera"), None, BlobEnable::Also));
        assert!(listener.admits(&blob_set("Camera", "PREVIEW")));
    }

    #[test]
    fn default_policy_applies_to_all_devices() {
        let mut listener = Listener::new();
        listener.set_blob_policy(&enable(None, None, BlobEnable::Also));
        assert!(listener.admits(&blob_set("Guider", "IMAGE")));
    }

    #[test]
    fn global_messages_are_always_admitted() {
        let listener = Listener::new();
        let global = Message::Notify(TextMessage {
            device: None,
            timestamp: None,
            message: "hello".into(),
        });
        assert!(listener.admits(&global));
    }

    #[test]
    fn deletions_ignore_blob_policy() {
        let mut listener = Listener::new();
        listener.set_blob_policy(&enable(Some("Camera"), None, BlobEnable::Only));
        assert!(listener.admits(&Message::Delete(DelProperty::device("Camera"))));
    }

    #[test]
    fn outbox_reports_closed_writer() {
        let (outbox, rx) = Outbox::channel(7);
        assert_eq!(outbox.peer(), 7);
        assert!(outbox.send(Arc::new(text_set("A", "B"))));
        drop(rx);
        assert!(!outbox.send(Arc::new(text_set("A", "B"))));
    }
}
