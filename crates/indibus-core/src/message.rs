//! Typed wire messages.
//!
//! These are the tagged variants exchanged between devices, the broker and
//! clients. They carry element values in their wire form: scalars stay as
//! the exact text that was received (so the broker relays them untouched and
//! devices decide how to interpret them), BLOB payloads are raw bytes.

use crate::types::{BlobEnable, PropertyKind, PropertyPermission, PropertyState, SwitchRule, SwitchStatus};

/// Protocol version announced in discovery requests.
pub const PROTOCOL_VERSION: &str = "1.7";

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Discovery request, optionally scoped to a device or a property.
    GetProperties(GetProperties),
    /// Full property definition.
    Define(DefVector),
    /// State and value update.
    Set(SetVector),
    /// Change request submitted by a client.
    New(NewVector),
    /// Property or device removal.
    Delete(DelProperty),
    /// Free-text notification.
    Notify(TextMessage),
    /// Binary payload policy for the sender.
    EnableBlob(EnableBlob),
}

impl Message {
    /// Returns the device this message refers to, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::GetProperties(m) => m.device.as_deref(),
            Self::Define(m) => Some(&m.device),
            Self::Set(m) => Some(&m.device),
            Self::New(m) => Some(&m.device),
            Self::Delete(m) => Some(&m.device),
            Self::Notify(m) => m.device.as_deref(),
            Self::EnableBlob(m) => m.device.as_deref(),
        }
    }

    /// Returns the property this message refers to, if any.
    pub fn property(&self) -> Option<&str> {
        match self {
            Self::GetProperties(m) => m.name.as_deref(),
            Self::Define(m) => Some(&m.name),
            Self::Set(m) => Some(&m.name),
            Self::New(m) => Some(&m.name),
            Self::Delete(m) => m.name.as_deref(),
            Self::Notify(_) => None,
            Self::EnableBlob(m) => m.name.as_deref(),
        }
    }

    /// Returns true if the message carries binary payload.
    ///
    /// Set and new vectors of BLOB type always count; a definition counts
    /// only when one of its BLOB elements holds a payload.
    pub fn carries_blob(&self) -> bool {
        match self {
            Self::Define(m) => {
                m.kind == PropertyKind::Blob
                    && m.elements.iter().any(|e| {
                        matches!(&e.value, WireValue::Blob(blob) if !blob.data.is_empty())
                    })
            }
            Self::Set(m) => m.kind == PropertyKind::Blob,
            Self::New(m) => m.kind == PropertyKind::Blob,
            _ => false,
        }
    }

    /// Returns the wire tag name of this message.
    pub fn tag_name(&self) -> String {
        match self {
            Self::GetProperties(_) => "getProperties".to_string(),
            Self::Define(m) => format!("def{}Vector", m.kind.tag_fragment()),
            Self::Set(m) => format!("set{}Vector", m.kind.tag_fragment()),
            Self::New(m) => format!("new{}Vector", m.kind.tag_fragment()),
            Self::Delete(_) => "delProperty".to_string(),
            Self::Notify(_) => "message".to_string(),
            Self::EnableBlob(_) => "enableBLOB".to_string(),
        }
    }
}

/// Discovery request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetProperties {
    pub version: Option<String>,
    pub device: Option<String>,
    pub name: Option<String>,
}

impl GetProperties {
    /// Requests every property of every device.
    pub fn all() -> Self {
        Self {
            version: Some(PROTOCOL_VERSION.to_string()),
            device: None,
            name: None,
        }
    }

    /// Requests every property of one device.
    pub fn device(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            ..Self::all()
        }
    }

    /// Requests a single property.
    pub fn property(device: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            name: Some(name.into()),
            ..Self::all()
        }
    }

    /// Returns true if `device` is within the scope of this request.
    pub fn matches_device(&self, device: &str) -> bool {
        self.device.as_deref().is_none_or(|d| d == device)
    }
}

/// A binary payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobValue {
    /// Format tag, usually a file suffix such as `.fits`.
    pub format: String,
    /// Declared uncompressed size in bytes.
    pub size: usize,
    /// Raw (decoded) payload.
    pub data: Vec<u8>,
}

impl BlobValue {
    /// Creates a payload whose declared size is its length.
    pub fn new(format: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            format: format.into(),
            size: data.len(),
            data,
        }
    }
}

/// An element value as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    /// Text, number, switch or light value, exactly as received.
    Scalar(String),
    /// Binary payload.
    Blob(BlobValue),
}

impl WireValue {
    /// Returns the scalar text, or `None` for BLOBs.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(text) => Some(text),
            Self::Blob(_) => None,
        }
    }
}

/// Display and range metadata of a number element.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberFormat {
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self {
            format: "%g".to_string(),
            min: 0.0,
            max: 0.0,
            step: 0.0,
        }
    }
}

/// An element inside a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DefElement {
    pub name: String,
    pub label: Option<String>,
    pub value: WireValue,
    /// Present for number elements only.
    pub number: Option<NumberFormat>,
}

/// An element inside a set or new vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneElement {
    pub name: String,
    pub value: WireValue,
}

impl OneElement {
    /// Creates an element with a scalar value.
    pub fn scalar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: WireValue::Scalar(value.into()),
        }
    }

    /// Creates a switch element.
    pub fn switch(name: impl Into<String>, status: SwitchStatus) -> Self {
        Self::scalar(name, status.as_str())
    }

    /// Creates a number element.
    pub fn number(name: impl Into<String>, value: f64) -> Self {
        Self::scalar(name, value.to_string())
    }

    /// Creates a BLOB element.
    pub fn blob(name: impl Into<String>, blob: BlobValue) -> Self {
        Self {
            name: name.into(),
            value: WireValue::Blob(blob),
        }
    }
}

/// Full property definition (`defXXXVector`).
#[derive(Debug, Clone, PartialEq)]
pub struct DefVector {
    pub kind: PropertyKind,
    pub device: String,
    pub name: String,
    pub label: Option<String>,
    pub group: Option<String>,
    pub state: PropertyState,
    /// Absent for lights, which are always read-only.
    pub permission: Option<PropertyPermission>,
    /// Present for switches only.
    pub rule: Option<SwitchRule>,
    pub timeout: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub elements: Vec<DefElement>,
}

/// State and value update (`setXXXVector`).
#[derive(Debug, Clone, PartialEq)]
pub struct SetVector {
    pub kind: PropertyKind,
    pub device: String,
    pub name: String,
    pub state: Option<PropertyState>,
    pub timeout: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub elements: Vec<OneElement>,
}

/// Change request (`newXXXVector`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVector {
    pub kind: PropertyKind,
    pub device: String,
    pub name: String,
    pub timestamp: Option<String>,
    pub elements: Vec<OneElement>,
}

impl NewVector {
    /// Creates an empty change request.
    pub fn new(kind: PropertyKind, device: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            device: device.into(),
            name: name.into(),
            timestamp: None,
            elements: Vec::new(),
        }
    }

    /// Builder: append an element.
    pub fn with_element(mut self, element: OneElement) -> Self {
        self.elements.push(element);
        self
    }

    /// Builder: set the timestamp.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// Property or device removal (`delProperty`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelProperty {
    pub device: String,
    /// `None` removes the whole device.
    pub name: Option<String>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
}

impl DelProperty {
    /// Removes a whole device.
    pub fn device(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            name: None,
            timestamp: None,
            message: None,
        }
    }

    /// Removes a single property.
    pub fn property(device: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::device(device)
        }
    }
}

/// Free-text notification (`message`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    /// `None` for a global notification.
    pub device: Option<String>,
    pub timestamp: Option<String>,
    pub message: String,
}

/// Binary payload policy (`enableBLOB`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableBlob {
    pub device: Option<String>,
    pub name: Option<String>,
    pub policy: BlobEnable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_def(data: Vec<u8>) -> DefVector {
        DefVector {
            kind: PropertyKind::Blob,
            device: "Camera".into(),
            name: "IMAGE".into(),
            label: None,
            group: None,
            state: PropertyState::Idle,
            permission: Some(PropertyPermission::ReadOnly),
            rule: None,
            timeout: None,
            timestamp: None,
            message: None,
            elements: vec![DefElement {
                name: "FRAME".into(),
                label: None,
                value: WireValue::Blob(BlobValue::new(".fits", data)),
                number: None,
            }],
        }
    }

    #[test]
    fn definition_carries_blob_only_with_payload() {
        assert!(!Message::Define(blob_def(Vec::new())).carries_blob());
        assert!(Message::Define(blob_def(vec![1, 2, 3])).carries_blob());
    }

    #[test]
    fn blob_set_always_carries_blob() {
        let set = SetVector {
            kind: PropertyKind::Blob,
            device: "Camera".into(),
            name: "IMAGE".into(),
            state: None,
            timeout: None,
            timestamp: None,
            message: None,
            elements: Vec::new(),
        };
        assert!(Message::Set(set).carries_blob());
    }

    #[test]
    fn accessors_and_tag_names() {
        let msg = Message::New(
            NewVector::new(PropertyKind::Switch, "Camera", "EXPOSE")
                .with_element(OneElement::switch("START", SwitchStatus::On)),
        );
        assert_eq!(msg.device(), Some("Camera"));
        assert_eq!(msg.property(), Some("EXPOSE"));
        assert_eq!(msg.tag_name(), "newSwitchVector");

        let del = Message::Delete(DelProperty::device("Camera"));
        assert_eq!(del.property(), None);
        assert_eq!(del.tag_name(), "delProperty");
    }

    #[test]
    fn get_properties_scope() {
        assert!(GetProperties::all().matches_device("Camera"));
        assert!(GetProperties::device("Camera").matches_device("Camera"));
        assert!(!GetProperties::device("Mount").matches_device("Camera"));
        assert_eq!(GetProperties::all().version.as_deref(), Some(PROTOCOL_VERSION));
    }
}
