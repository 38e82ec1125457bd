//! Enumerations shared by the model and the wire protocol.
//!
//! Every enum here has a fixed wire token (`as_str`) and a lenient parser
//! (`FromStr`, trimmed and case-insensitive).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle state of a property, also the value of a light element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    /// Returns the wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Ok => "Ok",
            Self::Busy => "Busy",
            Self::Alert => "Alert",
        }
    }
}

/// Who may change a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyPermission {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "wo")]
    WriteOnly,
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl PropertyPermission {
    /// Returns the wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::WriteOnly => "wo",
            Self::ReadWrite => "rw",
        }
    }

    /// Returns true if clients may submit new values.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Selection rule of a switch property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchRule {
    /// Exactly one element is ON.
    #[default]
    OneOfMany,
    /// Zero or one element is ON.
    AtMostOne,
    /// Unconstrained.
    AnyOfMany,
}

impl SwitchRule {
    /// Returns the wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneOfMany => "OneOfMany",
            Self::AtMostOne => "AtMostOne",
            Self::AnyOfMany => "AnyOfMany",
        }
    }
}

/// Value of a switch element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchStatus {
    On,
    #[default]
    Off,
}

impl SwitchStatus {
    /// Returns the wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "On",
            Self::Off => "Off",
        }
    }

    /// Returns true for `On`.
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

/// Per-listener policy for binary (BLOB) payload delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobEnable {
    /// Never send BLOB updates (the default).
    #[default]
    Never,
    /// Send BLOB updates along with everything else.
    Also,
    /// Send only BLOB updates.
    Only,
}

impl BlobEnable {
    /// Returns the wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "Never",
            Self::Also => "Also",
            Self::Only => "Only",
        }
    }

    /// Returns true if BLOB updates pass this policy.
    pub fn accepts_blobs(&self) -> bool {
        !matches!(self, Self::Never)
    }

    /// Returns true if non-BLOB updates pass this policy.
    pub fn accepts_non_blobs(&self) -> bool {
        !matches!(self, Self::Only)
    }
}

/// Semantic type of a property and of all of its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyKind {
    /// All kinds, in wire order.
    pub const ALL: [PropertyKind; 5] = [
        PropertyKind::Text,
        PropertyKind::Number,
        PropertyKind::Switch,
        PropertyKind::Light,
        PropertyKind::Blob,
    ];

    /// Returns the fragment used in tag names (`defTextVector`, `oneBLOB`, ...).
    pub fn tag_fragment(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Number => "Number",
            Self::Switch => "Switch",
            Self::Light => "Light",
            Self::Blob => "BLOB",
        }
    }

    /// Human-readable lowercase name, used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Switch => "switch",
            Self::Light => "light",
            Self::Blob => "blob",
        }
    }

    /// Resolves a tag fragment back to a kind.
    pub fn from_tag_fragment(fragment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag_fragment() == fragment)
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn parse_token<T: Copy>(
    kind: &'static str,
    value: &str,
    candidates: &[T],
    token: impl Fn(&T) -> &'static str,
) -> Result<T, ModelError> {
    let trimmed = value.trim();
    candidates
        .iter()
        .find(|c| token(*c).eq_ignore_ascii_case(trimmed))
        .copied()
        .ok_or_else(|| ModelError::invalid_token(kind, value))
}

impl FromStr for PropertyState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_token(
            "state",
            s,
            &[Self::Idle, Self::Ok, Self::Busy, Self::Alert],
            Self::as_str,
        )
    }
}

impl FromStr for PropertyPermission {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_token(
            "permission",
            s,
            &[Self::ReadOnly, Self::WriteOnly, Self::ReadWrite],
            Self::as_str,
        )
    }
}

impl FromStr for SwitchRule {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_token(
            "switch rule",
            s,
            &[Self::OneOfMany, Self::AtMostOne, Self::AnyOfMany],
            Self::as_str,
        )
    }
}

impl FromStr for SwitchStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_token("switch status", s, &[Self::On, Self::Off], Self::as_str)
    }
}

impl FromStr for BlobEnable {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_token(
            "BLOB policy",
            s,
            &[Self::Never, Self::Also, Self::Only],
            Self::as_str,
        )
    }
}

impl fmt::Display for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SwitchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for BlobEnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
