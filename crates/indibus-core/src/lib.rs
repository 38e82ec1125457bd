//! Core types: properties, elements, devices, wire messages, number formats

pub mod device;
pub mod element;
pub mod error;
pub mod message;
pub mod number;
pub mod property;
pub mod time;
pub mod tracing;
pub mod types;

pub use device::Device;
pub use element::{Element, ElementValue, NumberValue};
pub use error::{ModelError, ModelResult};
pub use message::{
    BlobValue, DefElement, DefVector, DelProperty, EnableBlob, GetProperties, Message,
    NewVector, NumberFormat, OneElement, PROTOCOL_VERSION, SetVector, TextMessage, WireValue,
};
pub use number::{format_number, format_sexagesimal, parse_number};
pub use property::{DEFAULT_TIMEOUT_SECS, Property, PropertyBuilder, RenderKind};
pub use time::{format_timestamp, now_timestamp, parse_timestamp};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing, parse_level};
pub use types::{
    BlobEnable, PropertyKind, PropertyPermission, PropertyState, SwitchRule, SwitchStatus,
};
