//! Model error types.

use thiserror::Error;

/// Result type for property and device model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by the property/element state machine.
///
/// None of these ever mutate state: an operation that fails leaves the
/// property exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// A change was requested on a read-only property.
    #[error("property {device}.{property} is read-only")]
    Permission { device: String, property: String },

    /// An element value could not be interpreted.
    #[error("invalid value for element {element}: {reason}")]
    Validation { element: String, reason: String },

    /// The request names an element the property does not have.
    #[error("property {property} has no element named {element}")]
    UnknownElement { property: String, element: String },

    /// A message or element of the wrong type was applied to a property.
    #[error("type mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Two elements with the same name were defined in one property.
    #[error("duplicate element {element} in property {property}")]
    DuplicateElement { property: String, element: String },

    /// A property needs at least one element.
    #[error("property {property} defines no elements")]
    EmptyProperty { property: String },

    /// A wire token (state, permission, rule, ...) was not recognized.
    #[error("invalid {kind} token: {value:?}")]
    InvalidToken { kind: &'static str, value: String },

    /// The device does not own the named property.
    #[error("device {device} has no property named {property}")]
    UnknownProperty { device: String, property: String },

    /// A property with the same name is already defined on the device.
    #[error("property {property} is already defined on device {device}")]
    DuplicateProperty { device: String, property: String },
}

impl ModelError {
    /// Creates a validation error for the given element.
    pub fn validation(element: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            element: element.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid token error.
    pub fn invalid_token(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidToken {
            kind,
            value: value.into(),
        }
    }
}
