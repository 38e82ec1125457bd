//! Elements: the typed values inside a property.

use crate::error::{ModelError, ModelResult};
use crate::message::{BlobValue, DefElement, NumberFormat, WireValue};
use crate::number::{format_number, parse_number};
use crate::types::{PropertyKind, PropertyState, SwitchStatus};

/// A number value together with its display and range metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberValue {
    pub value: f64,
    pub format: NumberFormat,
}

impl NumberValue {
    /// Returns true if `value` lies inside `[min, max]`.
    ///
    /// A range with `min >= max` is treated as unbounded.
    pub fn in_range(&self, value: f64) -> bool {
        let NumberFormat { min, max, .. } = self.format;
        min >= max || (min..=max).contains(&value)
    }
}

/// Current value of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Text(String),
    Number(NumberValue),
    Switch(SwitchStatus),
    Light(PropertyState),
    Blob(BlobValue),
}

impl ElementValue {
    /// Returns the semantic type of the value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Text(_) => PropertyKind::Text,
            Self::Number(_) => PropertyKind::Number,
            Self::Switch(_) => PropertyKind::Switch,
            Self::Light(_) => PropertyKind::Light,
            Self::Blob(_) => PropertyKind::Blob,
        }
    }

    /// Renders the value in wire form.
    pub fn to_wire(&self) -> WireValue {
        match self {
            Self::Text(text) => WireValue::Scalar(text.clone()),
            Self::Number(number) => WireValue::Scalar(number.value.to_string()),
            Self::Switch(status) => WireValue::Scalar(status.as_str().to_string()),
            Self::Light(state) => WireValue::Scalar(state.as_str().to_string()),
            Self::Blob(blob) => WireValue::Blob(blob.clone()),
        }
    }
}

/// A named value inside a property.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    label: String,
    value: ElementValue,
}

impl Element {
    /// Creates an element. An empty label defaults to the name.
    pub fn new(name: impl Into<String>, label: impl Into<String>, value: ElementValue) -> Self {
        let name = name.into().trim().to_string();
        let label = label.into().trim().to_string();
        let label = if label.is_empty() { name.clone() } else { label };
        Self { name, label, value }
    }

    /// Creates a text element.
    pub fn text(name: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, label, ElementValue::Text(value.into()))
    }

    /// Creates a number element.
    pub fn number(
        name: impl Into<String>,
        label: impl Into<String>,
        value: f64,
        format: NumberFormat,
    ) -> Self {
        Self::new(name, label, ElementValue::Number(NumberValue { value, format }))
    }

    /// Creates a switch element.
    pub fn switch(name: impl Into<String>, label: impl Into<String>, status: SwitchStatus) -> Self {
        Self::new(name, label, ElementValue::Switch(status))
    }

    /// Creates a light element.
    pub fn light(name: impl Into<String>, label: impl Into<String>, state: PropertyState) -> Self {
        Self::new(name, label, ElementValue::Light(state))
    }

    /// Creates an empty BLOB element.
    pub fn blob(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, label, ElementValue::Blob(BlobValue::default()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> &ElementValue {
        &self.value
    }

    pub fn kind(&self) -> PropertyKind {
        self.value.kind()
    }

    /// Replaces the value. The kinds must match.
    pub fn set_value(&mut self, value: ElementValue) -> ModelResult<()> {
        if value.kind() != self.kind() {
            return Err(ModelError::KindMismatch {
                expected: self.kind().name(),
                actual: value.kind().name(),
            });
        }
        self.value = value;
        Ok(())
    }

    pub(crate) fn replace_value(&mut self, value: ElementValue) {
        self.value = value;
    }

    /// Returns the switch status, if this is a switch element.
    pub fn switch_status(&self) -> Option<SwitchStatus> {
        match self.value {
            ElementValue::Switch(status) => Some(status),
            _ => None,
        }
    }

    /// Interprets a wire value as a new value for this element.
    ///
    /// Number elements accept decimal and sexagesimal text and must stay
    /// inside their declared range. BLOBs are replaced wholesale.
    pub fn parse_wire(&self, wire: &WireValue) -> ModelResult<ElementValue> {
        self.decode(wire, true)
    }

    /// Interprets a value reported by the owning device. The device is
    /// authoritative, so number ranges are not enforced.
    pub fn parse_reported(&self, wire: &WireValue) -> ModelResult<ElementValue> {
        self.decode(wire, false)
    }

    fn decode(&self, wire: &WireValue, check_range: bool) -> ModelResult<ElementValue> {
        match (&self.value, wire) {
            (ElementValue::Blob(_), WireValue::Blob(blob)) => Ok(ElementValue::Blob(blob.clone())),
            (ElementValue::Blob(_), WireValue::Scalar(_)) => {
                Err(ModelError::validation(&self.name, "expected a binary payload"))
            }
            (_, WireValue::Blob(_)) => Err(ModelError::validation(
                &self.name,
                "binary payload sent to a non-BLOB element",
            )),
            (ElementValue::Text(_), WireValue::Scalar(text)) => Ok(ElementValue::Text(text.clone())),
            (ElementValue::Number(current), WireValue::Scalar(text)) => {
                let value = parse_number(text).ok_or_else(|| {
                    ModelError::validation(&self.name, format!("not a number: {text:?}"))
                })?;
                if check_range && !current.in_range(value) {
                    return Err(ModelError::validation(
                        &self.name,
                        format!(
                            "{value} outside [{}, {}]",
                            current.format.min, current.format.max
                        ),
                    ));
                }
                Ok(ElementValue::Number(NumberValue {
                    value,
                    format: current.format.clone(),
                }))
            }
            (ElementValue::Switch(_), WireValue::Scalar(text)) => text
                .parse()
                .map(ElementValue::Switch)
                .map_err(|e: ModelError| ModelError::validation(&self.name, e.to_string())),
            (ElementValue::Light(_), WireValue::Scalar(text)) => text
                .parse()
                .map(ElementValue::Light)
                .map_err(|e: ModelError| ModelError::validation(&self.name, e.to_string())),
        }
    }

    /// Builds an element from its definition on the wire.
    pub fn from_def(kind: PropertyKind, def: &DefElement) -> ModelResult<Self> {
        let label = def.label.clone().unwrap_or_default();
        let value = match (kind, &def.value) {
            (PropertyKind::Blob, WireValue::Blob(blob)) => ElementValue::Blob(blob.clone()),
            (PropertyKind::Blob, WireValue::Scalar(_)) => ElementValue::Blob(BlobValue::default()),
            (_, WireValue::Blob(_)) => {
                return Err(ModelError::validation(
                    &def.name,
                    "binary payload in a non-BLOB definition",
                ));
            }
            (PropertyKind::Text, WireValue::Scalar(text)) => ElementValue::Text(text.clone()),
            (PropertyKind::Number, WireValue::Scalar(text)) => {
                let value = parse_number(text).ok_or_else(|| {
                    ModelError::validation(&def.name, format!("not a number: {text:?}"))
                })?;
                ElementValue::Number(NumberValue {
                    value,
                    format: def.number.clone().unwrap_or_default(),
                })
            }
            (PropertyKind::Switch, WireValue::Scalar(text)) => ElementValue::Switch(
                text.parse()
                    .map_err(|e: ModelError| ModelError::validation(&def.name, e.to_string()))?,
            ),
            (PropertyKind::Light, WireValue::Scalar(text)) => ElementValue::Light(
                text.parse()
                    .map_err(|e: ModelError| ModelError::validation(&def.name, e.to_string()))?,
            ),
        };
        Ok(Self::new(def.name.clone(), label, value))
    }

    /// Renders the element as part of a definition.
    pub fn to_def(&self) -> DefElement {
        let number = match &self.value {
            ElementValue::Number(number) => Some(number.format.clone()),
            _ => None,
        };
        // Definitions announce BLOB elements without their payload.
        let value = match &self.value {
            ElementValue::Blob(_) => WireValue::Scalar(String::new()),
            other => other.to_wire(),
        };
        DefElement {
            name: self.name.clone(),
            label: Some(self.label.clone()),
            value,
            number,
        }
    }

    /// Formats the value for humans.
    pub fn display_value(&self) -> String {
        match &self.value {
            ElementValue::Text(text) => text.clone(),
            ElementValue::Number(number) => format_number(number.value, &number.format.format)
                .trim()
                .to_string(),
            ElementValue::Switch(status) => status.as_str().to_string(),
            ElementValue::Light(state) => state.as_str().to_string(),
            ElementValue::Blob(blob) => format!("<{} bytes{}>", blob.size, blob.format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure() -> Element {
        Element::number(
            "SECONDS",
            "Seconds",
            1.0,
            NumberFormat {
                format: "%.2f".into(),
                min: 0.0,
                max: 3600.0,
                step: 0.01,
            },
        )
    }

    #[test]
    fn label_defaults_to_name() {
        let element = Element::text("PATH", "", "/tmp");
        assert_eq!(element.label(), "PATH");
    }

    #[test]
    fn number_parse_accepts_sexagesimal() {
        let value = exposure()
            .parse_wire(&WireValue::Scalar("0:30".into()))
            .unwrap();
        match value {
            ElementValue::Number(n) => assert_eq!(n.value, 0.5),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn number_parse_rejects_out_of_range_and_garbage() {
        let element = exposure();
        assert!(matches!(
            element.parse_wire(&WireValue::Scalar("7200".into())),
            Err(ModelError::Validation { .. })
        ));
        assert!(matches!(
            element.parse_wire(&WireValue::Scalar("soon".into())),
            Err(ModelError::Validation { .. })
        ));
    }

    #[test]
    fn blob_payload_only_fits_blob_elements() {
        let blob = WireValue::Blob(BlobValue::new(".raw", vec![1, 2]));
        assert!(Element::blob("FRAME", "").parse_wire(&blob).is_ok());
        assert!(exposure().parse_wire(&blob).is_err());
    }

    #[test]
    fn set_value_checks_kind() {
        let mut element = Element::switch("START", "", SwitchStatus::Off);
        assert!(element.set_value(ElementValue::Switch(SwitchStatus::On)).is_ok());
        assert!(element.set_value(ElementValue::Text("on".into())).is_err());
    }

    #[test]
    fn display_uses_number_format() {
        assert_eq!(exposure().display_value(), "1.00");
    }
}
