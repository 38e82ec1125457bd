//! Properties: typed, ordered groups of elements owned by one device.
//!
//! A property's shape (kind, element names and order) is fixed when it is
//! built. Afterwards only values, the lifecycle state and the timestamp
//! change, either through a validated change request (`apply_change`) or
//! through device-internal updates.

use chrono::{DateTime, Duration, Utc};

use crate::element::{Element, ElementValue};
use crate::error::{ModelError, ModelResult};
use crate::message::{DefVector, Message, NewVector, OneElement, SetVector};
use crate::time::now_timestamp;
use crate::types::{PropertyKind, PropertyPermission, PropertyState, SwitchRule, SwitchStatus};

/// Seconds a pending change may stay busy when no timeout is given.
pub const DEFAULT_TIMEOUT_SECS: u32 = 60;

/// Which message `Property::render` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    /// A full definition.
    Define,
    /// A value update carrying every element.
    Set,
}

/// A named, typed, ordered collection of elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    device: String,
    name: String,
    label: String,
    group: String,
    kind: PropertyKind,
    permission: PropertyPermission,
    state: PropertyState,
    timeout: u32,
    rule: Option<SwitchRule>,
    elements: Vec<Element>,
    timestamp: String,
    busy_since: Option<DateTime<Utc>>,
}

/// Builder for [`Property`].
#[derive(Debug, Clone)]
pub struct PropertyBuilder {
    device: String,
    name: String,
    kind: PropertyKind,
    label: Option<String>,
    group: Option<String>,
    permission: PropertyPermission,
    state: PropertyState,
    timeout: u32,
    rule: SwitchRule,
    elements: Vec<Element>,
}

impl PropertyBuilder {
    pub fn new(device: impl Into<String>, name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            kind,
            label: None,
            group: None,
            permission: PropertyPermission::default(),
            state: PropertyState::default(),
            timeout: DEFAULT_TIMEOUT_SECS,
            rule: SwitchRule::default(),
            elements: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the permission. Lights ignore this and are always read-only.
    #[must_use]
    pub fn with_permission(mut self, permission: PropertyPermission) -> Self {
        self.permission = permission;
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    /// Sets the busy timeout in seconds. Negative values clamp to zero.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = clamp_timeout(seconds);
        self
    }

    /// Sets the selection rule. Only meaningful for switches.
    #[must_use]
    pub fn with_rule(mut self, rule: SwitchRule) -> Self {
        self.rule = rule;
        self
    }

    #[must_use]
    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    #[must_use]
    pub fn with_elements(mut self, elements: impl IntoIterator<Item = Element>) -> Self {
        self.elements.extend(elements);
        self
    }

    /// Validates the shape and builds the property.
    ///
    /// # Errors
    ///
    /// Fails if there are no elements, if an element's kind differs from the
    /// property kind, or if two elements share a name.
    pub fn build(self) -> ModelResult<Property> {
        if self.elements.is_empty() {
            return Err(ModelError::EmptyProperty { property: self.name });
        }
        for (index, element) in self.elements.iter().enumerate() {
            if element.kind() != self.kind {
                return Err(ModelError::KindMismatch {
                    expected: self.kind.name(),
                    actual: element.kind().name(),
                });
            }
            if self.elements[..index].iter().any(|e| e.name() == element.name()) {
                return Err(ModelError::DuplicateElement {
                    property: self.name,
                    element: element.name().to_string(),
                });
            }
        }

        let permission = match self.kind {
            PropertyKind::Light => PropertyPermission::ReadOnly,
            _ => self.permission,
        };
        let rule = (self.kind == PropertyKind::Switch).then_some(self.rule);
        let label = self.label.filter(|l| !l.trim().is_empty()).unwrap_or_else(|| self.name.clone());

        let mut property = Property {
            device: self.device,
            name: self.name,
            label,
            group: self.group.unwrap_or_default(),
            kind: self.kind,
            permission,
            state: PropertyState::Idle,
            timeout: self.timeout,
            rule,
            elements: self.elements,
            timestamp: now_timestamp(),
            busy_since: None,
        };
        property.normalize_switches();
        property.set_state(self.state);
        Ok(property)
    }
}

fn clamp_timeout(seconds: f64) -> u32 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

impl Property {
    /// Builds a property from a definition received on the wire.
    pub fn from_def(def: &DefVector) -> ModelResult<Self> {
        let elements = def
            .elements
            .iter()
            .map(|e| Element::from_def(def.kind, e))
            .collect::<ModelResult<Vec<_>>>()?;

        let mut builder = PropertyBuilder::new(def.device.clone(), def.name.clone(), def.kind)
            .with_permission(def.permission.unwrap_or_default())
            .with_rule(def.rule.unwrap_or_default())
            .with_timeout(def.timeout.unwrap_or(f64::from(DEFAULT_TIMEOUT_SECS)))
            .with_state(def.state)
            .with_elements(elements);
        if let Some(label) = &def.label {
            builder = builder.with_label(label.clone());
        }
        if let Some(group) = &def.group {
            builder = builder.with_group(group.clone());
        }

        let mut property = builder.build()?;
        if let Some(timestamp) = &def.timestamp {
            property.timestamp = timestamp.clone();
        }
        Ok(property)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    pub fn permission(&self) -> PropertyPermission {
        self.permission
    }

    pub fn state(&self) -> PropertyState {
        self.state
    }

    /// Busy timeout in seconds; zero means no timeout.
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    /// Selection rule, `None` unless this is a switch property.
    pub fn rule(&self) -> Option<SwitchRule> {
        self.rule
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name() == name)
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// When the property last entered `Busy`, if it is busy now.
    pub fn busy_since(&self) -> Option<DateTime<Utc>> {
        self.busy_since
    }

    /// Moves the property to a new lifecycle state.
    ///
    /// Entering `Busy` records the current time so the timeout can be
    /// checked with [`Property::busy_expired`].
    pub fn set_state(&mut self, state: PropertyState) {
        match state {
            PropertyState::Busy if self.state != PropertyState::Busy => {
                self.busy_since = Some(Utc::now());
            }
            PropertyState::Busy => {}
            _ => self.busy_since = None,
        }
        self.state = state;
    }

    /// Returns true if the property has been busy longer than its timeout.
    ///
    /// Properties without a timeout never expire. The broker never acts on
    /// this; device logic decides whether to declare `Alert`.
    pub fn busy_expired(&self, now: DateTime<Utc>) -> bool {
        if self.state != PropertyState::Busy || self.timeout == 0 {
            return false;
        }
        self.busy_since
            .is_some_and(|since| now - since >= Duration::seconds(i64::from(self.timeout)))
    }

    /// Validates and applies a change request.
    ///
    /// Returns the names of the elements whose value changed, in element
    /// order. Every element is validated before anything is written, so a
    /// rejected request leaves the property untouched. The lifecycle state
    /// is left alone; the owning device decides whether to go `Busy`.
    ///
    /// # Errors
    ///
    /// `Permission` for read-only properties, `UnknownProperty` or
    /// `KindMismatch` if the request targets another property, and
    /// `UnknownElement` or `Validation` for bad element values.
    pub fn apply_change(&mut self, request: &NewVector) -> ModelResult<Vec<String>> {
        self.check_target(request.kind, &request.device, &request.name)?;
        if !self.permission.is_writable() {
            return Err(ModelError::Permission {
                device: self.device.clone(),
                property: self.name.clone(),
            });
        }

        let updates = self.decode_updates(&request.elements, true)?;
        let changed = if self.kind == PropertyKind::Switch {
            let requested: Vec<(usize, SwitchStatus)> = updates
                .iter()
                .filter_map(|(index, value)| match value {
                    ElementValue::Switch(status) => Some((*index, *status)),
                    _ => None,
                })
                .collect();
            let resolved = self.resolve_switches(&requested);
            self.assign_switches(resolved)
        } else {
            self.assign(updates)
        };

        if !changed.is_empty() {
            self.timestamp = now_timestamp();
        }
        Ok(changed)
    }

    /// Mirrors a device-reported update into this property.
    ///
    /// Used by clients that track remote state. The device is authoritative,
    /// so neither permissions, ranges nor switch rules are enforced, but an
    /// unknown element still rejects the whole update.
    pub fn apply_set(&mut self, update: &SetVector) -> ModelResult<Vec<String>> {
        self.check_target(update.kind, &update.device, &update.name)?;
        let updates = self.decode_updates(&update.elements, false)?;
        let changed = self.assign(updates);

        if let Some(state) = update.state {
            self.set_state(state);
        }
        if let Some(timeout) = update.timeout {
            self.timeout = clamp_timeout(timeout);
        }
        self.timestamp = update.timestamp.clone().unwrap_or_else(now_timestamp);
        Ok(changed)
    }

    /// Replaces one element's value from device-side logic.
    ///
    /// Switch rules are not applied here.
    pub fn update(&mut self, element: &str, value: ElementValue) -> ModelResult<()> {
        let index = self.index_of(element)?;
        self.elements[index].set_value(value)?;
        self.timestamp = now_timestamp();
        Ok(())
    }

    /// Renders the current state as a definition or a full update.
    pub fn render(&self, kind: RenderKind) -> Message {
        match kind {
            RenderKind::Define => Message::Define(self.to_def()),
            RenderKind::Set => Message::Set(self.to_set()),
        }
    }

    /// Renders the full definition.
    pub fn to_def(&self) -> DefVector {
        DefVector {
            kind: self.kind,
            device: self.device.clone(),
            name: self.name.clone(),
            label: Some(self.label.clone()),
            group: Some(self.group.clone()),
            state: self.state,
            permission: (self.kind != PropertyKind::Light).then_some(self.permission),
            rule: self.rule,
            timeout: (self.kind != PropertyKind::Light).then_some(f64::from(self.timeout)),
            timestamp: Some(self.timestamp.clone()),
            message: None,
            elements: self.elements.iter().map(Element::to_def).collect(),
        }
    }

    /// Renders an update carrying every element.
    pub fn to_set(&self) -> SetVector {
        self.set_of(self.elements.iter())
    }

    /// Renders an update carrying only the named elements, in element order.
    pub fn to_set_changed(&self, names: &[String]) -> SetVector {
        self.set_of(
            self.elements
                .iter()
                .filter(|e| names.iter().any(|n| n == e.name())),
        )
    }

    fn set_of<'a>(&self, elements: impl Iterator<Item = &'a Element>) -> SetVector {
        SetVector {
            kind: self.kind,
            device: self.device.clone(),
            name: self.name.clone(),
            state: Some(self.state),
            timeout: (self.kind != PropertyKind::Light).then_some(f64::from(self.timeout)),
            timestamp: Some(self.timestamp.clone()),
            message: None,
            elements: elements
                .map(|e| OneElement {
                    name: e.name().to_string(),
                    value: e.value().to_wire(),
                })
                .collect(),
        }
    }

    fn check_target(&self, kind: PropertyKind, device: &str, name: &str) -> ModelResult<()> {
        if device != self.device || name != self.name {
            return Err(ModelError::UnknownProperty {
                device: device.to_string(),
                property: name.to_string(),
            });
        }
        if kind != self.kind {
            return Err(ModelError::KindMismatch {
                expected: self.kind.name(),
                actual: kind.name(),
            });
        }
        Ok(())
    }

    fn index_of(&self, element: &str) -> ModelResult<usize> {
        self.elements
            .iter()
            .position(|e| e.name() == element)
            .ok_or_else(|| ModelError::UnknownElement {
                property: self.name.clone(),
                element: element.to_string(),
            })
    }

    fn decode_updates(
        &self,
        elements: &[OneElement],
        enforce_range: bool,
    ) -> ModelResult<Vec<(usize, ElementValue)>> {
        elements
            .iter()
            .map(|one| {
                let index = self.index_of(one.name.trim())?;
                let element = &self.elements[index];
                let value = if enforce_range {
                    element.parse_wire(&one.value)?
                } else {
                    element.parse_reported(&one.value)?
                };
                Ok((index, value))
            })
            .collect()
    }

    fn assign(&mut self, updates: Vec<(usize, ElementValue)>) -> Vec<String> {
        let mut touched = vec![false; self.elements.len()];
        for (index, value) in updates {
            let element = &mut self.elements[index];
            if element.value() != &value {
                element.replace_value(value);
                touched[index] = true;
            }
        }
        self.names_where(&touched)
    }

    fn assign_switches(&mut self, statuses: Vec<SwitchStatus>) -> Vec<String> {
        let mut touched = vec![false; self.elements.len()];
        for ((element, status), flag) in self.elements.iter_mut().zip(statuses).zip(&mut touched) {
            if element.switch_status() != Some(status) {
                element.replace_value(ElementValue::Switch(status));
                *flag = true;
            }
        }
        self.names_where(&touched)
    }

    fn names_where(&self, touched: &[bool]) -> Vec<String> {
        self.elements
            .iter()
            .zip(touched)
            .filter(|(_, touched)| **touched)
            .map(|(e, _)| e.name().to_string())
            .collect()
    }

    /// Applies requested switch statuses in order under the selection rule.
    ///
    /// Turning an element ON under a one-of rule turns its siblings OFF, so
    /// the last ON wins. Turning OFF the only ON element of a one-of-many
    /// switch is ignored.
    fn resolve_switches(&self, requested: &[(usize, SwitchStatus)]) -> Vec<SwitchStatus> {
        let mut statuses: Vec<SwitchStatus> = self
            .elements
            .iter()
            .map(|e| e.switch_status().unwrap_or_default())
            .collect();
        let rule = self.rule.unwrap_or_default();

        for &(index, status) in requested {
            match (rule, status) {
                (SwitchRule::AnyOfMany, _) | (SwitchRule::AtMostOne, SwitchStatus::Off) => {
                    statuses[index] = status;
                }
                (_, SwitchStatus::On) => {
                    statuses.fill(SwitchStatus::Off);
                    statuses[index] = SwitchStatus::On;
                }
                (SwitchRule::OneOfMany, SwitchStatus::Off) => {
                    let others_on = statuses
                        .iter()
                        .enumerate()
                        .any(|(i, s)| i != index && s.is_on());
                    if others_on {
                        statuses[index] = SwitchStatus::Off;
                    }
                }
            }
        }
        statuses
    }

    /// Keeps only the last ON element of a one-of switch.
    fn normalize_switches(&mut self) {
        let Some(rule) = self.rule else { return };
        if rule == SwitchRule::AnyOfMany {
            return;
        }
        let Some(last_on) = self
            .elements
            .iter()
            .rposition(|e| e.switch_status() == Some(SwitchStatus::On))
        else {
            return;
        };
        for (index, element) in self.elements.iter_mut().enumerate() {
            if index != last_on && element.switch_status() == Some(SwitchStatus::On) {
                element.replace_value(ElementValue::Switch(SwitchStatus::Off));
            }
        }
    }
}
