//! Devices: a named, ordered set of properties.

use chrono::{DateTime, Utc};

use crate::error::{ModelError, ModelResult};
use crate::message::{DelProperty, GetProperties, Message, NewVector};
use crate::property::{Property, PropertyBuilder, RenderKind};
use crate::time::now_timestamp;
use crate::types::{PropertyKind, PropertyState};

/// A device owning its properties in definition order.
#[derive(Debug, Clone, Default)]
pub struct Device {
    name: String,
    properties: Vec<Property>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts a property builder bound to this device.
    pub fn property_builder(&self, name: impl Into<String>, kind: PropertyKind) -> PropertyBuilder {
        PropertyBuilder::new(self.name.clone(), name, kind)
    }

    /// Adds a property and returns its definition message.
    ///
    /// # Errors
    ///
    /// `DuplicateProperty` if the name is taken, `UnknownProperty` if the
    /// property was built for another device.
    pub fn define(&mut self, property: Property) -> ModelResult<Message> {
        if property.device() != self.name {
            return Err(ModelError::UnknownProperty {
                device: self.name.clone(),
                property: property.name().to_string(),
            });
        }
        if self.property(property.name()).is_some() {
            return Err(ModelError::DuplicateProperty {
                device: self.name.clone(),
                property: property.name().to_string(),
            });
        }
        let def = property.render(RenderKind::Define);
        self.properties.push(property);
        Ok(def)
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name() == name)
    }

    /// Removes a property and returns the matching deletion message.
    pub fn remove(&mut self, name: &str) -> Option<Message> {
        let index = self.properties.iter().position(|p| p.name() == name)?;
        self.properties.remove(index);
        let mut del = DelProperty::property(self.name.clone(), name);
        del.timestamp = Some(now_timestamp());
        Some(Message::Delete(del))
    }

    /// Removes every property and returns the device-wide deletion.
    pub fn remove_all(&mut self) -> Message {
        self.properties.clear();
        let mut del = DelProperty::device(self.name.clone());
        del.timestamp = Some(now_timestamp());
        Message::Delete(del)
    }

    /// Renders the definitions a discovery request asks for.
    ///
    /// Requests for other devices or unknown properties yield nothing.
    pub fn handle_get_properties(&self, request: &GetProperties) -> Vec<Message> {
        if !request.matches_device(&self.name) {
            return Vec::new();
        }
        self.properties
            .iter()
            .filter(|p| request.name.as_deref().is_none_or(|n| n == p.name()))
            .map(|p| p.render(RenderKind::Define))
            .collect()
    }

    /// Applies a change request to the named property.
    ///
    /// Returns the names of the elements that changed.
    pub fn apply_new_vector(&mut self, request: &NewVector) -> ModelResult<Vec<String>> {
        if request.device != self.name {
            return Err(ModelError::UnknownProperty {
                device: request.device.clone(),
                property: request.name.clone(),
            });
        }
        let property = self
            .property_mut(&request.name)
            .ok_or_else(|| ModelError::UnknownProperty {
                device: request.device.clone(),
                property: request.name.clone(),
            })?;
        property.apply_change(request)
    }

    /// Moves properties whose busy timeout elapsed to `Alert`.
    ///
    /// Returns one update per property that changed state.
    pub fn expire_busy(&mut self, now: DateTime<Utc>) -> Vec<Message> {
        self.properties
            .iter_mut()
            .filter(|p| p.busy_expired(now))
            .map(|p| {
                p.set_state(PropertyState::Alert);
                let mut set = p.to_set_changed(&[]);
                set.message = Some(format!("{} timed out", p.name()));
                Message::Set(set)
            })
            .collect()
    }
}
