//! Built-in simulated camera.
//!
//! `demo_camera` exercises the whole property lifecycle without hardware:
//! exposures go `Busy` and count down, the frame arrives as a BLOB, and
//! the cooler ramps towards its set point one step per tick.

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use indibus_core::{
    BlobValue, Device, Element, ElementValue, Message, ModelError, ModelResult, NewVector,
    NumberFormat, NumberValue, PropertyKind, PropertyPermission, PropertyState, SwitchRule,
    SwitchStatus,
};
use indibus_server::{Driver, DriverContext};

/// Id the camera is registered under.
pub const DEMO_CAMERA_ID: &str = "demo_camera";

/// Device name the camera announces.
pub const DEMO_CAMERA_DEVICE: &str = "Demo Camera";

const CONNECTION: &str = "CONNECTION";
const EXPOSURE: &str = "CCD_EXPOSURE";
const EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
const ABORT: &str = "CCD_ABORT_EXPOSURE";
const TEMPERATURE: &str = "CCD_TEMPERATURE";
const TEMPERATURE_VALUE: &str = "CCD_TEMPERATURE_VALUE";
const FRAME: &str = "CCD1";

const FRAME_WIDTH: usize = 64;
const FRAME_HEIGHT: usize = 48;
const AMBIENT_TEMPERATURE: f64 = 20.0;
/// Degrees the cooler moves per tick.
const COOLING_STEP: f64 = 0.5;

struct Exposure {
    started: DateTime<Utc>,
    seconds: f64,
}

/// Simulated camera driver.
pub struct DemoCamera {
    device: Device,
    exposure: Option<Exposure>,
    cooler_target: Option<f64>,
    temperature: f64,
    frames: u64,
}

impl Default for DemoCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoCamera {
    pub fn new() -> Self {
        let device = build_device().unwrap_or_else(|e| {
            error!(error = %e, "Demo camera properties are invalid");
            Device::new(DEMO_CAMERA_DEVICE)
        });
        Self {
            device,
            exposure: None,
            cooler_target: None,
            temperature: AMBIENT_TEMPERATURE,
            frames: 0,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn connected(&self) -> bool {
        self.device
            .property(CONNECTION)
            .and_then(|p| p.element("CONNECT"))
            .and_then(Element::switch_status)
            .is_some_and(|s| s.is_on())
    }

    fn handle_new(&mut self, request: &NewVector, ctx: &DriverContext) {
        if request.name != CONNECTION && !self.connected() {
            self.reject(&request.name, "camera is not connected", ctx);
            return;
        }

        let changed = match self.device.apply_new_vector(request) {
            Ok(changed) => changed,
            Err(e) => {
                self.reject(&request.name, &e.to_string(), ctx);
                return;
            }
        };

        let result = match request.name.as_str() {
            CONNECTION => self.on_connection(&changed, ctx),
            EXPOSURE => self.on_exposure(&changed, ctx),
            ABORT => self.on_abort(ctx),
            TEMPERATURE => self.on_temperature(ctx),
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.reject(&request.name, &e.to_string(), ctx);
        }
    }

    fn on_connection(&mut self, changed: &[String], ctx: &DriverContext) -> ModelResult<()> {
        if !self.connected() {
            self.exposure = None;
            self.cooler_target = None;
        }
        if let Some(p) = self.device.property_mut(CONNECTION) {
            p.set_state(PropertyState::Ok);
        }
        ctx.update(&self.device, CONNECTION, changed);
        Ok(())
    }

    fn on_exposure(&mut self, changed: &[String], ctx: &DriverContext) -> ModelResult<()> {
        let seconds = self.number(EXPOSURE, EXPOSURE_VALUE)?;
        self.exposure = Some(Exposure {
            started: Utc::now(),
            seconds,
        });
        debug!(seconds, "Exposure started");
        ctx.set_state(&mut self.device, FRAME, PropertyState::Busy);
        if let Some(p) = self.device.property_mut(EXPOSURE) {
            p.set_state(PropertyState::Busy);
        }
        ctx.update(&self.device, EXPOSURE, changed);
        Ok(())
    }

    fn on_abort(&mut self, ctx: &DriverContext) -> ModelResult<()> {
        if self.exposure.take().is_some() {
            self.set_number(EXPOSURE, EXPOSURE_VALUE, 0.0)?;
            if let Some(p) = self.device.property_mut(EXPOSURE) {
                p.set_state(PropertyState::Alert);
            }
            ctx.update(&self.device, EXPOSURE, &[EXPOSURE_VALUE.to_string()]);
            ctx.set_state(&mut self.device, FRAME, PropertyState::Idle);
            ctx.notify(DEMO_CAMERA_DEVICE, "Exposure aborted");
        }
        let abort = self
            .device
            .property_mut(ABORT)
            .ok_or_else(|| unknown_property(ABORT))?;
        abort.update("ABORT", ElementValue::Switch(SwitchStatus::Off))?;
        abort.set_state(PropertyState::Ok);
        ctx.update(&self.device, ABORT, &["ABORT".to_string()]);
        Ok(())
    }

    /// The requested value is the set point; the element keeps showing the
    /// sensor reading.
    fn on_temperature(&mut self, ctx: &DriverContext) -> ModelResult<()> {
        let target = self.number(TEMPERATURE, TEMPERATURE_VALUE)?;
        self.set_number(TEMPERATURE, TEMPERATURE_VALUE, self.temperature)?;
        if (target - self.temperature).abs() < f64::EPSILON {
            ctx.set_state(&mut self.device, TEMPERATURE, PropertyState::Ok);
            return Ok(());
        }
        self.cooler_target = Some(target);
        ctx.set_state(&mut self.device, TEMPERATURE, PropertyState::Busy);
        Ok(())
    }

    fn progress_exposure(&mut self, now: DateTime<Utc>, ctx: &DriverContext) -> ModelResult<()> {
        let Some(exposure) = &self.exposure else {
            return Ok(());
        };
        // An expired busy timeout already moved the property to Alert.
        if self.device.property(EXPOSURE).map(|p| p.state()) != Some(PropertyState::Busy) {
            self.exposure = None;
            return Ok(());
        }

        let elapsed = (now - exposure.started).num_milliseconds() as f64 / 1000.0;
        let remaining = (exposure.seconds - elapsed).max(0.0);
        self.set_number(EXPOSURE, EXPOSURE_VALUE, remaining)?;
        if remaining > 0.0 {
            ctx.update(&self.device, EXPOSURE, &[EXPOSURE_VALUE.to_string()]);
            return Ok(());
        }

        self.exposure = None;
        self.frames += 1;
        let frame = self
            .device
            .property_mut(FRAME)
            .ok_or_else(|| unknown_property(FRAME))?;
        frame.update(FRAME, ElementValue::Blob(synthetic_frame(self.frames)))?;
        frame.set_state(PropertyState::Ok);
        ctx.update(&self.device, FRAME, &[FRAME.to_string()]);

        if let Some(p) = self.device.property_mut(EXPOSURE) {
            p.set_state(PropertyState::Ok);
        }
        ctx.update(&self.device, EXPOSURE, &[EXPOSURE_VALUE.to_string()]);
        debug!(frame = self.frames, "Exposure complete");
        Ok(())
    }

    fn progress_cooler(&mut self, ctx: &DriverContext) -> ModelResult<()> {
        let Some(target) = self.cooler_target else {
            return Ok(());
        };
        let delta = target - self.temperature;
        let reached = delta.abs() <= COOLING_STEP;
        self.temperature = if reached {
            target
        } else {
            self.temperature + COOLING_STEP.copysign(delta)
        };
        self.set_number(TEMPERATURE, TEMPERATURE_VALUE, self.temperature)?;
        if reached {
            self.cooler_target = None;
            if let Some(p) = self.device.property_mut(TEMPERATURE) {
                p.set_state(PropertyState::Ok);
            }
        }
        ctx.update(&self.device, TEMPERATURE, &[TEMPERATURE_VALUE.to_string()]);
        Ok(())
    }

    /// Reports a refused request: the property goes to `Alert` and the
    /// reason is sent as a device message.
    fn reject(&mut self, property: &str, reason: &str, ctx: &DriverContext) {
        debug!(property, reason, "Request rejected");
        ctx.set_state(&mut self.device, property, PropertyState::Alert);
        ctx.notify(DEMO_CAMERA_DEVICE, format!("{property}: {reason}"));
    }

    fn number(&self, property: &str, element: &str) -> ModelResult<f64> {
        match self
            .device
            .property(property)
            .and_then(|p| p.element(element))
            .map(Element::value)
        {
            Some(ElementValue::Number(number)) => Ok(number.value),
            _ => Err(unknown_element(property, element)),
        }
    }

    fn set_number(&mut self, property: &str, element: &str, value: f64) -> ModelResult<()> {
        let target = self
            .device
            .property_mut(property)
            .ok_or_else(|| unknown_property(property))?;
        let format = match target.element(element).map(Element::value) {
            Some(ElementValue::Number(number)) => number.format.clone(),
            _ => return Err(unknown_element(property, element)),
        };
        target.update(element, ElementValue::Number(NumberValue { value, format }))
    }
}

impl Driver for DemoCamera {
    fn handle(&mut self, message: &Message, ctx: &DriverContext) {
        match message {
            Message::GetProperties(request) => {
                for def in self.device.handle_get_properties(request) {
                    ctx.send(def);
                }
            }
            Message::New(request) if request.device == DEMO_CAMERA_DEVICE => {
                self.handle_new(request, ctx);
            }
            _ => {}
        }
    }

    fn tick(&mut self, now: DateTime<Utc>, ctx: &DriverContext) {
        ctx.expire_busy(&mut self.device, now);
        if let Err(e) = self.progress_exposure(now, ctx) {
            error!(error = %e, "Exposure update failed");
        }
        if let Err(e) = self.progress_cooler(ctx) {
            error!(error = %e, "Cooler update failed");
        }
    }
}

fn unknown_property(property: &str) -> ModelError {
    ModelError::UnknownProperty {
        device: DEMO_CAMERA_DEVICE.to_string(),
        property: property.to_string(),
    }
}

fn unknown_element(property: &str, element: &str) -> ModelError {
    ModelError::UnknownElement {
        property: property.to_string(),
        element: element.to_string(),
    }
}

fn build_device() -> ModelResult<Device> {
    let mut device = Device::new(DEMO_CAMERA_DEVICE);

    let connection = device
        .property_builder(CONNECTION, PropertyKind::Switch)
        .with_label("Connection")
        .with_group("Main Control")
        .with_rule(SwitchRule::OneOfMany)
        .with_element(Element::switch("CONNECT", "Connect", SwitchStatus::Off))
        .with_element(Element::switch("DISCONNECT", "Disconnect", SwitchStatus::On))
        .build()?;

    let exposure = device
        .property_builder(EXPOSURE, PropertyKind::Number)
        .with_label("Expose")
        .with_group("Main Control")
        .with_timeout(60.0)
        .with_element(Element::number(
            EXPOSURE_VALUE,
            "Duration (s)",
            1.0,
            NumberFormat {
                format: "%5.2f".into(),
                min: 0.001,
                max: 3600.0,
                step: 1.0,
            },
        ))
        .build()?;

    let abort = device
        .property_builder(ABORT, PropertyKind::Switch)
        .with_label("Abort")
        .with_group("Main Control")
        .with_rule(SwitchRule::AtMostOne)
        .with_element(Element::switch("ABORT", "Abort", SwitchStatus::Off))
        .build()?;

    let temperature = device
        .property_builder(TEMPERATURE, PropertyKind::Number)
        .with_label("Temperature")
        .with_group("Main Control")
        .with_timeout(0.0)
        .with_element(Element::number(
            TEMPERATURE_VALUE,
            "Temperature (C)",
            AMBIENT_TEMPERATURE,
            NumberFormat {
                format: "%5.2f".into(),
                min: -50.0,
                max: 50.0,
                step: 0.5,
            },
        ))
        .build()?;

    let frame = device
        .property_builder(FRAME, PropertyKind::Blob)
        .with_label("Image Data")
        .with_group("Image Info")
        .with_permission(PropertyPermission::ReadOnly)
        .with_element(Element::blob(FRAME, "Image"))
        .build()?;

    for property in [connection, exposure, abort, temperature, frame] {
        device.define(property)?;
    }
    Ok(device)
}

/// A gradient frame whose offset changes with every exposure.
fn synthetic_frame(sequence: u64) -> BlobValue {
    let data = (0..FRAME_WIDTH * FRAME_HEIGHT)
        .map(|i| ((i % FRAME_WIDTH) as u64 + (i / FRAME_WIDTH) as u64 + sequence) as u8)
        .collect();
    BlobValue::new(".raw", data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indibus_core::{GetProperties, OneElement, WireValue};
    use indibus_server::{DeviceBackend, DeviceLink, LocalBackend};
    use std::sync::Arc;
    use std::time::Duration;

    async fn start() -> (LocalBackend, DeviceLink) {
        let backend = LocalBackend::new(
            DEMO_CAMERA_ID,
            Arc::new(|| Box::new(DemoCamera::new()) as Box<dyn Driver>),
        )
        .with_tick(Duration::from_millis(10));
        let link = backend.start().await.unwrap();
        (backend, link)
    }

    fn send(link: &DeviceLink, message: Message) {
        link.outgoing.send(Arc::new(message)).unwrap();
    }

    async fn next_matching<F>(link: &mut DeviceLink, wanted: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = link.incoming.recv().await.unwrap();
                if wanted(&message) {
                    return message;
                }
            }
        })
        .await
        .unwrap()
    }

    fn connect() -> Message {
        Message::New(
            NewVector::new(PropertyKind::Switch, DEMO_CAMERA_DEVICE, CONNECTION)
                .with_element(OneElement::switch("CONNECT", SwitchStatus::On)),
        )
    }

    fn expose(seconds: f64) -> Message {
        Message::New(
            NewVector::new(PropertyKind::Number, DEMO_CAMERA_DEVICE, EXPOSURE)
                .with_element(OneElement::number(EXPOSURE_VALUE, seconds)),
        )
    }

    #[test]
    fn defines_all_properties() {
        let camera = DemoCamera::new();
        let names: Vec<&str> = camera.device().properties().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec![CONNECTION, EXPOSURE, ABORT, TEMPERATURE, FRAME]);
        assert!(!camera.connected());
    }

    #[test]
    fn frames_differ_between_exposures() {
        let first = synthetic_frame(1);
        assert_eq!(first.size, FRAME_WIDTH * FRAME_HEIGHT);
        assert_ne!(first.data, synthetic_frame(2).data);
    }

    #[tokio::test]
    async fn answers_discovery() {
        let (_backend, mut link) = start().await;
        send(&link, Message::GetProperties(GetProperties::all()));
        let mut names = Vec::new();
        for _ in 0..5 {
            match next_matching(&mut link, |_| true).await {
                Message::Define(def) => names.push(def.name),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(names, vec![CONNECTION, EXPOSURE, ABORT, TEMPERATURE, FRAME]);

        // Requests for another device yield nothing; the next frame is the
        // answer to the follow-up request.
        send(&link, Message::GetProperties(GetProperties::device("Mount")));
        send(&link, Message::GetProperties(GetProperties::property(DEMO_CAMERA_DEVICE, FRAME)));
        let def = next_matching(&mut link, |_| true).await;
        assert!(matches!(def, Message::Define(d) if d.name == FRAME));
    }

    #[tokio::test]
    async fn exposure_requires_connection() {
        let (_backend, mut link) = start().await;
        send(&link, expose(0.1));
        let update = next_matching(&mut link, |m| matches!(m, Message::Set(_))).await;
        let Message::Set(update) = update else { unreachable!() };
        assert_eq!(update.name, EXPOSURE);
        assert_eq!(update.state, Some(PropertyState::Alert));
        let note = next_matching(&mut link, |m| matches!(m, Message::Notify(_))).await;
        assert!(matches!(note, Message::Notify(t) if t.message.contains("not connected")));
    }

    #[tokio::test]
    async fn exposure_produces_a_frame() {
        let (_backend, mut link) = start().await;
        send(&link, connect());
        let update = next_matching(&mut link, |m| matches!(m, Message::Set(s) if s.name == CONNECTION)).await;
        let Message::Set(update) = update else { unreachable!() };
        assert_eq!(update.state, Some(PropertyState::Ok));

        send(&link, expose(0.05));
        let busy = next_matching(&mut link, |m| matches!(m, Message::Set(s) if s.name == EXPOSURE)).await;
        assert!(matches!(busy, Message::Set(s) if s.state == Some(PropertyState::Busy)));

        let frame = next_matching(&mut link, |m| {
            matches!(m, Message::Set(s) if s.name == FRAME && s.state == Some(PropertyState::Ok))
        })
        .await;
        let Message::Set(frame) = frame else { unreachable!() };
        match &frame.elements[0].value {
            WireValue::Blob(blob) => {
                assert_eq!(blob.format, ".raw");
                assert_eq!(blob.data.len(), FRAME_WIDTH * FRAME_HEIGHT);
            }
            other => panic!("expected a blob, got {other:?}"),
        }

        let done = next_matching(&mut link, |m| matches!(m, Message::Set(s) if s.name == EXPOSURE)).await;
        assert!(matches!(done, Message::Set(s) if s.state == Some(PropertyState::Ok)));
    }

    #[tokio::test]
    async fn out_of_range_exposure_is_refused() {
        let (_backend, mut link) = start().await;
        send(&link, connect());
        send(&link, expose(7200.0));
        let update = next_matching(&mut link, |m| matches!(m, Message::Set(s) if s.name == EXPOSURE)).await;
        assert!(matches!(update, Message::Set(s) if s.state == Some(PropertyState::Alert)));
    }

    #[tokio::test]
    async fn abort_stops_the_exposure() {
        let (_backend, mut link) = start().await;
        send(&link, connect());
        send(&link, expose(60.0));
        next_matching(&mut link, |m| {
            matches!(m, Message::Set(s) if s.name == EXPOSURE && s.state == Some(PropertyState::Busy))
        })
        .await;

        send(
            &link,
            Message::New(
                NewVector::new(PropertyKind::Switch, DEMO_CAMERA_DEVICE, ABORT)
                    .with_element(OneElement::switch("ABORT", SwitchStatus::On)),
            ),
        );
        next_matching(&mut link, |m| {
            matches!(m, Message::Set(s) if s.name == EXPOSURE && s.state == Some(PropertyState::Alert))
        })
        .await;
        let abort = next_matching(&mut link, |m| matches!(m, Message::Set(s) if s.name == ABORT)).await;
        let Message::Set(abort) = abort else { unreachable!() };
        assert_eq!(abort.state, Some(PropertyState::Ok));
        assert_eq!(abort.elements[0].value.as_scalar(), Some("Off"));
    }

    #[tokio::test]
    async fn cooler_ramps_to_set_point() {
        let (_backend, mut link) = start().await;
        send(&link, connect());
        send(
            &link,
            Message::New(
                NewVector::new(PropertyKind::Number, DEMO_CAMERA_DEVICE, TEMPERATURE)
                    .with_element(OneElement::number(TEMPERATURE_VALUE, 19.0)),
            ),
        );
        let busy = next_matching(&mut link, |m| matches!(m, Message::Set(s) if s.name == TEMPERATURE)).await;
        assert!(matches!(busy, Message::Set(s) if s.state == Some(PropertyState::Busy)));

        let settled = next_matching(&mut link, |m| {
            matches!(m, Message::Set(s) if s.name == TEMPERATURE && s.state == Some(PropertyState::Ok))
        })
        .await;
        let Message::Set(settled) = settled else { unreachable!() };
        let value: f64 = settled.elements[0].value.as_scalar().unwrap().parse().unwrap();
        assert_eq!(value, 19.0);
    }
}
