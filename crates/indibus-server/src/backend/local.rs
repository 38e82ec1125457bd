//! In-process drivers.
//!
//! The broker calls the driver's handlers directly; [`DriverContext`] turns
//! what the driver emits back into messages so the broker treats it like any
//! other backend. Inbound messages are handled one at a time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use indibus_core::{Device, Message, PropertyState, TextMessage, now_timestamp};
use indibus_protocol::DriverKind;

use super::{DeviceBackend, DeviceLink};
use crate::error::{ServerError, ServerResult};

/// A driver compiled into the broker.
pub trait Driver: Send {
    /// Called once after the backend starts.
    fn start(&mut self, _ctx: &DriverContext) {}

    /// Called for every message routed to this driver.
    fn handle(&mut self, message: &Message, ctx: &DriverContext);

    /// Called periodically; used for busy timeouts and simulated progress.
    fn tick(&mut self, _now: DateTime<Utc>, _ctx: &DriverContext) {}
}

/// Creates a fresh driver instance for each load.
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Emits messages on behalf of an in-process driver.
#[derive(Debug, Clone)]
pub struct DriverContext {
    tx: mpsc::UnboundedSender<Message>,
}

impl DriverContext {
    pub fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Driver output dropped, backend is gone");
        }
    }

    /// Sends an update carrying only the named elements, or none at all
    /// when `changed` is empty (a state-only update).
    pub fn update(&self, device: &Device, property: &str, changed: &[String]) {
        if let Some(property) = device.property(property) {
            self.send(Message::Set(property.to_set_changed(changed)));
        }
    }

    /// Sends a free-text message scoped to `device`.
    pub fn notify(&self, device: &str, text: impl Into<String>) {
        self.send(Message::Notify(TextMessage {
            device: Some(device.to_string()),
            timestamp: Some(now_timestamp()),
            message: text.into(),
        }));
    }

    /// Moves properties whose busy timeout elapsed to alert and reports them.
    pub fn expire_busy(&self, device: &mut Device, now: DateTime<Utc>) {
        for update in device.expire_busy(now) {
            debug!(device = %device.name(), property = ?update.property(), "Busy timeout expired");
            self.send(update);
        }
    }

    /// Sets a property state and reports it without element values.
    pub fn set_state(&self, device: &mut Device, property: &str, state: PropertyState) {
        if let Some(p) = device.property_mut(property) {
            p.set_state(state);
            self.send(Message::Set(p.to_set_changed(&[])));
        }
    }
}

/// Backend running a [`Driver`] on a broker task.
pub struct LocalBackend {
    id: String,
    factory: DriverFactory,
    tick: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl LocalBackend {
    pub fn new(id: impl Into<String>, factory: DriverFactory) -> Self {
        Self {
            id: id.into(),
            factory,
            tick: Duration::from_millis(500),
            shutdown: Mutex::new(None),
        }
    }

    /// Sets the period of [`Driver::tick`].
    pub fn with_tick(mut self, period: Duration) -> Self {
        self.tick = period;
        self
    }
}

impl DeviceBackend for LocalBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Builtin
    }

    fn identifiers(&self) -> Vec<String> {
        vec![format!("class+-+{}", self.id), self.id.clone()]
    }

    fn start(&self) -> BoxFuture<'_, ServerResult<DeviceLink>> {
        Box::pin(async move {
            let (link, incoming_tx, mut outgoing_rx) = DeviceLink::pair();
            let (stop_tx, mut stop_rx) = watch::channel(false);
            {
                let mut slot = self
                    .shutdown
                    .lock()
                    .map_err(|_| ServerError::device_start(&self.id, "backend state poisoned"))?;
                if slot.is_some() {
                    return Err(ServerError::already_loaded(&self.id));
                }
                *slot = Some(stop_tx);
            }

            let mut driver = (self.factory)();
            let ctx = DriverContext { tx: incoming_tx };
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let id = self.id.clone();

            tokio::spawn(async move {
                driver.start(&ctx);
                loop {
                    tokio::select! {
                        message = outgoing_rx.recv() => match message {
                            Some(message) => driver.handle(&message, &ctx),
                            None => break,
                        },
                        _ = ticker.tick() => driver.tick(Utc::now(), &ctx),
                        _ = stop_rx.changed() => break,
                    }
                }
                debug!(driver = %id, "Driver stopped");
            });
            Ok(link)
        })
    }

    fn destroy(&self) {
        if let Ok(mut slot) = self.shutdown.lock()
            && let Some(tx) = slot.take()
        {
            let _ = tx.send(true);
        }
    }
}
