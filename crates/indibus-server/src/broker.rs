//! Routing core.
//!
//! The broker owns one registry of connected clients and device backends,
//! guarded by a single lock. [`Broker::route`] takes a decoded message and
//! its origin and queues it on the outboxes of the peers that should see it.
//! Outboxes are unbounded and drained by one writer task per peer, so
//! routing never waits on a socket.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use indibus_core::{DelProperty, GetProperties, Message, now_timestamp};
use indibus_protocol::DeviceInfo;

use crate::backend::DeviceBackend;
use crate::error::{ServerError, ServerResult};
use crate::events::{AcceptPolicy, ConnectionInfo, PeerId, ServerEventHandler};
use crate::listener::{Listener, Outbox};

/// A registered client connection.
struct ClientPeer {
    listener: Listener,
    outbox: Outbox,
}

/// A registered device backend. It also listens, for snooping.
struct DevicePeer {
    listener: Listener,
    outbox: Outbox,
    backend: Arc<dyn DeviceBackend>,
    identifiers: Vec<String>,
    /// Device names learned from the messages it emitted.
    names: BTreeSet<String>,
}

#[derive(Default)]
struct Registry {
    next_id: PeerId,
    clients: HashMap<PeerId, ClientPeer>,
    devices: HashMap<PeerId, DevicePeer>,
    /// Identifiers of backends that are still starting.
    claimed: HashSet<String>,
    shutting_down: bool,
}

impl Registry {
    fn carries(&self, identifier: &str) -> bool {
        self.claimed.contains(identifier)
            || self
                .devices
                .values()
                .any(|d| d.identifiers.iter().any(|i| i == identifier))
    }

    fn allocate(&mut self) -> PeerId {
        self.next_id += 1;
        self.next_id
    }

    fn listener_mut(&mut self, peer: PeerId) -> Option<&mut Listener> {
        if let Some(client) = self.clients.get_mut(&peer) {
            return Some(&mut client.listener);
        }
        self.devices.get_mut(&peer).map(|d| &mut d.listener)
    }

    fn listener(&self, peer: PeerId) -> Option<&Listener> {
        if let Some(client) = self.clients.get(&peer) {
            return Some(&client.listener);
        }
        self.devices.get(&peer).map(|d| &d.listener)
    }

    /// Backend that announced `device`.
    fn owner_of(&self, device: &str) -> Option<PeerId> {
        self.devices
            .iter()
            .find(|(_, d)| d.names.contains(device))
            .map(|(id, _)| *id)
    }

    /// Every listening peer except `skip`: clients first, then snooping devices.
    fn listeners(&self, skip: PeerId) -> impl Iterator<Item = (&Listener, &Outbox)> {
        let clients = self.clients.values().map(|c| (&c.listener, &c.outbox));
        let devices = self
            .devices
            .iter()
            .filter(move |(id, _)| **id != skip)
            .map(|(_, d)| (&d.listener, &d.outbox));
        clients.chain(devices)
    }

    /// Queues `message` on every listener accepted by `wants`.
    fn fan_out<F>(&self, origin: PeerId, message: Message, wants: F) -> usize
    where
        F: Fn(&Listener) -> bool,
    {
        let message = Arc::new(message);
        let mut delivered = 0;
        for (listener, outbox) in self.listeners(origin) {
            if wants(listener) && listener.admits(&message) && outbox.send(message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Removes `device` from routing and tells everyone who watched it.
    fn drop_device_name(&mut self, origin: PeerId, device: &str, deletion: Message) -> usize {
        for peer in self.devices.values_mut() {
            peer.names.remove(device);
        }
        let delivered = self.fan_out(origin, deletion, |l| l.listens_to_any_of(device));
        for client in self.clients.values_mut() {
            client.listener.prune(device, None);
        }
        for peer in self.devices.values_mut() {
            peer.listener.prune(device, None);
        }
        delivered
    }
}

/// Accepted client: its id and the queue its writer task drains.
pub struct ClientRegistration {
    pub id: PeerId,
    pub outbox: tokio::sync::mpsc::UnboundedReceiver<Arc<Message>>,
}

/// Identifiers reserved through [`Broker::claim_identifiers`].
pub struct IdentifierClaim<'a> {
    broker: &'a Broker,
    identifiers: Vec<String>,
}

impl Drop for IdentifierClaim<'_> {
    fn drop(&mut self) {
        let mut registry = self.broker.lock();
        for id in &self.identifiers {
            registry.claimed.remove(id);
        }
    }
}

/// The broker.
pub struct Broker {
    registry: Mutex<Registry>,
    policies: Vec<Box<dyn AcceptPolicy>>,
    handlers: Vec<Arc<dyn ServerEventHandler>>,
    started_at: DateTime<Utc>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            policies: Vec::new(),
            handlers: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Builder: append an accept policy. Policies run in insertion order.
    pub fn with_accept_policy(mut self, policy: impl AcceptPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    /// Builder: add a lifecycle observer.
    pub fn with_event_handler(mut self, handler: Arc<dyn ServerEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while routing leaves the tables consistent enough to keep
        // serving; recover the guard rather than poisoning every connection.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, f: impl Fn(&dyn ServerEventHandler)) {
        for handler in &self.handlers {
            f(handler.as_ref());
        }
    }

    /// Runs the accept policies and registers a client if they all agree.
    ///
    /// Returns `None` when the connection must be closed without any
    /// protocol exchange.
    pub fn accept_connection(&self, info: &ConnectionInfo) -> Option<ClientRegistration> {
        if let Some(policy) = self.policies.iter().find(|p| !p.accept(info)) {
            self.notify(|h| h.connection_rejected(info.peer, policy.name()));
            return None;
        }

        let registration = {
            let mut registry = self.lock();
            if registry.shutting_down {
                return None;
            }
            let id = registry.allocate();
            let (outbox, rx) = Outbox::channel(id);
            registry.clients.insert(
                id,
                ClientPeer {
                    listener: Listener::new(),
                    outbox,
                },
            );
            ClientRegistration { id, outbox: rx }
        };
        self.notify(|h| h.connection_established(registration.id, info.peer));
        Some(registration)
    }

    /// Registers a started backend and greets it with a discovery request.
    pub fn register_device(
        &self,
        backend: Arc<dyn DeviceBackend>,
        outgoing: tokio::sync::mpsc::UnboundedSender<Arc<Message>>,
    ) -> Option<PeerId> {
        let identifiers = backend.identifiers();
        let id = {
            let mut registry = self.lock();
            if registry.shutting_down {
                return None;
            }
            let id = registry.allocate();
            let outbox = Outbox::from_sender(id, outgoing);
            outbox.send(Arc::new(Message::GetProperties(GetProperties::all())));
            registry.devices.insert(
                id,
                DevicePeer {
                    listener: Listener::new(),
                    outbox,
                    backend,
                    identifiers: identifiers.clone(),
                    names: BTreeSet::new(),
                },
            );
            id
        };
        self.notify(|h| h.device_registered(id, &identifiers));
        Some(id)
    }

    /// True if a running or starting backend carries `identifier`.
    pub fn is_loaded(&self, identifier: &str) -> bool {
        self.lock().carries(identifier)
    }

    /// Reserves `identifiers` for a backend about to start.
    ///
    /// The reservation lasts until the returned claim is dropped; keep it
    /// alive until the backend is registered.
    ///
    /// # Errors
    ///
    /// `AlreadyLoaded` if any identifier is running or already claimed.
    pub fn claim_identifiers(&self, identifiers: &[String]) -> ServerResult<IdentifierClaim<'_>> {
        let mut registry = self.lock();
        if let Some(taken) = identifiers.iter().find(|id| registry.carries(id)) {
            return Err(ServerError::already_loaded(taken.as_str()));
        }
        registry.claimed.extend(identifiers.iter().cloned());
        Ok(IdentifierClaim {
            broker: self,
            identifiers: identifiers.to_vec(),
        })
    }

    /// Routes one message received from `origin`.
    pub fn route(&self, origin: PeerId, message: Message) {
        let mut registry = self.lock();
        let from_device = registry.devices.contains_key(&origin);
        if !from_device && !registry.clients.contains_key(&origin) {
            trace!(peer = origin, "Dropping message from unregistered peer");
            return;
        }

        match message {
            Message::GetProperties(request) => {
                if !from_device && request.version.as_deref().is_none_or(str::is_empty) {
                    debug!(peer = origin, "Ignoring discovery request without version");
                    return;
                }
                if let Some(listener) = registry.listener_mut(origin) {
                    listener.listen(&request);
                }
                let target = request.device.as_deref().and_then(|d| registry.owner_of(d));
                let message = Arc::new(Message::GetProperties(request));
                for (id, device) in &registry.devices {
                    if *id == origin || target.is_some_and(|t| t != *id) {
                        continue;
                    }
                    device.outbox.send(message.clone());
                }
            }

            Message::New(request) => {
                let listening = registry
                    .listener(origin)
                    .is_some_and(|l| l.listens_to_property(&request.device, &request.name));
                if !listening {
                    debug!(
                        peer = origin,
                        device = %request.device,
                        property = %request.name,
                        "Dropping change request for undiscovered property"
                    );
                    return;
                }
                match registry
                    .owner_of(&request.device)
                    .and_then(|id| registry.devices.get(&id))
                {
                    Some(owner) => {
                        owner.outbox.send(Arc::new(Message::New(request)));
                    }
                    None => trace!(device = %request.device, "No backend owns device"),
                }
            }

            Message::EnableBlob(request) => {
                if let Some(listener) = registry.listener_mut(origin) {
                    listener.set_blob_policy(&request);
                }
            }

            message if !from_device => {
                debug!(peer = origin, tag = %message.tag_name(), "Ignoring device message from client");
            }

            Message::Define(def) => {
                learn_name(&mut registry, origin, &def.device);
                let (device, name) = (def.device.clone(), def.name.clone());
                let n = registry.fan_out(origin, Message::Define(def), |l| {
                    l.listens_to_property(&device, &name)
                });
                trace!(device = %device, property = %name, delivered = n, "Routed definition");
            }

            Message::Set(set) => {
                learn_name(&mut registry, origin, &set.device);
                let (device, name) = (set.device.clone(), set.name.clone());
                let n = registry.fan_out(origin, Message::Set(set), |l| {
                    l.listens_to_property(&device, &name)
                });
                trace!(device = %device, property = %name, delivered = n, "Routed update");
            }

            Message::Notify(note) => match note.device.clone() {
                Some(device) => {
                    learn_name(&mut registry, origin, &device);
                    registry.fan_out(origin, Message::Notify(note), |l| l.listens_to_any_of(&device));
                }
                None => {
                    let message = Arc::new(Message::Notify(note));
                    for client in registry.clients.values() {
                        client.outbox.send(message.clone());
                    }
                }
            },

            Message::Delete(del) => {
                let device = del.device.clone();
                match del.name.clone() {
                    Some(name) => {
                        let message = Arc::new(Message::Delete(del));
                        for (listener, outbox) in registry.listeners(origin) {
                            if listener.listens_to_property(&device, &name) {
                                outbox.send(message.clone());
                            }
                        }
                        for client in registry.clients.values_mut() {
                            client.listener.prune(&device, Some(&name));
                        }
                        for peer in registry.devices.values_mut() {
                            peer.listener.prune(&device, Some(&name));
                        }
                        debug!(device = %device, property = %name, "Property deleted");
                    }
                    None => {
                        let n = registry.drop_device_name(origin, &device, Message::Delete(del));
                        info!(device = %device, notified = n, "Device deleted");
                    }
                }
            }
        }
    }

    /// Removes a peer. Safe to call more than once; only the first call
    /// has an effect.
    ///
    /// For a device backend, every device it announced is deleted and the
    /// deletion is relayed to the listeners of that device.
    pub fn deregister(&self, peer: PeerId) {
        let mut registry = self.lock();
        if registry.clients.remove(&peer).is_some() {
            drop(registry);
            self.notify(|h| h.connection_broken(peer));
            return;
        }
        let Some(device) = registry.devices.remove(&peer) else {
            return;
        };
        let names: Vec<String> = device.names.iter().cloned().collect();
        for name in &names {
            let mut deletion = DelProperty::device(name.clone());
            deletion.timestamp = Some(now_timestamp());
            registry.drop_device_name(peer, name, Message::Delete(deletion));
        }
        drop(registry);
        self.notify(|h| h.driver_disconnected(peer, &device.identifiers, &names));
    }

    /// Destroys every backend carrying `identifier`. Deregistration follows
    /// once each backend's I/O observes the close.
    ///
    /// Returns the number of backends destroyed.
    pub fn unload_by_identifier(&self, identifier: &str) -> usize {
        let targets: Vec<Arc<dyn DeviceBackend>> = self
            .lock()
            .devices
            .values()
            .filter(|d| d.identifiers.iter().any(|i| i == identifier))
            .map(|d| d.backend.clone())
            .collect();
        for backend in &targets {
            info!(identifier, kind = %backend.kind(), "Unloading driver");
            backend.destroy();
        }
        targets.len()
    }

    /// Stops accepting peers, closes every client queue and destroys every
    /// backend.
    pub fn shutdown(&self) {
        let backends: Vec<Arc<dyn DeviceBackend>> = {
            let mut registry = self.lock();
            registry.shutting_down = true;
            registry.clients.clear();
            registry.devices.values().map(|d| d.backend.clone()).collect()
        };
        if !backends.is_empty() {
            info!(count = backends.len(), "Destroying device backends");
        }
        for backend in backends {
            backend.destroy();
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn backend_count(&self) -> usize {
        self.lock().devices.len()
    }

    /// Number of device names currently routed.
    pub fn device_count(&self) -> usize {
        self.lock().devices.values().map(|d| d.names.len()).sum()
    }

    /// Snapshot of the loaded backends, ordered by peer id.
    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        let registry = self.lock();
        let mut infos: Vec<DeviceInfo> = registry
            .devices
            .iter()
            .map(|(id, d)| DeviceInfo {
                id: *id,
                kind: d.backend.kind(),
                identifiers: d.identifiers.clone(),
                devices: d.names.iter().cloned().collect(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

/// The first backend to announce a name owns it; later claimants are not
/// routed to under that name.
fn learn_name(registry: &mut Registry, origin: PeerId, device: &str) {
    if let Some(owner) = registry.owner_of(device) {
        if owner != origin {
            warn!(peer = origin, owner, device = %device, "Device name already announced by another backend");
        }
        return;
    }
    if let Some(peer) = registry.devices.get_mut(&origin)
        && peer.names.insert(device.to_string())
    {
        info!(peer = origin, device = %device, "Learned device name");
    }
}
