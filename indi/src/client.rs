//! INDI client
//!
//! [`IndiClient`] ties one [`Transport`], one [`DeviceStore`] and one
//! [`EventDispatcher`] together. Every inbound message goes through
//! [`IndiClient::process`]: snapshot the values it will touch, apply it to the
//! store, then notify subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::codec::Decoded;
use crate::config::IndiClientConfig;
use crate::device::IndiDevice;
use crate::error::{IndiError, IndiResult};
use crate::events::{EventDispatcher, EventKind, IndiEvent, SubscriptionId};
use crate::message::{BlobMode, ClientMessage, ProcessOutcome, ServerMessage};
use crate::protocol::standard_properties as props;
use crate::store::{Device, DeviceRole, DeviceStore};
use crate::transport::{ConnectionState, RawInputSink, Transport, TransportHandler};
use crate::value::SwitchValue;
use crate::vector::{Property, PropertyVector};
use crate::IndiServer;

/// Per-message outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct MessageCounters {
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl MessageCounters {
    fn record(&self, outcome: &ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::Applied { .. } => &self.applied,
            ProcessOutcome::Skipped(_) => &self.skipped,
            ProcessOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MessageStats {
        MessageStats {
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Values captured before a message is applied
enum Snapshot {
    None,
    /// Current value per device a `set*` will merge into
    Changed(Vec<(String, Arc<Property>)>),
    /// Last value per device of every property a `delProperty` removes
    Deleted(Vec<(String, Arc<Property>)>),
}

struct ClientInner {
    server: IndiServer,
    config: IndiClientConfig,
    auto_connect: AtomicBool,
    store: DeviceStore,
    events: EventDispatcher,
    transport: Transport,
    stats: MessageCounters,
}

/// Connection to one INDI server
///
/// Cloning is cheap; clones share the connection, the store and the subscribers.
#[derive(Clone)]
pub struct IndiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for IndiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndiClient")
            .field("server", &self.inner.server)
            .field("state", &self.state())
            .field("devices", &self.inner.store.len())
            .finish()
    }
}

impl IndiClient {
    /// Create a client for `host`, on the default port unless one is given
    pub fn new(host: &str, port: Option<u16>) -> Self {
        let server = match port {
            Some(port) => IndiServer::new(host, port),
            None => IndiServer::with_default_port(host),
        };
        Self::with_config(server, IndiClientConfig::default())
    }

    pub fn with_config(server: IndiServer, config: IndiClientConfig) -> Self {
        let transport = Transport::new(
            server.clone(),
            config.connection_timeout(),
            config.stalled_fragment_warning(),
        );
        Self {
            inner: Arc::new(ClientInner {
                auto_connect: AtomicBool::new(config.auto_connect_devices),
                server,
                config,
                store: DeviceStore::new(),
                events: EventDispatcher::new(),
                transport,
                stats: MessageCounters::default(),
            }),
        }
    }

    pub fn server(&self) -> &IndiServer {
        &self.inner.server
    }

    pub fn config(&self) -> &IndiClientConfig {
        &self.inner.config
    }

    /// Switch newly defined devices to connected as soon as their
    /// `CONNECTION` property arrives
    pub fn set_auto_connect(&self, enabled: bool) {
        self.inner.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_connect(&self) -> bool {
        self.inner.auto_connect.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connect, returning the transport error on failure
    pub async fn try_connect(&self) -> IndiResult<()> {
        let strong: Arc<dyn TransportHandler> = self.inner.clone();
        let handler: Weak<dyn TransportHandler> = Arc::downgrade(&strong);
        self.inner.transport.open(handler).await
    }

    /// Connect; failure is only logged and observable through [`is_connected`](Self::is_connected)
    pub async fn connect(&self) {
        if let Err(e) = self.try_connect().await {
            tracing::warn!("INDI connection to {} failed: {}", self.inner.server, e);
        }
    }

    /// Close the connection. Calling this while disconnected does nothing.
    pub async fn disconnect(&self) {
        self.inner.transport.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Retry [`try_connect`](Self::try_connect) with exponential backoff
    pub async fn reconnect_with_backoff(&self) -> IndiResult<()> {
        let reconnection = &self.inner.config.reconnection;
        let max_attempts = reconnection.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            tracing::info!(
                "Reconnection attempt {}/{} to {}",
                attempt,
                max_attempts,
                self.inner.server
            );

            match self.try_connect().await {
                Ok(()) => {
                    tracing::info!("Successfully reconnected to {}", self.inner.server);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!("Reconnection attempt {} failed: {}", attempt, last_error);

                    if attempt < max_attempts {
                        let delay = reconnection.calculate_delay(attempt);
                        tracing::info!("Waiting {:?} before next reconnection attempt", delay);
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(IndiError::ReconnectionFailed {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Route raw inbound chunks to a diagnostic sink
    pub fn set_raw_input_sink(&self, sink: Option<Arc<dyn RawInputSink>>) {
        self.inner.transport.set_raw_input_sink(sink);
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Encode and send a message, then fire `MessageSent`
    pub async fn send(&self, message: ClientMessage) -> IndiResult<()> {
        self.inner.send(message).await
    }

    pub async fn query_all_properties(&self) -> IndiResult<()> {
        self.send(ClientMessage::get_all_properties()).await
    }

    pub async fn query_device_properties(&self, device: &str) -> IndiResult<()> {
        self.send(ClientMessage::get_device_properties(device)).await
    }

    /// Set BLOB delivery for a device, or for one of its properties
    pub async fn enable_blob(
        &self,
        device: &str,
        property: Option<&str>,
        mode: BlobMode,
    ) -> IndiResult<()> {
        self.send(ClientMessage::EnableBlob {
            device: Some(device.to_string()),
            property: property.map(str::to_string),
            mode,
        })
        .await
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Apply one server message and notify subscribers
    pub async fn process(&self, message: ServerMessage) -> ProcessOutcome {
        self.inner.process(message).await
    }

    pub fn message_stats(&self) -> MessageStats {
        self.inner.stats.snapshot()
    }

    // ========================================================================
    // Devices
    // ========================================================================

    pub fn store(&self) -> &DeviceStore {
        &self.inner.store
    }

    /// Create an empty device entry unless one exists. Fires `DeviceFound`
    /// only when the entry was created.
    pub fn reserve_device(&self, name: &str) -> bool {
        let created = self.inner.store.reserve(name);
        if created {
            self.inner
                .events
                .dispatch(&IndiEvent::DeviceFound(name.to_string()));
        }
        created
    }

    /// Handle for a device, reserving it if the server has not defined it yet
    pub fn device(&self, name: &str) -> IndiDevice {
        self.reserve_device(name);
        IndiDevice::new(self.clone(), name)
    }

    pub fn get_device(&self, name: &str) -> Option<Device> {
        self.inner.store.get(name)
    }

    pub fn require_device(&self, name: &str) -> IndiResult<Device> {
        self.inner.store.require(name)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.store.devices()
    }

    pub fn devices_with_role(&self, role: DeviceRole) -> Vec<Device> {
        self.inner.store.devices_with_role(role)
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        self.inner.store.connected_devices()
    }

    pub fn property(&self, device: &str, property: &str) -> Option<Arc<Property>> {
        self.inner.store.property(device, property)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&IndiEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(callback)
    }

    pub fn subscribe_to<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&IndiEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_to(kind, callback)
    }

    /// Receive events on a broadcast channel sized by `event_channel_capacity`
    pub fn subscribe_channel(&self) -> (SubscriptionId, broadcast::Receiver<IndiEvent>) {
        self.inner
            .events
            .subscribe_channel(self.inner.config.event_channel_capacity)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl ClientInner {
    async fn send(&self, message: ClientMessage) -> IndiResult<()> {
        let xml = message.encode()?;
        self.transport.send(xml).await?;
        tracing::debug!("Sent {}", message);
        self.events.dispatch(&IndiEvent::MessageSent(message));
        Ok(())
    }

    async fn process(&self, message: ServerMessage) -> ProcessOutcome {
        let snapshot = self.snapshot(&message);
        let outcome = message.process(&self.store);
        self.notify(&message, &outcome, snapshot);
        self.record(&message, &outcome);

        if outcome.is_applied() {
            self.auto_connect_if_needed(&message).await;
        }
        outcome
    }

    fn snapshot(&self, message: &ServerMessage) -> Snapshot {
        match message {
            ServerMessage::SetProperty {
                device, property, ..
            } => {
                let previous = if device.is_empty() {
                    self.store.find_property(property)
                } else {
                    self.store
                        .property(device, property)
                        .map(|value| vec![(device.clone(), value)])
                        .unwrap_or_default()
                };
                Snapshot::Changed(previous)
            }
            ServerMessage::DeleteProperty {
                device, property, ..
            } => {
                let doomed = match (device.as_deref(), property.as_deref()) {
                    (Some(device), Some(property)) => self
                        .store
                        .property(device, property)
                        .map(|value| vec![(device.to_string(), value)])
                        .unwrap_or_default(),
                    (Some(device), None) => self
                        .store
                        .properties_of(device)
                        .into_iter()
                        .map(|(_, value)| (device.to_string(), value))
                        .collect(),
                    (None, Some(property)) => self.store.find_property(property),
                    (None, None) => self
                        .store
                        .device_names()
                        .into_iter()
                        .flat_map(|device| {
                            self.store
                                .properties_of(&device)
                                .into_iter()
                                .map(move |(_, value)| (device.clone(), value))
                        })
                        .collect(),
                };
                Snapshot::Deleted(doomed)
            }
            _ => Snapshot::None,
        }
    }

    fn notify(&self, message: &ServerMessage, outcome: &ProcessOutcome, snapshot: Snapshot) {
        self.events
            .dispatch(&IndiEvent::MessageReceived(message.clone()));

        let ProcessOutcome::Applied { device_created } = outcome else {
            return;
        };

        match (message, snapshot) {
            (
                ServerMessage::DefineProperty {
                    device, property, ..
                },
                _,
            ) => {
                if *device_created {
                    self.events.dispatch(&IndiEvent::DeviceFound(device.clone()));
                }
                if let Some(value) = self.store.property(device, property) {
                    self.events.dispatch(&IndiEvent::PropertyDefined {
                        device: device.clone(),
                        name: property.clone(),
                        value,
                    });
                }
            }
            (ServerMessage::SetProperty { property, .. }, Snapshot::Changed(previous)) => {
                for (device, previous) in previous {
                    if let Some(next) = self.store.property(&device, property) {
                        self.events.dispatch(&IndiEvent::PropertyChanged {
                            device,
                            name: property.clone(),
                            previous,
                            next,
                        });
                    }
                }
            }
            (ServerMessage::DeleteProperty { .. }, Snapshot::Deleted(doomed)) => {
                for (device, last_value) in doomed {
                    self.events.dispatch(&IndiEvent::PropertyDeleted {
                        device,
                        name: last_value.name().to_string(),
                        last_value,
                    });
                }
            }
            (ServerMessage::Notification { device, message, .. }, _) => {
                self.events.dispatch(&IndiEvent::Notification {
                    device: device.clone(),
                    message: message.clone(),
                });
            }
            _ => {}
        }
    }

    fn record(&self, message: &ServerMessage, outcome: &ProcessOutcome) {
        self.stats.record(outcome);
        match outcome {
            ProcessOutcome::Applied { .. } => tracing::trace!("Applied {}", message),
            ProcessOutcome::Skipped(reason) => tracing::debug!("Skipped {}: {}", message, reason),
            ProcessOutcome::Failed(e) => tracing::warn!("Failed to apply {}: {}", message, e),
        }
    }

    async fn auto_connect_if_needed(&self, message: &ServerMessage) {
        let ServerMessage::DefineProperty {
            device, property, ..
        } = message
        else {
            return;
        };
        if property != props::CONNECTION || !self.auto_connect.load(Ordering::SeqCst) {
            return;
        }
        let Some(connection) = self.store.typed::<SwitchValue>(device, props::CONNECTION) else {
            return;
        };
        if connection.is_on(props::CONNECT) {
            return;
        }

        let mut request = PropertyVector::<SwitchValue>::with_items(
            props::CONNECTION,
            connection.iter().map(|s| SwitchValue::new(s.name.clone(), false)),
        );
        if !request.switch_to(props::CONNECT) {
            request.push(SwitchValue::new(props::CONNECT, true));
        }
        tracing::info!("Auto-connecting INDI device '{}'", device);
        if let Err(e) = self
            .send(ClientMessage::new_property(device.clone(), request))
            .await
        {
            tracing::warn!("Auto-connect of '{}' failed: {}", device, e);
        }
    }
}

#[async_trait]
impl TransportHandler for ClientInner {
    async fn connection_established(&self) {
        self.events.dispatch(&IndiEvent::ServerConnected);
        if let Err(e) = self.send(ClientMessage::get_all_properties()).await {
            tracing::warn!("Initial property query to {} failed: {}", self.server, e);
        }
    }

    async fn frame_received(&self, frame: Decoded) {
        match frame {
            Decoded::Message(message) => {
                self.process(message).await;
            }
            Decoded::Skipped(reason) => {
                tracing::debug!("Skipped inbound element: {}", reason);
                self.stats.record(&ProcessOutcome::Skipped(reason));
            }
            Decoded::Invalid { tag, error } => {
                tracing::warn!("Rejected inbound <{}>: {}", tag, error);
                self.stats.record(&ProcessOutcome::Failed(error));
            }
        }
    }

    async fn connection_closed(&self) {
        let removed = self.store.clear();
        tracing::info!(
            "Disconnected from INDI server {} ({} devices dropped)",
            self.server,
            removed.len()
        );
        self.events.dispatch(&IndiEvent::ServerDisconnected);
        for device in removed {
            self.events.dispatch(&IndiEvent::DeviceRemoved(device));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NumberValue;
    use std::sync::Mutex;

    fn recorded(client: &IndiClient) -> Arc<Mutex<Vec<IndiEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    fn kinds(events: &Mutex<Vec<IndiEvent>>) -> Vec<EventKind> {
        events.lock().unwrap().iter().map(IndiEvent::kind).collect()
    }

    fn define_number(device: &str, property: &str, leaves: &[(&str, f64)]) -> ServerMessage {
        ServerMessage::DefineProperty {
            device: device.to_string(),
            property: property.to_string(),
            value: PropertyVector::with_items(
                property,
                leaves.iter().map(|(n, v)| NumberValue::new(*n, *v)),
            )
            .into(),
        }
    }

    fn set_number(device: &str, property: &str, leaves: &[(&str, f64)]) -> ServerMessage {
        match define_number(device, property, leaves) {
            ServerMessage::DefineProperty {
                device,
                property,
                value,
            } => ServerMessage::SetProperty {
                device,
                property,
                value,
            },
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_define_fires_found_then_defined() {
        let client = IndiClient::new("localhost", None);
        let events = recorded(&client);

        let outcome = client
            .process(define_number("Focuser", "ABS_FOCUS_POSITION", &[("FOCUS_ABSOLUTE_POSITION", 100.0)]))
            .await;
        assert!(outcome.is_applied());
        client
            .process(define_number("Focuser", "FOCUS_TEMPERATURE", &[("TEMPERATURE", 4.5)]))
            .await;

        assert_eq!(
            kinds(&events),
            vec![
                EventKind::MessageReceived,
                EventKind::DeviceFound,
                EventKind::PropertyDefined,
                EventKind::MessageReceived,
                EventKind::PropertyDefined,
            ]
        );
        assert_eq!(client.message_stats().applied, 2);
    }

    #[tokio::test]
    async fn test_change_event_carries_previous_value() {
        let client = IndiClient::new("localhost", None);
        client
            .process(define_number("Mount", "EQUATORIAL_EOD_COORD", &[("RA", 1.0), ("DEC", 2.0)]))
            .await;
        let events = recorded(&client);

        client
            .process(set_number("Mount", "EQUATORIAL_EOD_COORD", &[("DEC", 45.0)]))
            .await;

        let events = events.lock().unwrap();
        match &events[1] {
            IndiEvent::PropertyChanged {
                device,
                previous,
                next,
                ..
            } => {
                assert_eq!(device, "Mount");
                let previous = previous.as_vector::<NumberValue>().unwrap();
                let next = next.as_vector::<NumberValue>().unwrap();
                assert_eq!(previous.value_of("DEC"), Some(2.0));
                assert_eq!(next.value_of("DEC"), Some(45.0));
                assert_eq!(next.value_of("RA"), Some(1.0));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_for_unknown_device_is_skipped() {
        let client = IndiClient::new("localhost", None);
        let events = recorded(&client);

        let outcome = client.process(set_number("Ghost", "P", &[("x", 1.0)])).await;

        assert!(matches!(outcome, ProcessOutcome::Skipped(_)));
        assert!(client.get_device("Ghost").is_none());
        assert_eq!(kinds(&events), vec![EventKind::MessageReceived]);
        assert_eq!(client.message_stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_delete_reports_last_values() {
        let client = IndiClient::new("localhost", None);
        client.process(define_number("CCD", "A", &[("x", 1.0)])).await;
        client.process(define_number("CCD", "B", &[("y", 2.0)])).await;
        client.process(define_number("Dome", "C", &[("z", 3.0)])).await;
        let events = recorded(&client);

        client
            .process(ServerMessage::DeleteProperty {
                device: Some("CCD".to_string()),
                property: None,
                timestamp: None,
                message: None,
            })
            .await;

        let mut deleted: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                IndiEvent::PropertyDeleted { device, name, .. } => Some(format!("{}.{}", device, name)),
                _ => None,
            })
            .collect();
        deleted.sort();
        assert_eq!(deleted, vec!["CCD.A", "CCD.B"]);
        assert!(client.get_device("CCD").unwrap().is_empty());
        assert_eq!(client.get_device("Dome").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_event() {
        let client = IndiClient::new("localhost", None);
        let events = recorded(&client);
        client
            .process(ServerMessage::Notification {
                device: None,
                timestamp: None,
                message: "Server restarting".to_string(),
            })
            .await;

        let events = events.lock().unwrap();
        match &events[1] {
            IndiEvent::Notification { device, message } => {
                assert_eq!(device, &None);
                assert_eq!(message, "Server restarting");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reserve_fires_found_once() {
        let client = IndiClient::new("localhost", None);
        let events = recorded(&client);

        assert!(client.reserve_device("Guider"));
        assert!(!client.reserve_device("Guider"));
        let _handle = client.device("Guider");

        assert_eq!(kinds(&events), vec![EventKind::DeviceFound]);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let client = IndiClient::new("localhost", Some(7624));
        assert!(matches!(
            client.query_all_properties().await,
            Err(IndiError::NotConnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        // Disconnecting twice is harmless
        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = IndiClientConfig::default();
        config.reconnection.max_attempts = 2;
        config.reconnection.base_delay_secs = 0;
        config.reconnection.use_jitter = false;
        let client = IndiClient::with_config(IndiServer::new("127.0.0.1", port), config);

        match client.reconnect_with_backoff().await {
            Err(IndiError::ReconnectionFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
