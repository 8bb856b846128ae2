//! Device handle
//!
//! [`IndiDevice`] pairs a device name with its client. Reads come from the
//! client's store; writes build a `new*Vector` from the stored definition and
//! send it. The store is only updated once the server answers.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::client::IndiClient;
use crate::error::{IndiError, IndiResult};
use crate::message::{BlobMode, ClientMessage};
use crate::protocol::standard_properties as props;
use crate::store::{Device, DeviceRole};
use crate::value::{IndiValue, NumberValue, SwitchValue, TextValue};
use crate::vector::{Property, PropertyVector};

/// A named device on one connection
#[derive(Debug, Clone)]
pub struct IndiDevice {
    client: IndiClient,
    name: String,
}

impl PartialEq for IndiDevice {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.client.server() == other.client.server()
    }
}

impl IndiDevice {
    pub(crate) fn new(client: IndiClient, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &IndiClient {
        &self.client
    }

    /// Current properties, if the device is still in the store
    pub fn snapshot(&self) -> Option<Device> {
        self.client.get_device(&self.name)
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().map(|d| d.is_connected()).unwrap_or(false)
    }

    pub fn roles(&self) -> Vec<DeviceRole> {
        self.snapshot().map(|d| d.roles()).unwrap_or_default()
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.client.store().has_property(&self.name, property)
    }

    pub fn property(&self, property: &str) -> Option<Arc<Property>> {
        self.client.property(&self.name, property)
    }

    pub fn typed<T: IndiValue>(&self, property: &str) -> Option<PropertyVector<T>> {
        self.client.store().typed(&self.name, property)
    }

    pub fn require_typed<T: IndiValue>(&self, property: &str) -> IndiResult<PropertyVector<T>> {
        self.client.store().require_typed(&self.name, property)
    }

    /// Ask the server to resend this device's properties
    pub async fn refresh(&self) -> IndiResult<()> {
        self.client.query_device_properties(&self.name).await
    }

    /// Send a new value for a property.
    ///
    /// Fails with `PermissionDenied` when the stored definition is read-only.
    pub async fn set_property(&self, value: impl Into<Property>) -> IndiResult<()> {
        let value = value.into();
        if let Some(existing) = self.property(value.name()) {
            if !existing.is_writable() {
                return Err(IndiError::PermissionDenied(format!(
                    "Property '{}.{}' is read-only",
                    self.name,
                    value.name()
                )));
            }
        }
        self.client
            .send(ClientMessage::new_property(self.name.clone(), value))
            .await
    }

    /// Switch the device's `CONNECTION` to connected. Does nothing if it already is.
    pub async fn connect(&self) -> IndiResult<()> {
        match self.connection_request(true)? {
            Some(request) => {
                tracing::info!("Connecting INDI device '{}'", self.name);
                self.set_property(request).await?;
                self.refresh().await
            }
            None => Ok(()),
        }
    }

    /// Switch the device's `CONNECTION` to disconnected. Does nothing if it already is.
    pub async fn disconnect(&self) -> IndiResult<()> {
        match self.connection_request(false)? {
            Some(request) => {
                tracing::info!("Disconnecting INDI device '{}'", self.name);
                self.set_property(request).await?;
                self.refresh().await
            }
            None => Ok(()),
        }
    }

    /// Serial port from `DEVICE_PORT`
    pub fn port(&self) -> Option<String> {
        self.typed::<TextValue>(props::DEVICE_PORT)
            .and_then(|v| v.text_of(props::PORT).map(str::to_string))
    }

    pub async fn set_port(&self, port: &str) -> IndiResult<()> {
        let mut vector = self.require_typed::<TextValue>(props::DEVICE_PORT)?;
        vector.require_mut(props::PORT)?.value = port.to_string();
        self.set_property(vector).await
    }

    /// Selected rate from `DEVICE_BAUD_RATE`
    pub fn baud_rate(&self) -> Option<u32> {
        self.typed::<SwitchValue>(props::DEVICE_BAUD_RATE)?
            .first_enabled()
            .and_then(|s| s.name.parse().ok())
    }

    pub fn available_baud_rates(&self) -> Vec<u32> {
        self.typed::<SwitchValue>(props::DEVICE_BAUD_RATE)
            .map(|v| v.iter().filter_map(|s| s.name.parse().ok()).collect())
            .unwrap_or_default()
    }

    pub async fn set_baud_rate(&self, rate: u32) -> IndiResult<()> {
        let mut vector = self.require_typed::<SwitchValue>(props::DEVICE_BAUD_RATE)?;
        let element = rate.to_string();
        if !vector.switch_to(&element) {
            return Err(IndiError::ElementNotFound {
                property: props::DEVICE_BAUD_RATE.to_string(),
                element,
            });
        }
        self.set_property(vector).await
    }

    /// Set `TIME_UTC` to the given instant and UTC offset
    pub async fn set_clock(&self, utc: DateTime<Utc>, offset_hours: f64) -> IndiResult<()> {
        let request = self.clock_request(utc, offset_hours)?;
        self.set_property(request).await
    }

    /// Set `GEOGRAPHIC_COORD`: latitude in degrees north, longitude in degrees
    /// east, elevation in meters
    pub async fn set_geolocation(&self, latitude: f64, longitude: f64, elevation: f64) -> IndiResult<()> {
        let request = self.geolocation_request(latitude, longitude, elevation)?;
        self.set_property(request).await
    }

    pub async fn enable_blobs(&self, mode: BlobMode) -> IndiResult<()> {
        self.client.enable_blob(&self.name, None, mode).await
    }

    /// The `CONNECTION` vector to send, or `None` when no change is needed
    fn connection_request(&self, connect: bool) -> IndiResult<Option<PropertyVector<SwitchValue>>> {
        let mut vector = self.require_typed::<SwitchValue>(props::CONNECTION)?;
        if vector.is_on(props::CONNECT) == connect {
            return Ok(None);
        }
        let target = if connect { props::CONNECT } else { props::DISCONNECT };
        if !vector.switch_to(target) {
            return Err(IndiError::ElementNotFound {
                property: props::CONNECTION.to_string(),
                element: target.to_string(),
            });
        }
        Ok(Some(vector))
    }

    fn clock_request(&self, utc: DateTime<Utc>, offset_hours: f64) -> IndiResult<PropertyVector<TextValue>> {
        let mut vector = self.require_typed::<TextValue>(props::TIME_UTC)?;
        vector.require_mut(props::UTC)?.value = utc.format("%Y-%m-%dT%H:%M:%S").to_string();
        vector.require_mut(props::OFFSET)?.value = format!("{:.2}", offset_hours);
        Ok(vector)
    }

    fn geolocation_request(
        &self,
        latitude: f64,
        longitude: f64,
        elevation: f64,
    ) -> IndiResult<PropertyVector<NumberValue>> {
        let mut vector = self.require_typed::<NumberValue>(props::GEOGRAPHIC_COORD)?;
        vector.require_mut(props::LAT)?.value = latitude.clamp(-90.0, 90.0);
        vector.require_mut(props::LONG)?.value = longitude.rem_euclid(360.0);
        vector.require_mut(props::ELEV)?.value = elevation.max(0.0);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ServerMessage;
    use crate::value::IndiPermission;
    use chrono::TimeZone;

    async fn define(client: &IndiClient, device: &str, value: impl Into<Property>) {
        let value = value.into();
        client
            .process(ServerMessage::DefineProperty {
                device: device.to_string(),
                property: value.name().to_string(),
                value,
            })
            .await;
    }

    fn connection(connected: bool) -> PropertyVector<SwitchValue> {
        PropertyVector::with_items(
            props::CONNECTION,
            [
                SwitchValue::new(props::CONNECT, connected),
                SwitchValue::new(props::DISCONNECT, !connected),
            ],
        )
    }

    #[tokio::test]
    async fn test_connection_requests() {
        let client = IndiClient::new("localhost", None);
        define(&client, "Mount", connection(false)).await;
        let mount = client.device("Mount");

        let request = mount.connection_request(true).unwrap().unwrap();
        assert!(request.is_on(props::CONNECT));
        assert!(!request.is_on(props::DISCONNECT));
        assert!(mount.connection_request(false).unwrap().is_none());

        define(&client, "Mount", connection(true)).await;
        assert!(mount.is_connected());
        let request = mount.connection_request(false).unwrap().unwrap();
        assert!(request.is_on(props::DISCONNECT));
        assert!(!request.is_on(props::CONNECT));
    }

    #[tokio::test]
    async fn test_connect_without_connection_property() {
        let client = IndiClient::new("localhost", None);
        let device = client.device("Bare");
        assert!(matches!(
            device.connect().await,
            Err(IndiError::PropertyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_port_and_baud_rate() {
        let client = IndiClient::new("localhost", None);
        define(
            &client,
            "Focuser",
            PropertyVector::with_items(props::DEVICE_PORT, [TextValue::new(props::PORT, "/dev/ttyUSB0")]),
        )
        .await;
        define(
            &client,
            "Focuser",
            PropertyVector::with_items(
                props::DEVICE_BAUD_RATE,
                [
                    SwitchValue::new("9600", true),
                    SwitchValue::new("19200", false),
                    SwitchValue::new("115200", false),
                ],
            ),
        )
        .await;
        let focuser = client.device("Focuser");

        assert_eq!(focuser.port().as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(focuser.baud_rate(), Some(9600));
        assert_eq!(focuser.available_baud_rates(), vec![9600, 19200, 115200]);
        assert!(matches!(
            focuser.set_baud_rate(4800).await,
            Err(IndiError::ElementNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_clock_and_location_requests() {
        let client = IndiClient::new("localhost", None);
        define(
            &client,
            "Mount",
            PropertyVector::with_items(
                props::TIME_UTC,
                [TextValue::new(props::UTC, ""), TextValue::new(props::OFFSET, "0")],
            ),
        )
        .await;
        define(
            &client,
            "Mount",
            PropertyVector::with_items(
                props::GEOGRAPHIC_COORD,
                [
                    NumberValue::new(props::LAT, 0.0),
                    NumberValue::new(props::LONG, 0.0),
                    NumberValue::new(props::ELEV, 0.0),
                ],
            ),
        )
        .await;
        let mount = client.device("Mount");

        let utc = Utc.with_ymd_and_hms(2024, 3, 9, 21, 30, 0).unwrap();
        let clock = mount.clock_request(utc, -5.0).unwrap();
        assert_eq!(clock.text_of(props::UTC), Some("2024-03-09T21:30:00"));
        assert_eq!(clock.text_of(props::OFFSET), Some("-5.00"));

        let location = mount.geolocation_request(95.0, -75.5, -10.0).unwrap();
        assert_eq!(location.value_of(props::LAT), Some(90.0));
        assert_eq!(location.value_of(props::LONG), Some(284.5));
        assert_eq!(location.value_of(props::ELEV), Some(0.0));
    }

    #[tokio::test]
    async fn test_read_only_property_is_rejected() {
        let client = IndiClient::new("localhost", None);
        define(
            &client,
            "CCD",
            PropertyVector::with_items("CCD_INFO", [NumberValue::new("CCD_MAX_X", 4096.0)])
                .with_permission(IndiPermission::ReadOnly),
        )
        .await;
        let ccd = client.device("CCD");

        let request = PropertyVector::with_items("CCD_INFO", [NumberValue::new("CCD_MAX_X", 1.0)]);
        assert!(matches!(
            ccd.set_property(request).await,
            Err(IndiError::PermissionDenied(_))
        ));
    }
}
