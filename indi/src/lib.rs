//! INDI protocol client
//!
//! Talks to INDI instrument-control servers over raw TCP: an incremental
//! framer for the server's element stream, a typed property-vector model, a
//! concurrent device/property store and a synchronous event dispatcher, tied
//! together by [`IndiClient`].
//!
//! ## Features
//!
//! - Typed text/number/switch/light/BLOB vectors with merge-by-name updates
//! - Sexagesimal and hexadecimal number parsing
//! - Device role classification from defined properties
//! - Explicit per-message outcomes, counted and logged
//! - Exponential backoff with jitter for reconnection
//! - mDNS and localhost server discovery

mod client;
mod codec;
mod config;
mod device;
mod error;
mod events;
mod message;
mod protocol;
mod store;
mod transport;
mod value;
mod vector;
mod wait;
mod xml;
pub mod discovery;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{IndiClient, MessageStats};
pub use codec::{decode_message, decode_property, Decoded};
pub use config::{IndiClientConfig, ReconnectionConfig};
pub use device::IndiDevice;
pub use discovery::{discover_localhost, discover_mdns, probe_server, DiscoveredDevice, DiscoveredServer};
pub use error::{IndiError, IndiResult};
pub use events::{EventDispatcher, EventKind, IndiEvent, SubscriptionId};
pub use message::{BlobMode, ClientMessage, ProcessOutcome, ServerMessage, SkipReason};
pub use protocol::{standard_properties, INDI_PROTOCOL_VERSION};
pub use store::{Device, DeviceRole, DeviceStore};
pub use transport::{ConnectionState, FrameDecoder, RawInputSink, TracingSink};
pub use value::{
    detect_format, parse_number, BlobValue, IndiPermission, IndiValue, LightValue, MessageKind,
    NumberValue, PropertyState, PropertyValue, SwitchValue, TextValue,
};
pub use vector::{Property, PropertyVector};
pub use xml::XmlElement;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// Address of an INDI server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndiServer {
    pub host: String,
    pub port: u16,
}

impl IndiServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, INDI_DEFAULT_PORT)
    }

    /// `host:port`, suitable for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for IndiServer {
    fn default() -> Self {
        Self::with_default_port("localhost")
    }
}

impl fmt::Display for IndiServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
