//! Client and server INDI messages
//!
//! Client messages only need encoding. Server messages also know how to apply
//! themselves to a [`DeviceStore`]; the result is reported as a
//! [`ProcessOutcome`] instead of being swallowed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IndiError, IndiResult};
use crate::protocol::INDI_PROTOCOL_VERSION;
use crate::store::DeviceStore;
use crate::value::MessageKind;
use crate::vector::Property;
use crate::xml::{write_element, XmlElement};

/// BLOB delivery mode requested with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlobMode {
    /// No BLOBs on this channel
    #[default]
    Never,
    /// Only BLOBs on this channel
    Only,
    /// BLOBs mixed with regular traffic
    Also,
}

impl BlobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Only => "Only",
            BlobMode::Also => "Also",
        }
    }
}

/// Message sent from the client to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `getProperties`, optionally scoped to a device and property
    GetProperties {
        device: Option<String>,
        property: Option<String>,
    },
    /// `new*Vector` carrying the requested values
    NewProperty {
        device: String,
        property: String,
        value: Property,
    },
    /// `enableBLOB`
    EnableBlob {
        device: Option<String>,
        property: Option<String>,
        mode: BlobMode,
    },
}

impl ClientMessage {
    /// Unscoped property query
    pub fn get_all_properties() -> Self {
        ClientMessage::GetProperties {
            device: None,
            property: None,
        }
    }

    pub fn get_device_properties(device: impl Into<String>) -> Self {
        ClientMessage::GetProperties {
            device: Some(device.into()),
            property: None,
        }
    }

    /// Request a new value; the property name is taken from the vector
    pub fn new_property(device: impl Into<String>, value: impl Into<Property>) -> Self {
        let value = value.into();
        ClientMessage::NewProperty {
            device: device.into(),
            property: value.name().to_string(),
            value,
        }
    }

    pub fn to_element(&self) -> IndiResult<XmlElement> {
        match self {
            ClientMessage::GetProperties { device, property } => {
                Ok(XmlElement::new("getProperties")
                    .with_attr("version", INDI_PROTOCOL_VERSION)
                    .with_opt_attr("device", device.as_deref())
                    .with_opt_attr("name", property.as_deref()))
            }
            ClientMessage::NewProperty {
                device,
                property,
                value,
            } => {
                let mut element = value.to_element(MessageKind::New, Some(device.as_str()))?;
                element.set_attr("name", property.clone());
                Ok(element)
            }
            ClientMessage::EnableBlob {
                device,
                property,
                mode,
            } => Ok(XmlElement::new("enableBLOB")
                .with_opt_attr("device", device.as_deref())
                .with_opt_attr("name", property.as_deref())
                .with_text(mode.as_str())),
        }
    }

    pub fn encode(&self) -> IndiResult<String> {
        write_element(&self.to_element()?)
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMessage::GetProperties { device, property } => write!(
                f,
                "getProperties {}.{}",
                device.as_deref().unwrap_or("*"),
                property.as_deref().unwrap_or("*")
            ),
            ClientMessage::NewProperty {
                device, property, ..
            } => write!(f, "new {}.{}", device, property),
            ClientMessage::EnableBlob {
                device,
                property,
                mode,
            } => write!(
                f,
                "enableBLOB {}.{} {}",
                device.as_deref().unwrap_or("*"),
                property.as_deref().unwrap_or("*"),
                mode.as_str()
            ),
        }
    }
}

/// Message received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `def*Vector`: create or replace a property, creating the device if needed
    DefineProperty {
        device: String,
        property: String,
        value: Property,
    },
    /// `set*Vector`: merge into an existing property. An empty device name
    /// targets every device that has the property.
    SetProperty {
        device: String,
        property: String,
        value: Property,
    },
    /// `delProperty`
    DeleteProperty {
        device: Option<String>,
        property: Option<String>,
        timestamp: Option<String>,
        message: Option<String>,
    },
    /// `message`: free text from the server or a driver
    Notification {
        device: Option<String>,
        timestamp: Option<String>,
        message: String,
    },
}

/// Why a server message had no effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Tag the decoder has no mapping for
    UnknownTag(String),
    /// `set*` for a device that was never defined
    UnknownDevice(String),
    /// `set*` for a property the device never defined
    UnknownProperty { device: String, property: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnknownTag(tag) => write!(f, "unrecognized tag <{}>", tag),
            SkipReason::UnknownDevice(device) => write!(f, "unknown device '{}'", device),
            SkipReason::UnknownProperty { device, property } => {
                write!(f, "unknown property '{}.{}'", device, property)
            }
        }
    }
}

/// Result of applying one server message
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The store was updated. `device_created` is set when a define introduced a new device.
    Applied { device_created: bool },
    Skipped(SkipReason),
    Failed(IndiError),
}

impl ProcessOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProcessOutcome::Applied { .. })
    }
}

impl ServerMessage {
    /// Device the message is scoped to, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            ServerMessage::DefineProperty { device, .. }
            | ServerMessage::SetProperty { device, .. } => Some(device.as_str()),
            ServerMessage::DeleteProperty { device, .. }
            | ServerMessage::Notification { device, .. } => device.as_deref(),
        }
    }

    pub fn tag(&self) -> String {
        match self {
            ServerMessage::DefineProperty { value, .. } => format!("def{}Vector", value.type_name()),
            ServerMessage::SetProperty { value, .. } => format!("set{}Vector", value.type_name()),
            ServerMessage::DeleteProperty { .. } => "delProperty".to_string(),
            ServerMessage::Notification { .. } => "message".to_string(),
        }
    }

    pub fn to_element(&self) -> IndiResult<XmlElement> {
        match self {
            ServerMessage::DefineProperty {
                device,
                property,
                value,
            } => {
                let mut element = value.to_element(MessageKind::Define, Some(device.as_str()))?;
                element.set_attr("name", property.clone());
                Ok(element)
            }
            ServerMessage::SetProperty {
                device,
                property,
                value,
            } => {
                let mut element = value.to_element(MessageKind::Set, Some(device.as_str()))?;
                element.set_attr("name", property.clone());
                Ok(element)
            }
            ServerMessage::DeleteProperty {
                device,
                property,
                timestamp,
                message,
            } => Ok(XmlElement::new("delProperty")
                .with_opt_attr("device", device.as_deref())
                .with_opt_attr("name", property.as_deref())
                .with_opt_attr("timestamp", timestamp.as_deref())
                .with_opt_attr("message", message.as_deref())),
            ServerMessage::Notification {
                device,
                timestamp,
                message,
            } => Ok(XmlElement::new("message")
                .with_opt_attr("device", device.as_deref())
                .with_opt_attr("timestamp", timestamp.as_deref())
                .with_attr("message", message.clone())),
        }
    }

    /// Render the message as the server would send it
    pub fn encode(&self) -> IndiResult<String> {
        write_element(&self.to_element()?)
    }

    /// Apply the message to the store
    pub fn process(&self, store: &DeviceStore) -> ProcessOutcome {
        match self {
            ServerMessage::DefineProperty {
                device,
                property,
                value,
            } => {
                let device_created = store.define(device, property, Arc::new(value.clone()));
                ProcessOutcome::Applied { device_created }
            }
            ServerMessage::SetProperty {
                device,
                property,
                value,
            } => {
                if device.is_empty() {
                    let updated = store.update_everywhere(property, value);
                    if updated == 0 {
                        return ProcessOutcome::Skipped(SkipReason::UnknownProperty {
                            device: "*".to_string(),
                            property: property.clone(),
                        });
                    }
                    return ProcessOutcome::Applied {
                        device_created: false,
                    };
                }
                if !store.contains(device) {
                    return ProcessOutcome::Skipped(SkipReason::UnknownDevice(device.clone()));
                }
                if store.update(device, property, value) {
                    ProcessOutcome::Applied {
                        device_created: false,
                    }
                } else {
                    ProcessOutcome::Skipped(SkipReason::UnknownProperty {
                        device: device.clone(),
                        property: property.clone(),
                    })
                }
            }
            ServerMessage::DeleteProperty {
                device, property, ..
            } => {
                match (device.as_deref(), property.as_deref()) {
                    (Some(device), Some(property)) => {
                        store.remove_property(device, property);
                    }
                    (Some(device), None) => {
                        store.clear_device(device);
                    }
                    (None, Some(property)) => {
                        store.remove_property_everywhere(property);
                    }
                    (None, None) => {
                        store.clear_all_properties();
                    }
                }
                ProcessOutcome::Applied {
                    device_created: false,
                }
            }
            ServerMessage::Notification { .. } => ProcessOutcome::Applied {
                device_created: false,
            },
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::DefineProperty {
                device, property, ..
            } => write!(f, "def {}.{}", device, property),
            ServerMessage::SetProperty {
                device, property, ..
            } => write!(f, "set {}.{}", device, property),
            ServerMessage::DeleteProperty {
                device, property, ..
            } => write!(
                f,
                "del {}.{}",
                device.as_deref().unwrap_or("*"),
                property.as_deref().unwrap_or("*")
            ),
            ServerMessage::Notification {
                device, message, ..
            } => write!(f, "message [{}] {}", device.as_deref().unwrap_or("-"), message),
        }
    }
}
