//! Device and property store
//!
//! One store per connection: device name → property name → current vector.
//! The transport's read task writes into it while callers read from any
//! thread, so storage is a sharded [`DashMap`]. Vectors are kept behind `Arc`
//! so lookups hand out cheap snapshots; an in-place merge clones a vector only
//! while someone still holds the previous snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{IndiError, IndiResult};
use crate::protocol::standard_properties as props;
use crate::value::{IndiValue, SwitchValue};
use crate::vector::{Property, PropertyVector};

type PropertyMap = HashMap<String, Arc<Property>>;

/// Thread-safe registry of devices and their property vectors
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: DashMap<String, PropertyMap>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a device, if known
    pub fn get(&self, name: &str) -> Option<Device> {
        self.devices.get(name).map(|entry| Device {
            name: name.to_string(),
            properties: entry.value().clone(),
        })
    }

    /// Snapshot of a device, failing with [`IndiError::DeviceNotFound`]
    pub fn require(&self, name: &str) -> IndiResult<Device> {
        self.get(name)
            .ok_or_else(|| IndiError::DeviceNotFound(name.to_string()))
    }

    /// Create an empty entry for `name` unless one exists.
    ///
    /// Returns true only for the call that actually created the entry.
    pub fn reserve(&self, name: &str) -> bool {
        match self.devices.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(PropertyMap::new());
                true
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn has_property(&self, device: &str, property: &str) -> bool {
        self.devices
            .get(device)
            .map(|entry| entry.contains_key(property))
            .unwrap_or(false)
    }

    pub fn property(&self, device: &str, property: &str) -> Option<Arc<Property>> {
        self.devices
            .get(device)
            .and_then(|entry| entry.get(property).cloned())
    }

    /// Property lookup that reports a missing device or property
    pub fn require_property(&self, device: &str, property: &str) -> IndiResult<Arc<Property>> {
        let entry = self
            .devices
            .get(device)
            .ok_or_else(|| IndiError::DeviceNotFound(device.to_string()))?;
        entry
            .get(property)
            .cloned()
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })
    }

    /// Typed copy of a vector; `None` if missing or of another leaf type
    pub fn typed<T: IndiValue>(&self, device: &str, property: &str) -> Option<PropertyVector<T>> {
        self.property(device, property)
            .and_then(|p| p.as_vector::<T>().cloned())
    }

    /// Typed copy of a vector, reporting why it is unavailable
    pub fn require_typed<T: IndiValue>(
        &self,
        device: &str,
        property: &str,
    ) -> IndiResult<PropertyVector<T>> {
        let found = self.require_property(device, property)?;
        found
            .as_vector::<T>()
            .cloned()
            .ok_or_else(|| IndiError::TypeMismatch {
                device: device.to_string(),
                property: property.to_string(),
                expected: T::TYPE_NAME,
                actual: found.type_name(),
            })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device names, sorted
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshots of every device, sorted by name
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .map(|entry| Device {
                name: entry.key().clone(),
                properties: entry.value().clone(),
            })
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn devices_with_role(&self, role: DeviceRole) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(|d| role.matches(d))
            .collect()
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(Device::is_connected)
            .collect()
    }

    pub fn disconnected_devices(&self) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(|d| !d.is_connected())
            .collect()
    }

    /// Every (device, property) pair currently stored for `property`
    pub fn find_property(&self, property: &str) -> Vec<(String, Arc<Property>)> {
        self.devices
            .iter()
            .filter_map(|entry| {
                entry
                    .get(property)
                    .map(|p| (entry.key().clone(), Arc::clone(p)))
            })
            .collect()
    }

    /// Every property of one device
    pub fn properties_of(&self, device: &str) -> Vec<(String, Arc<Property>)> {
        self.devices
            .get(device)
            .map(|entry| {
                entry
                    .iter()
                    .map(|(name, p)| (name.clone(), Arc::clone(p)))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Mutation, driven by server messages
    // ========================================================================

    /// Install or replace a property, creating the device if needed.
    /// Returns whether the device was created.
    pub(crate) fn define(&self, device: &str, property: &str, value: Arc<Property>) -> bool {
        match self.devices.entry(device.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().insert(property.to_string(), value);
                false
            }
            Entry::Vacant(vacant) => {
                let mut properties = PropertyMap::new();
                properties.insert(property.to_string(), value);
                vacant.insert(properties);
                true
            }
        }
    }

    /// Merge into an existing property. Returns false if the device or property is unknown.
    pub(crate) fn update(&self, device: &str, property: &str, value: &Property) -> bool {
        let Some(mut entry) = self.devices.get_mut(device) else {
            return false;
        };
        match entry.get_mut(property) {
            Some(existing) => {
                merge_or_replace(existing, value);
                true
            }
            None => false,
        }
    }

    /// Merge into `property` on every device that has it. Returns how many were updated.
    pub(crate) fn update_everywhere(&self, property: &str, value: &Property) -> usize {
        let mut updated = 0;
        for mut entry in self.devices.iter_mut() {
            if let Some(existing) = entry.get_mut(property) {
                merge_or_replace(existing, value);
                updated += 1;
            }
        }
        updated
    }

    pub(crate) fn remove_property(&self, device: &str, property: &str) -> Option<Arc<Property>> {
        self.devices
            .get_mut(device)
            .and_then(|mut entry| entry.remove(property))
    }

    pub(crate) fn remove_property_everywhere(&self, property: &str) -> usize {
        let mut removed = 0;
        for mut entry in self.devices.iter_mut() {
            if entry.remove(property).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Drop every property of one device, keeping the device entry
    pub(crate) fn clear_device(&self, device: &str) {
        if let Some(mut entry) = self.devices.get_mut(device) {
            entry.clear();
        }
    }

    /// Drop every property of every device, keeping the device entries
    pub(crate) fn clear_all_properties(&self) {
        for mut entry in self.devices.iter_mut() {
            entry.clear();
        }
    }

    /// Forget everything. Returns the names of the devices that were removed.
    pub(crate) fn clear(&self) -> Vec<String> {
        let names = self.device_names();
        for name in &names {
            self.devices.remove(name);
        }
        names
    }
}

fn merge_or_replace(existing: &mut Arc<Property>, update: &Property) {
    if !Arc::make_mut(existing).try_update(update) {
        tracing::debug!(
            "Replacing {} vector '{}' with {} update",
            existing.type_name(),
            existing.name(),
            update.type_name()
        );
        *existing = Arc::new(update.clone());
    }
}

// ============================================================================
// Device snapshot
// ============================================================================

/// Point-in-time copy of one device's properties
#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    properties: PropertyMap,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff `CONNECTION` is a switch vector whose `CONNECT` leaf is on
    pub fn is_connected(&self) -> bool {
        self.typed::<SwitchValue>(props::CONNECTION)
            .map(|v| v.is_on(props::CONNECT))
            .unwrap_or(false)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name).map(|p| p.as_ref())
    }

    pub fn typed<T: IndiValue>(&self, name: &str) -> Option<&PropertyVector<T>> {
        self.property(name).and_then(|p| p.as_vector::<T>())
    }

    /// Property names, sorted
    pub fn property_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.properties.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Every role this device's properties satisfy
    pub fn roles(&self) -> Vec<DeviceRole> {
        DeviceRole::ALL
            .iter()
            .copied()
            .filter(|role| role.matches(self))
            .collect()
    }

    /// Most specific role, in the order of [`DeviceRole::ALL`]
    pub fn primary_role(&self) -> Option<DeviceRole> {
        DeviceRole::ALL.iter().copied().find(|role| role.matches(self))
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Device kind inferred from the properties it defines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    Camera,
    Telescope,
    Focuser,
    FilterWheel,
    Dome,
    Rotator,
    Guider,
    SafetyMonitor,
    Weather,
    CoverCalibrator,
}

impl DeviceRole {
    /// Precedence order used by [`Device::primary_role`]
    pub const ALL: [DeviceRole; 10] = [
        DeviceRole::Camera,
        DeviceRole::Telescope,
        DeviceRole::Focuser,
        DeviceRole::FilterWheel,
        DeviceRole::Dome,
        DeviceRole::Rotator,
        DeviceRole::Guider,
        DeviceRole::SafetyMonitor,
        DeviceRole::Weather,
        DeviceRole::CoverCalibrator,
    ];

    /// A device has the role if it defines any of these properties
    pub fn defining_properties(&self) -> &'static [&'static str] {
        match self {
            DeviceRole::Camera => &[props::CCD_INFO, props::CCD_EXPOSURE, props::CCD_FRAME, props::CCD1],
            DeviceRole::Telescope => &[
                props::TELESCOPE_INFO,
                props::EQUATORIAL_EOD_COORD,
                props::ON_COORD_SET,
                props::TELESCOPE_MOTION_NS,
            ],
            DeviceRole::Focuser => &[
                props::FOCUS_MOTION,
                props::ABS_FOCUS_POSITION,
                props::REL_FOCUS_POSITION,
            ],
            DeviceRole::FilterWheel => &[props::FILTER_SLOT, props::FILTER_NAME],
            DeviceRole::Dome => &[
                props::DOME_MEASUREMENTS,
                props::DOME_SHUTTER,
                props::DOME_MOTION,
                props::ABS_DOME_POSITION,
            ],
            DeviceRole::Rotator => &[props::ABS_ROTATOR_ANGLE, props::ROTATOR_ANGLE],
            DeviceRole::Guider => &[
                props::TELESCOPE_TIMED_GUIDE_NS,
                props::TELESCOPE_TIMED_GUIDE_WE,
            ],
            DeviceRole::SafetyMonitor => &[props::SAFETY_STATUS, props::AUX_SAFETY],
            DeviceRole::Weather => &[props::WEATHER_STATUS, props::WEATHER_PARAMETERS],
            DeviceRole::CoverCalibrator => &[
                props::CAP_PARK,
                props::FLAT_LIGHT_CONTROL,
                props::FLAT_LIGHT_INTENSITY,
            ],
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        let defined = self
            .defining_properties()
            .iter()
            .any(|p| device.has_property(p));
        match self {
            // Cameras with an integrated wheel expose FILTER_SLOT too
            DeviceRole::FilterWheel => defined && !device.has_property(props::CCD_INFO),
            _ => defined,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceRole::Camera => "Camera",
            DeviceRole::Telescope => "Telescope",
            DeviceRole::Focuser => "Focuser",
            DeviceRole::FilterWheel => "Filter Wheel",
            DeviceRole::Dome => "Dome",
            DeviceRole::Rotator => "Rotator",
            DeviceRole::Guider => "Guider",
            DeviceRole::SafetyMonitor => "Safety Monitor",
            DeviceRole::Weather => "Weather",
            DeviceRole::CoverCalibrator => "Cover Calibrator",
        };
        f.write_str(name)
    }
}
