//! INDI leaf values
//!
//! Every property vector holds leaves of exactly one of five kinds. Each kind
//! implements [`IndiValue`], which carries the per-type XML naming and the
//! merge rule used when a `set*` update arrives.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{IndiError, IndiResult};
use crate::vector::{Property, PropertyVector};
use crate::xml::XmlElement;

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    /// Parse the protocol spelling, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(PropertyState::Idle),
            "ok" => Some(PropertyState::Ok),
            "busy" => Some(PropertyState::Busy),
            "alert" => Some(PropertyState::Alert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        }
    }
}

impl fmt::Display for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndiPermission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IndiPermission {
    /// Accepts both the protocol spelling (`ro`, `wo`, `rw`) and the short forms `r` and `w`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "ro" | "r" => Some(IndiPermission::ReadOnly),
            "wo" | "w" => Some(IndiPermission::WriteOnly),
            "rw" | "wr" => Some(IndiPermission::ReadWrite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndiPermission::ReadOnly => "ro",
            IndiPermission::WriteOnly => "wo",
            IndiPermission::ReadWrite => "rw",
        }
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, IndiPermission::ReadOnly)
    }
}

/// Which message family an element is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    New,
    Set,
    Define,
}

impl MessageKind {
    /// Vector tag prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            MessageKind::New => "new",
            MessageKind::Set => "set",
            MessageKind::Define => "def",
        }
    }

    /// Leaf tag prefix
    pub fn leaf_prefix(&self) -> &'static str {
        match self {
            MessageKind::New | MessageKind::Set => "one",
            MessageKind::Define => "def",
        }
    }
}

/// Behaviour shared by the five INDI leaf types
pub trait IndiValue: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Type name used in tags, e.g. `Number` in `defNumberVector`
    const TYPE_NAME: &'static str;

    /// Whether clients may send this leaf type in a `new*` vector
    const CLIENT_WRITABLE: bool = true;

    fn name(&self) -> &str;

    fn label(&self) -> &str;

    /// Build the leaf from a `def*`/`one*` element
    fn from_element(element: &XmlElement) -> Self;

    /// Render the leaf as a `def*`/`one*` element
    fn to_element(&self, kind: MessageKind) -> XmlElement;

    /// Take over the payload of `other`, keeping definition-only fields
    fn update_from(&mut self, other: &Self);

    fn wrap(vector: PropertyVector<Self>) -> Property;

    fn unwrap_ref(property: &Property) -> Option<&PropertyVector<Self>>;

    fn unwrap_mut(property: &mut Property) -> Option<&mut PropertyVector<Self>>;
}

fn leaf_element<T: IndiValue>(leaf: &T, kind: MessageKind) -> XmlElement {
    let element = XmlElement::new(format!("{}{}", kind.leaf_prefix(), T::TYPE_NAME))
        .with_attr("name", leaf.name());
    if kind == MessageKind::Define {
        element.with_opt_attr("label", Some(leaf.label()))
    } else {
        element
    }
}

fn leaf_name(element: &XmlElement) -> String {
    element.attr("name").unwrap_or_default().to_string()
}

fn leaf_label(element: &XmlElement) -> String {
    element
        .attr_non_empty("label")
        .or_else(|| element.attr("name"))
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// Text
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TextValue {
    pub name: String,
    pub label: String,
    pub value: String,
}

impl TextValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            value: value.into(),
        }
    }
}

impl IndiValue for TextValue {
    const TYPE_NAME: &'static str = "Text";

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn from_element(element: &XmlElement) -> Self {
        Self {
            name: leaf_name(element),
            label: leaf_label(element),
            value: element.trimmed_text().to_string(),
        }
    }

    fn to_element(&self, kind: MessageKind) -> XmlElement {
        leaf_element(self, kind).with_text(self.value.clone())
    }

    fn update_from(&mut self, other: &Self) {
        self.value = other.value.clone();
    }

    fn wrap(vector: PropertyVector<Self>) -> Property {
        Property::Text(vector)
    }

    fn unwrap_ref(property: &Property) -> Option<&PropertyVector<Self>> {
        match property {
            Property::Text(v) => Some(v),
            _ => None,
        }
    }

    fn unwrap_mut(property: &mut Property) -> Option<&mut PropertyVector<Self>> {
        match property {
            Property::Text(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Number
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NumberValue {
    pub name: String,
    pub label: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// printf-style format from the definition, e.g. `%010.6m`
    pub format: String,
}

impl NumberValue {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            value,
            min: 0.0,
            max: 0.0,
            step: 0.0,
            format: "%f".to_string(),
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = min;
        self.max = max;
        self.step = step;
        self
    }

    /// True if the value lies inside `min..=max`; an unset range (`min == max`) accepts anything
    pub fn in_range(&self, value: f64) -> bool {
        self.min >= self.max || (self.min..=self.max).contains(&value)
    }
}

/// Parse INDI numeric text.
///
/// Accepts plain decimals and sexagesimal `d:m:s` / `d:m` forms. The sign of
/// the degrees applies to the whole value. Formats ending in `x`/`X` are
/// read as hexadecimal. Anything unparsable yields `0.0`.
pub fn parse_number(text: &str, format: &str) -> f64 {
    let text = text.trim();
    if text.is_empty() {
        return 0.0;
    }

    if format.trim_end().ends_with(['x', 'X']) {
        let digits = text
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        return i64::from_str_radix(digits, 16).map(|v| v as f64).unwrap_or(0.0);
    }

    if !text.contains(':') {
        return text.parse().unwrap_or(0.0);
    }

    let negative = text.starts_with('-');
    let mut total = 0.0;
    for (i, part) in text.split(':').enumerate() {
        let part = part.trim();
        let component: f64 = match part.parse() {
            Ok(v) => v,
            Err(_) => return 0.0,
        };
        total += component.abs() / 60f64.powi(i as i32);
    }

    if negative {
        -total
    } else {
        total
    }
}

impl IndiValue for NumberValue {
    const TYPE_NAME: &'static str = "Number";

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn from_element(element: &XmlElement) -> Self {
        let format = element.attr("format").unwrap_or("%f").to_string();
        let attr_number = |key: &str| {
            element
                .attr(key)
                .map(|v| parse_number(v, &format))
                .unwrap_or(0.0)
        };
        Self {
            name: leaf_name(element),
            label: leaf_label(element),
            value: parse_number(element.trimmed_text(), &format),
            min: attr_number("min"),
            max: attr_number("max"),
            step: attr_number("step"),
            format,
        }
    }

    fn to_element(&self, kind: MessageKind) -> XmlElement {
        let element = leaf_element(self, kind);
        let element = if kind == MessageKind::Define {
            element
                .with_attr("format", self.format.clone())
                .with_attr("min", self.min.to_string())
                .with_attr("max", self.max.to_string())
                .with_attr("step", self.step.to_string())
        } else {
            element
        };
        element.with_text(self.value.to_string())
    }

    fn update_from(&mut self, other: &Self) {
        self.value = other.value;
    }

    fn wrap(vector: PropertyVector<Self>) -> Property {
        Property::Number(vector)
    }

    fn unwrap_ref(property: &Property) -> Option<&PropertyVector<Self>> {
        match property {
            Property::Number(v) => Some(v),
            _ => None,
        }
    }

    fn unwrap_mut(property: &mut Property) -> Option<&mut PropertyVector<Self>> {
        match property {
            Property::Number(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Switch
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchValue {
    pub name: String,
    pub label: String,
    pub is_on: bool,
}

impl SwitchValue {
    pub fn new(name: impl Into<String>, is_on: bool) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            is_on,
        }
    }
}

impl IndiValue for SwitchValue {
    const TYPE_NAME: &'static str = "Switch";

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn from_element(element: &XmlElement) -> Self {
        Self {
            name: leaf_name(element),
            label: leaf_label(element),
            is_on: element.trimmed_text().eq_ignore_ascii_case("on"),
        }
    }

    fn to_element(&self, kind: MessageKind) -> XmlElement {
        leaf_element(self, kind).with_text(if self.is_on { "On" } else { "Off" })
    }

    fn update_from(&mut self, other: &Self) {
        self.is_on = other.is_on;
    }

    fn wrap(vector: PropertyVector<Self>) -> Property {
        Property::Switch(vector)
    }

    fn unwrap_ref(property: &Property) -> Option<&PropertyVector<Self>> {
        match property {
            Property::Switch(v) => Some(v),
            _ => None,
        }
    }

    fn unwrap_mut(property: &mut Property) -> Option<&mut PropertyVector<Self>> {
        match property {
            Property::Switch(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Light
// ============================================================================

/// Read-only status indicator
#[derive(Debug, Clone, PartialEq)]
pub struct LightValue {
    pub name: String,
    pub label: String,
    /// Last reported indicator state, if the server sent one
    pub state: Option<PropertyState>,
}

impl LightValue {
    pub fn new(name: impl Into<String>, state: Option<PropertyState>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            state,
        }
    }
}

impl IndiValue for LightValue {
    const TYPE_NAME: &'static str = "Light";
    const CLIENT_WRITABLE: bool = false;

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn from_element(element: &XmlElement) -> Self {
        Self {
            name: leaf_name(element),
            label: leaf_label(element),
            state: PropertyState::parse(element.trimmed_text()),
        }
    }

    fn to_element(&self, kind: MessageKind) -> XmlElement {
        let element = leaf_element(self, kind);
        match self.state {
            Some(state) => element.with_text(state.as_str()),
            None => element,
        }
    }

    fn update_from(&mut self, other: &Self) {
        self.state = other.state;
    }

    fn wrap(vector: PropertyVector<Self>) -> Property {
        Property::Light(vector)
    }

    fn unwrap_ref(property: &Property) -> Option<&PropertyVector<Self>> {
        match property {
            Property::Light(v) => Some(v),
            _ => None,
        }
    }

    fn unwrap_mut(property: &mut Property) -> Option<&mut PropertyVector<Self>> {
        match property {
            Property::Light(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// BLOB
// ============================================================================

/// Binary attachment, kept base64-encoded as received
#[derive(Debug, Clone, PartialEq)]
pub struct BlobValue {
    pub name: String,
    pub label: String,
    pub payload: String,
    /// Declared format, e.g. `.fits` or `.fits.fz`
    pub format: String,
    /// Declared decoded size in bytes
    pub size: usize,
}

impl BlobValue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            payload: String::new(),
            format: String::new(),
            size: 0,
        }
    }

    pub fn from_bytes(name: impl Into<String>, data: &[u8], format: impl Into<String>) -> Self {
        Self {
            payload: BASE64.encode(data),
            format: format.into(),
            size: data.len(),
            ..Self::new(name)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the base64 payload. Line breaks inside the payload are ignored.
    pub fn decode(&self) -> IndiResult<Vec<u8>> {
        let compact: String = self
            .payload
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        BASE64.decode(compact).map_err(|e| IndiError::BlobDecode {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Format detected from the decoded content, falling back to the declared format
    pub fn detected_format(&self) -> IndiResult<String> {
        let data = self.decode()?;
        Ok(detect_format(&self.format, &data))
    }

    /// Extension to use when saving, including the leading dot
    pub fn file_extension(&self) -> String {
        let format = self.format.trim();
        if format.is_empty() {
            ".fits".to_string()
        } else if format.starts_with('.') {
            format.to_string()
        } else {
            format!(".{}", format)
        }
    }

    /// Decode the payload and write it to `path`
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> IndiResult<()> {
        let data = self.decode()?;
        std::fs::write(path.as_ref(), data)?;
        tracing::debug!(
            "Wrote BLOB '{}' ({} bytes) to {}",
            self.name,
            self.size,
            path.as_ref().display()
        );
        Ok(())
    }
}

/// Identify common BLOB payloads by their magic bytes
pub fn detect_format(declared_format: &str, data: &[u8]) -> String {
    let detected = if data.starts_with(b"SIMPLE") {
        if declared_format.ends_with(".fz") {
            ".fits.fz"
        } else {
            ".fits"
        }
    } else if data.starts_with(b"XTENSION") {
        ".fits.fz"
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        ".png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ".jpeg"
    } else if data.starts_with(&[0x1F, 0x8B]) {
        ".gz"
    } else if data.starts_with(&[0x50, 0x4B]) {
        ".zip"
    } else {
        declared_format
    };

    if !declared_format.is_empty() && detected != declared_format {
        tracing::debug!(
            "BLOB format mismatch: declared '{}', detected '{}'",
            declared_format,
            detected
        );
    }

    detected.to_string()
}

impl IndiValue for BlobValue {
    const TYPE_NAME: &'static str = "BLOB";

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn from_element(element: &XmlElement) -> Self {
        Self {
            name: leaf_name(element),
            label: leaf_label(element),
            payload: element.trimmed_text().to_string(),
            format: element.attr("format").unwrap_or_default().to_string(),
            size: element
                .attr("size")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
        }
    }

    fn to_element(&self, kind: MessageKind) -> XmlElement {
        let element = leaf_element(self, kind);
        let element = if kind == MessageKind::Define {
            element
        } else {
            element
                .with_attr("size", self.size.to_string())
                .with_attr("format", self.format.clone())
        };
        element.with_text(self.payload.clone())
    }

    fn update_from(&mut self, other: &Self) {
        self.payload = other.payload.clone();
        self.format = other.format.clone();
        self.size = other.size;
    }

    fn wrap(vector: PropertyVector<Self>) -> Property {
        Property::Blob(vector)
    }

    fn unwrap_ref(property: &Property) -> Option<&PropertyVector<Self>> {
        match property {
            Property::Blob(v) => Some(v),
            _ => None,
        }
    }

    fn unwrap_mut(property: &mut Property) -> Option<&mut PropertyVector<Self>> {
        match property {
            Property::Blob(v) => Some(v),
            _ => None,
        }
    }
}

/// A single leaf of any type
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(TextValue),
    Number(NumberValue),
    Switch(SwitchValue),
    Light(LightValue),
    Blob(BlobValue),
}

impl PropertyValue {
    pub fn name(&self) -> &str {
        match self {
            PropertyValue::Text(v) => &v.name,
            PropertyValue::Number(v) => &v.name,
            PropertyValue::Switch(v) => &v.name,
            PropertyValue::Light(v) => &v.name,
            PropertyValue::Blob(v) => &v.name,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            PropertyValue::Text(v) => &v.label,
            PropertyValue::Number(v) => &v.label,
            PropertyValue::Switch(v) => &v.label,
            PropertyValue::Light(v) => &v.label,
            PropertyValue::Blob(v) => &v.label,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(v) => write!(f, "{}={}", v.name, v.value),
            PropertyValue::Number(v) => write!(f, "{}={}", v.name, v.value),
            PropertyValue::Switch(v) => {
                write!(f, "{}={}", v.name, if v.is_on { "On" } else { "Off" })
            }
            PropertyValue::Light(v) => write!(
                f,
                "{}={}",
                v.name,
                v.state.map(|s| s.as_str()).unwrap_or("-")
            ),
            PropertyValue::Blob(v) => write!(f, "{}=<{} bytes {}>", v.name, v.size, v.format),
        }
    }
}
