//! Property vectors
//!
//! A vector is the protocol's unit of definition and update: a named, ordered
//! group of same-typed leaves with shared metadata. [`Property`] is the sum type
//! stored per device, one variant per leaf type.

use crate::error::{IndiError, IndiResult};
use crate::value::{
    BlobValue, IndiPermission, IndiValue, LightValue, MessageKind, NumberValue, PropertyState,
    PropertyValue, SwitchValue, TextValue,
};
use crate::xml::{write_element, XmlElement};

/// Ordered group of same-typed leaves, unique by leaf name
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyVector<T: IndiValue> {
    pub name: String,
    pub label: String,
    pub group: Option<String>,
    pub state: Option<PropertyState>,
    pub permission: Option<IndiPermission>,
    /// Switch rule (`OneOfMany`, `AtMostOne`, `AnyOfMany`), not enforced here
    pub rule: Option<String>,
    pub timeout: Option<String>,
    pub timestamp: Option<String>,
    /// Free text from the `message` attribute
    pub comment: Option<String>,
    items: Vec<T>,
}

impl<T: IndiValue> PropertyVector<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            group: None,
            state: None,
            permission: None,
            rule: None,
            timeout: None,
            timestamp: None,
            comment: None,
            items: Vec::new(),
        }
    }

    /// Build a vector from leaves; later duplicates of a leaf name replace earlier ones
    pub fn with_items(name: impl Into<String>, items: impl IntoIterator<Item = T>) -> Self {
        let mut vector = Self::new(name);
        for item in items {
            vector.push(item);
        }
        vector
    }

    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_permission(mut self, permission: IndiPermission) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Insert a leaf, replacing any existing leaf with the same name in place
    pub fn push(&mut self, item: T) {
        match self.items.iter_mut().find(|i| i.name() == item.name()) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.items.iter().find(|i| i.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.items.iter_mut().find(|i| i.name() == name)
    }

    /// Leaf lookup that reports a missing element as an error
    pub fn require_mut(&mut self, name: &str) -> IndiResult<&mut T> {
        let property = self.name.clone();
        self.get_mut(name).ok_or_else(|| IndiError::ElementNotFound {
            property,
            element: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|i| i.name())
    }

    /// Missing permission is treated as read-write
    pub fn is_writable(&self) -> bool {
        self.permission.map(|p| p.is_writable()).unwrap_or(true)
    }

    /// Merge an update into this vector by leaf name.
    ///
    /// Matching leaves take the update's payload, unmatched update leaves are
    /// appended, leaves the update does not mention are left alone. Metadata the
    /// update carries (state, timeout, timestamp, message) replaces ours.
    pub fn merge(&mut self, update: &PropertyVector<T>) {
        for incoming in &update.items {
            match self.get_mut(incoming.name()) {
                Some(existing) => existing.update_from(incoming),
                None => self.items.push(incoming.clone()),
            }
        }
        if update.state.is_some() {
            self.state = update.state;
        }
        if update.timeout.is_some() {
            self.timeout = update.timeout.clone();
        }
        if update.timestamp.is_some() {
            self.timestamp = update.timestamp.clone();
        }
        if update.comment.is_some() {
            self.comment = update.comment.clone();
        }
    }

    /// Decode a `*Vector` element. Children whose tag is not a leaf of this type are skipped.
    pub fn from_element(element: &XmlElement) -> Self {
        let name = element.attr("name").unwrap_or_default().to_string();
        let mut vector = Self::new(name.clone());
        vector.label = element.attr_non_empty("label").unwrap_or(name.as_str()).to_string();
        vector.group = element.attr_non_empty("group").map(str::to_string);
        vector.state = element.attr("state").and_then(PropertyState::parse);
        vector.permission = element.attr("perm").and_then(IndiPermission::parse);
        vector.rule = element.attr_non_empty("rule").map(str::to_string);
        vector.timeout = element.attr_non_empty("timeout").map(str::to_string);
        vector.timestamp = element.attr_non_empty("timestamp").map(str::to_string);
        vector.comment = element.attr_non_empty("message").map(str::to_string);

        for child in &element.children {
            if is_leaf_tag::<T>(&child.name) {
                vector.push(T::from_element(child));
            }
        }
        vector
    }

    /// Render as a `new*`, `set*` or `def*` vector element
    pub fn to_element(&self, kind: MessageKind, device: Option<&str>) -> IndiResult<XmlElement> {
        if kind == MessageKind::New && !T::CLIENT_WRITABLE {
            return Err(IndiError::PermissionDenied(format!(
                "{} vectors such as '{}' cannot be sent to the server",
                T::TYPE_NAME,
                self.name
            )));
        }

        let tag = format!("{}{}Vector", kind.prefix(), T::TYPE_NAME);
        let mut element = XmlElement::new(tag)
            .with_opt_attr("device", device)
            .with_attr("name", self.name.clone());

        match kind {
            MessageKind::New => {
                element = element.with_opt_attr("timestamp", self.timestamp.as_deref());
            }
            MessageKind::Set => {
                element = element
                    .with_opt_attr("state", self.state.map(|s| s.as_str()))
                    .with_opt_attr("timeout", self.timeout.as_deref())
                    .with_opt_attr("timestamp", self.timestamp.as_deref())
                    .with_opt_attr("message", self.comment.as_deref());
            }
            MessageKind::Define => {
                element = element
                    .with_opt_attr("label", Some(self.label.as_str()))
                    .with_opt_attr("group", self.group.as_deref())
                    .with_opt_attr("state", self.state.map(|s| s.as_str()))
                    .with_opt_attr("perm", self.permission.map(|p| p.as_str()))
                    .with_opt_attr("rule", self.rule.as_deref())
                    .with_opt_attr("timeout", self.timeout.as_deref())
                    .with_opt_attr("timestamp", self.timestamp.as_deref())
                    .with_opt_attr("message", self.comment.as_deref());
            }
        }

        for item in &self.items {
            element = element.with_child(item.to_element(kind));
        }
        Ok(element)
    }

    pub fn to_xml(&self, kind: MessageKind, device: Option<&str>) -> IndiResult<String> {
        write_element(&self.to_element(kind, device)?)
    }
}

fn is_leaf_tag<T: IndiValue>(tag: &str) -> bool {
    !tag.ends_with("Vector") && tag.ends_with(T::TYPE_NAME)
}

impl<'a, T: IndiValue> IntoIterator for &'a PropertyVector<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// ============================================================================
// Typed helpers
// ============================================================================

impl PropertyVector<SwitchValue> {
    /// Turn on exactly the switch named `name` and turn every other switch off.
    ///
    /// If no leaf has that name every switch ends up off. Returns whether the
    /// name was found.
    pub fn switch_to(&mut self, name: &str) -> bool {
        self.switch_where(|s| s.name == name)
    }

    /// Turn on the switch at `index` only. Out-of-range indices turn everything off.
    pub fn switch_to_index(&mut self, index: usize) -> bool {
        let mut found = false;
        for (i, switch) in self.items.iter_mut().enumerate() {
            switch.is_on = i == index;
            found |= switch.is_on;
        }
        found
    }

    /// Turn on the first switch matching `predicate` and turn every other switch off
    pub fn switch_where(&mut self, mut predicate: impl FnMut(&SwitchValue) -> bool) -> bool {
        let mut found = false;
        for switch in self.items.iter_mut() {
            switch.is_on = !found && predicate(switch);
            found |= switch.is_on;
        }
        found
    }

    pub fn first_enabled(&self) -> Option<&SwitchValue> {
        self.items.iter().find(|s| s.is_on)
    }

    pub fn switch(&self, name: &str) -> Option<&SwitchValue> {
        self.get(name)
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.get(name).map(|s| s.is_on).unwrap_or(false)
    }
}

impl PropertyVector<NumberValue> {
    pub fn value_of(&self, name: &str) -> Option<f64> {
        self.get(name).map(|n| n.value)
    }
}

impl PropertyVector<TextValue> {
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.get(name).map(|t| t.value.as_str())
    }
}

// ============================================================================
// Property
// ============================================================================

/// A property vector of any leaf type
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Text(PropertyVector<TextValue>),
    Number(PropertyVector<NumberValue>),
    Switch(PropertyVector<SwitchValue>),
    Light(PropertyVector<LightValue>),
    Blob(PropertyVector<BlobValue>),
}

macro_rules! each_vector {
    ($property:expr, $v:ident => $body:expr) => {
        match $property {
            Property::Text($v) => $body,
            Property::Number($v) => $body,
            Property::Switch($v) => $body,
            Property::Light($v) => $body,
            Property::Blob($v) => $body,
        }
    };
}

impl Property {
    pub fn name(&self) -> &str {
        each_vector!(self, v => &v.name)
    }

    pub fn label(&self) -> &str {
        each_vector!(self, v => &v.label)
    }

    pub fn group(&self) -> Option<&str> {
        each_vector!(self, v => v.group.as_deref())
    }

    pub fn state(&self) -> Option<PropertyState> {
        each_vector!(self, v => v.state)
    }

    pub fn permission(&self) -> Option<IndiPermission> {
        each_vector!(self, v => v.permission)
    }

    pub fn timestamp(&self) -> Option<&str> {
        each_vector!(self, v => v.timestamp.as_deref())
    }

    pub fn comment(&self) -> Option<&str> {
        each_vector!(self, v => v.comment.as_deref())
    }

    pub fn is_writable(&self) -> bool {
        each_vector!(self, v => v.is_writable())
    }

    pub fn len(&self) -> usize {
        each_vector!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        each_vector!(self, v => v.is_empty())
    }

    /// Leaf type name as used in tags
    pub fn type_name(&self) -> &'static str {
        match self {
            Property::Text(_) => TextValue::TYPE_NAME,
            Property::Number(_) => NumberValue::TYPE_NAME,
            Property::Switch(_) => SwitchValue::TYPE_NAME,
            Property::Light(_) => LightValue::TYPE_NAME,
            Property::Blob(_) => BlobValue::TYPE_NAME,
        }
    }

    /// All leaves as type-erased values
    pub fn values(&self) -> Vec<PropertyValue> {
        match self {
            Property::Text(v) => v.iter().cloned().map(PropertyValue::Text).collect(),
            Property::Number(v) => v.iter().cloned().map(PropertyValue::Number).collect(),
            Property::Switch(v) => v.iter().cloned().map(PropertyValue::Switch).collect(),
            Property::Light(v) => v.iter().cloned().map(PropertyValue::Light).collect(),
            Property::Blob(v) => v.iter().cloned().map(PropertyValue::Blob).collect(),
        }
    }

    pub fn as_vector<T: IndiValue>(&self) -> Option<&PropertyVector<T>> {
        T::unwrap_ref(self)
    }

    pub fn as_vector_mut<T: IndiValue>(&mut self) -> Option<&mut PropertyVector<T>> {
        T::unwrap_mut(self)
    }

    /// Merge `update` into this property by leaf name.
    ///
    /// Returns false (and changes nothing) when the leaf types differ.
    pub fn try_update(&mut self, update: &Property) -> bool {
        match (self, update) {
            (Property::Text(a), Property::Text(b)) => a.merge(b),
            (Property::Number(a), Property::Number(b)) => a.merge(b),
            (Property::Switch(a), Property::Switch(b)) => a.merge(b),
            (Property::Light(a), Property::Light(b)) => a.merge(b),
            (Property::Blob(a), Property::Blob(b)) => a.merge(b),
            _ => return false,
        }
        true
    }

    pub fn to_element(&self, kind: MessageKind, device: Option<&str>) -> IndiResult<XmlElement> {
        each_vector!(self, v => v.to_element(kind, device))
    }

    /// `new*Vector` element sent by clients
    pub fn create_for_new(&self, device: Option<&str>) -> IndiResult<String> {
        write_element(&self.to_element(MessageKind::New, device)?)
    }

    /// `set*Vector` element as sent by servers
    pub fn create_for_set(&self, device: Option<&str>) -> IndiResult<String> {
        write_element(&self.to_element(MessageKind::Set, device)?)
    }

    /// `def*Vector` element as sent by servers
    pub fn create_for_define(&self, device: Option<&str>) -> IndiResult<String> {
        write_element(&self.to_element(MessageKind::Define, device)?)
    }
}

impl<T: IndiValue> From<PropertyVector<T>> for Property {
    fn from(vector: PropertyVector<T>) -> Self {
        T::wrap(vector)
    }
}
