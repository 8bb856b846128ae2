//! Minimal XML element tree on top of quick-xml
//!
//! INDI traffic is a stream of sibling elements with no document envelope. The
//! reader side wraps the buffered stream in a synthetic root and only accepts
//! the result when the whole buffer is well formed.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::IndiResult;

const SYNTHETIC_ROOT: &str = "indiStream";

/// A parsed XML element with its attributes, child elements and text content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attribute value, if present
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attribute value, treating an empty attribute as missing
    pub fn attr_non_empty(&self, name: &str) -> Option<&str> {
        self.attr(name).filter(|v| !v.is_empty())
    }

    /// Text content with surrounding whitespace removed
    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}

/// Parse a buffered stream as a sequence of top-level elements.
///
/// Returns `None` while the buffer is not yet a well-formed fragment. Top-level
/// text between elements is dropped.
pub fn parse_fragment(buffer: &str) -> Option<Vec<XmlElement>> {
    let wrapped = format!("<{root}>{buffer}</{root}>", root = SYNTHETIC_ROOT);
    let mut reader = Reader::from_str(&wrapped);
    reader.trim_text(false);
    reader.check_end_names(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut finished: Option<XmlElement> = None;

    loop {
        let event = reader.read_event().ok()?;
        if finished.is_some() && !matches!(event, Event::Eof) {
            // Anything after the synthetic root means the buffer closed it early
            return None;
        }
        match event {
            Event::Start(start) => stack.push(start_element(&start)?),
            Event::Empty(start) => {
                let element = start_element(&start)?;
                stack.last_mut()?.children.push(element);
            }
            Event::End(_) => {
                let element = stack.pop()?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => finished = Some(element),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().ok()?;
                stack.last_mut()?.text.push_str(&text);
            }
            Event::CData(data) => {
                let bytes = data.into_inner();
                stack
                    .last_mut()?
                    .text
                    .push_str(&String::from_utf8_lossy(&bytes));
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions carry nothing for INDI
            _ => {}
        }
    }

    if !stack.is_empty() {
        return None;
    }
    finished.map(|root| root.children)
}

fn start_element(start: &BytesStart<'_>) -> Option<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.ok()?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().ok()?.into_owned();
        attributes.push((key, value));
    }
    Some(XmlElement {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Remove characters XML 1.0 does not allow in a document
pub fn strip_invalid_chars(text: &str) -> std::borrow::Cow<'_, str> {
    let valid = |c: char| matches!(c, '\t' | '\n' | '\r') || c >= '\u{20}' && c != '\u{FFFE}' && c != '\u{FFFF}';
    if text.chars().all(valid) {
        std::borrow::Cow::Borrowed(text)
    } else {
        std::borrow::Cow::Owned(text.chars().filter(|c| valid(*c)).collect())
    }
}

/// Serialize an element tree
pub fn write_element(element: &XmlElement) -> IndiResult<String> {
    let mut writer = Writer::new(Vec::new());
    write_into(&mut writer, element)?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

fn write_into(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> IndiResult<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if !element.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&element.text)))?;
    }
    for child in &element.children {
        write_into(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

/// Builder-style helpers used by the encoders
impl XmlElement {
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Add an attribute only when the value is present and non-empty
    pub fn with_opt_attr(mut self, key: &str, value: Option<&str>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.set_attr(key, value);
        }
        self
    }

    /// Add or overwrite an attribute
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }
}
