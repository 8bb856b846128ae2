//! Server element decoding
//!
//! Maps top-level elements to [`ServerMessage`]s. Vector types are picked from
//! the tag suffix through a single lookup table.

use crate::error::IndiError;
use crate::message::{ServerMessage, SkipReason};
use crate::value::{BlobValue, IndiValue, LightValue, NumberValue, SwitchValue, TextValue};
use crate::vector::{Property, PropertyVector};
use crate::xml::XmlElement;

type VectorDecoder = fn(&XmlElement) -> Property;

fn decode_vector<T: IndiValue>(element: &XmlElement) -> Property {
    T::wrap(PropertyVector::<T>::from_element(element))
}

/// Tag suffix → vector constructor
const VECTOR_DECODERS: &[(&str, VectorDecoder)] = &[
    ("TextVector", decode_vector::<TextValue>),
    ("NumberVector", decode_vector::<NumberValue>),
    ("SwitchVector", decode_vector::<SwitchValue>),
    ("LightVector", decode_vector::<LightValue>),
    ("BLOBVector", decode_vector::<BlobValue>),
];

/// Result of decoding one top-level element
#[derive(Debug, Clone)]
pub enum Decoded {
    Message(ServerMessage),
    Skipped(SkipReason),
    Invalid { tag: String, error: IndiError },
}

/// Decode a vector element of any type, if its tag has a known suffix
pub fn decode_property(element: &XmlElement) -> Option<Property> {
    VECTOR_DECODERS
        .iter()
        .find(|(suffix, _)| element.name.ends_with(suffix))
        .map(|(_, decode)| decode(element))
}

/// Turn one top-level element into a server message
pub fn decode_message(element: &XmlElement) -> Decoded {
    let tag = element.name.as_str();
    match tag {
        "delProperty" => Decoded::Message(ServerMessage::DeleteProperty {
            device: owned(element.attr_non_empty("device")),
            property: owned(element.attr_non_empty("name")),
            timestamp: owned(element.attr_non_empty("timestamp")),
            message: owned(element.attr_non_empty("message")),
        }),
        "message" => Decoded::Message(ServerMessage::Notification {
            device: owned(element.attr_non_empty("device")),
            timestamp: owned(element.attr_non_empty("timestamp")),
            message: element.attr("message").unwrap_or_default().to_string(),
        }),
        _ if tag.starts_with("def") => decode_vector_message(element, true),
        _ if tag.starts_with("set") => decode_vector_message(element, false),
        _ => Decoded::Skipped(SkipReason::UnknownTag(tag.to_string())),
    }
}

fn decode_vector_message(element: &XmlElement, define: bool) -> Decoded {
    let Some(value) = decode_property(element) else {
        return Decoded::Skipped(SkipReason::UnknownTag(element.name.clone()));
    };

    let device = element.attr("device").unwrap_or_default().trim().to_string();
    let property = value.name().to_string();
    if property.is_empty() {
        return Decoded::Invalid {
            tag: element.name.clone(),
            error: IndiError::ProtocolError(format!("<{}> without a name", element.name)),
        };
    }

    if define {
        if device.is_empty() {
            return Decoded::Invalid {
                tag: element.name.clone(),
                error: IndiError::ProtocolError(format!(
                    "<{} name=\"{}\"> without a device",
                    element.name, property
                )),
            };
        }
        Decoded::Message(ServerMessage::DefineProperty {
            device,
            property,
            value,
        })
    } else {
        Decoded::Message(ServerMessage::SetProperty {
            device,
            property,
            value,
        })
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_fragment;

    fn decode(xml: &str) -> Decoded {
        let elements = parse_fragment(xml).expect("well-formed test input");
        decode_message(&elements[0])
    }

    #[test]
    fn test_every_vector_type_is_recognized() {
        for (tag, leaf, type_name) in [
            ("defTextVector", "defText", "Text"),
            ("defNumberVector", "defNumber", "Number"),
            ("defSwitchVector", "defSwitch", "Switch"),
            ("defLightVector", "defLight", "Light"),
            ("defBLOBVector", "defBLOB", "BLOB"),
        ] {
            let xml = format!(r#"<{tag} device="d" name="p"><{leaf} name="x"/></{tag}>"#);
            match decode(&xml) {
                Decoded::Message(ServerMessage::DefineProperty { value, .. }) => {
                    assert_eq!(value.type_name(), type_name);
                    assert_eq!(value.len(), 1);
                }
                other => panic!("unexpected decode of {}: {:?}", tag, other),
            }
        }
    }

    #[test]
    fn test_set_vector_decoding() {
        let decoded = decode(
            r#"<setSwitchVector device="Mount" name="CONNECTION" state="Ok">
                <oneSwitch name="CONNECT">On</oneSwitch>
            </setSwitchVector>"#,
        );
        match decoded {
            Decoded::Message(ServerMessage::SetProperty {
                device,
                property,
                value,
            }) => {
                assert_eq!(device, "Mount");
                assert_eq!(property, "CONNECTION");
                let switches = value.as_vector::<SwitchValue>().unwrap();
                assert!(switches.is_on("CONNECT"));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_delete_and_message_decoding() {
        match decode(r#"<delProperty device="CCD" timestamp="2024-01-01T00:00:00"/>"#) {
            Decoded::Message(ServerMessage::DeleteProperty {
                device,
                property,
                timestamp,
                ..
            }) => {
                assert_eq!(device.as_deref(), Some("CCD"));
                assert_eq!(property, None);
                assert!(timestamp.is_some());
            }
            other => panic!("unexpected decode: {:?}", other),
        }

        match decode(r#"<message message="Dome closed"/>"#) {
            Decoded::Message(ServerMessage::Notification { device, message, .. }) => {
                assert_eq!(device, None);
                assert_eq!(message, "Dome closed");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        for xml in [
            r#"<getProperties version="1.7"/>"#,
            r#"<newNumberVector device="d" name="p"/>"#,
            r#"<defFancyVector device="d" name="p"/>"#,
            r#"<defText name="t">bare leaf</defText>"#,
        ] {
            assert!(
                matches!(decode(xml), Decoded::Skipped(SkipReason::UnknownTag(_))),
                "{} should be skipped",
                xml
            );
        }
    }

    #[test]
    fn test_define_requires_device_and_name() {
        assert!(matches!(
            decode(r#"<defTextVector name="p"><defText name="x"/></defTextVector>"#),
            Decoded::Invalid { .. }
        ));
        assert!(matches!(
            decode(r#"<defTextVector device="d"><defText name="x"/></defTextVector>"#),
            Decoded::Invalid { .. }
        ));
    }

    #[test]
    fn test_server_encoding_decodes_back() {
        let original = ServerMessage::DefineProperty {
            device: "Focuser".to_string(),
            property: "ABS_FOCUS_POSITION".to_string(),
            value: PropertyVector::with_items(
                "ABS_FOCUS_POSITION",
                [NumberValue::new("FOCUS_ABSOLUTE_POSITION", 12000.0).with_range(0.0, 50000.0, 10.0)],
            )
            .into(),
        };
        let xml = original.encode().unwrap();
        match decode(&xml) {
            Decoded::Message(decoded) => assert_eq!(decoded, original),
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
