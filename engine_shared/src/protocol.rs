//! Event payload encoding.
//!
//! ```text
//! Payload = u8 eventType | u16 eventSubType | body
//! CREATE  = u8 objectType | field-blob
//! DESTROY = u32 objectId
//! UPDATE  = u32 objectId | field-blob
//! PARENT_ADD / PARENT_REMOVE = u32 child  | u32 parent
//! CHILD_ADD  / CHILD_REMOVE  = u32 parent | u32 child
//! ```
//!
//! Every other subtype carries an opaque body. JOIN, PART and DATA_IN are
//! produced locally by the connection layer and never encoded.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::{
    codec::{self, CodecError},
    event::{Event, EventPayload, EventSubType, EventType, ObjectEvent},
    net::ClientId,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    UnknownType(u8),
    UnknownSubType(u16),
    /// Subtype belongs to a different category than the type byte says.
    TypeMismatch { event_type: u8, sub_type: EventSubType },
    /// Connection-local subtype found on the wire or given to the encoder.
    NotTransmittable(EventSubType),
    /// Payload variant does not fit the subtype.
    PayloadMismatch(EventSubType),
    Truncated(CodecError),
    TrailingBytes(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownType(t) => write!(f, "unknown event type {t}"),
            ProtocolError::UnknownSubType(s) => write!(f, "unknown event subtype {s}"),
            ProtocolError::TypeMismatch {
                event_type,
                sub_type,
            } => write!(f, "subtype {sub_type} does not belong to event type {event_type}"),
            ProtocolError::NotTransmittable(s) => write!(f, "{s} is not sent over the wire"),
            ProtocolError::PayloadMismatch(s) => write!(f, "payload does not match {s}"),
            ProtocolError::Truncated(e) => write!(f, "truncated event body: {e}"),
            ProtocolError::TrailingBytes(n) => write!(f, "{n} trailing bytes after event body"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        ProtocolError::Truncated(e)
    }
}

pub fn encode_event(event: &Event) -> Result<Bytes, ProtocolError> {
    let sub = event.sub_type();
    if sub.is_local_only() {
        return Err(ProtocolError::NotTransmittable(sub));
    }

    let mut buf = BytesMut::new();
    codec::put_u8(&mut buf, event.kind().as_u8());
    codec::put_u16(&mut buf, sub.as_u16());

    match event.payload() {
        EventPayload::Object(obj) if obj.sub_type() == sub => encode_object(&mut buf, obj),
        EventPayload::Object(_) | EventPayload::DataIn(_) => {
            return Err(ProtocolError::PayloadMismatch(sub))
        }
        _ if event.kind() == EventType::Object => return Err(ProtocolError::PayloadMismatch(sub)),
        EventPayload::Raw(body) => buf.extend_from_slice(body),
        EventPayload::None => {}
    }
    Ok(buf.freeze())
}

fn encode_object(buf: &mut BytesMut, obj: &ObjectEvent) {
    match obj {
        ObjectEvent::Create {
            object_type,
            fields,
        } => {
            codec::put_u8(buf, *object_type);
            buf.extend_from_slice(fields);
        }
        ObjectEvent::Destroy { object_id } => codec::put_u32(buf, *object_id),
        ObjectEvent::Update { object_id, fields } => {
            codec::put_u32(buf, *object_id);
            buf.extend_from_slice(fields);
        }
        ObjectEvent::ParentAdd { child, parent } | ObjectEvent::ParentRemove { child, parent } => {
            codec::put_u32(buf, *child);
            codec::put_u32(buf, *parent);
        }
        ObjectEvent::ChildAdd { parent, child } | ObjectEvent::ChildRemove { parent, child } => {
            codec::put_u32(buf, *parent);
            codec::put_u32(buf, *child);
        }
    }
}

/// Decodes one frame payload received from `source`.
pub fn decode_event(source: ClientId, payload: &[u8]) -> Result<Event, ProtocolError> {
    let mut src = payload;
    let type_byte = codec::get_u8(&mut src)?;
    let kind = EventType::from_u8(type_byte).ok_or(ProtocolError::UnknownType(type_byte))?;
    let sub_value = codec::get_u16(&mut src)?;
    let sub = EventSubType::from_u16(sub_value).ok_or(ProtocolError::UnknownSubType(sub_value))?;

    if sub.event_type() != kind {
        return Err(ProtocolError::TypeMismatch {
            event_type: type_byte,
            sub_type: sub,
        });
    }
    if sub.is_local_only() {
        return Err(ProtocolError::NotTransmittable(sub));
    }

    let event = if kind == EventType::Object {
        Event::object(decode_object(sub, src)?)
    } else if src.is_empty() {
        Event::signal(sub)
    } else {
        Event::with_body(sub, Bytes::copy_from_slice(src))
    };
    Ok(event.with_source(source))
}

fn decode_object(sub: EventSubType, body: &[u8]) -> Result<ObjectEvent, ProtocolError> {
    let mut src = body;
    let obj = match sub {
        EventSubType::ObjectCreate => {
            let object_type = codec::get_u8(&mut src)?;
            let fields = Bytes::copy_from_slice(src);
            src = &[];
            ObjectEvent::Create {
                object_type,
                fields,
            }
        }
        EventSubType::ObjectUpdate => {
            let object_id = codec::get_u32(&mut src)?;
            let fields = Bytes::copy_from_slice(src);
            src = &[];
            ObjectEvent::Update { object_id, fields }
        }
        EventSubType::ObjectDestroy => ObjectEvent::Destroy {
            object_id: codec::get_u32(&mut src)?,
        },
        EventSubType::ObjectParentAdd | EventSubType::ObjectParentRemove => {
            let child = codec::get_u32(&mut src)?;
            let parent = codec::get_u32(&mut src)?;
            if sub == EventSubType::ObjectParentAdd {
                ObjectEvent::ParentAdd { child, parent }
            } else {
                ObjectEvent::ParentRemove { child, parent }
            }
        }
        EventSubType::ObjectChildAdd | EventSubType::ObjectChildRemove => {
            let parent = codec::get_u32(&mut src)?;
            let child = codec::get_u32(&mut src)?;
            if sub == EventSubType::ObjectChildAdd {
                ObjectEvent::ChildAdd { parent, child }
            } else {
                ObjectEvent::ChildRemove { parent, child }
            }
        }
        other => return Err(ProtocolError::PayloadMismatch(other)),
    };

    if !src.is_empty() {
        return Err(ProtocolError::TrailingBytes(src.len()));
    }
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let bytes = encode_event(&Event::signal(EventSubType::NetworkPing)).unwrap();
        assert_eq!(&bytes[..], &[1, 4, 0]);
    }

    #[test]
    fn relation_body_order_follows_subtype() {
        let add = encode_event(&Event::object(ObjectEvent::ParentAdd { child: 5, parent: 3 }))
            .unwrap();
        assert_eq!(&add[3..], &[5, 0, 0, 0, 3, 0, 0, 0]);

        let child = encode_event(&Event::object(ObjectEvent::ChildAdd { parent: 3, child: 5 }))
            .unwrap();
        assert_eq!(&child[3..], &[3, 0, 0, 0, 5, 0, 0, 0]);

        let back = decode_event(ClientId(2), &child).unwrap();
        assert_eq!(
            back.object_event(),
            Some(&ObjectEvent::ChildAdd { parent: 3, child: 5 })
        );
        assert_eq!(back.source(), Some(ClientId(2)));
    }

    #[test]
    fn create_keeps_field_blob_verbatim() {
        let fields = Bytes::from_static(&[0]);
        let event = Event::object(ObjectEvent::Create {
            object_type: 2,
            fields: fields.clone(),
        });
        let wire = encode_event(&event).unwrap();
        assert_eq!(&wire[..], &[3, 8, 0, 2, 0]);
        let back = decode_event(ClientId(1), &wire).unwrap();
        assert_eq!(back.payload(), event.payload());
    }

    #[test]
    fn unknown_and_mismatched_headers_fail() {
        assert_eq!(
            decode_event(ClientId(1), &[9, 0, 0]).unwrap_err(),
            ProtocolError::UnknownType(9)
        );
        assert_eq!(
            decode_event(ClientId(1), &[1, 99, 0]).unwrap_err(),
            ProtocolError::UnknownSubType(99)
        );
        assert!(matches!(
            decode_event(ClientId(1), &[3, 4, 0]).unwrap_err(),
            ProtocolError::TypeMismatch { .. }
        ));
        assert_eq!(
            decode_event(ClientId(1), &[1, 1, 0]).unwrap_err(),
            ProtocolError::NotTransmittable(EventSubType::NetworkJoin)
        );
    }

    #[test]
    fn short_and_long_bodies_fail() {
        assert!(matches!(
            decode_event(ClientId(1), &[3, 9, 0, 1, 0]).unwrap_err(),
            ProtocolError::Truncated(_)
        ));
        assert_eq!(
            decode_event(ClientId(1), &[3, 9, 0, 1, 0, 0, 0, 7]).unwrap_err(),
            ProtocolError::TrailingBytes(1)
        );
    }

    #[test]
    fn local_events_are_not_encoded() {
        let data_in = Event::data_in(ClientId(1), Bytes::from_static(b"x"));
        assert_eq!(
            encode_event(&data_in).unwrap_err(),
            ProtocolError::NotTransmittable(EventSubType::NetworkDataIn)
        );
        let bogus = Event::with_body(EventSubType::ObjectUpdate, Bytes::new());
        assert_eq!(
            encode_event(&bogus).unwrap_err(),
            ProtocolError::PayloadMismatch(EventSubType::ObjectUpdate)
        );
    }

    #[test]
    fn opaque_bodies_pass_through() {
        let event = Event::with_body(EventSubType::WindowResize, Bytes::from_static(&[1, 2, 3]));
        let back = decode_event(ClientId(4), &encode_event(&event).unwrap()).unwrap();
        assert_eq!(back.kind(), EventType::Window);
        assert_eq!(back.payload(), &EventPayload::Raw(Bytes::from_static(&[1, 2, 3])));
    }
}
