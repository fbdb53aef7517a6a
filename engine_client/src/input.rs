//! Input handling.
//!
//! A windowing layer samples devices and hands [`InputEvent`]s to an
//! [`InputSource`], which turns them into INPUT/WINDOW events on the same
//! queue the network layer publishes to. Listeners registered for those types
//! see them in arrival order alongside everything else.

use std::{fmt, sync::Arc};

use bytes::BytesMut;
use engine_shared::{
    codec::{self, CodecError},
    event::{Event, EventPayload, EventQueue, EventSubType},
};
use parking_lot::Mutex;
use tracing::trace;

/// Device or window input at a moment in time.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    MouseButton { button: u8, pressed: bool, x: f32, y: f32 },
    MouseMove { x: f32, y: f32, dx: f32, dy: f32 },
    MouseWheel { dx: f32, dy: f32 },
    Key { code: u32, modifiers: u16, pressed: bool },
    TextInput(String),
    TextEditing { text: String, start: u32, length: u32 },
    Joystick { device: u8, axis: u8, value: f32 },
    Resize { width: u32, height: u32 },
    FocusChange { focused: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// Event is not an INPUT or WINDOW subtype.
    NotInput(EventSubType),
    Codec(CodecError),
    TrailingBytes(usize),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::NotInput(sub) => write!(f, "{sub} is not an input event"),
            InputError::Codec(e) => write!(f, "bad input body: {e}"),
            InputError::TrailingBytes(n) => write!(f, "{n} unread bytes after input body"),
        }
    }
}

impl std::error::Error for InputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InputError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for InputError {
    fn from(e: CodecError) -> Self {
        InputError::Codec(e)
    }
}

impl InputEvent {
    pub fn sub_type(&self) -> EventSubType {
        match self {
            InputEvent::MouseButton { pressed: true, .. } => EventSubType::InputMouseDown,
            InputEvent::MouseButton { pressed: false, .. } => EventSubType::InputMouseUp,
            InputEvent::MouseMove { .. } => EventSubType::InputMouseMove,
            InputEvent::MouseWheel { .. } => EventSubType::InputMouseWheel,
            InputEvent::Key { pressed: true, .. } => EventSubType::InputKeyDown,
            InputEvent::Key { pressed: false, .. } => EventSubType::InputKeyUp,
            InputEvent::TextInput(_) => EventSubType::InputTextInput,
            InputEvent::TextEditing { .. } => EventSubType::InputTextEditing,
            InputEvent::Joystick { .. } => EventSubType::InputJoystick,
            InputEvent::Resize { .. } => EventSubType::WindowResize,
            InputEvent::FocusChange { .. } => EventSubType::WindowFocusChange,
        }
    }

    /// Encodes into an event whose body uses the wire codec, so it can also
    /// be sent to a server unchanged.
    pub fn to_event(&self) -> Result<Event, InputError> {
        let mut buf = BytesMut::new();
        match self {
            InputEvent::MouseButton { button, x, y, .. } => {
                codec::put_u8(&mut buf, *button);
                codec::put_f32(&mut buf, *x);
                codec::put_f32(&mut buf, *y);
            }
            InputEvent::MouseMove { x, y, dx, dy } => {
                for v in [*x, *y, *dx, *dy] {
                    codec::put_f32(&mut buf, v);
                }
            }
            InputEvent::MouseWheel { dx, dy } => {
                codec::put_f32(&mut buf, *dx);
                codec::put_f32(&mut buf, *dy);
            }
            InputEvent::Key {
                code, modifiers, ..
            } => {
                codec::put_u32(&mut buf, *code);
                codec::put_u16(&mut buf, *modifiers);
            }
            InputEvent::TextInput(text) => codec::put_string(&mut buf, text)?,
            InputEvent::TextEditing {
                text,
                start,
                length,
            } => {
                codec::put_string(&mut buf, text)?;
                codec::put_u32(&mut buf, *start);
                codec::put_u32(&mut buf, *length);
            }
            InputEvent::Joystick {
                device,
                axis,
                value,
            } => {
                codec::put_u8(&mut buf, *device);
                codec::put_u8(&mut buf, *axis);
                codec::put_f32(&mut buf, *value);
            }
            InputEvent::Resize { width, height } => {
                codec::put_u32(&mut buf, *width);
                codec::put_u32(&mut buf, *height);
            }
            InputEvent::FocusChange { focused } => codec::put_u8(&mut buf, u8::from(*focused)),
        }
        Ok(Event::with_body(self.sub_type(), buf.freeze()))
    }

    pub fn from_event(event: &Event) -> Result<Self, InputError> {
        let body: &[u8] = match event.payload() {
            EventPayload::Raw(body) => body,
            _ => &[],
        };
        let mut src = body;
        let src = &mut src;

        use EventSubType::*;
        let input = match event.sub_type() {
            sub @ (InputMouseDown | InputMouseUp) => InputEvent::MouseButton {
                button: codec::get_u8(src)?,
                pressed: sub == InputMouseDown,
                x: codec::get_f32(src)?,
                y: codec::get_f32(src)?,
            },
            InputMouseMove => InputEvent::MouseMove {
                x: codec::get_f32(src)?,
                y: codec::get_f32(src)?,
                dx: codec::get_f32(src)?,
                dy: codec::get_f32(src)?,
            },
            InputMouseWheel => InputEvent::MouseWheel {
                dx: codec::get_f32(src)?,
                dy: codec::get_f32(src)?,
            },
            sub @ (InputKeyDown | InputKeyUp) => InputEvent::Key {
                code: codec::get_u32(src)?,
                modifiers: codec::get_u16(src)?,
                pressed: sub == InputKeyDown,
            },
            InputTextInput => InputEvent::TextInput(codec::get_string(src)?),
            InputTextEditing => InputEvent::TextEditing {
                text: codec::get_string(src)?,
                start: codec::get_u32(src)?,
                length: codec::get_u32(src)?,
            },
            InputJoystick => InputEvent::Joystick {
                device: codec::get_u8(src)?,
                axis: codec::get_u8(src)?,
                value: codec::get_f32(src)?,
            },
            WindowResize => InputEvent::Resize {
                width: codec::get_u32(src)?,
                height: codec::get_u32(src)?,
            },
            WindowFocusChange => InputEvent::FocusChange {
                focused: codec::get_u8(src)? != 0,
            },
            other => return Err(InputError::NotInput(other)),
        };

        if !src.is_empty() {
            return Err(InputError::TrailingBytes(src.len()));
        }
        Ok(input)
    }
}

/// Publishes input into an injected event queue.
#[derive(Default)]
pub struct InputSource {
    queue: Mutex<Option<Arc<EventQueue>>>,
}

impl InputSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_event_queue(&self, queue: Arc<EventQueue>) {
        *self.queue.lock() = Some(queue);
    }

    /// Returns `Ok(false)` when no queue is attached yet.
    pub fn inject(&self, input: &InputEvent) -> Result<bool, InputError> {
        let event = input.to_event()?;
        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return Ok(false);
        };
        trace!(event = %event.sub_type(), "Input injected");
        queue.add_event(event);
        Ok(true)
    }
}
