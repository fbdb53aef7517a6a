//! Event pipeline.
//!
//! Everything that happens to a game state arrives as an [`Event`]: socket
//! traffic from the connection layer, object mutations, input and window
//! notifications injected by a front-end. Producers push into the shared
//! [`EventQueue`]; a single pump drains it and fans each event out through the
//! [`EventDispatcher`] to the listeners registered for its type.

use std::{collections::VecDeque, fmt, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::net::ClientId;

/// Top-level event category. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    Undef = 0,
    Network = 1,
    State = 2,
    Object = 3,
    Input = 4,
    Window = 5,
}

impl EventType {
    pub const COUNT: usize = 6;

    pub const ALL: [EventType; Self::COUNT] = [
        EventType::Undef,
        EventType::Network,
        EventType::State,
        EventType::Object,
        EventType::Input,
        EventType::Window,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Undef => "UNDEF",
            EventType::Network => "NETWORK",
            EventType::State => "STATE",
            EventType::Object => "OBJECT",
            EventType::Input => "INPUT",
            EventType::Window => "WINDOW",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subtype within a category. Numbered globally; the discriminant is the wire
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventSubType {
    Undef = 0,

    NetworkJoin = 1,
    NetworkPart = 2,
    NetworkDataIn = 3,
    NetworkPing = 4,
    NetworkPong = 5,

    StateRunStart = 6,
    StateRunPause = 7,

    ObjectCreate = 8,
    ObjectDestroy = 9,
    ObjectUpdate = 10,
    ObjectParentAdd = 11,
    ObjectParentRemove = 12,
    ObjectChildAdd = 13,
    ObjectChildRemove = 14,

    InputMouseDown = 15,
    InputMouseUp = 16,
    InputMouseMove = 17,
    InputMouseWheel = 18,
    InputKeyDown = 19,
    InputKeyUp = 20,
    InputTextInput = 21,
    InputTextEditing = 22,
    InputJoystick = 23,

    WindowResize = 24,
    WindowFocusChange = 25,
}

impl EventSubType {
    const ALL: [EventSubType; 26] = [
        EventSubType::Undef,
        EventSubType::NetworkJoin,
        EventSubType::NetworkPart,
        EventSubType::NetworkDataIn,
        EventSubType::NetworkPing,
        EventSubType::NetworkPong,
        EventSubType::StateRunStart,
        EventSubType::StateRunPause,
        EventSubType::ObjectCreate,
        EventSubType::ObjectDestroy,
        EventSubType::ObjectUpdate,
        EventSubType::ObjectParentAdd,
        EventSubType::ObjectParentRemove,
        EventSubType::ObjectChildAdd,
        EventSubType::ObjectChildRemove,
        EventSubType::InputMouseDown,
        EventSubType::InputMouseUp,
        EventSubType::InputMouseMove,
        EventSubType::InputMouseWheel,
        EventSubType::InputKeyDown,
        EventSubType::InputKeyUp,
        EventSubType::InputTextInput,
        EventSubType::InputTextEditing,
        EventSubType::InputJoystick,
        EventSubType::WindowResize,
        EventSubType::WindowFocusChange,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Category this subtype belongs to.
    pub fn event_type(self) -> EventType {
        use EventSubType::*;
        match self {
            Undef => EventType::Undef,
            NetworkJoin | NetworkPart | NetworkDataIn | NetworkPing | NetworkPong => {
                EventType::Network
            }
            StateRunStart | StateRunPause => EventType::State,
            ObjectCreate | ObjectDestroy | ObjectUpdate | ObjectParentAdd | ObjectParentRemove
            | ObjectChildAdd | ObjectChildRemove => EventType::Object,
            InputMouseDown | InputMouseUp | InputMouseMove | InputMouseWheel | InputKeyDown
            | InputKeyUp | InputTextInput | InputTextEditing | InputJoystick => EventType::Input,
            WindowResize | WindowFocusChange => EventType::Window,
        }
    }

    /// Connection-local subtypes that never cross the wire.
    pub fn is_local_only(self) -> bool {
        matches!(
            self,
            EventSubType::NetworkJoin | EventSubType::NetworkPart | EventSubType::NetworkDataIn
        )
    }

    pub fn name(self) -> &'static str {
        use EventSubType::*;
        match self {
            Undef => "UNDEF",
            NetworkJoin => "NETWORK_JOIN",
            NetworkPart => "NETWORK_PART",
            NetworkDataIn => "NETWORK_DATA_IN",
            NetworkPing => "NETWORK_PING",
            NetworkPong => "NETWORK_PONG",
            StateRunStart => "STATE_RUN_START",
            StateRunPause => "STATE_RUN_PAUSE",
            ObjectCreate => "OBJECT_CREATE",
            ObjectDestroy => "OBJECT_DESTROY",
            ObjectUpdate => "OBJECT_UPDATE",
            ObjectParentAdd => "OBJECT_PARENT_ADD",
            ObjectParentRemove => "OBJECT_PARENT_REMOVE",
            ObjectChildAdd => "OBJECT_CHILD_ADD",
            ObjectChildRemove => "OBJECT_CHILD_REMOVE",
            InputMouseDown => "INPUT_MOUSE_DOWN",
            InputMouseUp => "INPUT_MOUSE_UP",
            InputMouseMove => "INPUT_MOUSE_MOVE",
            InputMouseWheel => "INPUT_MOUSE_WHEEL",
            InputKeyDown => "INPUT_KEY_DOWN",
            InputKeyUp => "INPUT_KEY_UP",
            InputTextInput => "INPUT_TEXT_INPUT",
            InputTextEditing => "INPUT_TEXT_EDITING",
            InputJoystick => "INPUT_JOYSTICK",
            WindowResize => "WINDOW_RESIZE",
            WindowFocusChange => "WINDOW_FOCUS_CHANGE",
        }
    }
}

impl fmt::Display for EventSubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Object mutation carried by an OBJECT event. Ids are raw node ids.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Create { object_type: u8, fields: Bytes },
    Destroy { object_id: u32 },
    Update { object_id: u32, fields: Bytes },
    ParentAdd { child: u32, parent: u32 },
    ParentRemove { child: u32, parent: u32 },
    ChildAdd { parent: u32, child: u32 },
    ChildRemove { parent: u32, child: u32 },
}

impl ObjectEvent {
    pub fn sub_type(&self) -> EventSubType {
        match self {
            ObjectEvent::Create { .. } => EventSubType::ObjectCreate,
            ObjectEvent::Destroy { .. } => EventSubType::ObjectDestroy,
            ObjectEvent::Update { .. } => EventSubType::ObjectUpdate,
            ObjectEvent::ParentAdd { .. } => EventSubType::ObjectParentAdd,
            ObjectEvent::ParentRemove { .. } => EventSubType::ObjectParentRemove,
            ObjectEvent::ChildAdd { .. } => EventSubType::ObjectChildAdd,
            ObjectEvent::ChildRemove { .. } => EventSubType::ObjectChildRemove,
        }
    }
}

/// Subtype-specific body.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    None,
    /// One reassembled frame payload, not yet decoded.
    DataIn(Bytes),
    Object(ObjectEvent),
    /// Opaque body (input, window, state and ping bodies).
    Raw(Bytes),
}

#[derive(Debug, Clone)]
pub struct Event {
    sub_type: EventSubType,
    created_at: DateTime<Utc>,
    source: Option<ClientId>,
    payload: EventPayload,
}

impl Event {
    pub fn new(sub_type: EventSubType, payload: EventPayload) -> Self {
        Self {
            sub_type,
            created_at: Utc::now(),
            source: None,
            payload,
        }
    }

    /// Payload-less event, e.g. JOIN/PART/PING.
    pub fn signal(sub_type: EventSubType) -> Self {
        Self::new(sub_type, EventPayload::None)
    }

    pub fn data_in(source: ClientId, data: Bytes) -> Self {
        Self::new(EventSubType::NetworkDataIn, EventPayload::DataIn(data)).with_source(source)
    }

    pub fn object(event: ObjectEvent) -> Self {
        Self::new(event.sub_type(), EventPayload::Object(event))
    }

    pub fn with_body(sub_type: EventSubType, body: Bytes) -> Self {
        Self::new(sub_type, EventPayload::Raw(body))
    }

    /// Tags the connection this event came from (or concerns).
    pub fn with_source(mut self, source: ClientId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> EventType {
        self.sub_type.event_type()
    }

    pub fn sub_type(&self) -> EventSubType {
        self.sub_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source(&self) -> Option<ClientId> {
        self.source
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn object_event(&self) -> Option<&ObjectEvent> {
        match &self.payload {
            EventPayload::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// Thread-safe FIFO shared by every producer.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    pub fn get_event(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let dropped = events.len();
        events.clear();
        dropped
    }
}

/// Receives events of the types it was registered for.
pub trait EventListener: Send + Sync {
    fn handle_event(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Per-type listener fan-out.
pub struct EventDispatcher {
    listeners: [Mutex<Vec<Arc<dyn EventListener>>>; EventType::COUNT],
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self {
            listeners: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<usize> = self.listeners.iter().map(|l| l.lock().len()).collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: EventType) -> &Mutex<Vec<Arc<dyn EventListener>>> {
        &self.listeners[kind.as_u8() as usize]
    }

    pub fn add_listener(&self, kind: EventType, listener: Arc<dyn EventListener>) {
        self.slot(kind).lock().push(listener);
    }

    /// Swaps out every listener for `kind` at once.
    pub fn replace_listeners(&self, kind: EventType, listeners: Vec<Arc<dyn EventListener>>) {
        *self.slot(kind).lock() = listeners;
    }

    pub fn clear(&self, kind: EventType) {
        self.slot(kind).lock().clear();
    }

    pub fn clear_all(&self) {
        for slot in &self.listeners {
            slot.lock().clear();
        }
    }

    pub fn listener_count(&self, kind: EventType) -> usize {
        self.slot(kind).lock().len()
    }

    /// Calls every listener for the event's type in registration order.
    ///
    /// The listener set is snapshotted first, so a listener may register or
    /// replace listeners without deadlocking. Every listener runs even if an
    /// earlier one fails; the first failure is returned.
    pub fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        let listeners = self.slot(event.kind()).lock().clone();

        let mut first_err = None;
        for (index, listener) in listeners.iter().enumerate() {
            if let Err(e) = listener.handle_event(event) {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!(
                        event = %event.sub_type(),
                        listener = index,
                        error = %e,
                        "Additional listener failure"
                    );
                }
            }
        }

        match first_err {
            Some(e) => Err(e.context(format!("handling {}", event.sub_type()))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(log: &Arc<Mutex<Vec<usize>>>, tag: usize) -> Arc<dyn EventListener> {
        let log = Arc::clone(log);
        Arc::new(move |_: &Event| -> anyhow::Result<()> {
            log.lock().push(tag);
            Ok(())
        })
    }

    #[test]
    fn queue_is_fifo() {
        let q = EventQueue::new();
        q.add_event(Event::signal(EventSubType::NetworkPing));
        q.add_event(Event::signal(EventSubType::NetworkPong));
        assert_eq!(q.event_count(), 2);
        assert_eq!(q.get_event().map(|e| e.sub_type()), Some(EventSubType::NetworkPing));
        assert_eq!(q.get_event().map(|e| e.sub_type()), Some(EventSubType::NetworkPong));
        assert!(q.get_event().is_none());
    }

    #[test]
    fn listeners_run_once_each_in_registration_order() {
        let d = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5 {
            d.add_listener(EventType::Network, recording(&log, tag));
        }
        d.add_listener(EventType::Object, recording(&log, 99));

        d.handle_event(&Event::signal(EventSubType::NetworkJoin))
            .unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn failing_listener_does_not_stop_the_rest() {
        let d = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        d.add_listener(EventType::Window, recording(&log, 1));
        d.add_listener(
            EventType::Window,
            Arc::new(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("boom") }),
        );
        d.add_listener(EventType::Window, recording(&log, 3));

        let err = d
            .handle_event(&Event::signal(EventSubType::WindowResize))
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert_eq!(*log.lock(), vec![1, 3]);
    }

    #[test]
    fn replace_swaps_the_whole_set() {
        let d = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        d.add_listener(EventType::Input, recording(&log, 1));
        d.add_listener(EventType::Input, recording(&log, 2));
        d.replace_listeners(EventType::Input, vec![recording(&log, 7)]);
        assert_eq!(d.listener_count(EventType::Input), 1);

        d.handle_event(&Event::signal(EventSubType::InputKeyDown))
            .unwrap();
        assert_eq!(*log.lock(), vec![7]);

        d.clear_all();
        assert_eq!(d.listener_count(EventType::Input), 0);
    }

    #[test]
    fn subtypes_map_to_their_category() {
        for value in 0..26u16 {
            let sub = EventSubType::from_u16(value).unwrap();
            assert_eq!(sub.as_u16(), value);
        }
        assert!(EventSubType::from_u16(26).is_none());
        assert!(EventType::from_u8(6).is_none());

        assert_eq!(EventSubType::NetworkPong.event_type(), EventType::Network);
        assert_eq!(EventSubType::ObjectChildRemove.event_type(), EventType::Object);
        assert_eq!(EventSubType::WindowFocusChange.event_type(), EventType::Window);
        assert_eq!(EventSubType::ObjectParentAdd.to_string(), "OBJECT_PARENT_ADD");
    }

    #[test]
    fn object_constructor_derives_subtype() {
        let e = Event::object(ObjectEvent::ChildAdd { parent: 3, child: 5 });
        assert_eq!(e.kind(), EventType::Object);
        assert_eq!(e.sub_type(), EventSubType::ObjectChildAdd);
        assert!(e.source().is_none());
    }
}
