//! Client implementation.
//!
//! The client maintains:
//! - One connection to the server, opened by a one-shot task
//! - A replica object manager fed by decoded DATA_IN payloads
//! - A render backend drawing the replica once per tick
//! - An input source publishing into the shared event queue

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::Context;
use engine_shared::{
    event::{Event, EventListener, EventPayload, EventQueue, EventSubType, EventType},
    net::{self, ClientId, Connection},
    objects::{ObjectManager, ObjectRole},
    protocol::{decode_event, encode_event},
    render::{render_frame, NullRenderer, RenderBackend},
    runtime::{GameState, Runtime},
    task::Task,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::input::{InputEvent, InputSource};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not created yet.
    Idle,
    /// Connect task scheduled or running.
    Connecting,
    /// JOIN received.
    Connected,
    /// Connect failed or the server went away. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        })
    }
}

/// Client game state.
pub struct ClientGameState {
    this: Weak<ClientGameState>,
    objects: Arc<ObjectManager>,
    state: Mutex<ConnectionState>,
    conn: Mutex<Option<Arc<Connection>>>,
    renderer: Mutex<Box<dyn RenderBackend>>,
    input: InputSource,
    events: Mutex<Option<Arc<EventQueue>>>,
    frames: AtomicU64,
    pongs: AtomicU64,
    window: Mutex<(u32, u32)>,
}

impl ClientGameState {
    pub fn new() -> Arc<Self> {
        Self::with_renderer(Box::new(NullRenderer::default()))
    }

    pub fn with_renderer(renderer: Box<dyn RenderBackend>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            objects: Arc::new(ObjectManager::new(ObjectRole::Replica)),
            state: Mutex::new(ConnectionState::Idle),
            conn: Mutex::new(None),
            renderer: Mutex::new(renderer),
            input: InputSource::new(),
            events: Mutex::new(None),
            frames: AtomicU64::new(0),
            pongs: AtomicU64::new(0),
            window: Mutex::new((0, 0)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// JOIN handled and the connection handed over by the connect task.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.conn.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Scene as replicated from the server.
    pub fn objects(&self) -> &Arc<ObjectManager> {
        &self.objects
    }

    pub fn input(&self) -> &InputSource {
        &self.input
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn pongs(&self) -> u64 {
        self.pongs.load(Ordering::Relaxed)
    }

    /// Last size reported by a WINDOW_RESIZE event.
    pub fn window_size(&self) -> (u32, u32) {
        *self.window.lock()
    }

    /// Encodes `event` and sends it to the server.
    pub fn send(&self, event: &Event) -> anyhow::Result<()> {
        let payload = encode_event(event)?;
        let conn = self.conn.lock().clone().context("not connected")?;
        conn.write(&payload)
            .with_context(|| format!("send {}", event.sub_type()))
    }

    pub fn ping(&self) -> anyhow::Result<()> {
        self.send(&Event::signal(EventSubType::NetworkPing))
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        // Closed is terminal.
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    fn run_connect(&self, rt: &Runtime) {
        let cfg = rt.config();
        info!(host = %cfg.host, port = cfg.port, "Connecting to server");
        match net::connect(
            &cfg.host,
            cfg.port,
            ClientId::SERVER,
            Arc::clone(rt.events()),
            rt.reactor(),
        ) {
            Ok(conn) => {
                *self.conn.lock() = Some(conn);
                // Shut down while connecting.
                if self.is_closed() {
                    self.close();
                }
            }
            // PART has already been published.
            Err(e) => error!(error = %e, "Connect failed"),
        }
    }

    fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        if let Some(conn) = self.conn.lock().take() {
            conn.disconnect();
        }
    }

    fn on_data(&self, payload: &[u8]) {
        let event = match decode_event(ClientId::SERVER, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropped malformed message from server");
                return;
            }
        };
        match event.sub_type() {
            EventSubType::NetworkPing => {
                if let Err(e) = self.send(&Event::signal(EventSubType::NetworkPong)) {
                    debug!(error = %format!("{e:#}"), "Could not answer PING");
                }
            }
            EventSubType::NetworkPong => {
                self.pongs.fetch_add(1, Ordering::Relaxed);
                debug!("PONG");
            }
            _ => match self.events.lock().as_ref() {
                Some(events) => events.add_event(event),
                None => debug!("Dropped message after shutdown"),
            },
        }
    }

    fn on_input(&self, event: &Event) -> anyhow::Result<()> {
        let input = InputEvent::from_event(event)?;
        match input {
            InputEvent::Resize { width, height } => {
                *self.window.lock() = (width, height);
                info!(width, height, "Window resized");
            }
            InputEvent::FocusChange { focused } => debug!(focused, "Focus changed"),
            other => debug!(input = ?other, "Input"),
        }
        Ok(())
    }
}

impl EventListener for ClientGameState {
    fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        match (event.sub_type(), event.payload()) {
            (EventSubType::NetworkJoin, _) => {
                self.set_state(ConnectionState::Connected);
                info!("Joined server");
            }
            (EventSubType::NetworkPart, _) => {
                if !self.is_closed() {
                    info!("Disconnected from server");
                }
                self.close();
            }
            (EventSubType::NetworkDataIn, EventPayload::DataIn(data)) => self.on_data(data),
            _ if matches!(event.kind(), EventType::Input | EventType::Window) => {
                return self.on_input(event)
            }
            _ => {}
        }
        Ok(())
    }
}

impl GameState for ClientGameState {
    fn name(&self) -> &str {
        "Client"
    }

    fn create(&self, rt: &Runtime) -> anyhow::Result<()> {
        let this = self
            .this
            .upgrade()
            .context("client state is not shared")?;

        *self.events.lock() = Some(Arc::clone(rt.events()));
        self.input.set_event_queue(Arc::clone(rt.events()));

        let listener = Arc::clone(&this) as Arc<dyn EventListener>;
        for kind in [EventType::Network, EventType::Input, EventType::Window] {
            rt.dispatcher().replace_listeners(kind, vec![listener.clone()]);
        }
        let replica = Arc::clone(&self.objects) as Arc<dyn EventListener>;
        rt.dispatcher().replace_listeners(EventType::Object, vec![replica]);

        self.set_state(ConnectionState::Connecting);
        let weak = Arc::downgrade(&this);
        let task_rt = rt.clone();
        rt.add_task(Task::new("Connect", move || {
            if let Some(client) = weak.upgrade() {
                client.run_connect(&task_rt);
            }
        }));
        Ok(())
    }

    fn destroy(&self, rt: &Runtime) {
        self.close();
        for kind in [
            EventType::Network,
            EventType::Object,
            EventType::Input,
            EventType::Window,
        ] {
            rt.dispatcher().clear(kind);
        }
        self.events.lock().take();
        info!(frames = self.frames(), "Client stopped");
    }

    fn tick(&self, _rt: &Runtime, _dt: Duration) {
        let items = self.objects.render_items();
        let mut renderer = self.renderer.lock();
        render_frame(&mut **renderer, &items);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use engine_shared::{
        event::ObjectEvent,
        math::Vec3,
        render::RenderItem,
        scene::{Entity, SceneObject},
    };

    fn server_frame(event: &Event) -> Event {
        Event::data_in(ClientId::SERVER, encode_event(event).unwrap())
    }

    struct Recording(Arc<Mutex<Vec<usize>>>);

    impl RenderBackend for Recording {
        fn begin_frame(&mut self) {
            self.0.lock().push(0);
        }

        fn draw(&mut self, _item: &RenderItem) {
            if let Some(last) = self.0.lock().last_mut() {
                *last += 1;
            }
        }

        fn end_frame(&mut self) {}
    }

    #[test]
    fn join_and_part_drive_the_state() {
        let client = ClientGameState::new();
        assert_eq!(client.state(), ConnectionState::Idle);

        client
            .handle_event(&Event::signal(EventSubType::NetworkJoin).with_source(ClientId::SERVER))
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        client
            .handle_event(&Event::signal(EventSubType::NetworkPart).with_source(ClientId::SERVER))
            .unwrap();
        assert!(client.is_closed());

        client
            .handle_event(&Event::signal(EventSubType::NetworkJoin))
            .unwrap();
        assert!(client.is_closed());
    }

    #[test]
    fn server_object_events_are_republished() {
        let client = ClientGameState::new();
        let queue = Arc::new(EventQueue::new());
        *client.events.lock() = Some(Arc::clone(&queue));

        let mut entity = Entity::default();
        entity.node.id = 12;
        entity.node.position = Vec3::new(0.0, 1.0, 0.0);
        let obj = SceneObject::Entity(entity);
        let create = Event::object(ObjectEvent::Create {
            object_type: obj.object_type().as_u8(),
            fields: obj.serialize(&[]),
        });

        client.handle_event(&server_frame(&create)).unwrap();
        let republished = queue.get_event().unwrap();
        assert_eq!(republished.sub_type(), EventSubType::ObjectCreate);
        assert_eq!(republished.source(), Some(ClientId::SERVER));

        client.objects().apply(&republished).unwrap();
        assert!(client.objects().contains(12));
    }

    #[test]
    fn pong_is_counted_and_junk_dropped() {
        let client = ClientGameState::new();
        client
            .handle_event(&server_frame(&Event::signal(EventSubType::NetworkPong)))
            .unwrap();
        assert_eq!(client.pongs(), 1);

        let junk = Event::data_in(ClientId::SERVER, Bytes::from_static(&[3, 0xff, 0xff]));
        client.handle_event(&junk).unwrap();
        assert_eq!(client.pongs(), 1);
    }

    #[test]
    fn resize_input_updates_window_size() {
        let client = ClientGameState::new();
        let resize = InputEvent::Resize {
            width: 800,
            height: 600,
        }
        .to_event()
        .unwrap();
        client.handle_event(&resize).unwrap();
        assert_eq!(client.window_size(), (800, 600));
    }

    #[test]
    fn send_without_connection_fails() {
        let client = ClientGameState::new();
        assert!(client.ping().is_err());
    }

    #[test]
    fn tick_draws_replicated_entities() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let client = ClientGameState::with_renderer(Box::new(Recording(Arc::clone(&frames))));

        let obj = SceneObject::Entity(Entity::default());
        client
            .objects()
            .apply_object(&ObjectEvent::Create {
                object_type: obj.object_type().as_u8(),
                fields: obj.serialize(&[]),
            })
            .unwrap();

        let rt = Runtime::new(Default::default()).unwrap();
        client.tick(&rt, Duration::from_millis(20));
        client.tick(&rt, Duration::from_millis(20));
        assert_eq!(*frames.lock(), vec![1, 1]);
        assert_eq!(client.frames(), 2);
    }
}
