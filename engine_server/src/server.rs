//! Server implementation.
//!
//! The server is a [`GameState`] entered on the shared [`Runtime`]. It owns
//! the authoritative object manager and a table of connected clients:
//! - a listener task on the reactor accepts sockets and publishes JOIN
//! - JOIN sends the new client a snapshot of the scene
//! - DATA_IN payloads are decoded; PING is answered, object events are
//!   applied here and relayed to every joined client
//! - a periodic task replicates transforms at `replicate_hz`
//! - the optional demo scene spins two entities every tick
//!
//! All graph changes go through the event queue, so listeners and relays see
//! them in one order. Replication batches are built and sent under the same
//! send lock as relays, so a client never sees a transform older than a change
//! already relayed to it.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use engine_shared::{
    event::{Event, EventListener, EventPayload, EventQueue, EventSubType, EventType, ObjectEvent},
    math::{Quat, Vec3},
    net::{ClientId, Connection},
    objects::{ObjectChange, ObjectManager, ObjectRole, TRANSFORM_FIELDS},
    protocol::{decode_event, encode_event},
    runtime::{GameState, Runtime},
    scene::{Entity, NodeId, SceneObject},
    task::PeriodicHandle,
};
use parking_lot::Mutex;
use tokio::{net::TcpListener, runtime::Handle, task::AbortHandle};
use tracing::{debug, info, warn};

/// Radians per second for the demo spin.
const DEMO_SPIN_RATE: f32 = 1.0;

struct ClientSlot {
    conn: Arc<Connection>,
    /// Set once JOIN has been handled and the snapshot sent.
    joined: bool,
}

#[derive(Debug, Clone, Copy)]
struct DemoScene {
    spinners: [NodeId; 2],
    angle: f32,
}

/// Authoritative game state.
pub struct ServerGameState {
    this: Weak<ServerGameState>,
    objects: Arc<ObjectManager>,
    clients: Mutex<HashMap<ClientId, ClientSlot>>,
    /// Held from reading the graph until the resulting frames are queued.
    send_order: Mutex<()>,
    next_client: AtomicU32,
    local_addr: Mutex<Option<SocketAddr>>,
    accept: Mutex<Option<AbortHandle>>,
    replicate: Mutex<Option<PeriodicHandle>>,
    demo: Mutex<Option<DemoScene>>,
    paused: AtomicBool,
    /// Queue decoded client messages are published to; set by `create`.
    events: Mutex<Option<Arc<EventQueue>>>,
}

impl ServerGameState {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            objects: Arc::new(ObjectManager::new(ObjectRole::Authority)),
            clients: Mutex::new(HashMap::new()),
            send_order: Mutex::new(()),
            next_client: AtomicU32::new(1),
            local_addr: Mutex::new(None),
            accept: Mutex::new(None),
            replicate: Mutex::new(None),
            demo: Mutex::new(None),
            paused: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }

    /// Bound listen address, once created.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Clients that completed JOIN.
    pub fn client_count(&self) -> usize {
        self.clients.lock().values().filter(|c| c.joined).count()
    }

    pub fn objects(&self) -> &Arc<ObjectManager> {
        &self.objects
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Sends `events` to every joined client.
    pub fn broadcast(&self, events: &[Event]) {
        let frames = encode_all(events);
        if frames.is_empty() {
            return;
        }
        for (id, slot) in self.clients.lock().iter().filter(|(_, c)| c.joined) {
            send_frames(*id, &slot.conn, &frames);
        }
    }

    fn replicate_transforms(&self) {
        let _order = self.send_order.lock();
        let events: Vec<Event> = self
            .objects
            .update_events(&TRANSFORM_FIELDS)
            .into_iter()
            .map(Event::object)
            .collect();
        self.broadcast(&events);
    }

    fn build_demo_scene(&self) -> anyhow::Result<DemoScene> {
        let root = self.create_local(SceneObject::Node(Default::default()))?;

        let mut cube = Entity {
            mesh: "cube".into(),
            texture: "crate".into(),
            ..Entity::default()
        };
        let first = self.create_local(SceneObject::Entity(cube.clone()))?;

        cube.node.position = Vec3::new(2.0, 0.0, 0.0);
        cube.node.scale = Vec3::new(0.5, 0.5, 0.5);
        let second = self.create_local(SceneObject::Entity(cube))?;

        for (parent, child) in [(root, first), (first, second)] {
            self.objects
                .apply_object(&ObjectEvent::ChildAdd { parent, child })
                .with_context(|| format!("link {child} under {parent}"))?;
        }

        info!(root, first, second, "Demo scene built");
        Ok(DemoScene {
            spinners: [first, second],
            angle: 0.0,
        })
    }

    fn create_local(&self, obj: SceneObject) -> anyhow::Result<NodeId> {
        let event = ObjectEvent::Create {
            object_type: obj.object_type().as_u8(),
            fields: obj.serialize(&[]),
        };
        match self.objects.apply_object(&event)? {
            ObjectChange::Created { id, .. } => Ok(id),
            other => Err(anyhow!("unexpected create result {other:?}")),
        }
    }

    fn spin_demo(&self, rt: &Runtime, dt: Duration) {
        let mut demo = self.demo.lock();
        let Some(demo) = demo.as_mut() else {
            return;
        };
        demo.angle = (demo.angle + DEMO_SPIN_RATE * dt.as_secs_f32()) % std::f32::consts::TAU;
        let rotation = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), demo.angle);

        for id in demo.spinners {
            let Some(mut obj) = self.objects.get(id) else {
                continue;
            };
            obj.node_mut().rotation = rotation;
            rt.publish(Event::object(ObjectEvent::Update {
                object_id: id,
                fields: obj.serialize(&["rotation"]),
            }));
        }
    }

    fn on_join(&self, client_id: ClientId) {
        let _order = self.send_order.lock();
        let snapshot: Vec<Event> = self
            .objects
            .snapshot_events()
            .into_iter()
            .map(Event::object)
            .collect();
        let frames = encode_all(&snapshot);

        let mut clients = self.clients.lock();
        let Some(slot) = clients.get_mut(&client_id) else {
            debug!(%client_id, "JOIN for a client that already left");
            return;
        };
        slot.joined = true;
        send_frames(client_id, &slot.conn, &frames);
        info!(%client_id, peer = %slot.conn.peer(), objects = self.objects.len(), "Client joined");
    }

    fn on_part(&self, client_id: ClientId) {
        if let Some(slot) = self.clients.lock().remove(&client_id) {
            slot.conn.disconnect();
            info!(%client_id, "Client left");
        }
    }

    fn on_data(&self, client_id: ClientId, payload: &[u8]) {
        let event = match decode_event(client_id, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(%client_id, error = %e, "Dropped malformed message");
                return;
            }
        };
        match event.sub_type() {
            EventSubType::NetworkPing => {
                let pong = Event::signal(EventSubType::NetworkPong);
                if let Some(slot) = self.clients.lock().get(&client_id) {
                    send_frames(client_id, &slot.conn, &encode_all(&[pong]));
                }
            }
            EventSubType::NetworkPong => debug!(%client_id, "PONG"),
            _ => match self.events.lock().as_ref() {
                Some(events) => events.add_event(event),
                None => debug!(%client_id, "Dropped message after shutdown"),
            },
        }
    }

    fn on_object(&self, event: &Event) -> anyhow::Result<()> {
        let _order = self.send_order.lock();
        let change = self.objects.apply(event)?;
        debug!(
            event = %event.sub_type(),
            source = ?event.source(),
            ?change,
            "Applied object event"
        );

        let relay = match (&change, event.object_event()) {
            (ObjectChange::Unchanged, _) | (_, None) => None,
            // Local transform updates reach clients through replication.
            (ObjectChange::Updated { .. }, _) if event.source().is_none() => None,
            (ObjectChange::Created { id, .. }, _) => self.objects.create_event(*id),
            (_, Some(obj)) => Some(obj.clone()),
        };
        if let Some(obj) = relay {
            self.broadcast(&[Event::object(obj)]);
        }
        Ok(())
    }
}

impl EventListener for ServerGameState {
    fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        match event.kind() {
            EventType::Object => return self.on_object(event),
            EventType::State => {
                let paused = event.sub_type() == EventSubType::StateRunPause;
                self.paused.store(paused, Ordering::Release);
                info!(paused, source = ?event.source(), "Run state changed");
                return Ok(());
            }
            _ => {}
        }

        let Some(client_id) = event.source() else {
            return Ok(());
        };
        match (event.sub_type(), event.payload()) {
            (EventSubType::NetworkJoin, _) => self.on_join(client_id),
            (EventSubType::NetworkPart, _) => self.on_part(client_id),
            (EventSubType::NetworkDataIn, EventPayload::DataIn(data)) => {
                self.on_data(client_id, data)
            }
            _ => {}
        }
        Ok(())
    }
}

impl GameState for ServerGameState {
    fn name(&self) -> &str {
        "Server"
    }

    fn create(&self, rt: &Runtime) -> anyhow::Result<()> {
        let this = self
            .this
            .upgrade()
            .context("server state is not shared")?;
        let cfg = rt.config();

        let listener = rt
            .reactor()
            .block_on(TcpListener::bind((cfg.host.as_str(), cfg.port)))
            .with_context(|| format!("bind {}:{}", cfg.host, cfg.port))?;
        let local = listener.local_addr().context("listener address")?;
        *self.local_addr.lock() = Some(local);
        *self.events.lock() = Some(Arc::clone(rt.events()));

        if cfg.demo_scene {
            *self.demo.lock() = Some(self.build_demo_scene()?);
        }

        let listeners = vec![Arc::clone(&this) as Arc<dyn EventListener>];
        for kind in [EventType::Network, EventType::State, EventType::Object] {
            rt.dispatcher().replace_listeners(kind, listeners.clone());
        }

        let task = rt.reactor().spawn(accept_loop(
            listener,
            Arc::downgrade(&this),
            Arc::clone(rt.events()),
            rt.reactor().handle().clone(),
        ));
        *self.accept.lock() = Some(task.abort_handle());

        let weak = Arc::downgrade(&this);
        let replicate = rt.add_periodic("Replicate", cfg.replicate_interval(), move || {
            if let Some(server) = weak.upgrade() {
                server.replicate_transforms();
            }
        });
        *self.replicate.lock() = Some(replicate);

        info!(%local, demo = cfg.demo_scene, "Server listening");
        Ok(())
    }

    fn destroy(&self, rt: &Runtime) {
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        if let Some(replicate) = self.replicate.lock().take() {
            replicate.cancel();
        }
        for kind in [EventType::Network, EventType::State, EventType::Object] {
            rt.dispatcher().clear(kind);
        }
        self.events.lock().take();

        let clients: Vec<_> = self.clients.lock().drain().collect();
        for (client_id, slot) in clients {
            slot.conn.disconnect();
            debug!(%client_id, "Disconnected on shutdown");
        }
        info!("Server stopped");
    }

    fn tick(&self, rt: &Runtime, dt: Duration) {
        if !self.is_paused() {
            self.spin_demo(rt, dt);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Weak<ServerGameState>,
    events: Arc<EventQueue>,
    handle: Handle,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let Some(server) = server.upgrade() else {
            return;
        };

        let client_id = ClientId(server.next_client.fetch_add(1, Ordering::Relaxed));
        // The reader spawned by `attach` cannot run before this task yields,
        // so JOIN is queued ahead of any DATA_IN from the new client.
        match Connection::attach(stream, client_id, Arc::clone(&events), &handle) {
            Ok(conn) => {
                server.clients.lock().insert(
                    client_id,
                    ClientSlot {
                        conn,
                        joined: false,
                    },
                );
                events.add_event(Event::signal(EventSubType::NetworkJoin).with_source(client_id));
                debug!(%client_id, %peer, "Accepted connection");
            }
            Err(e) => warn!(%peer, error = %e, "Could not attach connection"),
        }
    }
}

fn encode_all(events: &[Event]) -> Vec<Bytes> {
    events
        .iter()
        .filter_map(|event| match encode_event(event) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(event = %event.sub_type(), error = %e, "Could not encode event");
                None
            }
        })
        .collect()
}

fn send_frames(client_id: ClientId, conn: &Connection, frames: &[Bytes]) {
    for payload in frames {
        if let Err(e) = conn.write(payload) {
            // The connection publishes PART for a dead socket.
            debug!(%client_id, error = %e, "Send failed");
            return;
        }
    }
}
