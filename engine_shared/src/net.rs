//! Connections.
//!
//! A [`Connection`] is one TCP endpoint attached to the [`IoReactor`]. Its
//! read task owns a fixed-size read buffer and its own [`FrameReader`]; every
//! complete frame becomes a DATA_IN event on the shared queue. Outbound
//! payloads are framed and handed to a single writer task through the
//! connection's write lock, so frames from different producers never
//! interleave.
//!
//! A read error, write error, EOF or corrupt length prefix publishes PART and
//! closes the socket. There is no retry and no timeout.

use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    runtime::Handle,
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, error, info};

use crate::{
    event::{Event, EventQueue, EventSubType},
    frame::{encode_frame, FrameError, FrameReader},
    reactor::IoReactor,
};

/// Default listen/connect port.
pub const DEFAULT_PORT: u16 = 22001;

/// Size of the per-connection socket read buffer.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Identifies a connection. On a client the server connection uses
/// [`ClientId::SERVER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum NetError {
    /// Name resolution failed.
    Resolve { host: String, source: io::Error },
    /// Every resolved address refused or failed.
    ConnectFailed {
        host: String,
        port: u16,
        attempts: usize,
        last: Option<io::Error>,
    },
    Io(io::Error),
    NotConnected,
    Frame(FrameError),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Resolve { host, source } => write!(f, "failed to resolve '{host}': {source}"),
            NetError::ConnectFailed {
                host,
                port,
                attempts,
                last,
            } => {
                write!(f, "could not connect to {host}:{port} ({attempts} addresses tried")?;
                match last {
                    Some(e) => write!(f, ", last error: {e})"),
                    None => write!(f, ")"),
                }
            }
            NetError::Io(e) => write!(f, "socket error: {e}"),
            NetError::NotConnected => write!(f, "connection is closed"),
            NetError::Frame(e) => write!(f, "framing: {e}"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Resolve { source, .. } => Some(source),
            NetError::ConnectFailed { last, .. } => {
                last.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
            }
            NetError::Io(e) => Some(e),
            NetError::Frame(e) => Some(e),
            NetError::NotConnected => None,
        }
    }
}

impl From<FrameError> for NetError {
    fn from(e: FrameError) -> Self {
        NetError::Frame(e)
    }
}

/// One attached socket.
pub struct Connection {
    client_id: ClientId,
    peer: SocketAddr,
    connected: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Splits `stream` into reader and writer tasks on the reactor behind
    /// `handle`. The stream must already be registered with that reactor.
    pub fn attach(
        stream: TcpStream,
        client_id: ClientId,
        events: Arc<EventQueue>,
        handle: &Handle,
    ) -> Result<Arc<Self>, NetError> {
        let peer = stream.peer_addr().map_err(NetError::Io)?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();

        let connected = Arc::new(AtomicBool::new(true));
        let link = Link {
            client_id,
            connected: Arc::clone(&connected),
            events,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = handle.spawn(read_loop(rd, link.clone()));
        handle.spawn(write_loop(wr, rx, link, reader.abort_handle()));

        debug!(%client_id, %peer, "Connection attached");
        Ok(Arc::new(Self {
            client_id,
            peer,
            connected,
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(reader.abort_handle())),
        }))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Frames `payload` and queues it for the writer.
    pub fn write(&self, payload: &[u8]) -> Result<(), NetError> {
        let frame = encode_frame(payload)?;
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if self.is_connected() => tx.send(frame).map_err(|_| NetError::NotConnected),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Closes the socket locally. Does not publish PART.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        // Dropping the sender lets the writer flush what is queued and shut
        // the write half down.
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// State shared by a connection's read and write tasks.
#[derive(Clone)]
struct Link {
    client_id: ClientId,
    connected: Arc<AtomicBool>,
    events: Arc<EventQueue>,
}

impl Link {
    /// Publishes PART unless the other task or a local disconnect got there
    /// first.
    fn drop_link(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(client_id = %self.client_id, %reason, "Connection dropped");
            self.events
                .add_event(Event::signal(EventSubType::NetworkPart).with_source(self.client_id));
        }
    }
}

async fn read_loop(mut rd: OwnedReadHalf, link: Link) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut frames = FrameReader::new();

    let reason = loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read error: {e}"),
        };

        frames.push(&buf[..n]);
        match drain_frames(&mut frames, link.client_id, &link.events) {
            Ok(()) => {}
            Err(e) => break format!("protocol error: {e}"),
        }
    };

    link.drop_link(&reason);
}

fn drain_frames(
    frames: &mut FrameReader,
    client_id: ClientId,
    events: &EventQueue,
) -> Result<(), FrameError> {
    while let Some(payload) = frames.next_frame()? {
        events.add_event(Event::data_in(client_id, payload));
    }
    Ok(())
}

/// Writes queued frames in order. A failed write drops the link and stops
/// the reader, so both socket halves close.
async fn write_loop<W>(
    mut wr: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    link: Link,
    reader: AbortHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = wr.write_all(&frame).await {
            link.drop_link(&format!("write error: {e}"));
            reader.abort();
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// Blocking client connect.
///
/// Resolves `host`, tries each address in turn and on success publishes JOIN
/// before arming the read loop. Any failure publishes PART.
pub fn connect(
    host: &str,
    port: u16,
    client_id: ClientId,
    events: Arc<EventQueue>,
    reactor: &IoReactor,
) -> Result<Arc<Connection>, NetError> {
    let part = |events: &EventQueue| {
        events.add_event(Event::signal(EventSubType::NetworkPart).with_source(client_id));
    };

    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(source) => {
            error!(%host, port, error = %source, "Name resolution failed");
            part(&events);
            return Err(NetError::Resolve {
                host: host.to_string(),
                source,
            });
        }
    };

    let mut last = None;
    let mut stream = None;
    for addr in &addrs {
        match std::net::TcpStream::connect(addr) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => {
                debug!(%addr, error = %e, "Connect attempt failed");
                last = Some(e);
            }
        }
    }

    let Some(stream) = stream else {
        error!(%host, port, attempts = addrs.len(), "Could not connect");
        part(&events);
        return Err(NetError::ConnectFailed {
            host: host.to_string(),
            port,
            attempts: addrs.len(),
            last,
        });
    };

    let attached = stream.set_nonblocking(true).map_err(NetError::Io).and_then(|()| {
        events.add_event(Event::signal(EventSubType::NetworkJoin).with_source(client_id));
        let _enter = reactor.enter();
        let stream = TcpStream::from_std(stream).map_err(NetError::Io)?;
        Connection::attach(stream, client_id, Arc::clone(&events), reactor.handle())
    });

    match attached {
        Ok(conn) => {
            info!(%client_id, peer = %conn.peer(), "Connected");
            Ok(conn)
        }
        Err(e) => {
            error!(%host, port, error = %e, "Could not arm connection");
            part(&events);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use std::{
        io::{Read, Write},
        time::{Duration, Instant},
    };

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    fn pump_until(reactor: &IoReactor, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            reactor.step();
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn drain(events: &EventQueue) -> Vec<Event> {
        std::iter::from_fn(|| events.get_event()).collect()
    }

    #[test]
    fn connect_publishes_join_then_data_in() {
        init_tracing();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reactor = IoReactor::new().unwrap();
        let events = Arc::new(EventQueue::new());

        let conn = connect("127.0.0.1", port, ClientId::SERVER, Arc::clone(&events), &reactor)
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut wire = encode_frame(b"hello").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"world").unwrap());
        peer.write_all(&wire).unwrap();

        assert!(pump_until(&reactor, Duration::from_secs(5), || events.event_count() >= 3));
        let got = drain(&events);
        assert_eq!(got[0].sub_type(), EventSubType::NetworkJoin);
        assert_eq!(got[1].payload(), &EventPayload::DataIn(Bytes::from_static(b"hello")));
        assert_eq!(got[2].payload(), &EventPayload::DataIn(Bytes::from_static(b"world")));

        conn.write(b"ping").unwrap();
        let mut back = [0u8; 6];
        peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut read = 0;
        while read < back.len() && Instant::now() < deadline {
            reactor.step();
            match peer.read(&mut back[read..]) {
                Ok(n) => read += n,
                Err(_) => continue,
            }
        }
        assert_eq!(&back, &[6, 0, b'p', b'i', b'n', b'g']);
    }

    #[test]
    fn peer_close_publishes_part_once() {
        init_tracing();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reactor = IoReactor::new().unwrap();
        let events = Arc::new(EventQueue::new());

        let conn = connect("127.0.0.1", port, ClientId(7), Arc::clone(&events), &reactor).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        assert!(pump_until(&reactor, Duration::from_secs(5), || !conn.is_connected()));
        let subs: Vec<_> = drain(&events).iter().map(Event::sub_type).collect();
        assert_eq!(subs, vec![EventSubType::NetworkJoin, EventSubType::NetworkPart]);
        assert!(matches!(conn.write(b"late"), Err(NetError::NotConnected)));
    }

    #[test]
    fn refused_connect_publishes_part() {
        init_tracing();
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let reactor = IoReactor::new().unwrap();
        let events = Arc::new(EventQueue::new());

        let err = connect("127.0.0.1", port, ClientId::SERVER, Arc::clone(&events), &reactor)
            .unwrap_err();
        assert!(matches!(err, NetError::ConnectFailed { attempts: 1, .. }));
        assert_eq!(
            events.get_event().map(|e| e.sub_type()),
            Some(EventSubType::NetworkPart)
        );
    }

    #[test]
    fn write_error_publishes_part_and_stops_reader() {
        init_tracing();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let events = Arc::new(EventQueue::new());
        let connected = Arc::new(AtomicBool::new(true));
        let link = Link {
            client_id: ClientId(3),
            connected: Arc::clone(&connected),
            events: Arc::clone(&events),
        };

        let (wr, peer) = tokio::io::duplex(64);
        drop(peer);
        let reader = rt.spawn(std::future::pending::<()>());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(encode_frame(b"lost").unwrap()).unwrap();

        rt.block_on(write_loop(wr, rx, link.clone(), reader.abort_handle()));

        assert!(!connected.load(Ordering::Acquire));
        assert!(rt.block_on(reader).unwrap_err().is_cancelled());
        // A reader finishing afterwards does not publish a second PART.
        link.drop_link("connection closed by peer");
        let subs: Vec<_> = drain(&events).iter().map(Event::sub_type).collect();
        assert_eq!(subs, vec![EventSubType::NetworkPart]);
        assert_eq!(drain(&events).len(), 0);
    }

    #[test]
    fn concurrent_writers_never_interleave_frames() {
        init_tracing();
        const WRITERS: u8 = 4;
        const PER_WRITER: u8 = 25;
        const BODY: usize = 300;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reactor = IoReactor::new().unwrap();
        let events = Arc::new(EventQueue::new());

        let conn = connect("127.0.0.1", port, ClientId::SERVER, Arc::clone(&events), &reactor)
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || {
                    for seq in 0..PER_WRITER {
                        let mut payload = vec![writer; BODY];
                        payload[1] = seq;
                        conn.write(&payload).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let expected = usize::from(WRITERS) * usize::from(PER_WRITER);
        let mut frames = FrameReader::new();
        let mut got = Vec::new();
        let mut buf = [0u8; 4096];
        peer.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while got.len() < expected && Instant::now() < deadline {
            reactor.step();
            if let Ok(n) = peer.read(&mut buf) {
                frames.push(&buf[..n]);
            }
            while let Some(payload) = frames.next_frame().unwrap() {
                got.push(payload);
            }
        }

        assert_eq!(got.len(), expected);
        let mut next_seq = [0u8; WRITERS as usize];
        for payload in &got {
            assert_eq!(payload.len(), BODY);
            let writer = payload[0];
            assert!(payload[2..].iter().all(|b| *b == writer));
            // Each writer's frames arrive in the order it sent them.
            assert_eq!(payload[1], next_seq[usize::from(writer)]);
            next_seq[usize::from(writer)] += 1;
        }
        assert_eq!(next_seq, [PER_WRITER; WRITERS as usize]);
    }

    #[test]
    fn corrupt_length_drops_connection() {
        init_tracing();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reactor = IoReactor::new().unwrap();
        let events = Arc::new(EventQueue::new());

        let conn = connect("127.0.0.1", port, ClientId::SERVER, Arc::clone(&events), &reactor)
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(&[1, 0, 0xAA]).unwrap();

        assert!(pump_until(&reactor, Duration::from_secs(5), || !conn.is_connected()));
        let last = drain(&events).pop().map(|e| e.sub_type());
        assert_eq!(last, Some(EventSubType::NetworkPart));
    }
}
