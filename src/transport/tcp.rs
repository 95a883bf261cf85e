//! Static-seed TCP mesh transport
//!
//! Nodes listen on a TCP port and dial a configured list of seed
//! addresses. Each connection starts with a Hello/HelloAck handshake that
//! exchanges peer ids and group memberships, after which frames flow both
//! ways.
//!
//! Two nodes that seed each other dial at the same time and end up with two
//! sockets. Both ends keep the one dialed by the lower peer id. The lower
//! end closes the other socket; the higher end keeps it parked until that
//! close arrives, so neither side ever sees the current connection drop.
//!
//! Wire format:  [4-byte big-endian length][JSON frame]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{Segments, Transport, TransportEvent};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// TCP mesh configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Port to listen on (0 = OS-assigned)
    pub listen_port: u16,

    /// Addresses (`host:port`) dialed on start
    pub seeds: Vec<String>,

    /// Maximum number of peer connections
    pub max_peers: usize,

    /// Timeout for establishing a connection and completing the handshake
    pub connect_timeout: Duration,

    /// First delay between seed dial attempts
    pub reconnect_interval: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            seeds: Vec::new(),
            max_peers: 32,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(2),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Mesh frames
// ─────────────────────────────────────────────────────────────────

/// Frames exchanged on a mesh connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshFrame {
    Hello {
        peer_id: String,
        name: String,
        #[serde(default)]
        groups: Vec<String>,
    },
    HelloAck {
        peer_id: String,
        name: String,
        #[serde(default)]
        groups: Vec<String>,
    },
    Join {
        group: String,
    },
    Leave {
        group: String,
    },
    Whisper {
        #[serde(with = "base64_segments")]
        segments: Segments,
    },
    Shout {
        group: String,
        #[serde(with = "base64_segments")]
        segments: Segments,
    },
}

impl MeshFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            MeshFrame::Hello { .. } => "HELLO",
            MeshFrame::HelloAck { .. } => "HELLO_ACK",
            MeshFrame::Join { .. } => "JOIN",
            MeshFrame::Leave { .. } => "LEAVE",
            MeshFrame::Whisper { .. } => "WHISPER",
            MeshFrame::Shout { .. } => "SHOUT",
        }
    }
}

mod base64_segments {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(segments: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = segments.iter().map(|s| STANDARD.encode(s)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection state
// ─────────────────────────────────────────────────────────────────

struct PeerConnection {
    /// Distinguishes a replaced connection from the current one
    conn_id: u64,

    name: String,

    /// Groups the peer announced
    groups: HashSet<String>,

    write_tx: mpsc::Sender<MeshFrame>,

    /// Dialed by the lower of the two peer ids
    preferred: bool,

    _writer: JoinHandle<()>,
}

/// What `attach` did with a handshaken connection
enum Attached {
    /// First connection to this peer
    Fresh,
    /// Took over from a connection dialed the other way
    Replaced,
    /// Superseded on arrival, left open until the peer closes it
    Parked,
    /// Superseded on arrival and closed
    Closed,
}

/// Identity learned in a handshake
struct Link {
    peer_id: String,
    name: String,
    groups: Vec<String>,
    /// We dialed
    outbound: bool,
}

struct MeshInner {
    config: TcpConfig,
    peer_id: String,
    name: String,
    groups: RwLock<HashSet<String>>,
    listener_addr: RwLock<Option<SocketAddr>>,
    connections: RwLock<HashMap<String, PeerConnection>>,
    /// Superseded connections kept open until the peer closes them, by conn id
    parked: Mutex<HashMap<u64, PeerConnection>>,
    next_conn_id: AtomicU64,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// ─────────────────────────────────────────────────────────────────
// TCP Transport
// ─────────────────────────────────────────────────────────────────

/// Transport over direct TCP connections between nodes
pub struct TcpTransport {
    inner: Arc<MeshInner>,
}

impl TcpTransport {
    /// Create a transport; `peer_id` defaults to a fresh UUID
    pub fn new(config: TcpConfig, name: impl Into<String>, peer_id: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(MeshInner {
                config,
                peer_id: peer_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                name: name.into(),
                groups: RwLock::new(HashSet::new()),
                listener_addr: RwLock::new(None),
                connections: RwLock::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                event_tx,
                event_rx: tokio::sync::Mutex::new(event_rx),
                running: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Local listen address once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listener_addr.read()
    }

    /// Ids of currently connected peers
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner.connections.read().keys().cloned().collect()
    }

    /// Name a connected peer gave in its handshake
    pub fn peer_name(&self, peer_id: &str) -> Option<String> {
        self.inner.connections.read().get(peer_id).map(|c| c.name.clone())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown_tx.send_replace(false);

        let bind_addr = format!("0.0.0.0:{}", self.inner.config.listen_port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(Error::transport(format!("failed to bind {}: {}", bind_addr, e)));
            }
        };
        let addr = listener
            .local_addr()
            .map_err(|e| Error::transport(format!("no local address: {}", e)))?;
        *self.inner.listener_addr.write() = Some(addr);
        info!(addr = %addr, peer = %self.inner.peer_id, "TCP mesh listening");

        let mesh = Arc::clone(&self.inner);
        self.inner.track(tokio::spawn(async move {
            mesh.accept_loop(listener).await;
        }));

        for seed in self.inner.config.seeds.clone() {
            let mesh = Arc::clone(&self.inner);
            self.inner.track(tokio::spawn(async move {
                mesh.seed_loop(seed).await;
            }));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.connections.write().clear();
        self.inner.parked.lock().clear();
        *self.inner.listener_addr.write() = None;

        info!(peer = %self.inner.peer_id, "TCP mesh stopped");
        Ok(())
    }

    async fn join(&self, group: &str) -> Result<()> {
        if !self.inner.groups.write().insert(group.to_string()) {
            return Ok(());
        }

        let targets = self.inner.all_writers();
        for (peer_id, tx) in targets {
            let frame = MeshFrame::Join {
                group: group.to_string(),
            };
            if tx.send(frame).await.is_err() {
                debug!(peer = %peer_id, "Failed to announce join to peer");
            }
        }
        Ok(())
    }

    async fn whisper(&self, peer_id: &str, segments: Segments) -> Result<()> {
        let tx = self
            .inner
            .connections
            .read()
            .get(peer_id)
            .map(|conn| conn.write_tx.clone())
            .ok_or_else(|| Error::transport(format!("not connected to peer {}", peer_id)))?;

        tx.send(MeshFrame::Whisper { segments })
            .await
            .map_err(|_| Error::transport(format!("write channel to peer {} closed", peer_id)))
    }

    async fn shout(&self, group: &str, segments: Segments) -> Result<()> {
        let targets: Vec<(String, mpsc::Sender<MeshFrame>)> = self
            .inner
            .connections
            .read()
            .iter()
            .filter(|(_, conn)| conn.groups.contains(group))
            .map(|(id, conn)| (id.clone(), conn.write_tx.clone()))
            .collect();

        for (peer_id, tx) in targets {
            let frame = MeshFrame::Shout {
                group: group.to_string(),
                segments: segments.clone(),
            };
            if tx.send(frame).await.is_err() {
                debug!(peer = %peer_id, group = %group, "Failed to shout to peer");
            }
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return None;
        }

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let mut rx = self.inner.event_rx.lock().await;
        tokio::select! {
            event = rx.recv() => event,
            _ = async {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection management
// ─────────────────────────────────────────────────────────────────

impl MeshInner {
    /// Accept incoming peer connections
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Incoming peer connection");

                    if self.connections.read().len() >= self.config.max_peers {
                        warn!(peer_addr = %peer_addr, "Max peers reached, rejecting");
                        drop(stream);
                        continue;
                    }

                    let mesh = Arc::clone(&self);
                    self.track(tokio::spawn(async move {
                        if let Err(e) = mesh.handle_inbound(stream).await {
                            debug!(error = %e, "Inbound connection failed");
                        }
                    }));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Wait for Hello, attach, then answer with HelloAck
    ///
    /// The ack is queued behind the attach so the dialer can only settle on
    /// this connection after we have.
    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let frame = tokio::time::timeout(self.config.connect_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::transport("hello timeout"))??;

        match frame {
            MeshFrame::Hello {
                peer_id,
                name,
                groups,
            } => {
                if peer_id == self.peer_id {
                    return Err(Error::transport("peer dialed itself"));
                }
                info!(peer = %peer_id, name = %name, "Peer connected (inbound)");
                let ack = MeshFrame::HelloAck {
                    peer_id: self.peer_id.clone(),
                    name: self.name.clone(),
                    groups: self.own_groups(),
                };
                let link = Link {
                    peer_id,
                    name,
                    groups,
                    outbound: false,
                };
                self.attach(link, stream, Some(ack)).await;
                Ok(())
            }
            other => {
                warn!(frame = %other.type_name(), "Expected Hello, got something else");
                Err(Error::transport("expected Hello frame"))
            }
        }
    }

    /// Keep a seed connected until the mesh stops
    async fn seed_loop(self: Arc<Self>, seed: String) {
        while self.running.load(Ordering::SeqCst) {
            let policy = ExponentialBackoff {
                current_interval: self.config.reconnect_interval,
                initial_interval: self.config.reconnect_interval,
                max_interval: self.config.reconnect_interval * 16,
                max_elapsed_time: None,
                ..Default::default()
            };

            let mesh = Arc::clone(&self);
            let addr = seed.clone();
            let dialed = backoff::future::retry(policy, || {
                let mesh = Arc::clone(&mesh);
                let addr = addr.clone();
                async move {
                    if !mesh.running.load(Ordering::SeqCst) {
                        return Err(backoff::Error::permanent(Error::Shutdown));
                    }
                    mesh.dial(&addr).await.map_err(|e| {
                        debug!(seed = %addr, error = %e, "Seed dial failed, retrying");
                        backoff::Error::transient(e)
                    })
                }
            })
            .await;

            let peer_id = match dialed {
                Ok(peer_id) => peer_id,
                Err(_) => return,
            };

            // Redial once the seed connection drops
            while self.running.load(Ordering::SeqCst) && self.connections.read().contains_key(&peer_id) {
                tokio::time::sleep(self.config.reconnect_interval).await;
            }
        }
    }

    /// Connect to an address and complete the handshake; returns the peer id
    async fn dial(self: &Arc<Self>, addr: &str) -> Result<String> {
        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::transport(format!("connection to {} timed out", addr)))?
            .map_err(|e| Error::transport(format!("connection to {} failed: {}", addr, e)))?;

        let hello = MeshFrame::Hello {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            groups: self.own_groups(),
        };
        write_frame(&mut stream, &hello).await?;

        let ack = tokio::time::timeout(self.config.connect_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::transport("HelloAck timeout"))??;

        match ack {
            MeshFrame::HelloAck {
                peer_id,
                name,
                groups,
            } => {
                if peer_id == self.peer_id {
                    return Err(Error::transport(format!("seed {} is this node", addr)));
                }
                info!(peer = %peer_id, addr = %addr, "Peer handshake complete (outbound)");
                let link = Link {
                    peer_id: peer_id.clone(),
                    name,
                    groups,
                    outbound: true,
                };
                self.attach(link, stream, None).await;
                Ok(peer_id)
            }
            other => Err(Error::transport(format!(
                "expected HelloAck, got {}",
                other.type_name()
            ))),
        }
    }

    /// Register a handshaken connection and spawn its reader and writer
    ///
    /// `first` is written before anything else on the connection.
    async fn attach(self: &Arc<Self>, link: Link, stream: TcpStream, first: Option<MeshFrame>) {
        let Link {
            peer_id,
            name,
            groups,
            outbound,
        } = link;
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel::<MeshFrame>(64);
        if let Some(frame) = first {
            // Fresh channel, cannot be full
            let _ = write_tx.try_send(frame);
        }

        let peer_w = peer_id.clone();
        let writer = tokio::spawn(async move {
            write_loop(peer_w, write_half, write_rx).await;
        });

        let lower = self.peer_id < peer_id;
        let groups: HashSet<String> = groups.into_iter().collect();
        let conn = PeerConnection {
            conn_id,
            name: name.clone(),
            groups: groups.clone(),
            write_tx,
            preferred: outbound == lower,
            _writer: writer,
        };

        let attached = {
            let mut conns = self.connections.write();
            if !self.running.load(Ordering::SeqCst) {
                debug!(peer = %peer_id, "Mesh stopped during handshake, dropping connection");
                return;
            }
            let supersedes = conns
                .get(&peer_id)
                .map(|existing| conn.preferred && !existing.preferred);
            match supersedes {
                None => {
                    conns.insert(peer_id.clone(), conn);
                    Attached::Fresh
                }
                Some(true) => {
                    if let Some(old) = conns.insert(peer_id.clone(), conn) {
                        self.retire(old, lower);
                    }
                    Attached::Replaced
                }
                Some(false) => self.retire(conn, lower),
            }
        };

        match attached {
            Attached::Fresh => {
                let _ = self
                    .event_tx
                    .send(TransportEvent::Enter {
                        peer_id: peer_id.clone(),
                        name,
                    })
                    .await;
                for group in groups {
                    let _ = self
                        .event_tx
                        .send(TransportEvent::Join {
                            peer_id: peer_id.clone(),
                            group,
                        })
                        .await;
                }
            }
            Attached::Replaced => debug!(peer = %peer_id, conn = conn_id, "Switched to preferred connection"),
            Attached::Parked => debug!(peer = %peer_id, conn = conn_id, "Parked duplicate connection"),
            Attached::Closed => {
                debug!(peer = %peer_id, conn = conn_id, "Closed duplicate connection");
                return;
            }
        }

        let mesh = Arc::clone(self);
        self.track(tokio::spawn(async move {
            mesh.read_loop(peer_id, conn_id, read_half).await;
        }));
    }

    /// Drop a superseded connection; the higher id parks it instead
    fn retire(&self, conn: PeerConnection, lower: bool) -> Attached {
        if lower {
            Attached::Closed
        } else {
            self.parked.lock().insert(conn.conn_id, conn);
            Attached::Parked
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Forward frames from a peer as transport events until the stream ends
    async fn read_loop(self: Arc<Self>, peer_id: String, conn_id: u64, mut reader: tokio::net::tcp::OwnedReadHalf) {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => self.handle_frame(&peer_id, frame).await,
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "Peer read error");
                    break;
                }
            }
        }

        let removed = {
            let mut conns = self.connections.write();
            match conns.get(&peer_id) {
                Some(conn) if conn.conn_id == conn_id => conns.remove(&peer_id).is_some(),
                _ => {
                    self.parked.lock().remove(&conn_id);
                    false
                }
            }
        };
        if removed {
            info!(peer = %peer_id, "Peer disconnected");
            let _ = self.event_tx.send(TransportEvent::Exit { peer_id }).await;
        }
    }

    async fn handle_frame(&self, peer_id: &str, frame: MeshFrame) {
        let event = match frame {
            MeshFrame::Whisper { segments } => TransportEvent::Whisper {
                peer_id: peer_id.to_string(),
                segments,
            },
            MeshFrame::Shout { group, segments } => TransportEvent::Shout {
                peer_id: peer_id.to_string(),
                group,
                segments,
            },
            MeshFrame::Join { group } => {
                if let Some(conn) = self.connections.write().get_mut(peer_id) {
                    conn.groups.insert(group.clone());
                }
                TransportEvent::Join {
                    peer_id: peer_id.to_string(),
                    group,
                }
            }
            MeshFrame::Leave { group } => {
                if let Some(conn) = self.connections.write().get_mut(peer_id) {
                    conn.groups.remove(&group);
                }
                TransportEvent::Leave {
                    peer_id: peer_id.to_string(),
                    group,
                }
            }
            other => {
                debug!(peer = %peer_id, frame = %other.type_name(), "Unexpected handshake frame");
                return;
            }
        };
        let _ = self.event_tx.send(event).await;
    }

    fn own_groups(&self) -> Vec<String> {
        self.groups.read().iter().cloned().collect()
    }

    fn all_writers(&self) -> Vec<(String, mpsc::Sender<MeshFrame>)> {
        self.connections
            .read()
            .iter()
            .map(|(id, conn)| (id.clone(), conn.write_tx.clone()))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Wire protocol: length-prefixed JSON framing
// ─────────────────────────────────────────────────────────────────

const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024; // 64 MB

/// Read a length-prefixed JSON frame from a stream
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<MeshFrame> {
    let len = reader
        .read_u32()
        .await
        .map_err(|e| Error::transport(format!("read failed: {}", e)))?;
    if len > MAX_FRAME_SIZE {
        return Err(Error::transport(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::transport(format!("read failed: {}", e)))?;

    serde_json::from_slice(&buf).map_err(|e| Error::transport(format!("malformed frame: {}", e)))
}

/// Write a length-prefixed JSON frame to a stream
async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &MeshFrame) -> Result<()> {
    let json = serde_json::to_vec(frame).map_err(|e| Error::transport(format!("encode failed: {}", e)))?;
    let len = json.len() as u32;

    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

/// Background task: writes frames to a peer from a channel
async fn write_loop(peer_id: String, mut writer: tokio::net::tcp::OwnedWriteHalf, mut write_rx: mpsc::Receiver<MeshFrame>) {
    while let Some(frame) = write_rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(peer = %peer_id, error = %e, "Peer write error");
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_defaults() {
        let config = TcpConfig::default();
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.max_peers, 32);
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn test_frame_serialize() {
        let frame = MeshFrame::Whisper {
            segments: vec![b"{\"k\":1}".to_vec(), vec![0, 159, 146, 150]],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("WHISPER"));
        assert!(json.contains("AJ+Slg=="));

        let back: MeshFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_frame_rejects_bad_base64() {
        let json = r#"{"type":"SHOUT","group":"g","segments":["***"]}"#;
        assert!(serde_json::from_str::<MeshFrame>(json).is_err());
    }

    #[tokio::test]
    async fn test_framing_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = MeshFrame::Join { group: "mktl-test".into() };

        write_frame(&mut client, &frame).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), frame);
    }

    async fn next(transport: &TcpTransport) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), transport.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("transport closed")
    }

    #[tokio::test]
    async fn test_two_nodes_connect_and_whisper() {
        let a = TcpTransport::new(TcpConfig::default(), "a", None);
        a.start().await.unwrap();
        let port = a.listen_addr().unwrap().port();

        let b = TcpTransport::new(
            TcpConfig {
                seeds: vec![format!("127.0.0.1:{}", port)],
                reconnect_interval: Duration::from_millis(50),
                ..Default::default()
            },
            "b",
            None,
        );
        b.start().await.unwrap();

        match next(&a).await {
            TransportEvent::Enter { peer_id, name } => {
                assert_eq!(peer_id, b.peer_id());
                assert_eq!(name, "b");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next(&b).await {
            TransportEvent::Enter { peer_id, .. } => assert_eq!(peer_id, a.peer_id()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(b.peer_name(a.peer_id()).as_deref(), Some("a"));

        b.whisper(a.peer_id(), vec![b"hello".to_vec()]).await.unwrap();
        assert_eq!(
            next(&a).await,
            TransportEvent::Whisper {
                peer_id: b.peer_id().to_string(),
                segments: vec![b"hello".to_vec()],
            }
        );

        b.stop().await.unwrap();
        assert_eq!(
            next(&a).await,
            TransportEvent::Exit {
                peer_id: b.peer_id().to_string()
            }
        );
        a.stop().await.unwrap();
        assert!(a.next_event().await.is_none());
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn seeding(name: &str, listen_port: u16, seed_port: u16) -> TcpTransport {
        TcpTransport::new(
            TcpConfig {
                listen_port,
                seeds: vec![format!("127.0.0.1:{}", seed_port)],
                reconnect_interval: Duration::from_millis(20),
                ..Default::default()
            },
            name,
            None,
        )
    }

    #[tokio::test]
    async fn test_mutual_seeds_settle_on_one_connection() {
        for _ in 0..10 {
            let (port_a, port_b) = (free_port(), free_port());
            let a = seeding("a", port_a, port_b);
            let b = seeding("b", port_b, port_a);
            let (started_a, started_b) = tokio::join!(a.start(), b.start());
            started_a.unwrap();
            started_b.unwrap();

            assert!(matches!(next(&a).await, TransportEvent::Enter { .. }));
            assert!(matches!(next(&b).await, TransportEvent::Enter { .. }));

            // Crossing dials resolve without a second Enter or any Exit
            let quiet = Duration::from_millis(300);
            assert!(tokio::time::timeout(quiet, a.next_event()).await.is_err());
            assert!(tokio::time::timeout(quiet, b.next_event()).await.is_err());
            assert_eq!(a.connected_peers(), vec![b.peer_id().to_string()]);
            assert_eq!(b.connected_peers(), vec![a.peer_id().to_string()]);

            b.whisper(a.peer_id(), vec![b"ping".to_vec()]).await.unwrap();
            assert!(matches!(next(&a).await, TransportEvent::Whisper { .. }));
            a.whisper(b.peer_id(), vec![b"pong".to_vec()]).await.unwrap();
            assert!(matches!(next(&b).await, TransportEvent::Whisper { .. }));

            a.stop().await.unwrap();
            b.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_handshake_after_stop_is_dropped() {
        let a = TcpTransport::new(TcpConfig::default(), "a", None);
        a.start().await.unwrap();
        let addr = a.listen_addr().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        // Let the accept loop pick it up and wait for Hello
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.stop().await.unwrap();
        let hello = MeshFrame::Hello {
            peer_id: "late".into(),
            name: "late".into(),
            groups: vec![],
        };
        let _ = write_frame(&mut stream, &hello).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_whisper_unknown_peer_fails() {
        let a = TcpTransport::new(TcpConfig::default(), "a", None);
        let err = a.whisper("nobody", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
