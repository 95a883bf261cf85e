//! The coordinator: one receive task, a pool of workers and the
//! capability-announcement protocol
//!
//! The receive task drains the transport. Control traffic (`peer.keys`,
//! `key.announce`) and replies to pending requests are handled on that task
//! so capability updates are applied in arrival order. Everything else goes
//! onto one bounded queue shared by the workers.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, HandlerError, Result};
use crate::peer::{CapabilityTable, PeerCapabilities, RespondedSet};
use crate::protocol::control::{is_probe, probe_payload, LISTING_REQ_ID, PROBE_REQ_ID};
use crate::protocol::{
    decode_segments, encode, is_control_key, validate_key, CapabilityListing, Message, MessageBuilder, MsgType, Payload,
    KEY_ANNOUNCE, PEER_KEYS,
};
use crate::transport::{Segments, Transport, TransportEvent};

use super::events::{CoordinatorEvent, CoordinatorStats, StatsCounters};
use super::handler::{Handler, HandlerRegistry};

/// Group joined when none is configured
pub const DEFAULT_GROUP: &str = "mktl-test";

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// How a node sends its listing to a new peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncePolicy {
    /// Whisper the listing to the entering peer
    #[default]
    Whisper,
    /// Shout the listing to the group when the peer joins it; whispers when
    /// no group is set
    Shout,
}

impl FromStr for AnnouncePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "whisper" => Ok(AnnouncePolicy::Whisper),
            "shout" => Ok(AnnouncePolicy::Shout),
            other => Err(Error::config_field_invalid(
                "announce_policy",
                format!("unknown announce policy '{}' (expected whisper or shout)", other),
            )),
        }
    }
}

/// What happens to a peer's capability entry when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Keep the last announced keys
    #[default]
    Retain,
    /// Forget the peer's keys
    Evict,
}

impl FromStr for ExitPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "retain" => Ok(ExitPolicy::Retain),
            "evict" => Ok(ExitPolicy::Evict),
            other => Err(Error::config_field_invalid(
                "exit_policy",
                format!("unknown exit policy '{}' (expected retain or evict)", other),
            )),
        }
    }
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Group joined on start and used for shouts
    pub group: Option<String>,

    /// Number of worker tasks
    pub workers: usize,

    /// Capacity of the inbound queue
    pub queue_capacity: usize,

    /// Bounded wait of a worker's queue pop
    pub pop_timeout: Duration,

    /// How long `request` waits for a reply
    pub request_timeout: Duration,

    pub announce_policy: AnnouncePolicy,

    pub exit_policy: ExitPolicy,

    /// Capacity of the event channel returned by `start`
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            group: Some(DEFAULT_GROUP.to_string()),
            workers: 2,
            queue_capacity: 1000,
            pop_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            announce_policy: AnnouncePolicy::Whisper,
            exit_policy: ExitPolicy::Retain,
            event_buffer: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config_field_invalid("coordinator.workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config_field_invalid("coordinator.queue_capacity", "must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(Error::config_field_invalid("coordinator.event_buffer", "must be at least 1"));
        }
        if self.group.as_deref().is_some_and(str::is_empty) {
            return Err(Error::config_field_invalid("node.group", "group name must not be empty"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────

/// A message waiting for a worker
struct Inbound {
    msg: Message,
    peer_id: String,
}

type InboundQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound>>>;

/// A request waiting for its reply
struct PendingRequest {
    seq: u64,
    peer_id: String,
    key: String,
    tx: oneshot::Sender<Result<Message>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
    handlers: HandlerRegistry,
    capabilities: CapabilityTable,
    responded: RespondedSet,
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_seq: AtomicU64,
    stats: StatsCounters,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    events: RwLock<Option<mpsc::Sender<CoordinatorEvent>>>,
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Peer messaging coordinator
pub struct Coordinator {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    queue: Mutex<Option<InboundQueue>>,
}

impl Coordinator {
    /// Create a coordinator over a transport; nothing runs until `start`
    pub fn new(transport: Arc<dyn Transport>, config: CoordinatorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                handlers: HandlerRegistry::new(),
                capabilities: CapabilityTable::new(),
                responded: RespondedSet::new(),
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                stats: StatsCounters::default(),
                running: AtomicBool::new(false),
                shutdown_tx,
                events: RwLock::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
            queue: Mutex::new(None),
        }
    }

    /// This peer's transport id
    pub fn id(&self) -> &str {
        self.shared.transport.peer_id()
    }

    /// Node name reported by the transport
    pub fn name(&self) -> &str {
        self.shared.transport.name()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Message builder with this peer as sender
    pub fn builder(&self) -> MessageBuilder {
        MessageBuilder::new(self.id())
    }

    // ─────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────

    /// Bind a handler to a routing key, replacing any previous one
    pub fn register_handler<H>(&self, key: impl Into<String>, handler: H) -> Result<()>
    where
        H: Handler + 'static,
    {
        let key = key.into();
        validate_key(&key)?;
        if is_control_key(&key) {
            warn!(key = %key, "Handler registered under a reserved key is never invoked");
        }
        if self.shared.handlers.register(key.clone(), Arc::new(handler)).is_some() {
            debug!(key = %key, "Replaced handler");
        } else {
            debug!(key = %key, "Registered handler");
        }
        Ok(())
    }

    /// Remove the handler for a key; returns whether one was registered
    pub fn unregister_handler(&self, key: &str) -> bool {
        self.shared.handlers.unregister(key).is_some()
    }

    /// Keys this peer advertises
    pub fn handler_keys(&self) -> Vec<String> {
        self.shared.handlers.keys()
    }

    // ─────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────

    /// Encode and send a message, fire-and-forget
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.shared.send(msg).await
    }

    /// Send a whisper and wait for its `.reply` (or `.error`)
    pub async fn request(&self, msg: Message) -> Result<Message> {
        if !msg.is_whisper() {
            return Err(Error::field_invalid("msg_type", "requests must be whispers"));
        }
        if msg.is_reply() {
            return Err(Error::field_invalid("key", "a reply cannot be sent as a request"));
        }
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let peer_id = msg
            .destination()
            .ok_or_else(|| Error::field_invalid("destination", "whisper requires a destination"))?
            .to_string();

        let req_id = msg.req_id().to_string();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&req_id) {
                return Err(Error::field_invalid(
                    "req_id",
                    format!("request {} is already in flight", req_id),
                ));
            }
            pending.insert(
                req_id.clone(),
                PendingRequest {
                    seq,
                    peer_id,
                    key: msg.key().to_string(),
                    tx,
                },
            );
        }

        let timeout = self.shared.config.request_timeout;
        let result = match self.shared.send(&msg).await {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::Shutdown),
                Err(_) => Err(Error::RequestTimeout {
                    req_id: req_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
            Err(e) => Err(e),
        };

        {
            let mut pending = self.shared.pending.lock();
            if pending.get(&req_id).is_some_and(|p| p.seq == seq) {
                pending.remove(&req_id);
            }
        }

        result
    }

    /// Reply to a message: whisper to its sender, same req_id, key `<key>.reply`
    pub async fn reply(&self, to: &Message, payload: Payload) -> Result<()> {
        let reply = to.reply_builder(self.id()).with_payload(payload).build()?;
        self.shared.send(&reply).await?;
        StatsCounters::bump(&self.shared.stats.replies_sent);
        Ok(())
    }

    /// Re-send this peer's listing to every peer it has responded to.
    /// Returns the number of listings sent.
    pub async fn announce(&self) -> Result<usize> {
        let shared = &self.shared;
        if let (AnnouncePolicy::Shout, Some(_)) = (shared.config.announce_policy, &shared.config.group) {
            let listing = shared.listing(None)?;
            shared.send(&listing).await?;
            StatsCounters::bump(&shared.stats.announcements_sent);
            return Ok(1);
        }

        let mut sent = 0;
        for peer_id in shared.responded.peers() {
            let listing = shared.listing(Some(&peer_id))?;
            match shared.send(&listing).await {
                Ok(()) => {
                    StatsCounters::bump(&shared.stats.announcements_sent);
                    sent += 1;
                }
                Err(e) => shared.transport_failed(&e),
            }
        }
        Ok(sent)
    }

    /// Ask a peer for its listing
    pub async fn probe(&self, peer_id: &str) -> Result<()> {
        let msg = self
            .builder()
            .with_type(MsgType::Whisper)
            .with_req_id(PROBE_REQ_ID)
            .with_key(KEY_ANNOUNCE)
            .with_payload(probe_payload())
            .with_destination(peer_id)
            .build()?;
        self.shared.send(&msg).await
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start the transport, join the group and spawn the receive task and
    /// workers. Returns the event receiver.
    pub async fn start(&self) -> Result<mpsc::Receiver<CoordinatorEvent>> {
        let shared = &self.shared;
        shared.config.validate()?;
        if shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let (event_tx, event_rx) = mpsc::channel(shared.config.event_buffer);
        *shared.events.write() = Some(event_tx);
        shared.shutdown_tx.send_replace(false);

        if let Err(e) = self.start_transport().await {
            shared.running.store(false, Ordering::SeqCst);
            *shared.events.write() = None;
            return Err(e);
        }

        let (queue_tx, queue_rx) = mpsc::channel(shared.config.queue_capacity);
        let queue: InboundQueue = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let mut tasks = Vec::with_capacity(shared.config.workers + 1);
        let receiver = Arc::clone(shared);
        tasks.push(tokio::spawn(async move {
            receiver.receive_loop(queue_tx).await;
        }));
        for index in 0..shared.config.workers {
            let worker = Arc::clone(shared);
            let queue = Arc::clone(&queue);
            tasks.push(tokio::spawn(async move {
                worker.worker_loop(index, queue).await;
            }));
        }

        *self.tasks.lock() = tasks;
        *self.queue.lock() = Some(queue);

        info!(
            peer = %self.id(),
            name = %self.name(),
            group = ?shared.config.group,
            workers = shared.config.workers,
            keys = ?shared.handlers.keys(),
            "Coordinator started"
        );
        Ok(event_rx)
    }

    async fn start_transport(&self) -> Result<()> {
        let transport = &self.shared.transport;
        transport.start().await?;
        if let Some(group) = &self.shared.config.group {
            if let Err(e) = transport.join(group).await {
                let _ = transport.stop().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop the transport and all tasks. Queued messages are discarded,
    /// pending requests fail with `Shutdown`.
    pub async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            debug!("Coordinator already stopped");
            return Ok(());
        }
        shared.shutdown_tx.send_replace(true);

        if let Err(e) = shared.transport.stop().await {
            warn!(error = %e, "Transport stop failed");
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }

        let queue = self.queue.lock().take();
        if let Some(queue) = queue {
            let mut rx = queue.lock().await;
            let mut discarded = 0usize;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                info!(discarded, "Discarded queued messages");
            }
        }

        let pending: Vec<PendingRequest> = shared.pending.lock().drain().map(|(_, p)| p).collect();
        for request in pending {
            let _ = request.tx.send(Err(Error::Shutdown));
        }

        shared.responded.clear();
        *shared.events.write() = None;

        info!(peer = %self.id(), "Coordinator stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────

    /// Every peer's latest announced capabilities
    pub fn capabilities(&self) -> Vec<PeerCapabilities> {
        self.shared.capabilities.snapshot()
    }

    /// Keys a given peer announced
    pub fn peer_keys(&self, peer_id: &str) -> BTreeSet<String> {
        self.shared.capabilities.keys_for(peer_id)
    }

    /// Peers that announced a handler for `key`, sorted by id
    pub fn peers_supporting(&self, key: &str) -> Vec<String> {
        self.shared.capabilities.peers_supporting(key)
    }

    /// Peers this node has already sent its listing to
    pub fn responded_peers(&self) -> Vec<String> {
        self.shared.responded.peers()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.shared.stats.snapshot()
    }
}

// ─────────────────────────────────────────────────────────────────
// Receive path
// ─────────────────────────────────────────────────────────────────

impl Shared {
    fn own_id(&self) -> &str {
        self.transport.peer_id()
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = self.events.read().as_ref() {
            let _ = tx.try_send(event);
        }
    }

    fn transport_failed(&self, err: &Error) {
        warn!(error = %err, "Transport send failed");
        self.emit(CoordinatorEvent::TransportFailed {
            error: err.to_string(),
        });
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let segments: Segments = encode(msg)?.into_segments();
        match msg.msg_type() {
            MsgType::Whisper => {
                let destination = msg
                    .destination()
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| Error::field_invalid("destination", "whisper requires a destination"))?;
                self.transport.whisper(destination, segments).await
            }
            MsgType::Shout => {
                let group = self
                    .config
                    .group
                    .as_deref()
                    .ok_or_else(|| Error::transport("cannot shout: no group configured"))?;
                self.transport.shout(group, segments).await
            }
        }
    }

    /// Capability listing, whispered to `destination` or shouted when `None`
    fn listing(&self, destination: Option<&str>) -> Result<Message> {
        let listing = CapabilityListing::new(self.own_id(), self.handlers.keys());
        let builder = MessageBuilder::new(self.own_id())
            .with_req_id(LISTING_REQ_ID)
            .with_key(PEER_KEYS)
            .with_payload(listing.to_payload());
        let builder = match destination {
            Some(peer_id) => builder.with_type(MsgType::Whisper).with_destination(peer_id),
            None => builder.with_type(MsgType::Shout),
        };
        builder.build()
    }

    async fn send_listing(&self, destination: Option<&str>) {
        let result = match self.listing(destination) {
            Ok(listing) => self.send(&listing).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                StatsCounters::bump(&self.stats.announcements_sent);
                debug!(peer = ?destination, "Sent capability listing");
            }
            Err(e) => self.transport_failed(&e),
        }
    }

    async fn receive_loop(self: Arc<Self>, queue_tx: mpsc::Sender<Inbound>) {
        let mut shutdown = self.shutdown_tx.subscribe();

        while self.running.load(Ordering::SeqCst) {
            let event = tokio::select! {
                event = self.transport.next_event() => event,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };
            match event {
                Some(event) => self.handle_event(event, &queue_tx).await,
                None => {
                    debug!("Transport closed its event stream");
                    break;
                }
            }
        }

        debug!("Receive loop terminated");
    }

    async fn handle_event(&self, event: TransportEvent, queue_tx: &mpsc::Sender<Inbound>) {
        match event {
            TransportEvent::Enter { peer_id, name } => self.on_enter(peer_id, name).await,
            TransportEvent::Exit { peer_id } => self.on_exit(peer_id),
            TransportEvent::Join { peer_id, group } => self.on_join(peer_id, group).await,
            TransportEvent::Whisper { peer_id, segments } | TransportEvent::Shout { peer_id, segments, .. } => {
                StatsCounters::bump(&self.stats.received);
                match decode_segments(&segments, self.own_id()) {
                    Ok(msg) => self.on_message(msg, peer_id, queue_tx).await,
                    Err(e) => {
                        StatsCounters::bump(&self.stats.decode_failed);
                        warn!(peer = %peer_id, error = %e, "Dropping undecodable frame");
                        self.emit(CoordinatorEvent::DecodeFailed {
                            peer_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
            other => {
                debug!(peer = %other.peer_id(), event = other.kind(), "Ignoring transport event");
            }
        }
    }

    async fn on_enter(&self, peer_id: String, name: String) {
        info!(peer = %peer_id, name = %name, "Peer entered");
        self.emit(CoordinatorEvent::PeerEntered {
            peer_id: peer_id.clone(),
            name,
        });

        if !self.shouts_listings() {
            self.send_listing(Some(&peer_id)).await;
            self.responded.mark(&peer_id);
        }
    }

    /// Under the shout policy a listing goes out once the peer is in our group
    async fn on_join(&self, peer_id: String, group: String) {
        debug!(peer = %peer_id, group = %group, "Peer joined group");
        if self.shouts_listings() && self.config.group.as_deref() == Some(group.as_str()) {
            self.send_listing(None).await;
            self.responded.mark(&peer_id);
        }
    }

    fn shouts_listings(&self) -> bool {
        self.config.announce_policy == AnnouncePolicy::Shout && self.config.group.is_some()
    }

    fn on_exit(&self, peer_id: String) {
        info!(peer = %peer_id, "Peer exited");
        if self.config.exit_policy == ExitPolicy::Evict && self.capabilities.remove(&peer_id).is_some() {
            debug!(peer = %peer_id, "Evicted peer capabilities");
        }

        let orphaned: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for request in orphaned {
            let _ = request.tx.send(Err(Error::PeerExited {
                peer_id: peer_id.clone(),
            }));
        }

        self.emit(CoordinatorEvent::PeerExited { peer_id });
    }

    async fn on_message(&self, msg: Message, peer_id: String, queue_tx: &mpsc::Sender<Inbound>) {
        match msg.key() {
            PEER_KEYS => self.on_listing(&msg, &peer_id).await,
            KEY_ANNOUNCE => {
                if is_probe(msg.payload()) {
                    debug!(peer = %peer_id, "Capability probe received");
                } else {
                    debug!(peer = %peer_id, payload = ?msg.payload(), "Answering probe with unexpected payload");
                }
                self.send_listing(Some(&peer_id)).await;
            }
            _ if msg.is_reply() && self.complete_pending(&msg) => {
                debug!(peer = %peer_id, req_id = %msg.req_id(), key = %msg.key(), "Completed pending request");
            }
            _ => self.enqueue(msg, peer_id, queue_tx),
        }
    }

    async fn on_listing(&self, msg: &Message, peer_id: &str) {
        let listing = match CapabilityListing::from_payload(msg.payload()) {
            Ok(listing) => listing,
            Err(e) => {
                StatsCounters::bump(&self.stats.decode_failed);
                warn!(peer = %peer_id, error = %e, "Ignoring malformed capability listing");
                self.emit(CoordinatorEvent::DecodeFailed {
                    peer_id: peer_id.to_string(),
                    error: e.to_string(),
                });
                return;
            }
        };

        self.capabilities.replace(peer_id, listing.keys);
        let keys: Vec<String> = self.capabilities.keys_for(peer_id).into_iter().collect();
        info!(peer = %peer_id, keys = ?keys, "Peer capabilities updated");
        self.emit(CoordinatorEvent::CapabilitiesUpdated {
            peer_id: peer_id.to_string(),
            keys,
        });

        if self.responded.mark(peer_id) {
            self.send_listing(Some(peer_id)).await;
        }
    }

    /// Hand a reply to the request waiting on it; false when none matches
    fn complete_pending(&self, msg: &Message) -> bool {
        let request = {
            let mut pending = self.pending.lock();
            match pending.get(msg.req_id()) {
                Some(p) if p.key == msg.request_key() => pending.remove(msg.req_id()),
                _ => None,
            }
        };
        let Some(request) = request else {
            return false;
        };

        let outcome = if msg.is_error_reply() {
            let message = msg
                .field("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(Error::RemoteHandler {
                key: request.key.clone(),
                message,
            })
        } else {
            Ok(msg.clone())
        };
        let _ = request.tx.send(outcome);
        true
    }

    fn enqueue(&self, msg: Message, peer_id: String, queue_tx: &mpsc::Sender<Inbound>) {
        match queue_tx.try_send(Inbound { msg, peer_id }) {
            Ok(()) => StatsCounters::bump(&self.stats.queued),
            Err(mpsc::error::TrySendError::Full(item)) => {
                StatsCounters::bump(&self.stats.dropped);
                let err = Error::QueueFull {
                    capacity: self.config.queue_capacity,
                };
                warn!(
                    peer = %item.peer_id,
                    req_id = %item.msg.req_id(),
                    key = %item.msg.key(),
                    error = %err,
                    "Dropping message"
                );
                self.emit(CoordinatorEvent::Dropped {
                    peer_id: item.peer_id,
                    key: item.msg.key().to_string(),
                    capacity: self.config.queue_capacity,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Inbound queue closed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Worker path
    // ─────────────────────────────────────────────────────────────

    async fn worker_loop(self: Arc<Self>, index: usize, queue: InboundQueue) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let pop_timeout = self.config.pop_timeout;

        while self.running.load(Ordering::SeqCst) {
            let popped = tokio::select! {
                popped = tokio::time::timeout(pop_timeout, async { queue.lock().await.recv().await }) => popped,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };
            match popped {
                Ok(Some(inbound)) => self.dispatch(inbound).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        debug!(worker = index, "Worker terminated");
    }

    async fn dispatch(&self, inbound: Inbound) {
        let Inbound { msg, peer_id } = inbound;
        StatsCounters::bump(&self.stats.dispatched);

        let Some(handler) = self.handlers.get(msg.key()) else {
            StatsCounters::bump(&self.stats.no_handler);
            debug!(peer = %peer_id, req_id = %msg.req_id(), key = %msg.key(), "No handler for key");
            self.emit(CoordinatorEvent::NoHandler {
                req_id: msg.req_id().to_string(),
                key: msg.key().to_string(),
            });
            return;
        };

        let outcome = AssertUnwindSafe(handler.invoke(&msg, &peer_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic))));
        let answers = msg.is_whisper() && !msg.is_reply();

        match outcome {
            Ok(result) => {
                StatsCounters::bump(&self.stats.handled);
                debug!(peer = %peer_id, req_id = %msg.req_id(), key = %msg.key(), "Handled message");
                self.emit(CoordinatorEvent::Handled {
                    req_id: msg.req_id().to_string(),
                    key: msg.key().to_string(),
                });

                match result {
                    Some(payload) if answers => self.send_reply(&msg, &peer_id, msg.reply_key(), payload).await,
                    Some(_) => debug!(key = %msg.key(), "Discarding handler result for non-whisper"),
                    None => {}
                }
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.handler_failed);
                error!(peer = %peer_id, req_id = %msg.req_id(), key = %msg.key(), error = %e, "Handler failed");

                if answers {
                    let mut payload = Payload::new();
                    payload.insert("error".to_string(), json!(e.to_string()));
                    payload.insert("kind".to_string(), json!(e.kind()));
                    self.send_reply(&msg, &peer_id, msg.error_key(), payload).await;
                }

                self.emit(CoordinatorEvent::HandlerFailed {
                    req_id: msg.req_id().to_string(),
                    key: msg.key().to_string(),
                    error: e,
                });
            }
        }
    }

    async fn send_reply(&self, to: &Message, peer_id: &str, key: String, payload: Payload) {
        let reply = MessageBuilder::new(self.own_id())
            .with_type(MsgType::Whisper)
            .with_req_id(to.req_id())
            .with_key(key)
            .with_payload(payload)
            .with_destination(peer_id)
            .build();
        let result = match reply {
            Ok(reply) => self.send(&reply).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => StatsCounters::bump(&self.stats.replies_sent),
            Err(e) => self.transport_failed(&e),
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::HandlerResult;
    use crate::transport::MemoryHub;

    #[test]
    fn test_config_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.group.as_deref(), Some("mktl-test"));
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.pop_timeout, Duration::from_secs(1));
        assert_eq!(config.announce_policy, AnnouncePolicy::Whisper);
        assert_eq!(config.exit_policy, ExitPolicy::Retain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_sizes() {
        let config = CoordinatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CoordinatorConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("shout".parse::<AnnouncePolicy>().unwrap(), AnnouncePolicy::Shout);
        assert_eq!("Evict".parse::<ExitPolicy>().unwrap(), ExitPolicy::Evict);
        assert!("loud".parse::<AnnouncePolicy>().is_err());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idempotent() {
        let hub = MemoryHub::new();
        let coordinator = Coordinator::new(Arc::new(hub.endpoint("a")), CoordinatorConfig::default());

        let _events = coordinator.start().await.unwrap();
        assert!(coordinator.is_running());
        assert!(matches!(coordinator.start().await, Err(Error::AlreadyRunning)));

        coordinator.stop().await.unwrap();
        assert!(!coordinator.is_running());
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_bad_key() {
        let hub = MemoryHub::new();
        let coordinator = Coordinator::new(Arc::new(hub.endpoint("a")), CoordinatorConfig::default());
        let handler = |_: &Message, _: &str| -> HandlerResult { Ok(None) };

        assert!(coordinator.register_handler("bad key", handler).is_err());
        assert!(coordinator.register_handler("good.key", handler).is_ok());
        assert_eq!(coordinator.handler_keys(), vec!["good.key"]);
        assert!(coordinator.unregister_handler("good.key"));
    }

    #[tokio::test]
    async fn test_shout_without_group_fails() {
        let hub = MemoryHub::new();
        let config = CoordinatorConfig {
            group: None,
            ..Default::default()
        };
        let coordinator = Coordinator::new(Arc::new(hub.endpoint("a")), config);
        let _events = coordinator.start().await.unwrap();

        let msg = coordinator
            .builder()
            .with_type(MsgType::Shout)
            .with_key("peer.status")
            .build()
            .unwrap();
        assert!(matches!(coordinator.send(&msg).await, Err(Error::Transport { .. })));
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_requires_running() {
        let hub = MemoryHub::new();
        let coordinator = Coordinator::new(Arc::new(hub.endpoint("a")), CoordinatorConfig::default());
        let msg = coordinator
            .builder()
            .with_type(MsgType::Whisper)
            .with_key("test.key")
            .with_destination("somebody")
            .build()
            .unwrap();
        assert!(matches!(coordinator.request(msg).await, Err(Error::NotRunning)));
    }
}
