//! Synchronization session driving a [`TextCrdt`] over a [`Transport`].
//!
//! A [`SyncSession`] owns the local replica and the presence roster. Local
//! edits apply to the replica immediately and are broadcast while connected;
//! inbound frames are decoded, applied, and surfaced to the editing layer as
//! [`SessionEvent`]s.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     ^             |
//!                     |        (transport lost)
//!                     |             v
//!                     +------- Reconnecting --(attempts exhausted)--> Disconnected
//! ```
//!
//! One driver task runs per `connect()`. It selects over inbound transport
//! events, the heartbeat and resync intervals, and a shutdown signal. The
//! replica lives behind a `std::sync::Mutex` that is only held for the
//! synchronous work of a single edit or frame, never across an `.await`.

use crate::clock::{SystemTimeSource, TimeSource, VersionVector};
use crate::crdt::TextCrdt;
use crate::error::{CollabError, CollabResult};
use crate::message::{Envelope, HeartbeatPayload, JoinPayload, LeavePayload, Message, SyncResponse};
use crate::operation::{CrdtState, Operation};
use crate::presence::{CollaborationUser, CursorPosition, PresenceTracker, DEFAULT_PRESENCE_TIMEOUT_MS};
use crate::site::SiteId;
use crate::transport::{PeerChannel, Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Configuration for a sync session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between heartbeat pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Time to wait for a heartbeat reply before treating the transport as lost.
    pub heartbeat_timeout_ms: u64,
    /// Interval between periodic sync requests in milliseconds.
    pub resync_interval_ms: u64,
    /// Reconnect attempts after a loss before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt in milliseconds.
    pub base_backoff_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Idle time after which a silent collaborator is dropped from the roster.
    pub presence_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            resync_interval_ms: 60_000,
            max_reconnect_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> CollabResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that intervals are non-zero, backoff bounds are ordered and
    /// collaborators outlive at least one heartbeat.
    pub fn validate(&self) -> CollabResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(CollabError::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(CollabError::InvalidConfig(
                "heartbeat_timeout_ms must be positive".into(),
            ));
        }
        if self.presence_timeout_ms <= self.heartbeat_interval_ms {
            return Err(CollabError::InvalidConfig(format!(
                "presence_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.presence_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.resync_interval_ms == 0 {
            return Err(CollabError::InvalidConfig(
                "resync_interval_ms must be positive".into(),
            ));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(CollabError::InvalidConfig(format!(
                "max_backoff_ms ({}) is below base_backoff_ms ({})",
                self.max_backoff_ms, self.base_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_resync_interval_ms(mut self, ms: u64) -> Self {
        self.resync_interval_ms = ms;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_presence_timeout_ms(mut self, ms: u64) -> Self {
        self.presence_timeout_ms = ms;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_backoff_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// Connection status of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Not connected and not trying to be.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and exchanging messages.
    Connected,
    /// Waiting out the backoff before the next connect attempt.
    Reconnecting,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Notification delivered to the editing layer.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The connection status changed.
    StatusChanged(SessionStatus),
    /// A remote operation was applied to the local replica.
    RemoteOperation(Operation),
    /// A collaborator appeared in the roster.
    UserJoined(CollaborationUser),
    /// A collaborator left or timed out.
    UserLeft(SiteId),
    /// A collaborator moved their cursor.
    CursorUpdated {
        site_id: SiteId,
        cursor: CursorPosition,
    },
    /// A transient fault; the session keeps running unless the status says otherwise.
    Error(CollabError),
}

/// State guarded by the session mutex.
struct SessionState {
    crdt: TextCrdt,
    presence: PresenceTracker,
    local_user: CollaborationUser,
    status: SessionStatus,
    peers: BTreeMap<SiteId, Box<dyn PeerChannel>>,
    /// Last vector each collaborator advertised
    peer_vectors: HashMap<SiteId, VersionVector>,
    /// A heartbeat ping is waiting for its reply
    awaiting_heartbeat: bool,
}

/// Everything the driver task shares with the session handle.
struct Shared<T> {
    site_id: SiteId,
    config: SessionConfig,
    transport: T,
    time: Arc<dyn TimeSource>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<SessionState>,
}

struct Driver {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Why the inbound pump stopped.
enum PumpExit {
    Shutdown,
    Lost(CollabError),
}

/// A collaborative editing session for one site.
///
/// # Example
///
/// ```no_run
/// use collab::session::{SessionConfig, SyncSession};
/// use collab::transport::MemoryHub;
///
/// # async fn demo() {
/// let hub = MemoryHub::new();
/// let (session, mut events) =
///     SyncSession::new("site-a", "alice", hub.transport("site-a"), SessionConfig::default());
///
/// session.connect();
/// session.insert(0, 'h');
///
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # }
/// ```
pub struct SyncSession<T: Transport> {
    shared: Arc<Shared<T>>,
    driver: Mutex<Option<Driver>>,
}

impl<T: Transport> SyncSession<T> {
    /// Create a disconnected session stamped with system time.
    ///
    /// Returns the session and the receiver its events are delivered on.
    pub fn new(
        site_id: impl Into<SiteId>,
        user_id: impl Into<String>,
        transport: T,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_time_source(site_id, user_id, transport, config, Arc::new(SystemTimeSource))
    }

    /// Create a disconnected session using an injected time source.
    pub fn with_time_source(
        site_id: impl Into<SiteId>,
        user_id: impl Into<String>,
        transport: T,
        config: SessionConfig,
        time: Arc<dyn TimeSource>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let site_id = site_id.into();
        let (events, receiver) = mpsc::unbounded_channel();
        let now = time.now_ms();

        let state = SessionState {
            crdt: TextCrdt::with_time_source(site_id.clone(), Arc::clone(&time)),
            presence: PresenceTracker::with_timeout(config.presence_timeout_ms),
            // Receivers assign the color from their own palette
            local_user: CollaborationUser::new(user_id, site_id.clone(), "", now),
            status: SessionStatus::Disconnected,
            peers: BTreeMap::new(),
            peer_vectors: HashMap::new(),
            awaiting_heartbeat: false,
        };

        let shared = Arc::new(Shared {
            site_id,
            config,
            transport,
            time,
            events,
            state: Mutex::new(state),
        });

        let session = Self {
            shared,
            driver: Mutex::new(None),
        };
        (session, receiver)
    }

    /// Get the site id.
    pub fn site_id(&self) -> &SiteId {
        &self.shared.site_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current connection status.
    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    /// Start the driver task.
    ///
    /// Must be called from within a tokio runtime. Does nothing while a
    /// driver is already running.
    pub fn connect(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = driver.as_ref() {
            if !running.handle.is_finished() {
                tracing::debug!("Session {} is already running", self.shared.site_id);
                return;
            }
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_driver(Arc::clone(&self.shared), shutdown_rx));
        *driver = Some(Driver { shutdown, handle });
    }

    /// Stop the driver, announce `leave` if connected, and close every channel.
    ///
    /// Idempotent. Pending reconnects are cancelled; the replica is kept so
    /// offline editing continues.
    pub async fn disconnect(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(driver) = driver {
            let _ = driver.shutdown.send(());
            if let Err(e) = driver.handle.await {
                tracing::error!("Session driver for {} failed: {}", self.shared.site_id, e);
            }
        }
        // The driver may already have given up on its own
        self.shared.shut_down();
    }

    /// Insert a character at a visible index and broadcast it.
    pub fn insert(&self, index: usize, ch: char) -> Operation {
        let mut state = self.shared.lock();
        let op = state.crdt.insert(index, ch);
        self.shared.broadcast(&mut state, &Message::Operation(op.clone()));
        op
    }

    /// Insert a string starting at a visible index.
    pub fn insert_str(&self, index: usize, text: &str) -> Vec<Operation> {
        let mut state = self.shared.lock();
        let mut ops = Vec::new();
        for (offset, ch) in text.chars().enumerate() {
            let op = state.crdt.insert(index + offset, ch);
            self.shared.broadcast(&mut state, &Message::Operation(op.clone()));
            ops.push(op);
        }
        ops
    }

    /// Delete the character at a visible index and broadcast it.
    ///
    /// Returns `None` if the index is out of range.
    pub fn delete(&self, index: usize) -> Option<Operation> {
        let mut state = self.shared.lock();
        let op = state.crdt.delete(index)?;
        self.shared.broadcast(&mut state, &Message::Operation(op.clone()));
        Some(op)
    }

    /// The visible text of the local replica.
    pub fn text(&self) -> String {
        self.shared.lock().crdt.text()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.shared.lock().crdt.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().crdt.is_empty()
    }

    /// Snapshot of the local replica.
    pub fn state(&self) -> CrdtState {
        self.shared.lock().crdt.state()
    }

    /// Version vector of the local replica.
    pub fn version_vector(&self) -> VersionVector {
        self.shared.lock().crdt.version_vector().clone()
    }

    /// Merge a saved or received snapshot into the local replica.
    ///
    /// Returns the operations that were new. They are not broadcast; peers
    /// pick them up on the next sync exchange.
    pub fn merge_state(&self, snapshot: &CrdtState) -> Vec<Operation> {
        self.shared.lock().crdt.merge(snapshot)
    }

    /// Run a read-only closure against the local replica.
    pub fn with_crdt<R>(&self, f: impl FnOnce(&TextCrdt) -> R) -> R {
        f(&self.shared.lock().crdt)
    }

    /// Record and broadcast the local cursor.
    pub fn update_cursor(&self, index: usize, length: usize) {
        let cursor = CursorPosition::new(index, length);
        let mut state = self.shared.lock();
        state.local_user.cursor = Some(cursor);
        state.local_user.last_active = self.shared.time.now_ms();
        self.shared.broadcast(&mut state, &Message::Cursor(cursor));
    }

    /// Remote collaborators currently in the roster.
    pub fn users(&self) -> Vec<CollaborationUser> {
        self.shared
            .lock()
            .presence
            .users()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Attach a direct channel to a peer, replacing any previous one.
    pub fn add_peer(&self, site: impl Into<SiteId>, channel: Box<dyn PeerChannel>) {
        let site = site.into();
        tracing::debug!("Session {} adding peer channel to {}", self.shared.site_id, site);
        if let Some(previous) = self.shared.lock().peers.insert(site, channel) {
            previous.close();
        }
    }

    /// Detach and close a peer channel. Returns false if there was none.
    pub fn remove_peer(&self, site: &SiteId) -> bool {
        match self.shared.lock().peers.remove(site) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Number of attached peer channels.
    pub fn peer_count(&self) -> usize {
        self.shared.lock().peers.len()
    }

    /// Handle a frame that arrived over a direct peer channel.
    pub fn receive_peer_frame(&self, frame: &str) {
        self.shared.handle_frame(frame);
    }
}

impl<T: Transport> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is listening
        let _ = self.events.send(event);
    }

    fn set_status(&self, state: &mut SessionState, status: SessionStatus) {
        if state.status != status {
            tracing::debug!("Session {}: {} -> {}", self.site_id, state.status, status);
            state.status = status;
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn update_status(&self, status: SessionStatus) {
        let mut state = self.lock();
        self.set_status(&mut state, status);
    }

    fn encode(&self, to: Option<SiteId>, message: &Message) -> Option<String> {
        let encoded =
            Envelope::new(self.site_id.clone(), to, message, self.time.now_ms()).and_then(|e| e.encode());
        match encoded {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!("Failed to encode {:?} message: {}", message.message_type(), e);
                self.emit(SessionEvent::Error(e));
                None
            }
        }
    }

    fn send_primary(&self, frame: String) {
        if let Err(e) = self.transport.send(frame) {
            tracing::warn!("Session {} failed to send: {}", self.site_id, e);
            self.emit(SessionEvent::Error(e));
        }
    }

    /// Send to the primary transport and every peer channel. No-op unless connected.
    fn broadcast(&self, state: &mut SessionState, message: &Message) {
        if state.status != SessionStatus::Connected {
            return;
        }
        let Some(frame) = self.encode(None, message) else {
            return;
        };
        self.send_primary(frame.clone());
        self.send_to_peers(state, &frame, None);
    }

    /// Send a message addressed to one site, preferring its peer channel.
    fn send_to(&self, state: &mut SessionState, to: &SiteId, message: &Message) {
        let Some(frame) = self.encode(Some(to.clone()), message) else {
            return;
        };
        match state.peers.get(to).map(|peer| peer.send(frame.clone())) {
            Some(Ok(())) => {}
            Some(Err(e)) => self.fall_back(state, to, &frame, e),
            None => self.send_primary(frame),
        }
    }

    fn send_to_peers(&self, state: &mut SessionState, frame: &str, except: Option<&SiteId>) {
        let mut failed = Vec::new();
        for (site, peer) in &state.peers {
            if Some(site) == except {
                continue;
            }
            if let Err(e) = peer.send(frame.to_string()) {
                failed.push((site.clone(), e));
            }
        }
        for (site, e) in failed {
            self.fall_back(state, &site, frame, e);
        }
    }

    /// Drop a failed peer channel and relay the frame through the primary
    /// transport, addressed to that peer.
    fn fall_back(&self, state: &mut SessionState, site: &SiteId, frame: &str, err: CollabError) {
        tracing::warn!("{}; relaying through the primary transport", err);
        if let Some(peer) = state.peers.remove(site) {
            peer.close();
        }

        match Envelope::decode(frame) {
            Ok(mut envelope) => {
                envelope.to = Some(site.clone());
                match envelope.encode() {
                    Ok(relayed) => self.send_primary(relayed),
                    Err(e) => self.emit(SessionEvent::Error(e)),
                }
            }
            Err(e) => self.emit(SessionEvent::Error(e)),
        }
    }

    fn join_message(state: &SessionState) -> Message {
        Message::Join(JoinPayload {
            user: state.local_user.without_cursor(),
            version_vector: state.crdt.contiguous_vector(),
        })
    }

    /// Answer a peer's vector: full state for an empty replica, delta otherwise.
    fn sync_response(state: &SessionState, remote: &VersionVector) -> SyncResponse {
        if remote.is_empty() {
            SyncResponse::State {
                state: state.crdt.state(),
            }
        } else {
            SyncResponse::Delta {
                operations: state.crdt.delta(remote),
                version_vector: state.crdt.version_vector().clone(),
            }
        }
    }

    /// Decode and apply one inbound frame.
    fn handle_frame(&self, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Session {} dropping frame: {}", self.site_id, e);
                return;
            }
        };
        if envelope.from == self.site_id {
            tracing::debug!("Session {} dropping its own echo", self.site_id);
            return;
        }
        if !envelope.is_for(&self.site_id) {
            tracing::debug!(
                "Session {} dropping {:?} addressed to {:?}",
                self.site_id,
                envelope.message_type,
                envelope.to
            );
            return;
        }
        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    "Session {} dropping {:?} from {}: {}",
                    self.site_id,
                    envelope.message_type,
                    envelope.from,
                    e
                );
                return;
            }
        };

        let from = &envelope.from;
        let now = self.time.now_ms();
        let mut state = self.lock();
        state.presence.touch(from, now);
        if shows_activity(&message) {
            self.readmit(&mut state, from, now);
        }

        match message {
            Message::Operation(op) => {
                if state.crdt.apply_operation(&op) {
                    self.send_to_peers(&mut state, frame, Some(from));
                    self.emit(SessionEvent::RemoteOperation(op));
                }
            }
            Message::Cursor(cursor) => {
                if state.presence.update_cursor(from, cursor, now) {
                    self.emit(SessionEvent::CursorUpdated {
                        site_id: from.clone(),
                        cursor,
                    });
                }
            }
            Message::Join(JoinPayload {
                user,
                version_vector,
            }) => {
                let user = CollaborationUser {
                    site_id: from.clone(),
                    last_active: now,
                    ..user
                };
                if state.presence.join(user) {
                    tracing::info!("Session {}: {} joined", self.site_id, from);
                    if let Some(joined) = state.presence.get(from).cloned() {
                        self.emit(SessionEvent::UserJoined(joined));
                    }
                }

                // Only a broadcast join gets an answer; answering a directed
                // join would bounce joins back and forth.
                if envelope.is_broadcast() {
                    let announce = Self::join_message(&state);
                    self.send_to(&mut state, from, &announce);
                    let response = Self::sync_response(&state, &version_vector);
                    self.send_to(&mut state, from, &Message::SyncResponse(response));
                }
                state.peer_vectors.insert(from.clone(), version_vector);
            }
            Message::Leave(LeavePayload { .. }) => {
                state.peer_vectors.remove(from);
                if state.presence.leave(from).is_some() {
                    tracing::info!("Session {}: {} left", self.site_id, from);
                    self.emit(SessionEvent::UserLeft(from.clone()));
                }
            }
            Message::SyncRequest(version_vector) => {
                let response = Self::sync_response(&state, &version_vector);
                self.send_to(&mut state, from, &Message::SyncResponse(response));
                state.peer_vectors.insert(from.clone(), version_vector);
            }
            Message::SyncResponse(response) => {
                let remote_vector = match &response {
                    SyncResponse::State { state: snapshot } => snapshot.version_vector.clone(),
                    SyncResponse::Delta { version_vector, .. } => version_vector.clone(),
                };
                let applied = state.crdt.merge_operations(response.operations());
                if !applied.is_empty() {
                    tracing::debug!(
                        "Session {} merged {} operations from {}",
                        self.site_id,
                        applied.len(),
                        from
                    );
                }
                for op in applied {
                    self.emit(SessionEvent::RemoteOperation(op));
                }

                // Push back whatever the responder is missing (offline edits)
                let missing = state.crdt.delta(&remote_vector);
                if !missing.is_empty() {
                    let push = SyncResponse::Delta {
                        operations: missing,
                        version_vector: state.crdt.version_vector().clone(),
                    };
                    self.send_to(&mut state, from, &Message::SyncResponse(push));
                }
                state.peer_vectors.insert(from.clone(), remote_vector);
            }
            Message::Heartbeat(HeartbeatPayload { reply: false }) => {
                let reply = Message::Heartbeat(HeartbeatPayload { reply: true });
                self.send_to(&mut state, from, &reply);
            }
            Message::Heartbeat(HeartbeatPayload { reply: true }) => {
                state.awaiting_heartbeat = false;
            }
        }
    }

    /// Put a live sender missing from the roster back into it.
    ///
    /// The record is rebuilt from the site alone; the user id is the site id
    /// until the collaborator announces itself again.
    fn readmit(&self, state: &mut SessionState, from: &SiteId, now: u64) {
        if state.presence.get(from).is_some() {
            return;
        }
        let user = CollaborationUser::new(from.as_str(), from.clone(), "", now);
        if state.presence.join(user) {
            tracing::info!("Session {}: {} is back", self.site_id, from);
            if let Some(user) = state.presence.get(from).cloned() {
                self.emit(SessionEvent::UserJoined(user));
            }
        }
    }

    /// The transport came up: announce ourselves. The join carries our
    /// vector, so every peer answers it with what we miss.
    fn on_connected(&self) {
        let mut state = self.lock();
        state.awaiting_heartbeat = false;
        self.set_status(&mut state, SessionStatus::Connected);
        tracing::info!("Session {} connected", self.site_id);

        let join = Self::join_message(&state);
        self.broadcast(&mut state, &join);
    }

    fn on_lost(&self, err: CollabError) {
        tracing::warn!("Session {} lost its transport: {}", self.site_id, err);
        self.transport.close();

        let mut state = self.lock();
        state.awaiting_heartbeat = false;
        state.presence.mark_all_offline();
        self.emit(SessionEvent::Error(err));
    }

    fn give_up(&self) {
        let attempts = self.config.max_reconnect_attempts;
        tracing::error!("Session {} gave up after {} reconnect attempts", self.site_id, attempts);

        let mut state = self.lock();
        self.set_status(&mut state, SessionStatus::Disconnected);
        self.emit(SessionEvent::Error(CollabError::ReconnectExhausted { attempts }));
    }

    /// Idempotent teardown: leave, close everything, keep the replica.
    fn shut_down(&self) {
        let mut state = self.lock();
        if state.status == SessionStatus::Connected {
            let leave = Message::Leave(LeavePayload {
                user: state.local_user.without_cursor(),
            });
            self.broadcast(&mut state, &leave);
            tracing::info!("Session {} disconnected", self.site_id);
        }
        self.transport.close();

        for (_, peer) in std::mem::take(&mut state.peers) {
            peer.close();
        }
        state.awaiting_heartbeat = false;
        state.presence.mark_all_offline();
        self.set_status(&mut state, SessionStatus::Disconnected);
    }

    /// Heartbeat tick: expire idle collaborators and ping unless a ping is
    /// outstanding. Returns true if a ping was sent.
    fn heartbeat_tick(&self) -> bool {
        let now = self.time.now_ms();
        let mut state = self.lock();

        for site in state.presence.expire(now) {
            state.peer_vectors.remove(&site);
            tracing::info!("Session {}: {} timed out", self.site_id, site);
            self.emit(SessionEvent::UserLeft(site));
        }

        if state.awaiting_heartbeat {
            return false;
        }
        self.broadcast(&mut state, &Message::Heartbeat(HeartbeatPayload { reply: false }));
        state.awaiting_heartbeat = true;
        true
    }

    fn heartbeat_outstanding(&self) -> bool {
        self.lock().awaiting_heartbeat
    }

    /// Periodic resync: advertise our contiguous vector and trim history all
    /// known collaborators have acknowledged.
    fn resync_tick(&self) {
        let mut state = self.lock();
        let request = Message::SyncRequest(state.crdt.contiguous_vector());
        self.broadcast(&mut state, &request);

        if state.presence.is_empty() {
            return;
        }
        let mut stable = state.crdt.version_vector().clone();
        for user in state.presence.users() {
            match state.peer_vectors.get(&user.site_id) {
                Some(vector) => stable = stable.meet(vector),
                None => return,
            }
        }
        let trimmed = state.crdt.compact(&stable);
        if trimmed > 0 {
            tracing::debug!("Session {} compacted {} operations", self.site_id, trimmed);
        }
    }
}

/// Messages only a live collaborator sends. Joins and leaves manage the
/// roster themselves; heartbeat replies may come from the relay.
fn shows_activity(message: &Message) -> bool {
    !matches!(
        message,
        Message::Join(_) | Message::Leave(_) | Message::Heartbeat(HeartbeatPayload { reply: true })
    )
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Connection state machine: connect, pump until lost, back off, repeat.
async fn run_driver<T: Transport>(shared: Arc<Shared<T>>, mut shutdown: broadcast::Receiver<()>) {
    let mut attempt: u32 = 0;

    loop {
        shared.update_status(SessionStatus::Connecting);
        let (tx, mut inbound) = mpsc::unbounded_channel();

        let connected = tokio::select! {
            result = shared.transport.connect(tx) => result,
            _ = shutdown.recv() => {
                shared.shut_down();
                return;
            }
        };

        let err = match connected {
            Ok(()) => {
                attempt = 0;
                shared.on_connected();
                match pump(&shared, &mut inbound, &mut shutdown).await {
                    PumpExit::Shutdown => {
                        shared.shut_down();
                        return;
                    }
                    PumpExit::Lost(err) => err,
                }
            }
            Err(err) => err,
        };
        shared.on_lost(err);

        attempt += 1;
        if attempt > shared.config.max_reconnect_attempts {
            shared.give_up();
            return;
        }

        shared.update_status(SessionStatus::Reconnecting);
        let delay = shared.config.backoff_delay(attempt);
        tracing::info!(
            "Session {} reconnecting in {:?} (attempt {}/{})",
            shared.site_id,
            delay,
            attempt,
            shared.config.max_reconnect_attempts
        );

        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = shutdown.recv() => {
                shared.shut_down();
                return;
            }
        }
    }
}

/// Process inbound events and timers until shutdown or transport loss.
async fn pump<T: Transport>(
    shared: &Shared<T>,
    inbound: &mut mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: &mut broadcast::Receiver<()>,
) -> PumpExit {
    let config = &shared.config;
    let heartbeat_period = millis(config.heartbeat_interval_ms);
    let resync_period = millis(config.resync_interval_ms);

    let mut heartbeat = time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resync = time::interval_at(Instant::now() + resync_period, resync_period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reply_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return PumpExit::Shutdown,
            event = inbound.recv() => match event {
                Some(TransportEvent::Frame(frame)) => shared.handle_frame(&frame),
                Some(TransportEvent::Error(reason)) => {
                    return PumpExit::Lost(CollabError::Transport(reason));
                }
                Some(TransportEvent::Closed) | None => {
                    return PumpExit::Lost(CollabError::Transport("connection closed".into()));
                }
            },
            _ = heartbeat.tick() => {
                if shared.heartbeat_tick() {
                    reply_deadline = Some(Instant::now() + Duration::from_millis(config.heartbeat_timeout_ms));
                }
            }
            _ = time::sleep_until(reply_deadline.unwrap_or_else(Instant::now)), if reply_deadline.is_some() => {
                reply_deadline = None;
                if shared.heartbeat_outstanding() {
                    return PumpExit::Lost(CollabError::Transport("heartbeat timed out".into()));
                }
            }
            _ = resync.tick() => shared.resync_tick(),
        }
    }
}
