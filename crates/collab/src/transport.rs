//! Transport seam between a session and the network.
//!
//! A session talks to exactly one primary [`Transport`] (typically a relay
//! server connection) and any number of direct [`PeerChannel`]s. Frames are
//! opaque JSON strings; addressing lives inside the envelope.
//!
//! [`MemoryHub`] is an in-process relay used by tests and the simulator:
//! every frame one member sends is delivered to every other member, and
//! heartbeat pings are answered by the hub itself the way a relay server
//! would answer them. Pings are still relayed so other members see the
//! sender is alive.

use crate::error::{CollabError, CollabResult};
use crate::message::{Envelope, HeartbeatPayload, Message, MessageType};
use crate::site::SiteId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Site id the memory hub uses when it answers heartbeats.
pub const HUB_SITE: &str = "memory-hub";

/// Frames a [`MemoryHub`] keeps in its log unless configured otherwise.
pub const DEFAULT_HUB_LOG_CAPACITY: usize = 4_096;

/// Event delivered from a transport to its session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound frame
    Frame(String),
    /// The connection closed
    Closed,
    /// The connection failed
    Error(String),
}

/// Primary connection used by a session.
///
/// `connect` hands the transport the sender half of the session's inbound
/// queue; the transport pushes frames and lifecycle events into it until it
/// is closed.
#[trait_variant::make(Send)]
pub trait Transport: Send + Sync + 'static {
    /// Establish the connection.
    async fn connect(&self, inbound: mpsc::UnboundedSender<TransportEvent>) -> CollabResult<()>;

    /// Queue a frame for sending.
    fn send(&self, frame: String) -> CollabResult<()>;

    /// Close the connection. Must be safe to call when not connected.
    fn close(&self);
}

/// Direct channel to a single peer.
pub trait PeerChannel: Send {
    /// Send a frame to the peer.
    fn send(&self, frame: String) -> CollabResult<()>;

    /// Close the channel.
    fn close(&self);
}

#[derive(Debug)]
struct HubState {
    /// Connected members and their inbound queues
    members: HashMap<SiteId, mpsc::UnboundedSender<TransportEvent>>,
    /// Sites whose connect attempts fail
    unreachable: HashSet<SiteId>,
    /// Sites whose outgoing frames are swallowed
    silenced: HashSet<SiteId>,
    /// Most recent frames accepted for delivery, with their senders
    log: VecDeque<(SiteId, String)>,
    /// Maximum log length; 0 disables logging
    log_capacity: usize,
}

impl HubState {
    fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            members: HashMap::new(),
            unreachable: HashSet::new(),
            silenced: HashSet::new(),
            log: VecDeque::new(),
            log_capacity,
        }
    }

    fn record(&mut self, from: &SiteId, frame: &str) {
        if self.log_capacity == 0 {
            return;
        }
        while self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back((from.clone(), frame.to_string()));
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_HUB_LOG_CAPACITY)
    }
}

/// In-process relay connecting any number of [`MemoryTransport`]s.
#[derive(Clone, Debug, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty hub that keeps at most `capacity` frames in its log.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState::with_log_capacity(capacity))),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a transport for `site` attached to this hub.
    pub fn transport(&self, site: impl Into<SiteId>) -> MemoryTransport {
        MemoryTransport {
            site: site.into(),
            hub: self.clone(),
        }
    }

    /// Check if a site is currently connected.
    pub fn is_connected(&self, site: &SiteId) -> bool {
        self.state().members.contains_key(site)
    }

    /// Number of connected members.
    pub fn member_count(&self) -> usize {
        self.state().members.len()
    }

    /// Make connect attempts from `site` fail (or succeed again).
    pub fn set_reachable(&self, site: &SiteId, reachable: bool) {
        let mut state = self.state();
        if reachable {
            state.unreachable.remove(site);
        } else {
            state.unreachable.insert(site.clone());
        }
    }

    /// Swallow every frame `site` sends, heartbeats included.
    pub fn set_silenced(&self, site: &SiteId, silenced: bool) {
        let mut state = self.state();
        if silenced {
            state.silenced.insert(site.clone());
        } else {
            state.silenced.remove(site);
        }
    }

    /// Drop a member's connection as if the network failed.
    pub fn drop_connection(&self, site: &SiteId) {
        if let Some(tx) = self.state().members.remove(site) {
            tracing::debug!("Hub dropping connection of {}", site);
            let _ = tx.send(TransportEvent::Closed);
        }
    }

    /// Push a raw frame to one member.
    pub fn inject(&self, site: &SiteId, frame: impl Into<String>) -> bool {
        match self.state().members.get(site) {
            Some(tx) => tx.send(TransportEvent::Frame(frame.into())).is_ok(),
            None => false,
        }
    }

    /// The most recent frames accepted, oldest first, with their senders.
    pub fn log(&self) -> Vec<(SiteId, String)> {
        self.state().log.iter().cloned().collect()
    }

    /// Decoded envelopes sent by `site`.
    pub fn sent_by(&self, site: &SiteId) -> Vec<Envelope> {
        self.state()
            .log
            .iter()
            .filter(|(from, _)| from == site)
            .filter_map(|(_, frame)| Envelope::decode(frame).ok())
            .collect()
    }

    fn connect(&self, site: &SiteId, inbound: mpsc::UnboundedSender<TransportEvent>) -> CollabResult<()> {
        let mut state = self.state();
        if state.unreachable.contains(site) {
            return Err(CollabError::Transport(format!("{} is unreachable", site)));
        }
        if let Some(previous) = state.members.insert(site.clone(), inbound) {
            let _ = previous.send(TransportEvent::Closed);
        }
        tracing::debug!("Hub accepted {}", site);
        Ok(())
    }

    fn deliver(&self, from: &SiteId, frame: String) -> CollabResult<()> {
        let mut state = self.state();
        if !state.members.contains_key(from) {
            return Err(CollabError::NotConnected);
        }
        if state.silenced.contains(from) {
            return Ok(());
        }

        state.record(from, &frame);
        if let Some(reply) = heartbeat_reply(from, &frame) {
            if let Some(tx) = state.members.get(from) {
                let _ = tx.send(TransportEvent::Frame(reply));
            }
        }

        state.members.retain(|site, tx| {
            site == from || tx.send(TransportEvent::Frame(frame.clone())).is_ok()
        });
        Ok(())
    }

    fn disconnect(&self, site: &SiteId) {
        if self.state().members.remove(site).is_some() {
            tracing::debug!("Hub released {}", site);
        }
    }
}

/// Answer a broadcast heartbeat ping the way a relay server would.
fn heartbeat_reply(from: &SiteId, frame: &str) -> Option<String> {
    let envelope = Envelope::decode(frame).ok()?;
    if envelope.message_type != MessageType::Heartbeat || !envelope.is_broadcast() {
        return None;
    }
    match envelope.message().ok()? {
        Message::Heartbeat(HeartbeatPayload { reply: false }) => {}
        _ => return None,
    }

    let reply = Message::Heartbeat(HeartbeatPayload { reply: true });
    Envelope::new(
        SiteId::new(HUB_SITE),
        Some(from.clone()),
        &reply,
        envelope.timestamp,
    )
    .and_then(|e| e.encode())
    .ok()
}

/// A [`Transport`] attached to a [`MemoryHub`].
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    site: SiteId,
    hub: MemoryHub,
}

impl MemoryTransport {
    /// Site this transport belongs to.
    pub fn site(&self) -> &SiteId {
        &self.site
    }
}

impl Transport for MemoryTransport {
    async fn connect(&self, inbound: mpsc::UnboundedSender<TransportEvent>) -> CollabResult<()> {
        self.hub.connect(&self.site, inbound)
    }

    fn send(&self, frame: String) -> CollabResult<()> {
        self.hub.deliver(&self.site, frame)
    }

    fn close(&self) {
        self.hub.disconnect(&self.site);
    }
}

/// A [`PeerChannel`] backed by an unbounded queue.
///
/// Sends fail once the receiving half is dropped or the channel is closed.
#[derive(Debug)]
pub struct QueuePeerChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    peer: SiteId,
}

impl QueuePeerChannel {
    /// Create a channel to `peer` and the receiver its frames arrive on.
    pub fn new(peer: impl Into<SiteId>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            tx: Mutex::new(Some(tx)),
            peer: peer.into(),
        };
        (channel, rx)
    }
}

impl PeerChannel for QueuePeerChannel {
    fn send(&self, frame: String) -> CollabResult<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| CollabError::PeerChannelFailed(self.peer.clone())),
            None => Err(CollabError::PeerChannelFailed(self.peer.clone())),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: &str) -> SiteId {
        SiteId::new(id)
    }

    fn frame(from: &str, message: Message) -> String {
        Envelope::new(site(from), None, &message, 1)
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_hub_broadcasts_to_other_members() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.connect(tx_a).await.unwrap();
        b.connect(tx_b).await.unwrap();

        a.send("hello".to_string()).unwrap();

        assert_eq!(rx_b.recv().await, Some(TransportEvent::Frame("hello".into())));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(hub.log().len(), 1);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        assert_eq!(a.send("x".into()), Err(CollabError::NotConnected));
    }

    #[tokio::test]
    async fn test_unreachable_site_cannot_connect() {
        let hub = MemoryHub::new();
        hub.set_reachable(&site("a"), false);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = hub.transport("a").connect(tx).await;
        assert!(matches!(result, Err(CollabError::Transport(_))));
        assert!(!hub.is_connected(&site("a")));
    }

    #[tokio::test]
    async fn test_hub_answers_heartbeat() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.connect(tx).await.unwrap();

        a.send(frame("a", Message::Heartbeat(HeartbeatPayload { reply: false })))
            .unwrap();

        let Some(TransportEvent::Frame(reply)) = rx.recv().await else {
            panic!("expected a heartbeat reply");
        };
        let envelope = Envelope::decode(&reply).unwrap();
        assert_eq!(envelope.from, site(HUB_SITE));
        assert_eq!(envelope.to, Some(site("a")));
        assert_eq!(
            envelope.message().unwrap(),
            Message::Heartbeat(HeartbeatPayload { reply: true })
        );
        assert_eq!(hub.log().len(), 1);
    }

    #[tokio::test]
    async fn test_hub_relays_pings_to_other_members() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.connect(tx_a).await.unwrap();
        b.connect(tx_b).await.unwrap();

        let ping = frame("a", Message::Heartbeat(HeartbeatPayload { reply: false }));
        a.send(ping.clone()).unwrap();

        // a hears from the hub, b sees the ping itself
        let Some(TransportEvent::Frame(reply)) = rx_a.recv().await else {
            panic!("expected a heartbeat reply");
        };
        assert_eq!(Envelope::decode(&reply).unwrap().from, site(HUB_SITE));
        assert_eq!(rx_b.recv().await, Some(TransportEvent::Frame(ping)));
    }

    #[tokio::test]
    async fn test_log_keeps_only_latest_frames() {
        let hub = MemoryHub::with_log_capacity(2);
        let a = hub.transport("a");
        let (tx, _rx) = mpsc::unbounded_channel();
        a.connect(tx).await.unwrap();

        for frame in ["one", "two", "three"] {
            a.send(frame.into()).unwrap();
        }

        let frames: Vec<String> = hub.log().into_iter().map(|(_, frame)| frame).collect();
        assert_eq!(frames, vec!["two".to_string(), "three".to_string()]);

        let quiet = MemoryHub::with_log_capacity(0);
        let b = quiet.transport("b");
        let (tx, _rx) = mpsc::unbounded_channel();
        b.connect(tx).await.unwrap();
        b.send("unlogged".into()).unwrap();
        assert!(quiet.log().is_empty());
    }

    #[tokio::test]
    async fn test_drop_connection_notifies_member() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.connect(tx).await.unwrap();

        hub.drop_connection(&site("a"));
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
        assert_eq!(hub.member_count(), 0);
    }

    #[tokio::test]
    async fn test_silenced_site_sends_nothing() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.connect(tx_a).await.unwrap();
        b.connect(tx_b).await.unwrap();

        hub.set_silenced(&site("a"), true);
        a.send("lost".into()).unwrap();
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_queue_peer_channel_fails_after_receiver_drop() {
        let (channel, rx) = QueuePeerChannel::new("p");
        assert!(channel.send("one".into()).is_ok());

        drop(rx);
        assert_eq!(
            channel.send("two".into()),
            Err(CollabError::PeerChannelFailed(site("p")))
        );
    }

    #[test]
    fn test_queue_peer_channel_close() {
        let (channel, _rx) = QueuePeerChannel::new("p");
        channel.close();
        assert!(channel.send("x".into()).is_err());
    }
}
