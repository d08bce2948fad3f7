//! Integration tests for the collaboration system
//! Tests convergence, concurrent editing, and sync over sessions
//!
//! These tests simulate real collaborative editing scenarios with multiple
//! replicas making concurrent edits under arbitrary delivery orders and
//! ensure that all replicas converge to the same final state.

use collab::{
    CollabError, CrdtState, ManualTimeSource, MemoryHub, MemoryTransport, Operation,
    SessionConfig, SessionEvent, SessionStatus, SiteId, SyncSession, TextCrdt, VersionVector,
};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Test harness for simulating multiple replicas with explicit delivery
struct CollaborationHarness {
    replicas: Vec<TextCrdt>,
    /// In-flight operations: queues[from][to]
    queues: Vec<Vec<VecDeque<Operation>>>,
}

impl CollaborationHarness {
    fn new(sites: usize) -> Self {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let replicas = (0..sites)
            .map(|i| TextCrdt::with_time_source(format!("site-{i}"), time.clone()))
            .collect();
        let queues = (0..sites)
            .map(|_| (0..sites).map(|_| VecDeque::new()).collect())
            .collect();
        Self { replicas, queues }
    }

    fn site_count(&self) -> usize {
        self.replicas.len()
    }

    fn publish(&mut self, from: usize, op: Operation) {
        for to in 0..self.site_count() {
            if to != from {
                self.queues[from][to].push_back(op.clone());
            }
        }
    }

    fn insert(&mut self, site: usize, index: usize, ch: char) {
        let op = self.replicas[site].insert(index, ch);
        self.publish(site, op);
    }

    fn insert_text(&mut self, site: usize, index: usize, text: &str) {
        for (i, ch) in text.chars().enumerate() {
            self.insert(site, index + i, ch);
        }
    }

    fn delete(&mut self, site: usize, index: usize) {
        if let Some(op) = self.replicas[site].delete(index) {
            self.publish(site, op);
        }
    }

    /// Deliver the oldest in-flight operation from `from` to `to`.
    fn deliver_next(&mut self, from: usize, to: usize) -> bool {
        match self.queues[from][to].pop_front() {
            Some(op) => {
                self.replicas[to].apply_operation(&op);
                true
            }
            None => false,
        }
    }

    /// Deliver an arbitrary in-flight operation (breaks per-site order).
    fn deliver_any(&mut self, from: usize, to: usize, pick: usize) -> bool {
        let queue = &mut self.queues[from][to];
        if queue.is_empty() {
            return false;
        }
        let index = pick % queue.len();
        match queue.remove(index) {
            Some(op) => {
                self.replicas[to].apply_operation(&op);
                true
            }
            None => false,
        }
    }

    fn flush(&mut self) {
        let n = self.site_count();
        for from in 0..n {
            for to in 0..n {
                while self.deliver_next(from, to) {}
            }
        }
    }

    fn text(&self, site: usize) -> String {
        self.replicas[site].text()
    }

    fn assert_converged(&self) {
        let first = self.text(0);
        for (i, replica) in self.replicas.iter().enumerate().skip(1) {
            assert_eq!(replica.text(), first, "replica {} diverged", i);
            assert_eq!(
                replica.version_vector(),
                self.replicas[0].version_vector(),
                "replica {} version vector diverged",
                i
            );
        }
    }
}

// =============================================================================
// Convergence scenarios
// =============================================================================

#[test]
fn test_hello_with_concurrent_exclamations() {
    let mut h = CollaborationHarness::new(2);
    h.insert_text(0, 0, "hello");
    h.flush();
    assert_eq!(h.text(1), "hello");

    h.insert(1, 0, '!');
    h.insert(1, 5, '!');
    h.insert(0, 5, '?');
    h.flush();

    h.assert_converged();
    assert_eq!(h.text(0).chars().count(), 8);
    assert_eq!(h.text(0).matches('!').count(), 2);
}

#[test]
fn test_hello_example_converges_to_seven_chars() {
    let mut h = CollaborationHarness::new(2);
    h.insert_text(0, 0, "hello");
    h.flush();

    h.insert(1, 0, '!');
    h.insert(1, 5, '!');
    h.flush();

    h.assert_converged();
    assert_eq!(h.text(0).chars().count(), 7);
}

#[test]
fn test_three_sites_concurrent_typing() {
    let mut h = CollaborationHarness::new(3);
    h.insert_text(0, 0, "base");
    h.flush();

    h.insert_text(0, 0, "AAA");
    h.insert_text(1, 4, "BBB");
    h.insert_text(2, 2, "CCC");
    h.delete(1, 0);
    h.flush();

    h.assert_converged();
    assert_eq!(h.text(0).chars().count(), 4 + 9 - 1);
}

#[test]
fn test_concurrent_delete_of_same_character() {
    let mut h = CollaborationHarness::new(2);
    h.insert_text(0, 0, "abc");
    h.flush();

    h.delete(0, 1);
    h.delete(1, 1);
    h.flush();

    h.assert_converged();
    assert_eq!(h.text(0), "ac");
    assert_eq!(h.replicas[0].entry_count(), 3);
}

#[test]
fn test_reverse_delivery_converges() {
    let mut h = CollaborationHarness::new(2);
    h.insert_text(0, 0, "abcdef");
    h.delete(0, 2);
    h.delete(0, 0);

    // Newest first: deletes arrive before their inserts
    while let Some(last) = h.queues[0][1].len().checked_sub(1) {
        h.deliver_any(0, 1, last);
    }

    h.assert_converged();
    assert_eq!(h.text(1), "bdef");
    assert_eq!(h.replicas[1].pending_delete_count(), 0);
}

#[test]
fn test_insert_then_delete_replays_to_empty() {
    let mut crdt = TextCrdt::new("a");
    crdt.insert(0, 'a');
    crdt.delete(0);
    assert_eq!(crdt.text(), "");

    let mut fresh = TextCrdt::new("b");
    fresh.merge(&crdt.state());
    assert_eq!(fresh.text(), "");
}

// =============================================================================
// State merge properties
// =============================================================================

#[test]
fn test_merge_is_commutative_and_idempotent() {
    let mut a = TextCrdt::new("a");
    let mut b = TextCrdt::new("b");
    let mut c = TextCrdt::new("c");
    for (i, ch) in "one".chars().enumerate() {
        a.insert(i, ch);
    }
    for (i, ch) in "two".chars().enumerate() {
        b.insert(i, ch);
    }
    c.insert(0, 'x');

    let states = [a.state(), b.state(), c.state()];

    let mut forward = TextCrdt::new("f");
    for state in &states {
        forward.merge(state);
    }
    let mut backward = TextCrdt::new("g");
    for state in states.iter().rev() {
        backward.merge(state);
    }
    // Merging a merged state again changes nothing
    let again = backward.merge(&forward.state());

    assert!(again.is_empty());
    assert_eq!(forward.text(), backward.text());
    assert_eq!(forward.version_vector(), backward.version_vector());
}

#[test]
fn test_snapshot_json_replays_losslessly() {
    let mut a = TextCrdt::new("a");
    for (i, ch) in "snapshot".chars().enumerate() {
        a.insert(i, ch);
    }
    a.delete(0);
    a.insert_with_attributes(0, 'S', Some(serde_json::json!({"bold": true})));

    let json = a.state().to_json().unwrap();
    let restored = CrdtState::from_json(&json).unwrap();

    let mut b = TextCrdt::new("b");
    b.merge(&restored);
    assert_eq!(b.text(), "Snapshot");
    assert_eq!(b.entry_count(), a.entry_count());
    assert_eq!(b.version_vector(), a.version_vector());
}

#[test]
fn test_delta_sync_between_diverged_replicas() {
    let mut a = TextCrdt::new("a");
    let mut b = TextCrdt::new("b");
    for (i, ch) in "shared".chars().enumerate() {
        a.insert(i, ch);
    }
    b.merge(&a.state());

    a.insert(0, '<');
    b.insert(6, '>');

    let to_b = a.delta(&b.contiguous_vector());
    let to_a = b.delta(&a.contiguous_vector());
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_a.len(), 1);

    b.merge_operations(&to_b);
    a.merge_operations(&to_a);
    assert_eq!(a.text(), "<shared>");
    assert_eq!(a.text(), b.text());
}

#[test]
fn test_compacted_replica_still_serves_new_peers() {
    let mut a = TextCrdt::new("a");
    let mut b = TextCrdt::new("b");
    for (i, ch) in "compact me".chars().enumerate() {
        a.insert(i, ch);
    }
    a.delete(7);
    b.merge(&a.state());

    let stable = a.version_vector().meet(b.version_vector());
    assert!(a.compact(&stable) > 0);

    let mut late = TextCrdt::new("late");
    late.merge(&a.state());
    assert_eq!(late.text(), a.text());
    assert_eq!(late.version_vector(), a.version_vector());

    assert!(a.delta(b.version_vector()).is_empty());
}

// =============================================================================
// Density
// =============================================================================

#[test]
fn test_ten_thousand_inserts_at_front_stay_ordered() {
    let mut crdt = TextCrdt::new("dense");
    let mut previous: Option<collab::Identifier> = None;

    for i in 0..10_000u32 {
        let ch = char::from(b'a' + (i % 26) as u8);
        let op = crdt.insert(0, ch);
        if let Some(prev) = &previous {
            assert!(op.identifier < *prev, "insert {} not before its successor", i);
        }
        previous = Some(op.identifier);
    }

    assert_eq!(crdt.len(), 10_000);
    let ids: Vec<_> = crdt.entries().map(|e| e.id.clone()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_ten_thousand_inserts_in_middle_stay_ordered() {
    let mut crdt = TextCrdt::new("dense");
    crdt.insert(0, '[');
    crdt.insert(1, ']');
    for _ in 0..10_000 {
        crdt.insert(1, 'x');
    }

    let text = crdt.text();
    assert!(text.starts_with('['));
    assert!(text.ends_with(']'));
    assert_eq!(text.chars().count(), 10_002);
}

// =============================================================================
// Property-based convergence
// =============================================================================

#[derive(Clone, Debug)]
enum Action {
    Insert { site: usize, index: usize, ch: char },
    Delete { site: usize, index: usize },
    DeliverNext { from: usize, to: usize },
    DeliverAny { from: usize, to: usize, pick: usize },
}

fn action_strategy(sites: usize) -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0..sites, 0..40usize, prop::char::range('a', 'z'))
            .prop_map(|(site, index, ch)| Action::Insert { site, index, ch }),
        1 => (0..sites, 0..40usize).prop_map(|(site, index)| Action::Delete { site, index }),
        3 => (0..sites, 0..sites).prop_map(|(from, to)| Action::DeliverNext { from, to }),
        1 => (0..sites, 0..sites, any::<usize>())
            .prop_map(|(from, to, pick)| Action::DeliverAny { from, to, pick }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_replicas_converge(actions in prop::collection::vec(action_strategy(3), 1..120)) {
        let mut h = CollaborationHarness::new(3);

        for action in actions {
            match action {
                Action::Insert { site, index, ch } => {
                    let len = h.replicas[site].len();
                    h.insert(site, index % (len + 1), ch);
                }
                Action::Delete { site, index } => {
                    let len = h.replicas[site].len();
                    if len > 0 {
                        h.delete(site, index % len);
                    }
                }
                Action::DeliverNext { from, to } => {
                    h.deliver_next(from, to);
                }
                Action::DeliverAny { from, to, pick } => {
                    h.deliver_any(from, to, pick);
                }
            }
        }
        h.flush();

        let first = h.text(0);
        for replica in &h.replicas {
            prop_assert_eq!(replica.text(), first.clone());
            prop_assert_eq!(replica.pending_delete_count(), 0);
        }
    }

    #[test]
    fn prop_reapplying_history_is_idempotent(text in "[a-z]{1,30}", deletes in prop::collection::vec(0..30usize, 0..10)) {
        let mut a = TextCrdt::new("a");
        for (i, ch) in text.chars().enumerate() {
            a.insert(i, ch);
        }
        for d in deletes {
            if !a.is_empty() {
                a.delete(d % a.len());
            }
        }

        let before = a.text();
        let history: Vec<Operation> = a.history().to_vec();
        prop_assert!(a.merge_operations(&history).is_empty());
        prop_assert_eq!(a.text(), before);
    }

    #[test]
    fn prop_delta_is_exactly_unseen_operations(
        text in "[a-z]{1,20}",
        seen_a in 0..25u64,
    ) {
        let mut a = TextCrdt::new("a");
        for (i, ch) in text.chars().enumerate() {
            a.insert(i, ch);
        }

        let mut remote = VersionVector::new();
        remote.set(SiteId::new("a"), seen_a);
        let delta = a.delta(&remote);

        let expected = (text.chars().count() as u64).saturating_sub(seen_a);
        prop_assert_eq!(delta.len() as u64, expected);
        prop_assert!(delta.iter().all(|op| op.clock > seen_a));
    }
}

// =============================================================================
// Sessions over the in-memory hub
// =============================================================================

fn session_config() -> SessionConfig {
    SessionConfig::default()
        .with_heartbeat_interval_ms(1_000)
        .with_heartbeat_timeout_ms(500)
        .with_resync_interval_ms(2_000)
        .with_max_reconnect_attempts(3)
        .with_backoff_ms(100, 1_000)
}

fn start_session(hub: &MemoryHub, site: &str) -> SyncSession<MemoryTransport> {
    let (session, _events) = SyncSession::new(
        site,
        format!("user-{site}"),
        hub.transport(site),
        session_config(),
    );
    session.connect();
    session
}

async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_sessions_converge_with_concurrent_edits() {
    let hub = MemoryHub::new();
    let sessions: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|site| start_session(&hub, site))
        .collect();
    wait(10).await;

    for round in 0..10 {
        for (i, session) in sessions.iter().enumerate() {
            let index = if round % 2 == 0 { 0 } else { session.len() };
            session.insert(index, char::from(b'a' + i as u8));
        }
    }
    sessions[1].delete(3);
    wait(10).await;

    let text = sessions[0].text();
    assert_eq!(text.chars().count(), 29);
    for session in &sessions {
        assert_eq!(session.text(), text);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropped_site_heals_through_rejoin() {
    let hub = MemoryHub::new();
    let a = start_session(&hub, "a");
    let b = start_session(&hub, "b");
    wait(10).await;

    a.insert_str(0, "steady");
    wait(10).await;

    hub.drop_connection(&SiteId::new("b"));
    wait(10).await;
    assert_eq!(b.status(), SessionStatus::Reconnecting);

    // Edits on both sides while b is away
    a.insert(6, '!');
    b.insert(0, '>');

    wait(500).await;
    assert_eq!(b.status(), SessionStatus::Connected);
    assert_eq!(a.text(), b.text());
    assert_eq!(a.text(), ">steady!");
}

#[tokio::test(start_paused = true)]
async fn test_periodic_resync_heals_lost_operation() {
    let hub = MemoryHub::new();
    let a = start_session(&hub, "a");
    let b = start_session(&hub, "b");
    wait(10).await;

    // Frames from a are swallowed but the connection stays up
    hub.set_silenced(&SiteId::new("a"), true);
    a.insert(0, 'z');
    hub.set_silenced(&SiteId::new("a"), false);
    wait(10).await;
    assert_eq!(b.text(), "");

    // b's resync request pulls it in
    wait(2_100).await;
    assert_eq!(b.text(), "z");
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_hub_exhausts_reconnects() {
    let hub = MemoryHub::new();
    hub.set_reachable(&SiteId::new("a"), false);
    let (session, mut events) = SyncSession::new(
        "a",
        "user-a",
        hub.transport("a"),
        session_config(),
    );
    session.connect();

    // 100 + 200 + 400 ms of backoff
    wait(1_000).await;
    assert_eq!(session.status(), SessionStatus::Disconnected);

    let mut exhausted = false;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Error(CollabError::ReconnectExhausted { attempts: 3 }) {
            exhausted = true;
        }
    }
    assert!(exhausted);
}
