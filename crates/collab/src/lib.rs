//! Replicated text editing for real-time collaboration.
//!
//! This crate provides a Logoot-style sequence CRDT that lets independent
//! sites edit one text concurrently and converge without a central lock, plus
//! the session protocol that keeps replicas in sync over an unreliable
//! transport.
//!
//! # Modules
//!
//! - `site`: Site identifiers
//! - `clock`: Lamport clock, version vector and injected time sources
//! - `position`: Dense position identifiers and the allocation algorithm
//! - `operation`: Operations, character entries and state snapshots
//! - `crdt`: The replicated text sequence (`TextCrdt`)
//! - `message`: Wire envelope and message payloads
//! - `presence`: Collaborator roster and cursors
//! - `transport`: Transport seam and the in-memory hub
//! - `session`: Connection lifecycle, heartbeats, resync and broadcast
//! - `error`: Error types for the collaboration crate
//!
//! # Example
//!
//! ```
//! use collab::crdt::TextCrdt;
//!
//! let mut alice = TextCrdt::new("alice");
//! let mut bob = TextCrdt::new("bob");
//!
//! let ops: Vec<_> = "hello".chars().enumerate().map(|(i, c)| alice.insert(i, c)).collect();
//! bob.merge_operations(&ops);
//!
//! // Concurrent edits at both ends
//! let a = alice.insert(0, '>');
//! let b = bob.insert(5, '!');
//! alice.apply_operation(&b);
//! bob.apply_operation(&a);
//!
//! assert_eq!(alice.text(), ">hello!");
//! assert_eq!(alice.text(), bob.text());
//! ```

pub mod clock;
pub mod crdt;
pub mod error;
pub mod message;
pub mod operation;
pub mod position;
pub mod presence;
pub mod session;
pub mod site;
pub mod transport;

// Re-export commonly used types
pub use clock::{LamportClock, ManualTimeSource, SystemTimeSource, TimeSource, VersionVector};
pub use crdt::TextCrdt;
pub use error::{CollabError, CollabResult};
pub use message::{Envelope, Message, MessageType, SyncResponse};
pub use operation::{CharacterEntry, CrdtState, Identifier, OpStamp, Operation, OperationKind};
pub use position::{generate_position_between, Position, PositionComponent, MAX_DIGIT};
pub use presence::{CollaborationUser, CursorPosition, PresenceTracker};
pub use session::{SessionConfig, SessionEvent, SessionStatus, SyncSession};
pub use site::SiteId;
pub use transport::{MemoryHub, MemoryTransport, PeerChannel, QueuePeerChannel, Transport, TransportEvent};
