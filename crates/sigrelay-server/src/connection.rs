//! Connection state shared between a connection's own task and the registry.
//!
//! The connection task exclusively owns the socket, the receive buffer and
//! the receiving ends of the queues. Everyone else (registry, router, other
//! connections' tasks) holds a cloned [`ConnectionHandle`], which can only
//! enqueue frames, request a close, and read the lifecycle.

use bytes::Bytes;
use sigrelay_core::{CloseCode, RelayError, RelayResult};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

pub type ConnectionId = u64;

/// Signaling channel selected by the upgrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Audio/video call signaling (`/call-signaling`, `/audio-signaling`).
    Call,
    /// Chat signaling (`/chat-signaling`).
    Chat,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Call, Channel::Chat];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Call => "call",
            Channel::Chat => "chat",
        }
    }

    pub fn service_name(self) -> &'static str {
        match self {
            Channel::Call => "call-signaling",
            Channel::Chat => "chat-signaling",
        }
    }
}

/// Registry key: rooms are namespaced by channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub channel: Channel,
    pub room_id: String,
}

impl RoomKey {
    pub fn new(channel: Channel, room_id: impl Into<String>) -> Self {
        Self {
            channel,
            room_id: room_id.into(),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel.as_str(), self.room_id)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Connecting,
            1 => Lifecycle::Open,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// A close requested from outside the connection's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: CloseCode,
    pub reason: String,
}

/// Receiving ends owned by the connection task.
pub struct ConnectionQueues {
    /// Encoded frames queued by the router.
    pub outbound: mpsc::Receiver<Bytes>,
    /// Close requests (superseded, backpressure, shutdown).
    pub close: watch::Receiver<Option<CloseRequest>>,
}

struct Inner {
    id: ConnectionId,
    room: RoomKey,
    participant_id: String,
    remote: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<Option<CloseRequest>>,
    lifecycle: AtomicU8,
    released: AtomicBool,
}

/// Non-owning reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state with a bounded outbound queue.
    pub fn new(
        id: ConnectionId,
        room: RoomKey,
        participant_id: impl Into<String>,
        remote: SocketAddr,
        queue_capacity: usize,
    ) -> (Self, ConnectionQueues) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Self {
            inner: Arc::new(Inner {
                id,
                room,
                participant_id: participant_id.into(),
                remote,
                outbound: outbound_tx,
                close_tx,
                lifecycle: AtomicU8::new(Lifecycle::Connecting as u8),
                released: AtomicBool::new(false),
            }),
        };
        let queues = ConnectionQueues {
            outbound: outbound_rx,
            close: close_rx,
        };
        (handle, queues)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn room(&self) -> &RoomKey {
        &self.inner.room
    }

    pub fn participant_id(&self) -> &str {
        &self.inner.participant_id
    }

    pub fn remote(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::Acquire))
    }

    /// Advance the lifecycle; earlier states are ignored. Returns the previous state.
    pub fn advance(&self, next: Lifecycle) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.fetch_max(next as u8, Ordering::AcqRel))
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() == Lifecycle::Open
    }

    /// Enqueue an encoded frame without waiting.
    ///
    /// A full queue is [`RelayError::Backpressure`]; the caller decides the
    /// policy (the router closes the recipient).
    pub fn try_send(&self, frame: Bytes) -> RelayResult<()> {
        match self.inner.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RelayError::Backpressure(self.inner.id)),
            Err(TrySendError::Closed(_)) => Err(RelayError::ConnectionClosed),
        }
    }

    /// Ask the connection's task to close with `code`. The first request wins.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        self.inner.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseRequest {
                code,
                reason: reason.to_string(),
            });
            true
        })
    }

    /// The close requested so far, if any.
    pub fn close_requested(&self) -> Option<CloseRequest> {
        self.inner.close_tx.borrow().clone()
    }

    /// Returns `true` exactly once; guards the single registry `leave`.
    pub fn release(&self) -> bool {
        !self.inner.released.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("room", &self.inner.room)
            .field("participant_id", &self.inner.participant_id)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
