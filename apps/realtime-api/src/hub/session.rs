//! Per-connection session state: outbound queue, lifecycle, and heartbeat bookkeeping.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use frbook_common::id::{prefix, prefixed_ulid};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::events::Event;

/// Close codes (4000-range for application-level).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_SESSION_TIMEOUT: u16 = 4009;
pub const CLOSE_KICKED: u16 = 4010;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Transport,
    HeartbeatTimeout,
    Kicked,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::ClientClosed | Self::Transport => CLOSE_NORMAL,
            Self::HeartbeatTimeout => CLOSE_SESSION_TIMEOUT,
            Self::Kicked => CLOSE_KICKED,
            Self::Shutdown => CLOSE_GOING_AWAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "Client closed",
            Self::Transport => "Transport error",
            Self::HeartbeatTimeout => "Heartbeat timeout",
            Self::Kicked => "Kicked",
            Self::Shutdown => "Server shutting down",
        }
    }
}

/// A frame waiting in a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<Event>),
    /// Ask the client to disconnect on its own (sent while draining).
    Closing(&'static str),
    /// Keep-alive ping from the heartbeat task.
    Ping,
}

/// Admin snapshot of one live link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub hub: String,
    pub user_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

/// One live real-time connection bound to one user in one hub.
///
/// The session never holds a pointer back to its hub; it only knows the hub
/// name. Whoever drives the connection unregisters it after it closes.
pub struct Session {
    /// Unique link identifier (`lnk_` prefixed ULID).
    pub session_id: String,
    pub user_id: String,
    pub hub: String,
    pub connected_at: DateTime<Utc>,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    dropped: AtomicU64,
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in `Connecting` along with the receiving end of its
    /// outbound queue, which belongs to the writer.
    pub fn new(hub: &str, user_id: &str, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self {
            session_id: prefixed_ulid(prefix::LINK),
            user_id: user_id.to_string(),
            hub: hub.to_string(),
            connected_at: Utc::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound: tx,
            dropped: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// `Connecting` → `Active`. Returns false if the session already moved on.
    pub fn activate(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Active)
    }

    /// `Active` → `Draining`, and queue a closing notice for the client.
    pub fn begin_drain(&self, reason: &'static str) -> bool {
        if !self.transition(SessionState::Active, SessionState::Draining) {
            return false;
        }
        // Best effort: a full queue still gets force-closed after the grace period.
        let _ = self.outbound.try_send(Outbound::Closing(reason));
        true
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Queue an event for delivery without blocking.
    ///
    /// When the queue is full the new event is dropped and counted. Returns
    /// whether the event was queued.
    pub fn enqueue(&self, event: Arc<Event>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(Outbound::Event(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    dropped,
                    "outbound queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a keep-alive ping. Skipped when the queue is full; a backed-up
    /// writer does not need one and is not counted as dropping.
    pub fn ping(&self) -> bool {
        !self.is_closed() && self.outbound.try_send(Outbound::Ping).is_ok()
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of frames currently waiting in the outbound queue.
    pub fn queue_len(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Close the session. Only the first call has any effect; it records the
    /// reason and wakes the reader and writer. Returns whether this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let prev = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if prev == SessionState::Closed as u8 {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.cancel.cancel();
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the session has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            hub: self.hub.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
        }
    }
}
