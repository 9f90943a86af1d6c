//! Named registry of live sessions with per-user fan-out and graceful drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time;

use super::events::{ClientMessage, Event};
use super::session::{CloseReason, LinkInfo, Session};

/// Hub carrying general notifications (friend requests, posts, notices).
pub const NOTIFICATIONS_HUB: &str = "notifications";
/// Hub carrying call signaling.
pub const CALLS_HUB: &str = "calls";

/// Per-hub session settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Receives data frames and disconnects from a hub's sessions.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, session: &Arc<Session>, message: ClientMessage);

    fn on_disconnect(&self, _session: &Arc<Session>) {}
}

/// A named registry of sessions grouped by user.
///
/// `DashMap` keeps contention per shard; the inner map is only touched while
/// the shard lock is held and never across an `.await`.
pub struct Hub {
    name: String,
    config: HubConfig,
    users: DashMap<String, HashMap<String, Arc<Session>>>,
    draining: AtomicBool,
    emptied: Notify,
    inbound: RwLock<Option<Weak<dyn InboundHandler>>>,
}

impl Hub {
    pub fn new(name: &str, config: HubConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            users: DashMap::new(),
            draining: AtomicBool::new(false),
            emptied: Notify::new(),
            inbound: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Install the handler for inbound data frames. Held weakly so the
    /// handler's owner controls its lifetime.
    pub fn set_inbound_handler(&self, handler: Weak<dyn InboundHandler>) {
        *self.inbound.write() = Some(handler);
    }

    pub fn inbound_handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.inbound.read().as_ref().and_then(Weak::upgrade)
    }

    /// Add a session under its user. While draining the session is closed
    /// instead and `false` is returned.
    pub fn register(&self, session: &Arc<Session>) -> bool {
        if self.is_draining() {
            session.close(CloseReason::Shutdown);
            return false;
        }

        self.users
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.session_id.clone(), session.clone());

        // Drain may have started between the check and the insert.
        if self.is_draining() {
            self.unregister(session);
            session.close(CloseReason::Shutdown);
            return false;
        }

        tracing::debug!(
            hub = %self.name,
            session_id = %session.session_id,
            user_id = %session.user_id,
            "session registered"
        );
        true
    }

    /// Remove a session. Unknown sessions are ignored. Returns whether the
    /// session was present.
    pub fn unregister(&self, session: &Arc<Session>) -> bool {
        let removed = match self.users.get_mut(&session.user_id) {
            Some(mut set) => set.remove(&session.session_id).is_some(),
            None => false,
        };
        self.users.remove_if(&session.user_id, |_, set| set.is_empty());

        if removed {
            self.released(std::slice::from_ref(session));
        }
        removed
    }

    /// Queue an event on every session of a user. Returns how many sessions
    /// accepted it; a user without sessions is not an error.
    pub fn notify(&self, user_id: &str, event: Event) -> usize {
        let targets: Vec<Arc<Session>> = match self.users.get(user_id) {
            Some(set) => set.values().cloned().collect(),
            None => return 0,
        };
        let event = Arc::new(event);
        targets.iter().filter(|s| s.enqueue(event.clone())).count()
    }

    /// Queue an event on every registered session, each exactly once.
    pub fn broadcast(&self, event: Event) -> usize {
        let event = Arc::new(event);
        self.sessions()
            .iter()
            .filter(|s| s.enqueue(event.clone()))
            .count()
    }

    /// Force-close every session of a user. Returns how many were closed.
    pub fn kick(&self, user_id: &str) -> usize {
        let Some((_, set)) = self.users.remove(user_id) else {
            return 0;
        };
        let sessions: Vec<Arc<Session>> = set.into_values().collect();
        for session in &sessions {
            session.close(CloseReason::Kicked);
        }
        tracing::info!(hub = %self.name, %user_id, sessions = sessions.len(), "user kicked");
        self.released(&sessions);
        sessions.len()
    }

    /// Force-close a single session. Returns whether it was found.
    pub fn kick_session(&self, session_id: &str) -> bool {
        let Some(session) = self.find_session(session_id) else {
            return false;
        };
        session.close(CloseReason::Kicked);
        self.unregister(&session);
        tracing::info!(hub = %self.name, %session_id, "session kicked");
        true
    }

    pub fn find_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.users
            .iter()
            .find_map(|entry| entry.value().get(session_id).cloned())
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.users
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn list_active(&self) -> Vec<LinkInfo> {
        self.sessions().iter().map(|s| s.info()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn user_session_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|set| set.len()).unwrap_or(0)
    }

    /// Stop accepting sessions, ask every client to leave, wait up to `grace`
    /// for them to go, then force-close whatever is left.
    pub async fn drain(&self, grace: Duration) {
        self.draining.store(true, Ordering::Release);

        let sessions = self.sessions();
        tracing::info!(hub = %self.name, sessions = sessions.len(), "draining hub");
        for session in &sessions {
            session.begin_drain("Server shutting down");
        }

        if time::timeout(grace, self.wait_empty()).await.is_ok() {
            tracing::info!(hub = %self.name, "hub drained");
            return;
        }

        let remaining = self.sessions();
        self.users.clear();
        for session in &remaining {
            session.close(CloseReason::Shutdown);
        }
        tracing::warn!(
            hub = %self.name,
            forced = remaining.len(),
            "grace period elapsed, force-closed remaining sessions"
        );
        self.released(&remaining);
    }

    async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.users.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Bookkeeping after sessions left the registry. No map guard may be held.
    fn released(&self, sessions: &[Arc<Session>]) {
        if let Some(handler) = self.inbound_handler() {
            for session in sessions {
                handler.on_disconnect(session);
            }
        }
        if self.users.is_empty() {
            self.emptied.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::{Outbound, SessionState};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn hub() -> Hub {
        Hub::new(NOTIFICATIONS_HUB, HubConfig::default())
    }

    fn open(hub: &Hub, user_id: &str) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, rx) = Session::new(hub.name(), user_id, hub.config().queue_capacity);
        session.activate();
        assert!(hub.register(&session));
        (session, rx)
    }

    fn event(kind: &str) -> Event {
        Event::broadcast(kind, serde_json::json!({}))
    }

    fn drain_events(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Event(e) = frame {
                kinds.push(e.kind.clone());
            }
        }
        kinds
    }

    #[test]
    fn register_and_unregister_track_counts() {
        let hub = hub();
        let (a, _ra) = open(&hub, "u1");
        let (b, _rb) = open(&hub, "u1");
        let (c, _rc) = open(&hub, "u2");
        assert_eq!(hub.user_session_count("u1"), 2);
        assert_eq!(hub.session_count(), 3);

        assert!(hub.unregister(&a));
        assert_eq!(hub.user_session_count("u1"), 1);

        // Double unregister is a no-op.
        assert!(!hub.unregister(&a));
        assert_eq!(hub.user_session_count("u1"), 1);

        assert!(hub.unregister(&b));
        assert!(hub.unregister(&c));
        assert_eq!(hub.session_count(), 0);
        // No empty per-user sets are kept around.
        assert!(hub.users.is_empty());
    }

    #[test]
    fn notify_user_without_sessions_delivers_nothing() {
        let hub = hub();
        let (_other, mut rx) = open(&hub, "u2");
        assert_eq!(hub.notify("u1", event("PING")), 0);
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn notify_reaches_every_device_of_user() {
        let hub = hub();
        let (_a, mut ra) = open(&hub, "u1");
        let (_b, mut rb) = open(&hub, "u1");
        let (_c, mut rc) = open(&hub, "u2");

        assert_eq!(hub.notify("u1", event("POST_LIKED")), 2);
        assert_eq!(drain_events(&mut ra), vec!["POST_LIKED"]);
        assert_eq!(drain_events(&mut rb), vec!["POST_LIKED"]);
        assert!(drain_events(&mut rc).is_empty());
    }

    #[test]
    fn broadcast_delivers_once_per_session() {
        let hub = hub();
        let mut receivers: Vec<_> = (0..5).map(|_| open(&hub, "u1")).collect();

        assert_eq!(hub.broadcast(event("NOTICE_CREATED")), 5);
        for (_, rx) in receivers.iter_mut() {
            assert_eq!(drain_events(rx), vec!["NOTICE_CREATED"]);
        }
    }

    #[test]
    fn per_session_delivery_is_fifo() {
        let hub = hub();
        let (_a, mut rx) = open(&hub, "u1");
        hub.notify("u1", event("FIRST"));
        hub.broadcast(event("SECOND"));
        hub.notify("u1", event("THIRD"));
        assert_eq!(drain_events(&mut rx), vec!["FIRST", "SECOND", "THIRD"]);
    }

    #[test]
    fn kick_then_notify_reaches_nobody() {
        let hub = hub();
        let (a, _ra) = open(&hub, "u1");
        let (b, _rb) = open(&hub, "u1");

        assert_eq!(hub.kick("u1"), 2);
        assert_eq!(hub.notify("u1", event("PING")), 0);
        assert!(a.is_closed());
        assert!(b.is_closed());

        // Kicking an absent user is idempotent.
        assert_eq!(hub.kick("u1"), 0);
        // Late unregister from the connection driver is harmless.
        assert!(!hub.unregister(&a));
    }

    #[test]
    fn kick_session_leaves_other_devices() {
        let hub = hub();
        let (a, _ra) = open(&hub, "u1");
        let (_b, mut rb) = open(&hub, "u1");

        assert!(hub.kick_session(&a.session_id));
        assert!(!hub.kick_session(&a.session_id));
        assert_eq!(hub.notify("u1", event("PING")), 1);
        assert_eq!(drain_events(&mut rb), vec!["PING"]);
    }

    #[test]
    fn list_active_snapshots_links() {
        let hub = hub();
        let (a, _ra) = open(&hub, "u1");
        let links = hub.list_active();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].hub, NOTIFICATIONS_HUB);
        assert_eq!(links[0].user_id, "u1");
        assert_eq!(links[0].session_id, a.session_id);
    }

    #[tokio::test]
    async fn drain_force_closes_after_grace() {
        let hub = hub();
        let (a, mut ra) = open(&hub, "u1");
        let (b, _rb) = open(&hub, "u2");

        let started = std::time::Instant::now();
        hub.drain(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(hub.list_active().is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert!(matches!(ra.try_recv().unwrap(), Outbound::Closing(_)));
    }

    #[tokio::test]
    async fn drain_returns_early_when_clients_leave() {
        let hub = Arc::new(hub());
        let (a, _ra) = open(&hub, "u1");

        let leaver = {
            let hub = hub.clone();
            let a = a.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_millis(20)).await;
                a.close(CloseReason::ClientClosed);
                hub.unregister(&a);
            })
        };

        let started = std::time::Instant::now();
        hub.drain(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.close_reason(), Some(CloseReason::ClientClosed));
        leaver.await.unwrap();
    }

    #[tokio::test]
    async fn register_while_draining_closes_session() {
        let hub = hub();
        hub.drain(Duration::from_millis(10)).await;

        let (session, _rx) = Session::new(hub.name(), "u1", 4);
        session.activate();
        assert!(!hub.register(&session));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(hub.session_count(), 0);
    }

    #[derive(Default)]
    struct Recorder {
        disconnected: Mutex<Vec<String>>,
    }

    impl InboundHandler for Recorder {
        fn on_message(&self, _session: &Arc<Session>, _message: ClientMessage) {}

        fn on_disconnect(&self, session: &Arc<Session>) {
            self.disconnected.lock().push(session.session_id.clone());
        }
    }

    #[test]
    fn inbound_handler_sees_disconnects_and_is_held_weakly() {
        let hub = hub();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn InboundHandler> = Arc::downgrade(&recorder) as Weak<dyn InboundHandler>;
        hub.set_inbound_handler(weak);

        let (a, _ra) = open(&hub, "u1");
        hub.unregister(&a);
        assert_eq!(*recorder.disconnected.lock(), vec![a.session_id.clone()]);

        drop(recorder);
        assert!(hub.inbound_handler().is_none());
    }
}
