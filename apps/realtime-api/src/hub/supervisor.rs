//! Process-wide registry of named hubs: setup, producer entry points, admin
//! introspection, and the one-shot shutdown sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::time;

use super::events::{Event, Target};
use super::registry::{Hub, HubConfig};
use super::session::LinkInfo;

/// Slack on top of the grace period for force-closing stragglers.
const SHUTDOWN_OVERHEAD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("unknown hub {0}")]
    UnknownHub(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Owns every hub for the lifetime of the process. Built once in `main` and
/// handed to producers through `AppState`.
pub struct Supervisor {
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
    healthy: AtomicBool,
    shutdown_started: AtomicBool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Create the named hub, or return the existing one.
    pub fn setup(&self, name: &str, config: HubConfig) -> Result<Arc<Hub>, SupervisorError> {
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(SupervisorError::ShuttingDown);
        }
        let mut hubs = self.hubs.write();
        let hub = hubs
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(hub = %name, "hub started");
                Arc::new(Hub::new(name, config))
            })
            .clone();
        Ok(hub)
    }

    pub fn hub(&self, name: &str) -> Result<Arc<Hub>, SupervisorError> {
        self.hubs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownHub(name.to_string()))
    }

    pub fn hub_names(&self) -> Vec<String> {
        self.hubs.read().keys().cloned().collect()
    }

    /// Queue an event for every session of `user_id` in the named hub.
    pub fn notify(&self, hub: &str, user_id: &str, event: Event) -> Result<usize, SupervisorError> {
        Ok(self.hub(hub)?.notify(user_id, event))
    }

    /// Queue an event for every session in the named hub.
    pub fn broadcast(&self, hub: &str, event: Event) -> Result<usize, SupervisorError> {
        Ok(self.hub(hub)?.broadcast(event))
    }

    /// Route an event by its own target.
    pub fn dispatch(&self, hub: &str, event: Event) -> Result<usize, SupervisorError> {
        let hub = self.hub(hub)?;
        Ok(match event.target.clone() {
            Target::User(user_id) => hub.notify(&user_id, event),
            Target::Broadcast => hub.broadcast(event),
        })
    }

    /// Force-close links matching a user and/or a session, in one hub or in
    /// all of them. Returns how many links were closed.
    pub fn kick(
        &self,
        hub: Option<&str>,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<usize, SupervisorError> {
        let hubs = match hub {
            Some(name) => vec![self.hub(name)?],
            None => self.hubs.read().values().cloned().collect(),
        };

        let mut kicked = 0;
        for hub in hubs {
            if let Some(user_id) = user_id {
                kicked += hub.kick(user_id);
            }
            if let Some(session_id) = session_id {
                kicked += usize::from(hub.kick_session(session_id));
            }
        }
        Ok(kicked)
    }

    /// Every live link across all hubs.
    pub fn list_links(&self) -> Vec<LinkInfo> {
        let hubs: Vec<Arc<Hub>> = self.hubs.read().values().cloned().collect();
        hubs.iter().flat_map(|hub| hub.list_active()).collect()
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Drain every hub concurrently, then release the registry. Only the
    /// first call does anything.
    pub async fn shutdown_all(&self, grace: Duration) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.healthy.store(false, Ordering::Release);

        let hubs: Vec<Arc<Hub>> = self.hubs.read().values().cloned().collect();
        tracing::info!(hubs = hubs.len(), grace_ms = grace.as_millis() as u64, "shutting down hubs");

        let drains = join_all(hubs.iter().map(|hub| hub.drain(grace)));
        if time::timeout(grace + SHUTDOWN_OVERHEAD, drains).await.is_err() {
            tracing::warn!("hub drain overran the grace period");
        }

        self.hubs.write().clear();
        tracing::info!("hubs shut down");
    }
}
