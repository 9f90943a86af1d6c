pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod routes;

use std::sync::Arc;

use config::Config;
use hub::{SignalingRelay, Supervisor, SupervisorError, CALLS_HUB, NOTIFICATIONS_HUB};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub relay: Arc<SignalingRelay>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Set up the notifications and calls hubs and the relay over the latter.
    pub fn build(config: Config) -> Result<Self, SupervisorError> {
        let supervisor = Arc::new(Supervisor::new());
        let hub_config = config.hub_config();
        supervisor.setup(NOTIFICATIONS_HUB, hub_config.clone())?;
        let calls = supervisor.setup(CALLS_HUB, hub_config)?;
        let relay = SignalingRelay::new(calls, config.invite_timeout);

        Ok(Self {
            supervisor,
            relay,
            config: Arc::new(config),
        })
    }
}
