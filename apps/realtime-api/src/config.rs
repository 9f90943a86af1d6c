use std::time::Duration;

use crate::hub::HubConfig;

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secret used to verify the JWT presented on the WebSocket upgrade.
    /// Shared with the REST layer, fixed for the lifetime of the process.
    pub hub_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Capacity of each session's outbound queue.
    pub queue_capacity: usize,
    /// How often the writer pings the client.
    pub heartbeat_interval: Duration,
    /// Inactivity window after which a session is force-closed.
    pub heartbeat_timeout: Duration,
    /// How long a call may stay unanswered.
    pub invite_timeout: Duration,
    /// Grace period given to hubs during shutdown.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            hub_secret: required_var("HUB_SECRET"),
            port: optional_var("PORT").unwrap_or(8000),
            queue_capacity: optional_var("HUB_QUEUE_CAPACITY").unwrap_or(256),
            heartbeat_interval: secs_var("HUB_HEARTBEAT_INTERVAL_SECS", 30),
            heartbeat_timeout: secs_var("HUB_HEARTBEAT_TIMEOUT_SECS", 60),
            invite_timeout: secs_var("CALL_INVITE_TIMEOUT_SECS", 45),
            shutdown_grace: secs_var("SHUTDOWN_GRACE_SECS", 10),
        }
    }

    /// Per-hub settings derived from this config.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn secs_var(name: &str, default: u64) -> Duration {
    Duration::from_secs(optional_var(name).unwrap_or(default))
}
