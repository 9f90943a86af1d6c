pub mod events;
pub mod registry;
pub mod server;
pub mod session;
pub mod signaling;
pub mod supervisor;

pub use events::{Event, Target};
pub use registry::{Hub, HubConfig, InboundHandler, CALLS_HUB, NOTIFICATIONS_HUB};
pub use session::{LinkInfo, Session};
pub use signaling::{CallPhase, RelayError, SignalingRelay};
pub use supervisor::{Supervisor, SupervisorError};
