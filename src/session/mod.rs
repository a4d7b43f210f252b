//! Sessions: key material, reconnects and the outbound queue.

mod config;
mod markers;
mod queue;
mod registry;
#[allow(clippy::module_inception)]
mod session;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use markers::RequestMarkers;
pub use queue::{Completion, OutboundQueue};
pub use registry::ActiveSessions;
pub use session::{InboundMessages, Session};
