//! Connection generations and the resumption protocol.
//!
//! A session reconnects by creating a new [`Connection`]. The new
//! generation links the predecessor's [`ConnectionContext`] and, after
//! both sides exchanged [`ResumptionInfo`], resends whatever the peer
//! did not acknowledge.

#[allow(clippy::module_inception)]
mod connection;
mod context;
mod resumption;
mod state;

pub use connection::{Connection, StateChange};
pub(crate) use connection::{SessionShared, WeakConnection};
pub use context::{ChunkCache, ConnectionContext, ResumeOutcome};
pub use resumption::{CloseOptions, CloseReason, ResumptionExchange, ResumptionInfo, WireMessage};
pub use state::{ConnectionState, StateCell};
