//! Connected worker and reader sessions.
//!
//! - [`WorkerNode`]: one session, with its timers, assigned jobs and
//!   preferred affinities
//! - [`WorkerNodeRegistry`]: owns all sessions, indexed by control endpoint
//!   and by logical id
//!
//! # Identity
//!
//! A session starts Anonymous, becomes Addressed once it announces a control
//! port and Identified once it announces a logical id. When a provisional
//! session turns out to belong to an already identified one (same endpoint,
//! same id, or an in-flight job), it is merged into it and callers continue
//! with the surviving [`NodeHandle`].

pub mod registry;
pub mod session;

pub use registry::{ExpiredSession, WorkerNodeRegistry};
pub use session::{NodeHandle, SessionState, WorkerNode, WorkerNodeInfo};
