//! In-memory scheduling state.
//!
//! - [`JobStatusTracker`]: one [`IdSet`](crate::bitset::IdSet) per status,
//!   validated transitions
//! - [`AffinityRegistry`]: interned affinity tokens with their jobs and clients
//! - [`GcRegistry`]: per-job affinity, group and expiration
//! - [`JobInfoCache`]: bounded submitter info, evicted by status priority

pub mod affinity;
pub mod cache;
pub mod gc;
pub mod job;
pub mod status;

pub use affinity::{AffinityRegistry, AffinityStatistics};
pub use cache::{JobInfo, JobInfoCache};
pub use gc::{GcRecord, GcRegistry};
pub use job::{AffinityId, ClientId, ClientRole, GroupId, JobId, JobStatus};
pub use status::{JobStatusTracker, StatusChange};
