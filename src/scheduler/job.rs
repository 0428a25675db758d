use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Queue-unique job id, allocated by an external sequence. Never 0.
pub type JobId = u32;
/// Session key used by the affinity registry. Never 0.
pub type ClientId = u32;
/// Interned affinity token. Never 0.
pub type AffinityId = u32;
/// Job group id. Never 0.
pub type GroupId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Canceled,
    Failed,
    Done,
    Reading,
    ReadFailed,
    Confirmed,
    /// Not a member of any status set.
    NotFound,
}

impl JobStatus {
    /// Statuses backed by a status set, in storage order.
    pub const TRACKED: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Canceled,
        JobStatus::Failed,
        JobStatus::Done,
        JobStatus::Reading,
        JobStatus::ReadFailed,
        JobStatus::Confirmed,
    ];

    /// Position of this status' set, `None` for `NotFound`.
    pub const fn index(self) -> Option<usize> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Running => Some(1),
            JobStatus::Canceled => Some(2),
            JobStatus::Failed => Some(3),
            JobStatus::Done => Some(4),
            JobStatus::Reading => Some(5),
            JobStatus::ReadFailed => Some(6),
            JobStatus::Confirmed => Some(7),
            JobStatus::NotFound => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
            JobStatus::Done => "Done",
            JobStatus::Reading => "Reading",
            JobStatus::ReadFailed => "ReadFailed",
            JobStatus::Confirmed => "Confirmed",
            JobStatus::NotFound => "NotFound",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::TRACKED
            .into_iter()
            .chain([JobStatus::NotFound])
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| QueueError::UnknownStatus(s.to_string()))
    }
}

/// What a client does with jobs: executes them (`Get`) or consumes results
/// (`Read`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRole {
    Get,
    Read,
    Undefined,
}

/// One value per concrete client role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSets<T> {
    pub get: T,
    pub read: T,
}

impl<T> RoleSets<T> {
    /// `None` for `ClientRole::Undefined`.
    pub fn for_role(&self, role: ClientRole) -> Option<&T> {
        match role {
            ClientRole::Get => Some(&self.get),
            ClientRole::Read => Some(&self.read),
            ClientRole::Undefined => None,
        }
    }

    pub fn for_role_mut(&mut self, role: ClientRole) -> Option<&mut T> {
        match role {
            ClientRole::Get => Some(&mut self.get),
            ClientRole::Read => Some(&mut self.read),
            ClientRole::Undefined => None,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        [&mut self.get, &mut self.read].into_iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        [&self.get, &self.read].into_iter()
    }
}
