use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bitset::IdSet;
use crate::scheduler::job::{ClientId, JobId};

/// Opaque reference to a session owned by the registry. Holders re-resolve it
/// on every use; a removed session simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeHandle(pub(crate) u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Identity progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Address known, nothing announced.
    Anonymous,
    /// Control port announced.
    Addressed,
    /// Logical id announced.
    Identified,
}

/// Deadlines owned by the session itself. `None` sorts below any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTimers {
    pub notify_until: Option<DateTime<Utc>>,
    pub live_until: Option<DateTime<Utc>>,
}

impl SessionTimers {
    /// Element-wise maximum.
    pub fn merge(self, other: SessionTimers) -> SessionTimers {
        SessionTimers {
            notify_until: self.notify_until.max(other.notify_until),
            live_until: self.live_until.max(other.live_until),
        }
    }
}

/// One connected worker or reader process.
#[derive(Debug)]
pub struct WorkerNode {
    pub(crate) handle: NodeHandle,
    pub(crate) client_id: ClientId,
    pub(crate) address: IpAddr,
    pub(crate) port: Option<u16>,
    pub(crate) id: Option<String>,
    pub(crate) timers: SessionTimers,
    /// Assigned jobs and their execution deadlines.
    pub(crate) jobs: BTreeMap<JobId, DateTime<Utc>>,
    pub(crate) preferred_affinities: IdSet,
    valid_until: Option<DateTime<Utc>>,
}

impl WorkerNode {
    pub fn new(
        handle: NodeHandle,
        client_id: ClientId,
        address: IpAddr,
        now: DateTime<Utc>,
        live_timeout: chrono::Duration,
    ) -> Self {
        let mut node = Self {
            handle,
            client_id,
            address,
            port: None,
            id: None,
            timers: SessionTimers {
                notify_until: None,
                live_until: Some(now + live_timeout),
            },
            jobs: BTreeMap::new(),
            preferred_affinities: IdSet::new(),
            valid_until: None,
        };
        node.recompute_validity();
        node
    }

    pub fn state(&self) -> SessionState {
        if self.id.is_some() {
            SessionState::Identified
        } else if self.port.is_some() {
            SessionState::Addressed
        } else {
            SessionState::Anonymous
        }
    }

    /// Eligible for a "new job" notification: has a port and its
    /// notification window is still open.
    pub fn should_notify(&self, now: DateTime<Utc>) -> bool {
        self.port.is_some() && self.timers.notify_until.is_some_and(|t| t > now)
    }

    /// Max of the session timers and every assigned job's deadline.
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }

    fn recompute_validity(&mut self) {
        let latest_job = self.jobs.values().max().copied();
        self.valid_until = self
            .timers
            .live_until
            .max(self.timers.notify_until)
            .max(latest_job);
    }

    pub fn touch(&mut self, now: DateTime<Utc>, live_timeout: chrono::Duration) {
        self.timers.live_until = self.timers.live_until.max(Some(now + live_timeout));
        self.recompute_validity();
    }

    pub fn set_notify_until(&mut self, deadline: Option<DateTime<Utc>>) {
        self.timers.notify_until = deadline;
        self.recompute_validity();
    }

    pub fn add_job(&mut self, job_id: JobId, deadline: DateTime<Utc>) {
        self.jobs.insert(job_id, deadline);
        self.recompute_validity();
    }

    /// False if the job is not assigned to this session.
    pub fn update_job(&mut self, job_id: JobId, deadline: DateTime<Utc>) -> bool {
        let Some(current) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        *current = deadline;
        self.recompute_validity();
        true
    }

    pub fn remove_job(&mut self, job_id: JobId) -> bool {
        let removed = self.jobs.remove(&job_id).is_some();
        if removed {
            self.recompute_validity();
        }
        removed
    }

    pub fn has_job(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    /// Releases every assigned job.
    pub fn take_jobs(&mut self) -> Vec<JobId> {
        let jobs = std::mem::take(&mut self.jobs).into_keys().collect();
        self.recompute_validity();
        jobs
    }

    /// Folds a provisional session into this one: jobs are united (later
    /// deadline wins), timers take the element-wise maximum and preferred
    /// affinities are united.
    pub fn absorb(&mut self, other: WorkerNode) {
        for (job_id, deadline) in other.jobs {
            let slot = self.jobs.entry(job_id).or_insert(deadline);
            *slot = (*slot).max(deadline);
        }
        self.timers = self.timers.merge(other.timers);
        self.preferred_affinities
            .union_with(&other.preferred_affinities);
        self.recompute_validity();
    }

    pub fn info(&self) -> WorkerNodeInfo {
        WorkerNodeInfo {
            handle: self.handle,
            client_id: self.client_id,
            id: self.id.clone(),
            address: self.address,
            port: self.port,
            state: self.state(),
            jobs: self.jobs.keys().copied().collect(),
            notify_until: self.timers.notify_until,
            live_until: self.timers.live_until,
            valid_until: self.valid_until,
        }
    }
}

/// Point-in-time view of a session for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerNodeInfo {
    pub handle: NodeHandle,
    pub client_id: ClientId,
    pub id: Option<String>,
    pub address: IpAddr,
    pub port: Option<u16>,
    pub state: SessionState,
    pub jobs: Vec<JobId>,
    pub notify_until: Option<DateTime<Utc>>,
    pub live_until: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}
