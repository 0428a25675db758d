use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bitset::IdSet;
use crate::scheduler::job::{JobId, JobStatus};
use crate::scheduler::status::JobStatusTracker;

/// Submitter attributes of a job. Written once, read many times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub client_ip: String,
    pub client_session: String,
    pub client_hit_id: String,
}

/// Eviction order: terminal and error statuses go first, active jobs last.
const EVICTION_TIERS: [&[JobStatus]; 3] = [
    &[
        JobStatus::Confirmed,
        JobStatus::ReadFailed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ],
    &[JobStatus::Done, JobStatus::Reading],
    &[JobStatus::Pending],
];

/// Bounded job id → [`JobInfo`] map.
///
/// Lock order: the cache mutex may be held while taking the status tracker's
/// read lock, never the reverse.
pub struct JobInfoCache {
    entries: Mutex<HashMap<JobId, Arc<JobInfo>>>,
    max_elements: usize,
    // Readers skip the cache while a purge holds the mutex. A stale read of
    // the flag only costs a cache miss or a short wait.
    cleaning: AtomicBool,
    tracker: Arc<JobStatusTracker>,
}

impl JobInfoCache {
    /// `max_elements` of 0 means unbounded.
    pub fn new(max_elements: usize, tracker: Arc<JobStatusTracker>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_elements,
            cleaning: AtomicBool::new(false),
            tracker,
        }
    }

    /// Inserts the entry unless one exists, then purges if over the ceiling.
    pub fn set_job_info(&self, job_id: JobId, info: JobInfo) {
        let over_ceiling = {
            let mut entries = self.entries.lock();
            entries.entry(job_id).or_insert_with(|| Arc::new(info));
            self.max_elements > 0 && entries.len() > self.max_elements
        };
        if over_ceiling {
            self.purge();
        }
    }

    /// `None` when absent or while a purge is running.
    pub fn get_job_info(&self, job_id: JobId) -> Option<Arc<JobInfo>> {
        if self.is_cleaning() {
            return None;
        }
        self.entries.lock().get(&job_id).cloned()
    }

    pub fn remove_job(&self, job_id: JobId) -> bool {
        self.entries.lock().remove(&job_id).is_some()
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts down to 90 % of the ceiling when over it. Within a tier the
    /// lowest (oldest) job ids go first. Returns the number evicted.
    pub fn purge(&self) -> usize {
        if self.max_elements == 0 {
            return 0;
        }
        self.cleaning.store(true, Ordering::Relaxed);
        let removed = {
            let mut entries = self.entries.lock();
            if entries.len() <= self.max_elements {
                0
            } else {
                let target = self.max_elements - self.max_elements / 10;
                let before = entries.len();
                let mut cached: IdSet = entries.keys().copied().collect();

                for tier in EVICTION_TIERS {
                    let to_remove = entries.len().saturating_sub(target);
                    if to_remove == 0 {
                        break;
                    }
                    let mut candidates = self.tracker.get_jobs(tier);
                    candidates.intersect_with(&cached);
                    for job_id in candidates.iter().take(to_remove) {
                        entries.remove(&job_id);
                        cached.remove(job_id);
                    }
                }
                // Running jobs and jobs the tracker no longer knows.
                let to_remove = entries.len().saturating_sub(target);
                for job_id in cached.iter().take(to_remove) {
                    entries.remove(&job_id);
                }
                before - entries.len()
            }
        };
        self.cleaning.store(false, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(removed, ceiling = self.max_elements, "Purged job info cache");
        }
        removed
    }
}
