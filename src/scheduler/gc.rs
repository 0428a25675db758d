use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{AffinityId, GroupId, JobId};

/// Attributes the reclaimer needs without touching persistent storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRecord {
    pub affinity_id: Option<AffinityId>,
    pub group_id: Option<GroupId>,
    pub expires_at: DateTime<Utc>,
}

/// Flat job id → [`GcRecord`] map.
///
/// Every accessor for an unregistered job is a caller bug and returns a
/// fatal-class error.
#[derive(Default)]
pub struct GcRegistry {
    records: Mutex<HashMap<JobId, GcRecord>>,
}

impl GcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_job(
        &self,
        job_id: JobId,
        affinity_id: Option<AffinityId>,
        group_id: Option<GroupId>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(&job_id) {
            tracing::error!(job_id, "Job registered for garbage collection twice");
            return Err(QueueError::JobAlreadyRegistered(job_id));
        }
        records.insert(
            job_id,
            GcRecord {
                affinity_id,
                group_id,
                expires_at,
            },
        );
        Ok(())
    }

    fn with_record<T>(&self, job_id: JobId, f: impl FnOnce(&mut GcRecord) -> T) -> Result<T> {
        let mut records = self.records.lock();
        match records.get_mut(&job_id) {
            Some(record) => Ok(f(record)),
            None => {
                tracing::error!(job_id, "Garbage collection record missing");
                Err(QueueError::JobNotRegistered(job_id))
            }
        }
    }

    /// Moves the expiration time, e.g. when a run extends the job's lifetime.
    pub fn update_lifetime(&self, job_id: JobId, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_record(job_id, |r| r.expires_at = expires_at)
    }

    pub fn update_affinity(&self, job_id: JobId, affinity_id: Option<AffinityId>) -> Result<()> {
        self.with_record(job_id, |r| r.affinity_id = affinity_id)
    }

    pub fn update_group(&self, job_id: JobId, group_id: Option<GroupId>) -> Result<()> {
        self.with_record(job_id, |r| r.group_id = group_id)
    }

    pub fn get_affinity_id(&self, job_id: JobId) -> Result<Option<AffinityId>> {
        self.with_record(job_id, |r| r.affinity_id)
    }

    pub fn get_group_id(&self, job_id: JobId) -> Result<Option<GroupId>> {
        self.with_record(job_id, |r| r.group_id)
    }

    pub fn get_lifetime(&self, job_id: JobId) -> Result<DateTime<Utc>> {
        self.with_record(job_id, |r| r.expires_at)
    }

    /// Removes the record if `now` has reached its expiration time and hands
    /// it back so the caller can cascade into the affinity and group indices.
    pub fn delete_if_timed_out(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<GcRecord>> {
        let mut records = self.records.lock();
        let Some(record) = records.get(&job_id) else {
            tracing::error!(job_id, "Garbage collection record missing");
            return Err(QueueError::JobNotRegistered(job_id));
        };
        if now < record.expires_at {
            return Ok(None);
        }
        Ok(records.remove(&job_id))
    }

    /// Unconditional removal for operator erase. Absent records are tolerated
    /// because the erase may race with the reclaimer.
    pub fn delete_job(&self, job_id: JobId) -> Option<GcRecord> {
        self.records.lock().remove(&job_id)
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.records.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn print(&self, verbose: bool) -> String {
        let records = self.records.lock();
        let mut out = String::new();
        let _ = writeln!(out, "gc records: {}", records.len());
        if verbose {
            let mut ids: Vec<&JobId> = records.keys().collect();
            ids.sort_unstable();
            for id in ids {
                let r = &records[id];
                let _ = writeln!(
                    out,
                    "  job {}: affinity {:?}, group {:?}, expires {}",
                    id,
                    r.affinity_id,
                    r.group_id,
                    r.expires_at.to_rfc3339()
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_register_twice_is_fatal() {
        let gc = GcRegistry::new();
        let now = Utc::now();
        gc.register_job(1, Some(2), None, now).unwrap();
        let err = gc.register_job(1, None, None, now).unwrap_err();
        assert!(matches!(err, QueueError::JobAlreadyRegistered(1)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unregistered_accessors_fail() {
        let gc = GcRegistry::new();
        assert!(gc.get_affinity_id(5).unwrap_err().is_fatal());
        assert!(gc.update_lifetime(5, Utc::now()).is_err());
        assert!(gc.delete_if_timed_out(5, Utc::now()).is_err());
        assert_eq!(gc.delete_job(5), None);
    }

    #[test]
    fn test_expiry_returns_record() {
        let gc = GcRegistry::new();
        let now = Utc::now();
        let expires = now + Duration::seconds(10);
        gc.register_job(1, Some(3), Some(4), expires).unwrap();

        assert_eq!(gc.delete_if_timed_out(1, now).unwrap(), None);
        assert!(gc.is_registered(1));

        let record = gc.delete_if_timed_out(1, expires).unwrap().unwrap();
        assert_eq!(record.affinity_id, Some(3));
        assert_eq!(record.group_id, Some(4));
        assert!(!gc.is_registered(1));
        assert!(gc.is_empty());
    }

    #[test]
    fn test_updates() {
        let gc = GcRegistry::new();
        let now = Utc::now();
        gc.register_job(1, None, None, now).unwrap();

        gc.update_lifetime(1, now + Duration::hours(1)).unwrap();
        gc.update_affinity(1, Some(9)).unwrap();
        gc.update_group(1, Some(2)).unwrap();

        assert_eq!(gc.get_lifetime(1).unwrap(), now + Duration::hours(1));
        assert_eq!(gc.get_affinity_id(1).unwrap(), Some(9));
        assert_eq!(gc.get_group_id(1).unwrap(), Some(2));
        assert_eq!(gc.delete_if_timed_out(1, now).unwrap(), None);
    }
}
