use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bitset::IdSet;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::affinity::check_token;
use crate::scheduler::{
    AffinityId, AffinityRegistry, AffinityStatistics, ClientId, ClientRole, GcRegistry, GroupId,
    JobId, JobInfo, JobInfoCache, JobStatus, JobStatusTracker, StatusChange,
};
use crate::worker::{NodeHandle, WorkerNodeInfo, WorkerNodeRegistry};

/// Attributes supplied with a new job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub affinity: Option<String>,
    pub group: Option<GroupId>,
    pub info: JobInfo,
}

/// Parameters of a get-job request.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    /// Fall back to any pending job when no preferred affinity has one.
    pub any_affinity: bool,
    /// Jobs the client must not be offered.
    pub exclude: IdSet,
    /// When nothing is found, keep the session in the notification list for
    /// this long.
    pub wait: Option<chrono::Duration>,
}

/// A job handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub job_id: JobId,
    pub affinity_id: Option<AffinityId>,
    pub deadline: DateTime<Utc>,
}

/// Totals of one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub scanned_jobs: usize,
    pub expired_jobs: usize,
    pub collected_affinities: usize,
    pub expired_sessions: usize,
    pub requeued_jobs: usize,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.expired_jobs == 0
            && self.collected_affinities == 0
            && self.expired_sessions == 0
            && self.requeued_jobs == 0
    }
}

/// One queue's scheduling core.
///
/// This is the only place that calls across components. Cascades always take
/// the GC registry before the affinity registry, and only ever read from the
/// status tracker while another component's lock is held.
pub struct Queue {
    config: QueueConfig,
    tracker: Arc<JobStatusTracker>,
    affinities: AffinityRegistry,
    gc: GcRegistry,
    cache: JobInfoCache,
    workers: WorkerNodeRegistry,
    // Last job id visited by the incremental reclaim scan.
    reclaim_cursor: parking_lot::Mutex<JobId>,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Self {
        let tracker = Arc::new(JobStatusTracker::new(config.compaction_threshold));
        let cache = JobInfoCache::new(config.job_info_cache_size, tracker.clone());
        tracing::info!(queue = %config.name, "Queue created");
        Self {
            config,
            tracker,
            affinities: AffinityRegistry::new(),
            gc: GcRegistry::new(),
            cache,
            workers: WorkerNodeRegistry::new(),
            reclaim_cursor: parking_lot::Mutex::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn tracker(&self) -> &JobStatusTracker {
        &self.tracker
    }

    pub fn affinities(&self) -> &AffinityRegistry {
        &self.affinities
    }

    pub fn gc(&self) -> &GcRegistry {
        &self.gc
    }

    pub fn cache(&self) -> &JobInfoCache {
        &self.cache
    }

    pub fn workers(&self) -> &WorkerNodeRegistry {
        &self.workers
    }

    // ---- jobs -------------------------------------------------------------

    /// Admits a new job as Pending. Returns the worker clients waiting on its
    /// affinity so the caller can wake them.
    pub fn submit_job(&self, job_id: JobId, job: NewJob, now: DateTime<Utc>) -> Result<Vec<ClientId>> {
        if let Some(token) = job.affinity.as_deref() {
            check_token(token)?;
        }
        self.tracker
            .change_status_from(job_id, JobStatus::NotFound, JobStatus::Pending)?;

        let affinity_id = job.affinity.as_deref().map(|token| {
            self.affinities
                .resolve_affinity_token(token, Some(job_id), None, ClientRole::Get)
        });

        if let Err(e) = self
            .gc
            .register_job(job_id, affinity_id, job.group, now + self.config.job_lifetime())
        {
            self.tracker.set_status(job_id, JobStatus::NotFound);
            if let Some(id) = affinity_id {
                self.affinities.remove_job_from_affinity(id, job_id);
            }
            return Err(e);
        }
        self.cache.set_job_info(job_id, job.info);

        let waiting = affinity_id
            .map(|id| self.affinities.get_wait_clients(id, ClientRole::Get))
            .unwrap_or_default();
        tracing::debug!(job_id, ?affinity_id, waiting = waiting.len(), "Job submitted");
        Ok(waiting.iter().collect())
    }

    /// Bulk reload of `from..=to` as Pending jobs without affinity or group.
    pub fn load_pending_range(&self, from: JobId, to: JobId, now: DateTime<Utc>) -> Result<()> {
        if from > to {
            return Ok(());
        }
        self.tracker.add_pending_batch(from, to);
        let expires_at = now + self.config.job_lifetime();
        for job_id in from..=to {
            self.gc.register_job(job_id, None, None, expires_at)?;
        }
        tracing::info!(from, to, "Loaded pending jobs");
        Ok(())
    }

    /// Attaches a reloaded job to an affinity. Used while replaying storage,
    /// between [`Queue::load_affinities`] and [`Queue::finalize_load`].
    pub fn restore_job_affinity(&self, job_id: JobId, affinity_id: AffinityId) -> Result<bool> {
        self.gc.update_affinity(job_id, Some(affinity_id))?;
        Ok(self.affinities.add_job_to_affinity(affinity_id, job_id))
    }

    pub fn job_info(&self, job_id: JobId) -> Option<Arc<JobInfo>> {
        self.cache.get_job_info(job_id)
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        self.tracker.get_status(job_id)
    }

    /// Picks a pending job for the session: preferred affinities first, then
    /// any pending job if allowed. Without a match the session is recorded as
    /// waiting on its preferred affinities.
    pub fn dispatch(
        &self,
        handle: NodeHandle,
        request: DispatchRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let Some(client_id) = self.workers.client_id(handle) else {
            return Ok(None);
        };
        let preferred = self.workers.get_preferred_affinities(handle);
        let mut exclude = request.exclude;

        loop {
            let (job_id, prior) = loop {
                let mut candidates = self.affinities.get_jobs_with_affinities(&preferred);
                candidates.difference_with(&exclude);
                let picked = self.tracker.get_pending_job_from_set(&candidates).or_else(|| {
                    request
                        .any_affinity
                        .then(|| self.tracker.get_job_by_status(&[JobStatus::Pending], &exclude))
                        .flatten()
                });

                let Some(job_id) = picked else {
                    self.affinities
                        .set_wait_client_for_affinities(client_id, &preferred, ClientRole::Get);
                    if let Some(wait) = request.wait {
                        self.workers.set_notify_deadline(handle, Some(now + wait));
                    }
                    return Ok(None);
                };

                match self.tracker.change_status(job_id, JobStatus::Running) {
                    Ok(change) => break (job_id, change.prior),
                    // Taken by a concurrent dispatch between the pick and the move.
                    Err(QueueError::InvalidTransition { .. }) => {
                        exclude.insert(job_id);
                    }
                    Err(e) => return Err(e),
                }
            };

            let deadline = now + self.config.run_timeout();
            if !self.workers.add_job(handle, job_id, deadline) {
                // Session disconnected meanwhile.
                self.tracker.set_status(job_id, prior);
                return Ok(None);
            }

            let affinity_id = match self.extend_lifetime(job_id, deadline) {
                Ok(affinity_id) => affinity_id,
                // Erased or expired after the move to Running.
                Err(QueueError::JobNotRegistered(_)) => {
                    self.workers.remove_job(job_id);
                    if self.tracker.is_in(job_id, JobStatus::Running) {
                        self.tracker.set_status(job_id, JobStatus::NotFound);
                    }
                    tracing::debug!(job_id, %handle, "Dispatched job vanished");
                    exclude.insert(job_id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.affinities
                .remove_wait_client_from_affinities(client_id, &preferred, ClientRole::Get);

            tracing::debug!(job_id, %handle, ?affinity_id, "Job dispatched");
            return Ok(Some(Assignment {
                job_id,
                affinity_id,
                deadline,
            }));
        }
    }

    /// Keeps the job alive at least until `deadline`. Returns its affinity.
    fn extend_lifetime(&self, job_id: JobId, deadline: DateTime<Utc>) -> Result<Option<AffinityId>> {
        let expires_at = self.gc.get_lifetime(job_id)?.max(deadline);
        self.gc.update_lifetime(job_id, expires_at)?;
        self.gc.get_affinity_id(job_id)
    }

    /// Running or Pending → Done. Returns the reader clients waiting on the
    /// job's affinity alongside the change.
    pub fn complete_job(&self, job_id: JobId) -> Result<(StatusChange, Vec<ClientId>)> {
        let change = self.tracker.change_status(job_id, JobStatus::Done)?;
        if !change.applied {
            return Ok((change, Vec::new()));
        }
        self.workers.remove_job(job_id);
        let readers = match self.gc.get_affinity_id(job_id) {
            Ok(Some(id)) => self.affinities.get_wait_clients(id, ClientRole::Read).iter().collect(),
            _ => Vec::new(),
        };
        Ok((change, readers))
    }

    /// Running → Failed. Reported as a quiet no-op from any other status.
    pub fn fail_job(&self, job_id: JobId) -> Result<StatusChange> {
        let change = self.tracker.change_status(job_id, JobStatus::Failed)?;
        if change.applied {
            self.workers.remove_job(job_id);
        }
        Ok(change)
    }

    /// Running → Pending, e.g. when a worker gives a job back. Any other
    /// status, including an unknown job, is an `InvalidTransition`.
    pub fn return_job(&self, job_id: JobId) -> Result<StatusChange> {
        let change = self
            .tracker
            .change_status_from(job_id, JobStatus::Running, JobStatus::Pending)?;
        self.workers.remove_job(job_id);
        Ok(change)
    }

    pub fn cancel_job(&self, job_id: JobId) -> Result<StatusChange> {
        let change = self.tracker.change_status(job_id, JobStatus::Canceled)?;
        if change.applied {
            self.workers.remove_job(job_id);
        }
        Ok(change)
    }

    /// Done → Reading on behalf of a reader session.
    pub fn start_reading(&self, handle: NodeHandle, job_id: JobId, now: DateTime<Utc>) -> Result<StatusChange> {
        let change = self.tracker.change_status(job_id, JobStatus::Reading)?;
        if !self.workers.add_job(handle, job_id, now + self.config.run_timeout()) {
            self.tracker.set_status(job_id, change.prior);
            return Err(QueueError::InvalidTransition {
                job_id,
                from: change.prior,
                to: JobStatus::Reading,
            });
        }
        Ok(change)
    }

    pub fn confirm_read(&self, job_id: JobId) -> Result<StatusChange> {
        let change = self.tracker.change_status(job_id, JobStatus::Confirmed)?;
        if change.applied {
            self.workers.remove_job(job_id);
        }
        Ok(change)
    }

    pub fn fail_read(&self, job_id: JobId) -> Result<StatusChange> {
        let change = self.tracker.change_status(job_id, JobStatus::ReadFailed)?;
        if change.applied {
            self.workers.remove_job(job_id);
        }
        Ok(change)
    }

    /// Operator erase. Returns the status the job had.
    pub fn erase_job(&self, job_id: JobId) -> Result<JobStatus> {
        let status = self.tracker.get_status(job_id)?;
        self.drop_job(job_id);
        tracing::info!(job_id, %status, "Job erased");
        Ok(status)
    }

    fn drop_job(&self, job_id: JobId) {
        self.tracker.set_status(job_id, JobStatus::NotFound);
        if let Some(record) = self.gc.delete_job(job_id) {
            if let Some(affinity_id) = record.affinity_id {
                self.affinities.remove_job_from_affinity(affinity_id, job_id);
            }
        }
        self.cache.remove_job(job_id);
        self.workers.remove_job(job_id);
    }

    /// Puts a job released by a vanished session back where it can be
    /// picked up again. Returns true if it moved.
    fn requeue_released(&self, job_id: JobId) -> Result<bool> {
        let (from, target) = match self.tracker.get_status(job_id)? {
            JobStatus::Running => (JobStatus::Running, JobStatus::Pending),
            JobStatus::Reading => (JobStatus::Reading, JobStatus::Done),
            _ => return Ok(false),
        };
        match self.tracker.change_status_from(job_id, from, target) {
            Ok(change) => Ok(change.applied),
            // Moved on since the lookup.
            Err(QueueError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ---- sessions ---------------------------------------------------------

    pub fn register_worker(&self, address: IpAddr, now: DateTime<Utc>) -> NodeHandle {
        self.workers
            .register_node(address, now, self.config.live_timeout())
    }

    pub fn heartbeat(&self, handle: NodeHandle, now: DateTime<Utc>) -> bool {
        self.workers.touch(handle, now, self.config.live_timeout())
    }

    /// Announces the session's control port, redirecting to an identified
    /// session already registered there. Returns the handle to use from now
    /// on.
    pub fn announce_port(&self, handle: NodeHandle, port: u16) -> Option<NodeHandle> {
        let client_id = self.workers.client_id(handle);
        let holder = self
            .workers
            .node_info(handle)
            .and_then(|info| self.workers.find_by_address(info.address, port))
            .filter(|holder| *holder != handle);
        let holder_client = holder.and_then(|h| self.workers.client_id(h));

        let survivor = match self.workers.identify_worker_node_by_address(handle, port) {
            Some(survivor) => survivor,
            None => self.workers.set_port(handle, port)?,
        };
        self.follow_merge(handle, client_id, survivor);
        // An identified caller absorbs a provisional holder of the port.
        if let Some(holder) = holder.filter(|h| *h != survivor) {
            if self.workers.client_id(holder).is_none() {
                self.follow_merge(holder, holder_client, survivor);
            }
        }
        Some(survivor)
    }

    /// Announces the logical id. Returns the handle to use from now on.
    pub fn announce_id(&self, handle: NodeHandle, id: &str) -> Option<NodeHandle> {
        let client_id = self.workers.client_id(handle);
        let survivor = self.workers.set_id(handle, id)?;
        self.follow_merge(handle, client_id, survivor);
        Some(survivor)
    }

    /// Recognises a provisional session by a job it reports as in flight.
    pub fn identify_by_job(&self, handle: NodeHandle, job_id: JobId) -> Option<NodeHandle> {
        let client_id = self.workers.client_id(handle);
        let survivor = self.workers.identify_worker_node_by_job_id(handle, job_id)?;
        self.follow_merge(handle, client_id, survivor);
        Some(survivor)
    }

    /// Moves the affinity references of a merged-away session to the survivor.
    fn follow_merge(&self, from: NodeHandle, from_client: Option<ClientId>, survivor: NodeHandle) {
        if from == survivor {
            return;
        }
        if let Some(client_id) = from_client {
            self.affinities.remove_client(client_id);
        }
        if let Some(client_id) = self.workers.client_id(survivor) {
            let preferred = self.workers.get_preferred_affinities(survivor);
            self.affinities
                .add_client_to_affinities(client_id, &preferred, ClientRole::Get);
        }
    }

    /// Replaces the session's preferred affinities by token.
    pub fn set_preferred_affinities(&self, handle: NodeHandle, tokens: &[&str]) -> Option<IdSet> {
        let client_id = self.workers.client_id(handle)?;
        let preferred: IdSet = tokens
            .iter()
            .filter(|token| match check_token(token) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(%handle, error = %e, "Ignoring preferred affinity");
                    false
                }
            })
            .map(|token| {
                self.affinities
                    .resolve_affinity_token(token, None, Some(client_id), ClientRole::Get)
            })
            .collect();
        let previous = self
            .workers
            .set_preferred_affinities(handle, preferred.clone())?;
        let dropped = &previous - &preferred;
        self.affinities
            .remove_client_from_affinities(client_id, &dropped, ClientRole::Get);
        self.affinities
            .remove_wait_client_from_affinities(client_id, &dropped, ClientRole::Get);
        Some(preferred)
    }

    /// Session went away: its running jobs go back to Pending, its reads back
    /// to Done. Returns the jobs that moved.
    pub fn disconnect(&self, handle: NodeHandle) -> Result<Vec<JobId>> {
        let client_id = self.workers.client_id(handle);
        let released = self.workers.unregister_node(handle);
        if let Some(client_id) = client_id {
            self.affinities.remove_client(client_id);
        }
        let mut requeued = Vec::new();
        for job_id in released {
            if self.requeue_released(job_id)? {
                requeued.push(job_id);
            }
        }
        tracing::info!(%handle, requeued = requeued.len(), "Worker session disconnected");
        Ok(requeued)
    }

    pub fn notify_list(&self, unconditional: bool, now: DateTime<Utc>) -> Vec<SocketAddr> {
        self.workers
            .get_notify_list(unconditional, now, self.config.notify_timeout())
    }

    pub fn nodes_info(&self, now: DateTime<Utc>) -> Vec<WorkerNodeInfo> {
        self.workers.get_nodes_info(now)
    }

    pub fn affinity_statistics(&self) -> Vec<AffinityStatistics> {
        self.affinities.get_affinity_statistics(&self.tracker)
    }

    // ---- reclamation ------------------------------------------------------

    /// One reclamation pass. Visits up to `reclaim_batch` tracked jobs after
    /// the previous pass' cursor, erasing the expired ones, then collects
    /// unreferenced affinities and expired sessions.
    pub fn reclaim(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();

        let batch = self.next_reclaim_batch();
        report.scanned_jobs = batch.len();
        for job_id in batch {
            let record = match self.gc.delete_if_timed_out(job_id, now) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                // Erased since the batch was taken.
                Err(QueueError::JobNotRegistered(_))
                    if self.tracker.get_status(job_id)? == JobStatus::NotFound =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };
            self.tracker.set_status(job_id, JobStatus::NotFound);
            if let Some(affinity_id) = record.affinity_id {
                self.affinities.remove_job_from_affinity(affinity_id, job_id);
            }
            self.cache.remove_job(job_id);
            self.workers.remove_job(job_id);
            report.expired_jobs += 1;
        }

        report.collected_affinities = self.affinities.collect_garbage(self.config.affinity_gc_batch);

        for session in self.workers.collect_expired(now) {
            self.affinities.remove_client(session.client_id);
            for job_id in session.jobs {
                if self.requeue_released(job_id)? {
                    report.requeued_jobs += 1;
                }
            }
            report.expired_sessions += 1;
        }

        if report.is_empty() {
            tracing::trace!(scanned = report.scanned_jobs, "Reclaim pass found nothing");
        } else {
            tracing::info!(
                expired_jobs = report.expired_jobs,
                collected_affinities = report.collected_affinities,
                expired_sessions = report.expired_sessions,
                requeued_jobs = report.requeued_jobs,
                "Reclaim pass"
            );
        }
        Ok(report)
    }

    fn next_reclaim_batch(&self) -> Vec<JobId> {
        let alive = self.tracker.get_alive_jobs();
        let mut cursor = self.reclaim_cursor.lock();
        let limit = self.config.reclaim_batch.max(1);

        let mut batch: Vec<JobId> = alive.iter().filter(|id| *id > *cursor).take(limit).collect();
        if batch.len() < limit {
            // wrap around to the start
            let start = *cursor;
            batch.extend(
                alive
                    .iter()
                    .take_while(|id| *id <= start)
                    .take(limit - batch.len()),
            );
        }
        *cursor = match batch.last() {
            Some(&last) if batch.len() == limit => last,
            _ => 0,
        };
        batch
    }

    // ---- persistence ------------------------------------------------------

    /// Writes affinities that still have jobs. Returns the record count.
    pub fn dump_affinities<W: Write>(&self, writer: &mut W) -> Result<usize> {
        self.affinities.dump(writer)
    }

    /// Replaces the dictionary file at `path` once the dump has succeeded.
    /// A file that supplied `loaded` entries is left untouched when no job
    /// claimed any of them, and `None` is returned.
    pub fn save_affinities(&self, path: &Path, loaded: usize) -> Result<Option<usize>> {
        let mut buf = Vec::new();
        let written = self.dump_affinities(&mut buf)?;
        if written == 0 && loaded > 0 {
            return Ok(None);
        }
        std::fs::write(path, &buf)?;
        Ok(Some(written))
    }

    pub fn load_affinities<R: Read>(&self, reader: &mut R) -> Result<usize> {
        self.affinities.load_from_dump(reader)
    }

    /// Ends a reload: drops dictionary entries no job claimed. Returns the
    /// number dropped.
    pub fn finalize_load(&self) -> usize {
        self.affinities.finalize_affinity_dictionary_loading()
    }

    /// Administrative text dump of every component.
    pub fn print(&self, verbose: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "queue {}", self.config.name);
        out.push_str(&self.tracker.print(verbose));
        out.push_str(&self.affinities.print(verbose));
        out.push_str(&self.gc.print(verbose));
        let _ = writeln!(out, "job info cache: {}", self.cache.len());
        out.push_str(&self.workers.print(verbose));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queue() -> Queue {
        Queue::new(QueueConfig::new("test").with_job_lifetime_secs(100).with_run_timeout_secs(10))
    }

    fn job(affinity: &str) -> NewJob {
        NewJob {
            affinity: Some(affinity.to_string()),
            ..NewJob::default()
        }
    }

    #[test]
    fn test_submit_twice_is_rejected() {
        let q = queue();
        let now = Utc::now();
        q.submit_job(1, NewJob::default(), now).unwrap();
        let err = q.submit_job(1, NewJob::default(), now).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: JobStatus::Pending, .. }));
        assert_eq!(q.gc().len(), 1);
    }

    #[test]
    fn test_dispatch_prefers_affinity() {
        let q = queue();
        let now = Utc::now();
        q.submit_job(1, job("a"), now).unwrap();
        q.submit_job(2, job("b"), now).unwrap();

        let h = q.register_worker("10.0.0.1".parse().unwrap(), now);
        q.set_preferred_affinities(h, &["b"]).unwrap();

        let assigned = q.dispatch(h, DispatchRequest::default(), now).unwrap().unwrap();
        assert_eq!(assigned.job_id, 2);
        assert_eq!(assigned.deadline, now + Duration::seconds(10));
        assert_eq!(q.job_status(2).unwrap(), JobStatus::Running);

        // nothing else under "b", no fallback requested
        assert!(q.dispatch(h, DispatchRequest::default(), now).unwrap().is_none());

        let any = DispatchRequest {
            any_affinity: true,
            ..DispatchRequest::default()
        };
        assert_eq!(q.dispatch(h, any, now).unwrap().unwrap().job_id, 1);
    }

    #[test]
    fn test_waiting_client_is_reported_on_submit() {
        let q = queue();
        let now = Utc::now();
        let h = q.register_worker("10.0.0.1".parse().unwrap(), now);
        q.set_preferred_affinities(h, &["chr1"]).unwrap();
        assert!(q.dispatch(h, DispatchRequest::default(), now).unwrap().is_none());

        let client = q.workers().client_id(h).unwrap();
        assert_eq!(q.submit_job(5, job("chr1"), now).unwrap(), vec![client]);

        q.dispatch(h, DispatchRequest::default(), now).unwrap().unwrap();
        assert!(q.submit_job(6, job("chr1"), now).unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_requeues_running() {
        let q = queue();
        let now = Utc::now();
        q.load_pending_range(1, 3, now).unwrap();
        let h = q.register_worker("10.0.0.1".parse().unwrap(), now);
        let any = DispatchRequest {
            any_affinity: true,
            ..DispatchRequest::default()
        };
        let first = q.dispatch(h, any.clone(), now).unwrap().unwrap().job_id;
        assert_eq!(first, 1);
        q.dispatch(h, any, now).unwrap().unwrap();
        q.complete_job(2).unwrap();

        assert_eq!(q.disconnect(h).unwrap(), vec![1]);
        assert_eq!(q.job_status(1).unwrap(), JobStatus::Pending);
        assert_eq!(q.job_status(2).unwrap(), JobStatus::Done);
        assert!(q.workers().is_empty());
    }

    #[test]
    fn test_erase_cascades() {
        let q = queue();
        let now = Utc::now();
        q.submit_job(9, job("x"), now).unwrap();
        let aff = q.affinities().get_id_by_token("x").unwrap();

        assert_eq!(q.erase_job(9).unwrap(), JobStatus::Pending);
        assert_eq!(q.job_status(9).unwrap(), JobStatus::NotFound);
        assert!(!q.gc().is_registered(9));
        assert!(q.job_info(9).is_none());
        assert!(q.affinities().get_jobs_with_affinity(aff).is_empty());
        assert!(q.affinities().removal_candidates().contains(aff));
    }

    #[test]
    fn test_reclaim_batches_wrap_around() {
        let q = Queue::new(QueueConfig {
            reclaim_batch: 2,
            ..QueueConfig::new("test")
        });
        let now = Utc::now();
        q.load_pending_range(1, 5, now).unwrap();
        assert_eq!(q.next_reclaim_batch(), vec![1, 2]);
        assert_eq!(q.next_reclaim_batch(), vec![3, 4]);
        assert_eq!(q.next_reclaim_batch(), vec![5, 1]);
        assert_eq!(q.next_reclaim_batch(), vec![2, 3]);
    }
}
