use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::RwLock;

use crate::bitset::IdSet;
use crate::error::{QueueError, Result};
use crate::scheduler::job::{JobId, JobStatus};

/// Outcome of a validated status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Status before the call, or the reported status for a no-op.
    pub prior: JobStatus,
    /// False when the call was accepted as a no-op and nothing moved.
    pub applied: bool,
}

impl StatusChange {
    fn applied(prior: JobStatus) -> Self {
        Self {
            prior,
            applied: true,
        }
    }

    fn noop(reported: JobStatus) -> Self {
        Self {
            prior: reported,
            applied: false,
        }
    }
}

const PENDING: usize = slot(JobStatus::Pending);
const DONE: usize = slot(JobStatus::Done);

const fn slot(status: JobStatus) -> usize {
    match status.index() {
        Some(i) => i,
        None => panic!("NotFound has no status set"),
    }
}

#[derive(Default)]
struct TrackerState {
    sets: [IdSet; 8],
    done_count: u64,
    // Pending/Done mutations since their last compaction
    hot_mutations: u64,
}

impl TrackerState {
    fn set(&self, status: JobStatus) -> Option<&IdSet> {
        status.index().map(|i| &self.sets[i])
    }

    /// Finds the single status set holding `job_id`.
    fn locate(&self, job_id: JobId) -> Result<JobStatus> {
        let mut found = JobStatus::NotFound;
        let mut duplicates = Vec::new();
        for (status, set) in JobStatus::TRACKED.iter().zip(self.sets.iter()) {
            if set.contains(job_id) {
                if found == JobStatus::NotFound {
                    found = *status;
                } else {
                    duplicates.push(*status);
                }
            }
        }
        if duplicates.is_empty() {
            return Ok(found);
        }
        duplicates.insert(0, found);
        tracing::error!(job_id, statuses = ?duplicates, "Job present in several status sets");
        Err(QueueError::InconsistentStatus {
            job_id,
            statuses: duplicates,
        })
    }

    /// The only place a job's membership changes: clear everything the job
    /// may be in, then set the target.
    fn place(&mut self, job_id: JobId, from: JobStatus, to: JobStatus) {
        match from.index() {
            Some(i) => {
                self.sets[i].remove(job_id);
            }
            None => {
                for set in self.sets.iter_mut() {
                    set.remove(job_id);
                }
            }
        }
        if let Some(i) = to.index() {
            self.sets[i].insert(job_id);
        }
        if is_hot(from) || is_hot(to) {
            self.hot_mutations += 1;
        }
    }

    fn union_of(&self, statuses: &[JobStatus]) -> IdSet {
        let mut out = IdSet::new();
        for status in statuses {
            if let Some(set) = self.set(*status) {
                out.union_with(set);
            }
        }
        out
    }
}

fn is_hot(status: JobStatus) -> bool {
    matches!(status, JobStatus::Pending | JobStatus::Done)
}

/// Per-status membership of every job in one queue.
///
/// One read/write lock covers all eight sets so that multi-set queries see a
/// consistent snapshot.
pub struct JobStatusTracker {
    state: RwLock<TrackerState>,
    compaction_threshold: u64,
}

impl Default for JobStatusTracker {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl JobStatusTracker {
    /// `compaction_threshold` of 0 disables automatic compaction.
    pub fn new(compaction_threshold: u64) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            compaction_threshold,
        }
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatus> {
        self.state.read().locate(job_id)
    }

    pub fn is_in(&self, job_id: JobId, status: JobStatus) -> bool {
        self.state
            .read()
            .set(status)
            .is_some_and(|set| set.contains(job_id))
    }

    /// Unconditionally moves the job to `status`; `NotFound` erases it.
    pub fn set_status(&self, job_id: JobId, status: JobStatus) {
        let mut state = self.state.write();
        state.place(job_id, JobStatus::NotFound, status);
        self.maybe_compact(&mut state);
    }

    /// Validated transition. Returns the prior status, or an
    /// `InvalidTransition` error without touching any set.
    pub fn change_status(&self, job_id: JobId, target: JobStatus) -> Result<StatusChange> {
        self.transition(job_id, None, target)
    }

    /// Like [`change_status`](Self::change_status), but only from `expected`.
    /// Any other current status is an `InvalidTransition`, checked under the
    /// same lock as the move.
    pub fn change_status_from(
        &self,
        job_id: JobId,
        expected: JobStatus,
        target: JobStatus,
    ) -> Result<StatusChange> {
        self.transition(job_id, Some(expected), target)
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: Option<JobStatus>,
        target: JobStatus,
    ) -> Result<StatusChange> {
        use JobStatus::*;

        let mut state = self.state.write();
        let prior = state.locate(job_id)?;
        if expected.is_some_and(|expected| expected != prior) {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: prior,
                to: target,
            });
        }

        let outcome = match (target, prior) {
            (Pending, NotFound | Running) => Some(StatusChange::applied(prior)),
            (Running, Pending) => Some(StatusChange::applied(prior)),
            (Canceled, Canceled | NotFound) => return Ok(StatusChange::noop(prior)),
            (Canceled, _) => Some(StatusChange::applied(prior)),
            (Failed, Running) => Some(StatusChange::applied(prior)),
            (Failed, _) => return Ok(StatusChange::noop(Failed)),
            (Done, Running | Pending) => {
                state.done_count += 1;
                Some(StatusChange::applied(prior))
            }
            (Done, Reading) => Some(StatusChange::applied(prior)),
            (Done, _) => return Ok(StatusChange::noop(prior)),
            (Reading, Done) => Some(StatusChange::applied(prior)),
            (ReadFailed, Reading) => Some(StatusChange::applied(prior)),
            (ReadFailed, _) => return Ok(StatusChange::noop(ReadFailed)),
            (Confirmed, Confirmed) => return Ok(StatusChange::noop(Confirmed)),
            (Confirmed, Reading) => Some(StatusChange::applied(prior)),
            _ => None,
        };

        let Some(change) = outcome else {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: prior,
                to: target,
            });
        };
        state.place(job_id, prior, target);
        self.maybe_compact(&mut state);
        Ok(change)
    }

    /// Bulk admission of `from..=to` into Pending, used when reloading.
    pub fn add_pending_batch(&self, from: JobId, to: JobId) {
        if from > to {
            return;
        }
        let mut batch = IdSet::new();
        batch.insert_range(from..=to);

        let mut state = self.state.write();
        for (i, set) in state.sets.iter_mut().enumerate() {
            if i != PENDING {
                set.difference_with(&batch);
            }
        }
        state.sets[PENDING].union_with(&batch);
        state.hot_mutations += u64::from(to - from) + 1;
        self.maybe_compact(&mut state);
    }

    pub fn count_status(&self, status: JobStatus) -> usize {
        self.state.read().set(status).map_or(0, IdSet::len)
    }

    /// Number of jobs per tracked status, taken under one lock.
    pub fn status_snapshot(&self) -> BTreeMap<JobStatus, usize> {
        let state = self.state.read();
        JobStatus::TRACKED
            .iter()
            .zip(state.sets.iter())
            .map(|(status, set)| (*status, set.len()))
            .collect()
    }

    /// Union of the given status sets.
    pub fn get_jobs(&self, statuses: &[JobStatus]) -> IdSet {
        self.state.read().union_of(statuses)
    }

    /// `candidates ∩ Pending`.
    pub fn pending_intersect(&self, candidates: &IdSet) -> IdSet {
        let state = self.state.read();
        let mut out = candidates.clone();
        out.intersect_with(&state.sets[PENDING]);
        out
    }

    /// Every job that is a member of some status set.
    pub fn get_alive_jobs(&self) -> IdSet {
        self.state.read().union_of(&JobStatus::TRACKED)
    }

    /// Lowest candidate that is Pending.
    pub fn get_pending_job_from_set(&self, candidates: &IdSet) -> Option<JobId> {
        let state = self.state.read();
        let pending = &state.sets[PENDING];
        if candidates.len() <= pending.len() {
            candidates.iter().find(|id| pending.contains(*id))
        } else {
            pending.iter().find(|id| candidates.contains(*id))
        }
    }

    /// Lowest job in any of `statuses` that is not in `excluded`.
    pub fn get_job_by_status(&self, statuses: &[JobStatus], excluded: &IdSet) -> Option<JobId> {
        let state = self.state.read();
        statuses
            .iter()
            .filter_map(|status| state.set(*status))
            .filter_map(|set| set.iter().find(|id| !excluded.contains(*id)))
            .min()
    }

    /// Size of `status ∩ jobs`.
    pub fn count_in(&self, status: JobStatus, jobs: &IdSet) -> usize {
        self.state
            .read()
            .set(status)
            .map_or(0, |set| set.intersection_len(jobs))
    }

    pub fn min_job_id(&self) -> Option<JobId> {
        let state = self.state.read();
        state.sets.iter().filter_map(IdSet::first).min()
    }

    pub fn max_job_id(&self) -> Option<JobId> {
        let state = self.state.read();
        state.sets.iter().filter_map(IdSet::last).max()
    }

    /// Jobs moved to Done from Pending or Running since construction.
    pub fn done_count(&self) -> u64 {
        self.state.read().done_count
    }

    /// Rewrites every set into its compact form.
    pub fn compact(&self) {
        let mut state = self.state.write();
        for set in state.sets.iter_mut() {
            set.optimize();
        }
        state.hot_mutations = 0;
    }

    fn maybe_compact(&self, state: &mut TrackerState) {
        if self.compaction_threshold == 0 || state.hot_mutations < self.compaction_threshold {
            return;
        }
        state.sets[PENDING].optimize();
        state.sets[DONE].optimize();
        tracing::debug!(
            mutations = state.hot_mutations,
            "Compacted pending and done sets"
        );
        state.hot_mutations = 0;
    }

    /// Administrative text dump. Not a stable format.
    pub fn print(&self, verbose: bool) -> String {
        let state = self.state.read();
        let mut out = String::new();
        for (status, set) in JobStatus::TRACKED.iter().zip(state.sets.iter()) {
            let _ = writeln!(out, "status {}: {}", status, set.len());
            if verbose && !set.is_empty() {
                let ids: Vec<String> = set.iter().map(|id| id.to_string()).collect();
                let _ = writeln!(out, "  {}", ids.join(" "));
            }
        }
        let _ = writeln!(out, "done count: {}", state.done_count);
        out
    }
}
