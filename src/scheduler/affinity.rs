use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::{ErrorKind, Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use serde::Serialize;

use crate::bitset::IdSet;
use crate::error::{QueueError, Result};
use crate::scheduler::job::{AffinityId, ClientId, ClientRole, JobId, JobStatus, RoleSets};
use crate::scheduler::status::JobStatusTracker;

/// Longest affinity token that can be admitted and written to a dump. Dump
/// records with a longer token are treated as corruption.
pub const MAX_TOKEN_LEN: usize = 1 << 20;

/// Rejects tokens that could not be reloaded from a dump.
pub fn check_token(token: &str) -> Result<()> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(QueueError::AffinityTokenTooLong {
            len: token.len(),
            max: MAX_TOKEN_LEN,
        });
    }
    Ok(())
}

/// Clients of one role attached to an affinity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSets {
    /// Clients that asked to be offered jobs with this affinity.
    pub preferred: IdSet,
    /// Clients blocked until a job with this affinity shows up.
    pub waiting: IdSet,
}

impl ClientSets {
    fn is_empty(&self) -> bool {
        self.preferred.is_empty() && self.waiting.is_empty()
    }
}

struct AffinityRecord {
    token: String,
    jobs: IdSet,
    clients: RoleSets<ClientSets>,
}

impl AffinityRecord {
    fn new(token: String) -> Self {
        Self {
            token,
            jobs: IdSet::new(),
            clients: RoleSets::default(),
        }
    }

    fn can_be_deleted(&self) -> bool {
        self.jobs.is_empty() && self.clients.iter().all(ClientSets::is_empty)
    }
}

/// Per-affinity summary for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffinityStatistics {
    pub id: AffinityId,
    pub token: String,
    pub jobs: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub get_clients: usize,
    pub read_clients: usize,
    pub waiting_get_clients: usize,
    pub waiting_read_clients: usize,
}

#[derive(Default)]
struct RegistryState {
    by_token: HashMap<String, AffinityId>,
    records: HashMap<AffinityId, AffinityRecord>,
    removal_candidates: IdSet,
    last_id: AffinityId,
}

impl RegistryState {
    fn allocate_id(&mut self) -> AffinityId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.records.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Returns the id and whether it was created by this call.
    fn resolve(&mut self, token: &str) -> (AffinityId, bool) {
        if let Some(id) = self.by_token.get(token) {
            return (*id, false);
        }
        let id = self.allocate_id();
        self.by_token.insert(token.to_string(), id);
        self.records.insert(id, AffinityRecord::new(token.to_string()));
        (id, true)
    }

    fn mark_if_unreferenced(&mut self, id: AffinityId) {
        if self.records.get(&id).is_some_and(AffinityRecord::can_be_deleted) {
            self.removal_candidates.insert(id);
        }
    }

    fn client_sets(&mut self, id: AffinityId, role: ClientRole) -> Option<&mut ClientSets> {
        self.records.get_mut(&id)?.clients.for_role_mut(role)
    }

    fn delete(&mut self, id: AffinityId) {
        if let Some(record) = self.records.remove(&id) {
            self.by_token.remove(&record.token);
        }
    }
}

/// Interns affinity tokens and tracks the jobs and client sessions that
/// reference each one.
///
/// A single mutex covers both directions of the token mapping, every
/// per-affinity set and the removal-candidate set, so an affinity can never be
/// emptied without also being marked collectible.
#[derive(Default)]
pub struct AffinityRegistry {
    state: Mutex<RegistryState>,
}

impl AffinityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up or creates the id for `token`, then attaches the job and/or
    /// client when given.
    pub fn resolve_affinity_token(
        &self,
        token: &str,
        job_id: Option<JobId>,
        client_id: Option<ClientId>,
        role: ClientRole,
    ) -> AffinityId {
        let mut state = self.state.lock();
        let (id, created) = state.resolve(token);
        let mut referenced = false;

        if let Some(record) = state.records.get_mut(&id) {
            if let Some(job_id) = job_id {
                record.jobs.insert(job_id);
                referenced = true;
            }
            if let Some(client_id) = client_id {
                if let Some(sets) = record.clients.for_role_mut(role) {
                    sets.preferred.insert(client_id);
                    referenced = true;
                }
            }
        }

        if referenced {
            state.removal_candidates.remove(id);
        } else if created {
            state.removal_candidates.insert(id);
        }
        id
    }

    /// Creates the id if absent without attaching anything. The new affinity
    /// stays collectible until a job or client references it.
    pub fn resolve_affinity(&self, token: &str) -> AffinityId {
        self.resolve_affinity_token(token, None, None, ClientRole::Undefined)
    }

    pub fn get_id_by_token(&self, token: &str) -> Option<AffinityId> {
        self.state.lock().by_token.get(token).copied()
    }

    pub fn get_token_by_id(&self, id: AffinityId) -> Option<String> {
        self.state.lock().records.get(&id).map(|r| r.token.clone())
    }

    /// False if the affinity does not exist.
    pub fn add_job_to_affinity(&self, id: AffinityId, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&id) else {
            tracing::debug!(affinity_id = id, job_id, "Job added to unknown affinity");
            return false;
        };
        record.jobs.insert(job_id);
        state.removal_candidates.remove(id);
        true
    }

    pub fn remove_job_from_affinity(&self, id: AffinityId, job_id: JobId) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(&id) {
            record.jobs.remove(job_id);
            state.mark_if_unreferenced(id);
        }
    }

    pub fn add_client_to_affinity(&self, client_id: ClientId, id: AffinityId, role: ClientRole) {
        let mut state = self.state.lock();
        if let Some(sets) = state.client_sets(id, role) {
            sets.preferred.insert(client_id);
            state.removal_candidates.remove(id);
        }
    }

    pub fn add_client_to_affinities(&self, client_id: ClientId, ids: &IdSet, role: ClientRole) {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(sets) = state.client_sets(id, role) {
                sets.preferred.insert(client_id);
                state.removal_candidates.remove(id);
            }
        }
    }

    pub fn remove_client_from_affinities(
        &self,
        client_id: ClientId,
        ids: &IdSet,
        role: ClientRole,
    ) {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(sets) = state.client_sets(id, role) {
                sets.preferred.remove(client_id);
                state.mark_if_unreferenced(id);
            }
        }
    }

    /// Marks the client as waiting for jobs with any of `ids`.
    pub fn set_wait_client_for_affinities(
        &self,
        client_id: ClientId,
        ids: &IdSet,
        role: ClientRole,
    ) {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(sets) = state.client_sets(id, role) {
                sets.waiting.insert(client_id);
                state.removal_candidates.remove(id);
            }
        }
    }

    pub fn remove_wait_client_from_affinities(
        &self,
        client_id: ClientId,
        ids: &IdSet,
        role: ClientRole,
    ) {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(sets) = state.client_sets(id, role) {
                sets.waiting.remove(client_id);
                state.mark_if_unreferenced(id);
            }
        }
    }

    /// Drops the client from every set of every affinity, e.g. on disconnect.
    pub fn remove_client(&self, client_id: ClientId) {
        let mut state = self.state.lock();
        let mut emptied = Vec::new();
        for (id, record) in state.records.iter_mut() {
            let mut touched = false;
            for sets in record.clients.iter_mut() {
                touched |= sets.preferred.remove(client_id);
                touched |= sets.waiting.remove(client_id);
            }
            if touched && record.can_be_deleted() {
                emptied.push(*id);
            }
        }
        for id in emptied {
            state.removal_candidates.insert(id);
        }
    }

    pub fn get_wait_clients(&self, id: AffinityId, role: ClientRole) -> IdSet {
        let state = self.state.lock();
        state
            .records
            .get(&id)
            .and_then(|r| r.clients.for_role(role))
            .map(|sets| sets.waiting.clone())
            .unwrap_or_default()
    }

    pub fn get_jobs_with_affinity(&self, id: AffinityId) -> IdSet {
        let state = self.state.lock();
        state
            .records
            .get(&id)
            .map(|r| r.jobs.clone())
            .unwrap_or_default()
    }

    pub fn get_jobs_with_affinities(&self, ids: &IdSet) -> IdSet {
        let state = self.state.lock();
        let mut out = IdSet::new();
        for id in ids {
            if let Some(record) = state.records.get(&id) {
                out.union_with(&record.jobs);
            }
        }
        out
    }

    /// Per-affinity client and job counts. Job sets are copied out under the
    /// registry lock and intersected with the tracker afterwards, so the two
    /// locks are never held together.
    pub fn get_affinity_statistics(&self, tracker: &JobStatusTracker) -> Vec<AffinityStatistics> {
        let snapshot: Vec<(AffinityStatistics, IdSet)> = {
            let state = self.state.lock();
            let mut rows: Vec<_> = state
                .records
                .iter()
                .map(|(id, record)| {
                    let stats = AffinityStatistics {
                        id: *id,
                        token: record.token.clone(),
                        jobs: record.jobs.len(),
                        pending_jobs: 0,
                        running_jobs: 0,
                        get_clients: record.clients.get.preferred.len(),
                        read_clients: record.clients.read.preferred.len(),
                        waiting_get_clients: record.clients.get.waiting.len(),
                        waiting_read_clients: record.clients.read.waiting.len(),
                    };
                    (stats, record.jobs.clone())
                })
                .collect();
            rows.sort_by_key(|(stats, _)| stats.id);
            rows
        };

        snapshot
            .into_iter()
            .map(|(mut stats, jobs)| {
                stats.pending_jobs = tracker.count_in(JobStatus::Pending, &jobs);
                stats.running_jobs = tracker.count_in(JobStatus::Running, &jobs);
                stats
            })
            .collect()
    }

    /// Deletes up to `max_to_remove` unreferenced affinities. Candidates that
    /// were referenced again since they were marked are dropped from the
    /// candidate set and kept. Returns the number deleted.
    pub fn collect_garbage(&self, max_to_remove: usize) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        while removed < max_to_remove {
            let Some(id) = state.removal_candidates.first() else {
                break;
            };
            state.removal_candidates.remove(id);
            if state.records.get(&id).is_some_and(AffinityRecord::can_be_deleted) {
                state.delete(id);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = state.removal_candidates.len(),
                "Collected unreferenced affinities"
            );
        }
        removed
    }

    /// Drops stale entries from the candidate set without deleting anything.
    /// Returns the number of candidates still eligible for deletion.
    pub fn check_remove_candidates(&self) -> usize {
        let mut state = self.state.lock();
        let stale: Vec<AffinityId> = state
            .removal_candidates
            .iter()
            .filter(|id| !state.records.get(id).is_some_and(AffinityRecord::can_be_deleted))
            .collect();
        for id in stale {
            state.removal_candidates.remove(id);
        }
        state.removal_candidates.len()
    }

    pub fn removal_candidates(&self) -> IdSet {
        self.state.lock().removal_candidates.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `(id, token)` pairs of affinities that still have jobs.
    /// Returns the number of records written. Nothing is written when a
    /// token is over [`MAX_TOKEN_LEN`].
    pub fn dump<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let mut rows: Vec<(AffinityId, String)> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|(_, r)| !r.jobs.is_empty())
                .map(|(id, r)| (*id, r.token.clone()))
                .collect()
        };
        rows.sort_unstable_by_key(|(id, _)| *id);

        let mut records = Vec::with_capacity(rows.len());
        for (id, token) in &rows {
            check_token(token)?;
            let len = u32::try_from(token.len()).map_err(|_| QueueError::AffinityTokenTooLong {
                len: token.len(),
                max: MAX_TOKEN_LEN,
            })?;
            records.push((*id, len, token.as_bytes()));
        }
        for (id, len, token) in records {
            writer.write_u32::<LittleEndian>(id)?;
            writer.write_u32::<LittleEndian>(len)?;
            writer.write_all(token)?;
        }
        writer.flush()?;
        Ok(rows.len())
    }

    /// Loads a dictionary written by [`dump`](Self::dump). Job membership is
    /// rebuilt by replaying `add_job_to_affinity`, after which
    /// [`finalize_affinity_dictionary_loading`](Self::finalize_affinity_dictionary_loading)
    /// must be called.
    pub fn load_from_dump<R: Read>(&self, reader: &mut R) -> Result<usize> {
        let mut loaded = Vec::new();
        while let Some((id, len)) = read_header(reader)? {
            if id == 0 {
                return Err(QueueError::CorruptDump("affinity id 0".to_string()));
            }
            if len as usize > MAX_TOKEN_LEN {
                return Err(QueueError::CorruptDump(format!(
                    "token length {} for affinity {}",
                    len, id
                )));
            }
            let mut bytes = vec![0u8; len as usize];
            reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => {
                    QueueError::CorruptDump(format!("truncated token for affinity {}", id))
                }
                _ => QueueError::Io(e),
            })?;
            let token = String::from_utf8(bytes).map_err(|_| {
                QueueError::CorruptDump(format!("token of affinity {} is not UTF-8", id))
            })?;
            loaded.push((id, token));
        }

        let mut state = self.state.lock();
        let mut seen_ids = IdSet::new();
        let mut seen_tokens = HashSet::new();
        for (id, token) in &loaded {
            let duplicate = !seen_ids.insert(*id)
                || !seen_tokens.insert(token.as_str())
                || state.records.contains_key(id)
                || state.by_token.contains_key(token);
            if duplicate {
                return Err(QueueError::CorruptDump(format!(
                    "duplicate affinity {} '{}'",
                    id, token
                )));
            }
        }
        for (id, token) in loaded.iter().cloned() {
            state.by_token.insert(token.clone(), id);
            state.records.insert(id, AffinityRecord::new(token));
        }
        Ok(loaded.len())
    }

    /// Drops loaded affinities that received no job during reload and primes
    /// the allocator past the highest surviving id. Returns the number dropped.
    pub fn finalize_affinity_dictionary_loading(&self) -> usize {
        let mut state = self.state.lock();
        let unused: Vec<AffinityId> = state
            .records
            .iter()
            .filter(|(_, r)| r.can_be_deleted())
            .map(|(id, _)| *id)
            .collect();
        for id in &unused {
            state.delete(*id);
            state.removal_candidates.remove(*id);
        }
        state.last_id = state.records.keys().copied().max().unwrap_or(0);
        tracing::info!(
            affinities = state.records.len(),
            dropped = unused.len(),
            "Affinity dictionary loaded"
        );
        unused.len()
    }

    /// Administrative text dump. Not a stable format.
    pub fn print(&self, verbose: bool) -> String {
        let state = self.state.lock();
        let mut ids: Vec<&AffinityId> = state.records.keys().collect();
        ids.sort_unstable();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "affinities: {} (removal candidates: {})",
            state.records.len(),
            state.removal_candidates.len()
        );
        for id in ids {
            let record = &state.records[id];
            let _ = writeln!(
                out,
                "affinity {} '{}': jobs {}, get clients {}/{}, read clients {}/{}",
                id,
                record.token,
                record.jobs.len(),
                record.clients.get.preferred.len(),
                record.clients.get.waiting.len(),
                record.clients.read.preferred.len(),
                record.clients.read.waiting.len(),
            );
            if verbose && !record.jobs.is_empty() {
                let jobs: Vec<String> = record.jobs.iter().map(|j| j.to_string()).collect();
                let _ = writeln!(out, "  jobs: {}", jobs.join(" "));
            }
        }
        out
    }
}

/// Reads the fixed 8-byte record prefix. `None` on a clean end of input.
fn read_header<R: Read>(reader: &mut R) -> Result<Option<(AffinityId, u32)>> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(None),
        8 => Ok(Some((
            LittleEndian::read_u32(&header[..4]),
            LittleEndian::read_u32(&header[4..]),
        ))),
        n => Err(QueueError::CorruptDump(format!(
            "truncated record header ({} of 8 bytes)",
            n
        ))),
    }
}
