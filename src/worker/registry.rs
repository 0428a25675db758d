use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::bitset::IdSet;
use crate::scheduler::job::{ClientId, JobId};
use crate::worker::session::{NodeHandle, SessionState, WorkerNode, WorkerNodeInfo};

/// A session dropped because its validity deadline passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub handle: NodeHandle,
    pub client_id: ClientId,
    pub jobs: Vec<JobId>,
}

struct RegistryIndex {
    nodes: HashMap<NodeHandle, Mutex<WorkerNode>>,
    by_address: HashMap<(IpAddr, u16), NodeHandle>,
    by_id: HashMap<String, NodeHandle>,
    next_handle: u64,
    last_client_id: ClientId,
    last_notify: Option<DateTime<Utc>>,
}

impl RegistryIndex {
    fn allocate_client_id(&mut self) -> ClientId {
        self.last_client_id = self.last_client_id.wrapping_add(1);
        if self.last_client_id == 0 {
            self.last_client_id = 1;
        }
        self.last_client_id
    }

    fn is_identified(&self, handle: NodeHandle) -> bool {
        self.nodes
            .get(&handle)
            .is_some_and(|n| n.lock().state() == SessionState::Identified)
    }

    fn unindex(&mut self, node: &WorkerNode) {
        if let Some(port) = node.port {
            let key = (node.address, port);
            if self.by_address.get(&key) == Some(&node.handle) {
                self.by_address.remove(&key);
            }
        }
        if let Some(id) = &node.id {
            if self.by_id.get(id) == Some(&node.handle) {
                self.by_id.remove(id);
            }
        }
    }

    fn remove(&mut self, handle: NodeHandle) -> Option<WorkerNode> {
        let node = self.nodes.remove(&handle)?.into_inner();
        self.unindex(&node);
        Some(node)
    }

    /// Points `(address, port)` at `handle`, dropping its previous mapping.
    fn assign_port(&mut self, handle: NodeHandle, address: IpAddr, port: u16) {
        let previous = self
            .nodes
            .get(&handle)
            .and_then(|n| n.lock().port.replace(port));
        if let Some(old) = previous.filter(|old| *old != port) {
            if self.by_address.get(&(address, old)) == Some(&handle) {
                self.by_address.remove(&(address, old));
            }
        }
        self.by_address.insert((address, port), handle);
    }

    /// Folds `from` into `into`; `from` becomes unreachable.
    fn merge(&mut self, from: NodeHandle, into: NodeHandle) -> bool {
        if from == into || !self.nodes.contains_key(&into) {
            return false;
        }
        let Some(provisional) = self.remove(from) else {
            return false;
        };
        tracing::debug!(%from, %into, jobs = provisional.jobs.len(), "Merging worker session");
        if let Some(target) = self.nodes.get(&into) {
            target.lock().absorb(provisional);
        }
        true
    }
}

/// Owns every connected session and its identity indices.
///
/// Lock order: the registry lock is always taken before a session's own
/// mutex. Unknown handles are routine (disconnect races) and yield empty
/// results.
pub struct WorkerNodeRegistry {
    index: RwLock<RegistryIndex>,
}

impl Default for WorkerNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerNodeRegistry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(RegistryIndex {
                nodes: HashMap::new(),
                by_address: HashMap::new(),
                by_id: HashMap::new(),
                next_handle: 1,
                last_client_id: 0,
                last_notify: None,
            }),
        }
    }

    /// Creates an Anonymous session on first contact.
    pub fn register_node(
        &self,
        address: IpAddr,
        now: DateTime<Utc>,
        live_timeout: chrono::Duration,
    ) -> NodeHandle {
        let mut index = self.index.write();
        let handle = NodeHandle(index.next_handle);
        index.next_handle += 1;
        let client_id = index.allocate_client_id();
        index.nodes.insert(
            handle,
            Mutex::new(WorkerNode::new(handle, client_id, address, now, live_timeout)),
        );
        handle
    }

    /// Removes the session from every index and releases its jobs.
    pub fn unregister_node(&self, handle: NodeHandle) -> Vec<JobId> {
        match self.index.write().remove(handle) {
            Some(mut node) => node.take_jobs(),
            None => {
                tracing::debug!(%handle, "Unregister of unknown worker session");
                Vec::new()
            }
        }
    }

    /// Announces the session's control port. Returns the handle now owning
    /// `(address, port)`. When an unidentified session already holds the
    /// mapping, the two are merged: an identified caller absorbs the holder,
    /// otherwise the holder absorbs the caller. A mapping held by a different
    /// identified session is left alone and `None` is returned.
    pub fn set_port(&self, handle: NodeHandle, port: u16) -> Option<NodeHandle> {
        let mut index = self.index.write();
        let Some(address) = index.nodes.get(&handle).map(|n| n.lock().address) else {
            tracing::debug!(%handle, "Port announced by unknown worker session");
            return None;
        };
        let key = (address, port);
        match index.by_address.get(&key).copied() {
            Some(owner) if owner != handle => {
                if index.is_identified(owner) {
                    tracing::warn!(
                        %handle,
                        %owner,
                        %address,
                        port,
                        "Refusing to take over control port of identified session"
                    );
                    return None;
                }
                if !index.is_identified(handle) {
                    index.merge(handle, owner);
                    return Some(owner);
                }
                index.merge(owner, handle);
                index.assign_port(handle, address, port);
                Some(handle)
            }
            _ => {
                index.assign_port(handle, address, port);
                Some(handle)
            }
        }
    }

    /// Announces the logical id. When another session already holds `id`,
    /// this session is merged into it and the surviving handle is returned.
    /// A session that already carries a different id keeps it and `None` is
    /// returned.
    pub fn set_id(&self, handle: NodeHandle, id: &str) -> Option<NodeHandle> {
        let mut index = self.index.write();
        let current = match index.nodes.get(&handle) {
            Some(n) => n.lock().id.clone(),
            None => {
                tracing::debug!(%handle, id, "Id announced by unknown worker session");
                return None;
            }
        };
        if let Some(existing) = current.filter(|existing| existing != id) {
            tracing::warn!(%handle, existing = %existing, id, "Worker session already identified");
            return None;
        }
        if let Some(owner) = index.by_id.get(id).copied() {
            if owner == handle {
                return Some(handle);
            }
            index.merge(handle, owner);
            return Some(owner);
        }
        if let Some(n) = index.nodes.get(&handle) {
            n.lock().id = Some(id.to_string());
        }
        index.by_id.insert(id.to_string(), handle);
        Some(handle)
    }

    /// Redirects a provisional session to the identified session already
    /// registered at the same address and `port`, merging it in. `None`
    /// when there is no such counterpart or the caller is identified itself.
    pub fn identify_worker_node_by_address(
        &self,
        handle: NodeHandle,
        port: u16,
    ) -> Option<NodeHandle> {
        let mut index = self.index.write();
        let address = index.nodes.get(&handle).map(|n| n.lock().address)?;
        let owner = index.by_address.get(&(address, port)).copied()?;
        if owner == handle || !index.is_identified(owner) {
            return None;
        }
        if index.is_identified(handle) {
            tracing::warn!(
                %handle,
                %owner,
                %address,
                port,
                "Identified session announced the address of another identified session"
            );
            return None;
        }
        index.merge(handle, owner).then_some(owner)
    }

    /// Redirects a provisional session to the identified session that holds
    /// `job_id`, merging it in. An identified caller is never merged.
    pub fn identify_worker_node_by_job_id(
        &self,
        handle: NodeHandle,
        job_id: JobId,
    ) -> Option<NodeHandle> {
        let mut index = self.index.write();
        if !index.nodes.contains_key(&handle) || index.is_identified(handle) {
            return None;
        }
        let owner = index.nodes.iter().find_map(|(h, n)| {
            let node = n.lock();
            (*h != handle && node.has_job(job_id) && node.state() == SessionState::Identified)
                .then_some(*h)
        })?;
        index.merge(handle, owner).then_some(owner)
    }

    pub fn add_job(&self, handle: NodeHandle, job_id: JobId, deadline: DateTime<Utc>) -> bool {
        let index = self.index.read();
        match index.nodes.get(&handle) {
            Some(n) => {
                n.lock().add_job(job_id, deadline);
                true
            }
            None => {
                tracing::debug!(%handle, job_id, "Job assigned to unknown worker session");
                false
            }
        }
    }

    /// Moves the execution deadline of `job_id` on whichever session holds it.
    pub fn update_job(&self, job_id: JobId, deadline: DateTime<Utc>) -> bool {
        let index = self.index.read();
        index
            .nodes
            .values()
            .any(|n| n.lock().update_job(job_id, deadline))
    }

    /// Detaches `job_id` from its session, returning that session.
    pub fn remove_job(&self, job_id: JobId) -> Option<NodeHandle> {
        let index = self.index.read();
        index.nodes.iter().find_map(|(h, n)| n.lock().remove_job(job_id).then_some(*h))
    }

    pub fn find_by_job(&self, job_id: JobId) -> Option<NodeHandle> {
        let index = self.index.read();
        index
            .nodes
            .iter()
            .find_map(|(h, n)| n.lock().has_job(job_id).then_some(*h))
    }

    pub fn find_by_address(&self, address: IpAddr, port: u16) -> Option<NodeHandle> {
        self.index.read().by_address.get(&(address, port)).copied()
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeHandle> {
        self.index.read().by_id.get(id).copied()
    }

    fn with_node<T>(&self, handle: NodeHandle, f: impl FnOnce(&mut WorkerNode) -> T) -> Option<T> {
        let index = self.index.read();
        let result = index.nodes.get(&handle).map(|n| f(&mut n.lock()));
        if result.is_none() {
            tracing::debug!(%handle, "Unknown worker session");
        }
        result
    }

    /// Heartbeat: pushes the liveness deadline forward.
    pub fn touch(&self, handle: NodeHandle, now: DateTime<Utc>, live_timeout: chrono::Duration) -> bool {
        self.with_node(handle, |n| n.touch(now, live_timeout)).is_some()
    }

    pub fn set_notify_deadline(&self, handle: NodeHandle, deadline: Option<DateTime<Utc>>) -> bool {
        self.with_node(handle, |n| n.set_notify_until(deadline)).is_some()
    }

    /// Replaces the preferred affinities, returning the previous set.
    pub fn set_preferred_affinities(&self, handle: NodeHandle, affinities: IdSet) -> Option<IdSet> {
        self.with_node(handle, |n| std::mem::replace(&mut n.preferred_affinities, affinities))
    }

    pub fn get_preferred_affinities(&self, handle: NodeHandle) -> IdSet {
        self.with_node(handle, |n| n.preferred_affinities.clone())
            .unwrap_or_default()
    }

    pub fn client_id(&self, handle: NodeHandle) -> Option<ClientId> {
        self.with_node(handle, |n| n.client_id)
    }

    pub fn node_info(&self, handle: NodeHandle) -> Option<WorkerNodeInfo> {
        self.with_node(handle, |n| n.info())
    }

    /// Control endpoints to tell about new pending work. Unless
    /// `unconditional`, only sessions inside their notification window are
    /// listed and calls closer together than `notify_timeout` return nothing.
    pub fn get_notify_list(
        &self,
        unconditional: bool,
        now: DateTime<Utc>,
        notify_timeout: chrono::Duration,
    ) -> Vec<SocketAddr> {
        let mut index = self.index.write();
        if !unconditional && index.last_notify.is_some_and(|last| now < last + notify_timeout) {
            return Vec::new();
        }
        index.last_notify = Some(now);

        let mut targets: Vec<SocketAddr> = index
            .nodes
            .values()
            .filter_map(|n| {
                let node = n.lock();
                let port = node.port?;
                (unconditional || node.should_notify(now))
                    .then(|| SocketAddr::new(node.address, port))
            })
            .collect();
        targets.sort_unstable();
        targets
    }

    /// Sessions whose validity deadline is still ahead of `now`.
    pub fn get_nodes(&self, now: DateTime<Utc>) -> Vec<NodeHandle> {
        let index = self.index.read();
        let mut handles: Vec<NodeHandle> = index
            .nodes
            .iter()
            .filter(|(_, n)| n.lock().valid_until().is_some_and(|t| t > now))
            .map(|(h, _)| *h)
            .collect();
        handles.sort_unstable();
        handles
    }

    pub fn get_nodes_info(&self, now: DateTime<Utc>) -> Vec<WorkerNodeInfo> {
        let index = self.index.read();
        let mut infos: Vec<WorkerNodeInfo> = index
            .nodes
            .values()
            .filter_map(|n| {
                let node = n.lock();
                node.valid_until().is_some_and(|t| t > now).then(|| node.info())
            })
            .collect();
        infos.sort_unstable_by_key(|info| info.handle);
        infos
    }

    /// Drops every session whose validity deadline has passed.
    pub fn collect_expired(&self, now: DateTime<Utc>) -> Vec<ExpiredSession> {
        let mut index = self.index.write();
        let mut expired: Vec<NodeHandle> = index
            .nodes
            .iter()
            .filter(|(_, n)| n.lock().valid_until().map_or(true, |t| t <= now))
            .map(|(h, _)| *h)
            .collect();
        expired.sort_unstable();

        expired
            .into_iter()
            .filter_map(|handle| {
                let mut node = index.remove(handle)?;
                Some(ExpiredSession {
                    handle,
                    client_id: node.client_id,
                    jobs: node.take_jobs(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn print(&self, verbose: bool) -> String {
        let index = self.index.read();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "worker sessions: {} (addressed {}, identified {})",
            index.nodes.len(),
            index.by_address.len(),
            index.by_id.len()
        );
        if verbose {
            let mut handles: Vec<&NodeHandle> = index.nodes.keys().collect();
            handles.sort_unstable();
            for handle in handles {
                let node = index.nodes[handle].lock();
                let _ = writeln!(
                    out,
                    "  {} client {} {:?} {}:{} id={} jobs={:?}",
                    handle,
                    node.client_id,
                    node.state(),
                    node.address,
                    node.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    node.id.as_deref().unwrap_or("-"),
                    node.jobs.keys().collect::<Vec<_>>()
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

    fn addr() -> IpAddr {
        "192.168.0.7".parse().unwrap()
    }

    #[test]
    fn test_register_allocates_distinct_ids() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let a = reg.register_node(addr(), now, Duration::seconds(10));
        let b = reg.register_node(addr(), now, Duration::seconds(10));
        assert_ne!(a, b);
        assert_ne!(reg.client_id(a), reg.client_id(b));
        assert_eq!(reg.node_info(a).unwrap().state, SessionState::Anonymous);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_unregister_releases_jobs() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let h = reg.register_node(addr(), now, Duration::seconds(10));
        reg.set_port(h, 9100);
        reg.set_id(h, "w1");
        reg.add_job(h, 4, now);
        reg.add_job(h, 2, now);

        assert_eq!(reg.unregister_node(h), vec![2, 4]);
        assert!(reg.find_by_address(addr(), 9100).is_none());
        assert!(reg.find_by_id("w1").is_none());
        assert!(reg.unregister_node(h).is_empty());
    }

    #[test]
    fn test_set_port_refuses_identified_owner() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let owner = reg.register_node(addr(), now, Duration::seconds(10));
        reg.set_port(owner, 9100);
        reg.set_id(owner, "w1");

        let intruder = reg.register_node(addr(), now, Duration::seconds(10));
        assert_eq!(reg.set_port(intruder, 9100), None);
        assert_eq!(reg.find_by_address(addr(), 9100), Some(owner));
        assert!(reg.node_info(intruder).is_some());
    }

    #[test]
    fn test_set_port_merges_into_unidentified_owner() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let first = reg.register_node(addr(), now, Duration::seconds(10));
        reg.set_port(first, 9100);
        let second = reg.register_node(addr(), now, Duration::seconds(10));
        reg.add_job(second, 11, now + Duration::seconds(30));

        assert_eq!(reg.set_port(second, 9100), Some(first));
        assert!(reg.node_info(second).is_none());
        assert_eq!(reg.find_by_job(11), Some(first));
    }

    #[test]
    fn test_set_port_moves_address_mapping() {
        let reg = WorkerNodeRegistry::new();
        let h = reg.register_node(addr(), Utc::now(), Duration::seconds(10));
        reg.set_port(h, 9100);
        reg.set_port(h, 9200);
        assert!(reg.find_by_address(addr(), 9100).is_none());
        assert_eq!(reg.find_by_address(addr(), 9200), Some(h));
    }

    #[test]
    fn test_set_id_with_taken_id_merges() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let old = reg.register_node(addr(), now, Duration::seconds(10));
        reg.set_id(old, "w1");
        let new = reg.register_node(addr(), now, Duration::seconds(10));
        reg.add_job(new, 3, now);

        assert_eq!(reg.set_id(new, "w1"), Some(old));
        assert_eq!(reg.node_info(old).unwrap().jobs, vec![3]);
        assert!(reg.node_info(new).is_none());
        // a second, different id is not applied
        assert_eq!(reg.set_id(old, "w2"), None);
        assert_eq!(reg.find_by_id("w1"), Some(old));
    }

    #[test]
    fn test_identify_by_job_id() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let identified = reg.register_node(addr(), now, Duration::seconds(10));
        reg.set_id(identified, "w1");
        reg.add_job(identified, 8, now + Duration::seconds(20));

        let provisional = reg.register_node(addr(), now, Duration::seconds(40));
        assert_eq!(reg.identify_worker_node_by_job_id(provisional, 9), None);
        assert_eq!(
            reg.identify_worker_node_by_job_id(provisional, 8),
            Some(identified)
        );
        let info = reg.node_info(identified).unwrap();
        assert_eq!(info.live_until, Some(now + Duration::seconds(40)));
        assert!(reg.node_info(provisional).is_none());
    }

    #[test]
    fn test_job_bookkeeping() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let h = reg.register_node(addr(), now, Duration::seconds(10));
        reg.add_job(h, 1, now + Duration::seconds(60));
        assert!(reg.update_job(1, now + Duration::seconds(120)));
        assert_eq!(
            reg.node_info(h).unwrap().valid_until,
            Some(now + Duration::seconds(120))
        );
        assert!(!reg.update_job(2, now));
        assert_eq!(reg.remove_job(1), Some(h));
        assert_eq!(reg.remove_job(1), None);
    }

    #[test]
    fn test_notify_list_throttle() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let waiting = reg.register_node(addr(), now, Duration::seconds(10));
        reg.set_port(waiting, 9100);
        reg.set_notify_deadline(waiting, Some(now + Duration::seconds(30)));
        let idle = reg.register_node("10.0.0.2".parse().unwrap(), now, Duration::seconds(10));
        reg.set_port(idle, 9100);

        let timeout = Duration::milliseconds(100);
        assert_eq!(
            reg.get_notify_list(false, now, timeout),
            vec![SocketAddr::new(addr(), 9100)]
        );
        // throttled
        assert!(reg.get_notify_list(false, now + Duration::milliseconds(50), timeout).is_empty());
        // unconditional ignores both the throttle and the notify window
        assert_eq!(
            reg.get_notify_list(true, now + Duration::milliseconds(50), timeout).len(),
            2
        );
        assert_eq!(
            reg.get_notify_list(false, now + Duration::milliseconds(200), timeout).len(),
            1
        );
    }

    #[test]
    fn test_collect_expired() {
        let reg = WorkerNodeRegistry::new();
        let now = Utc::now();
        let short = reg.register_node(addr(), now, Duration::seconds(5));
        let busy = reg.register_node(addr(), now, Duration::seconds(5));
        reg.add_job(short, 1, now);
        reg.add_job(busy, 2, now + Duration::seconds(60));

        let later = now + Duration::seconds(10);
        assert_eq!(reg.get_nodes(later), vec![busy]);
        let expired = reg.collect_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, short);
        assert_eq!(expired[0].jobs, vec![1]);
        assert_eq!(reg.get_nodes_info(later).len(), 1);
    }
}
