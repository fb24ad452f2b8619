//! Deduplicating, concurrency-bounded scan scheduler.
//!
//! Every logical request subscribes to one shared sub-task per host. A host
//! is probed once no matter how many requests wait on it, and its result is
//! delivered to every subscriber. All bookkeeping happens under one lock that
//! is never held across an await; probes run as spawned tasks and pull the
//! next queued host when they finish.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MAX_CONCURRENT_TASKS;
use crate::notify::{Notifier, ScanSummary};
use crate::probe::HostProbe;
use crate::store::{prune_tasks, ResultStore, RunningStatus, TaskTable};
use crate::types::{now_ts, Finding, HostId, HostResult, ScanRequest, ScanState};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Terminal requests kept beyond this count are evicted oldest first.
    pub max_tasks: usize,
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: MAX_CONCURRENT_TASKS,
            max_tasks: 10,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Shared probe work for one host. Lives exactly as long as it has
/// subscribers.
#[derive(Debug)]
struct HostSubTask {
    subscribers: BTreeSet<String>,
    cancel: CancellationToken,
    /// Distinguishes this sub-task from a later one for the same host.
    generation: u64,
    running: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    requests: BTreeMap<String, ScanRequest>,
    subtasks: HashMap<HostId, HostSubTask>,
    waiting: VecDeque<HostId>,
    /// Probe slots in use, by sub-task generation. A slot is released when
    /// the probe task returns, even if its sub-task was destroyed earlier.
    running: HashMap<u64, HostId>,
    version: u64,
    next_generation: u64,
}

impl SchedulerState {
    fn snapshot(&mut self) -> TaskTable {
        self.version += 1;
        TaskTable {
            version: self.version,
            tasks: self.requests.clone(),
            scanning: !self.running.is_empty() || !self.waiting.is_empty(),
        }
    }
}

pub struct Scheduler {
    probe: Arc<dyn HostProbe>,
    store: ResultStore,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        probe: Arc<dyn HostProbe>,
        store: ResultStore,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            store,
            notifier,
            config,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Register a request for `hosts` under `key`.
    ///
    /// A no-op while a non-terminal request with the same key exists. Hosts
    /// already queued or running are joined rather than probed again. An
    /// empty host set completes immediately. Returns whether a request was
    /// created.
    pub async fn submit(&self, key: &str, hosts: Vec<HostId>) -> bool {
        let now = now_ts();
        let (table, summary) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.requests.get(key).is_some_and(|r| !r.state.is_terminal()) {
                debug!(key, "request already active");
                return false;
            }

            let pending: BTreeSet<HostId> = hosts.into_iter().collect();
            let mut request = ScanRequest::new(now, pending.clone());
            let mut summary = None;
            if pending.is_empty() {
                request.state = ScanState::Complete;
                request.completed_at = Some(now);
                summary = Some(ScanSummary::from_request(key, &request, now));
            }

            for host in pending {
                if let Some(sub) = st.subtasks.get_mut(&host) {
                    sub.subscribers.insert(key.to_string());
                    if sub.running {
                        request.state = ScanState::Scanning;
                    }
                    continue;
                }
                st.next_generation += 1;
                st.subtasks.insert(
                    host.clone(),
                    HostSubTask {
                        subscribers: BTreeSet::from([key.to_string()]),
                        cancel: CancellationToken::new(),
                        generation: st.next_generation,
                        running: false,
                    },
                );
                st.waiting.push_back(host);
            }
            info!(key, hosts = request.pending_hosts.len(), "scan request submitted");
            st.requests.insert(key.to_string(), request);

            let pruned = prune_tasks(&mut st.requests, self.config.max_tasks, self.config.retention, now);
            if !pruned.is_empty() {
                debug!(?pruned, "pruned old scan requests");
            }
            (st.snapshot(), summary)
        };

        self.store.save_tasks(&table).await;
        if let Some(summary) = summary {
            self.finish(&summary).await;
        }
        true
    }

    /// Start queued hosts, FIFO, while probe slots are free.
    pub fn schedule(self: &Arc<Self>) {
        let mut launches = Vec::new();
        let table = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            while st.running.len() < self.config.max_concurrent_tasks {
                let Some(host) = st.waiting.pop_front() else {
                    break;
                };
                let Some(sub) = st.subtasks.get_mut(&host) else {
                    continue;
                };
                if sub.running {
                    continue;
                }
                sub.running = true;
                st.running.insert(sub.generation, host.clone());
                for key in &sub.subscribers {
                    if let Some(req) = st.requests.get_mut(key) {
                        if req.state == ScanState::Queued {
                            req.state = ScanState::Scanning;
                        }
                    }
                }
                launches.push((host, sub.generation, sub.cancel.clone()));
            }
            (!launches.is_empty()).then(|| st.snapshot())
        };

        for (host, generation, cancel) in launches {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_host(host, generation, cancel).await });
        }
        if let Some(table) = table {
            let store = self.store.clone();
            tokio::spawn(async move { store.save_tasks(&table).await });
        }
    }

    async fn run_host(self: Arc<Self>, host: HostId, generation: u64, cancel: CancellationToken) {
        info!(%host, generation, "host probe started");
        let probe = Arc::clone(&self.probe);
        let target = host.clone();
        let findings = match tokio::spawn(async move { probe.scan(&target, cancel).await }).await {
            Ok(findings) => findings,
            Err(e) => {
                error!(%host, error = %e, "host probe task failed");
                Vec::new()
            }
        };
        self.complete_host(&host, generation, findings).await;
        self.schedule();
    }

    /// Fan a finished probe out to its subscribers. Results of a sub-task
    /// that was destroyed meanwhile are dropped.
    async fn complete_host(&self, host: &HostId, generation: u64, findings: Vec<Finding>) {
        let now = now_ts();
        let result = HostResult {
            host: host.clone(),
            timestamp: now,
            findings,
        };

        let (table, delivered, completed) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.running.remove(&generation);

            let current = st
                .subtasks
                .get(host)
                .is_some_and(|s| s.generation == generation);
            let mut completed = Vec::new();
            if current {
                if let Some(sub) = st.subtasks.remove(host) {
                    for key in sub.subscribers {
                        let Some(req) = st.requests.get_mut(&key) else {
                            continue;
                        };
                        if req.state.is_terminal() {
                            continue;
                        }
                        req.pending_hosts.remove(host);
                        req.results.push(result.clone());
                        if req.pending_hosts.is_empty() {
                            req.state = ScanState::Complete;
                            req.completed_at = Some(now);
                            completed.push(ScanSummary::from_request(&key, req, now));
                        }
                    }
                }
            } else {
                debug!(%host, generation, "dropping result of cancelled host probe");
            }
            (st.snapshot(), current, completed)
        };

        if delivered {
            self.store.save_host_result(&result).await;
            if !result.findings.is_empty() {
                self.notifier.weak_credentials(&result).await;
            }
        }
        self.store.save_tasks(&table).await;
        for summary in completed {
            self.finish(&summary).await;
        }
    }

    async fn finish(&self, summary: &ScanSummary) {
        self.store.set_last_completed_scan_ts(summary.completed_at).await;
        self.notifier.scan_completed(summary).await;
    }

    /// Stop a queued or scanning request. Its hosts are unsubscribed; a host
    /// left without subscribers is dequeued, or its running probe is
    /// cancelled. Returns whether the request was active.
    pub async fn stop(&self, key: &str) -> bool {
        let table = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(req) = st.requests.get_mut(key) else {
                return false;
            };
            if req.state.is_terminal() {
                return false;
            }
            req.state = ScanState::Stopped;
            let pending = std::mem::take(&mut req.pending_hosts);

            for host in pending {
                let Some(sub) = st.subtasks.get_mut(&host) else {
                    continue;
                };
                sub.subscribers.remove(key);
                if !sub.subscribers.is_empty() {
                    continue;
                }
                if let Some(sub) = st.subtasks.remove(&host) {
                    sub.cancel.cancel();
                    if sub.running {
                        info!(%host, "terminating probe of unsubscribed host");
                    } else {
                        st.waiting.retain(|h| h != &host);
                    }
                }
            }
            info!(key, "scan request stopped");
            st.snapshot()
        };
        self.store.save_tasks(&table).await;
        true
    }

    /// Stop every active request; returns their keys.
    pub async fn stop_all(&self) -> Vec<String> {
        let active: Vec<String> = self
            .state
            .lock()
            .requests
            .iter()
            .filter(|(_, r)| !r.state.is_terminal())
            .map(|(k, _)| k.clone())
            .collect();
        let mut stopped = Vec::new();
        for key in active {
            if self.stop(&key).await {
                stopped.push(key);
            }
        }
        stopped
    }

    /// Reload persisted requests after a restart. In-flight work cannot be
    /// resumed, so every non-terminal request becomes stopped.
    pub async fn recover(&self) -> usize {
        let mut tasks = self.store.load_tasks().await;
        let mut demoted = 0;
        for (key, req) in tasks.iter_mut() {
            if !req.state.is_terminal() {
                info!(key = %key, "demoting interrupted scan request");
                req.state = ScanState::Stopped;
                req.pending_hosts.clear();
                demoted += 1;
            }
        }
        let table = {
            let mut st = self.state.lock();
            st.requests = tasks;
            st.snapshot()
        };
        self.store.save_tasks(&table).await;
        demoted
    }

    /// Clear a stale shared "scanning" flag when nothing is running here.
    /// Returns whether the flag changed.
    pub async fn check_running_status(&self) -> bool {
        let idle = {
            let st = self.state.lock();
            st.running.is_empty() && st.waiting.is_empty()
        };
        if !idle || self.store.running_status().await != RunningStatus::Scanning {
            return false;
        }
        let changed = self.store.update_running_status(RunningStatus::Complete).await;
        if changed {
            info!("reset stale scanning status");
        }
        changed
    }

    pub fn request(&self, key: &str) -> Option<ScanRequest> {
        self.state.lock().requests.get(key).cloned()
    }

    pub fn requests(&self) -> BTreeMap<String, ScanRequest> {
        self.state.lock().requests.clone()
    }

    /// Probe slots currently in use.
    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Hosts with a live sub-task, with their subscriber keys.
    pub fn subscribers(&self, host: &HostId) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .subtasks
            .get(host)
            .map(|s| s.subscribers.clone())
    }
}
