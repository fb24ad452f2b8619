//! Persisted state shared with polling consumers.
//!
//! The scheduler process is the only writer. Everything is last-writer-wins
//! except the task table, which carries a version so that out-of-order saves
//! from concurrently finishing probes never roll the table back.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{now_ts, HostId, HostResult, ScanRequest, ScanSnapshot};

pub const TASKS_KEY: &str = "weak_password_scan:tasks";
pub const LAST_COMPLETED_KEY: &str = "weak_password_scan:last_completed_ts";
pub const STATUS_KEY: &str = "weak_password_scan:status";
pub const POLICY_KEY: &str = "weak_password_scan:policy";
pub const EXTRAS_KEY: &str = "weak_password_scan:extras";
pub const DICT_HASH_KEY: &str = "weak_password_scan:dictionary.sha256";
const HOST_KEY_PREFIX: &str = "weak_password_scan:host:";

/// Minimal key-value contract of the external persisted store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically replace the value and return the previous one.
    async fn get_set(&self, key: &str, value: String) -> Result<Option<String>, StoreError>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// In-process `KvStore` with per-key expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn get_set(&self, key: &str, value: String) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let previous = self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(previous.filter(|e| e.live(now)).map(|e| e.value))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct FileEntry {
    value: String,
    /// Unix seconds; wall clock so expiry survives a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<f64>,
}

impl FileEntry {
    fn live(&self, now: f64) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

#[derive(Debug, Default)]
struct FileState {
    entries: HashMap<String, FileEntry>,
    /// Bumped on every mutation.
    revision: u64,
}

/// `KvStore` persisted as one JSON document, rewritten through a temporary
/// file and a rename after every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<FileState>,
    /// Revision on disk; serializes writers so an older document never lands
    /// after a newer one.
    written: tokio::sync::Mutex<u64>,
}

impl FileStore {
    /// Open `path`, loading its live entries. A missing file starts empty; an
    /// unreadable one is logged and replaced on the next write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, FileEntry>>(&raw) {
                Ok(entries) => {
                    let now = now_ts();
                    entries.into_iter().filter(|(_, e)| e.live(now)).collect()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable store file");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = entries.len(), "opened store file");
        Ok(Self {
            path,
            state: Mutex::new(FileState { entries, revision: 0 }),
            written: tokio::sync::Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` and persist the result. Returns what `change` returned.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, FileEntry>) -> T,
    ) -> Result<T, StoreError> {
        let (out, revision, body) = {
            let mut st = self.state.lock();
            let out = change(&mut st.entries);
            st.revision += 1;
            let now = now_ts();
            st.entries.retain(|_, e| e.live(now));
            (out, st.revision, serde_json::to_string(&st.entries)?)
        };
        self.persist(revision, body).await?;
        Ok(out)
    }

    async fn persist(&self, revision: u64, body: String) -> Result<(), StoreError> {
        let mut written = self.written.lock().await;
        if revision <= *written {
            return Ok(());
        }
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.json".to_string());
        let tmp = self.path.with_file_name(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        *written = revision;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let st = self.state.lock();
        Ok(st
            .entries
            .get(key)
            .filter(|e| e.live(now_ts()))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|d| now_ts() + d.as_secs_f64());
        self.mutate(|entries| {
            entries.insert(key.to_string(), FileEntry { value, expires_at });
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.remove(key);
        })
        .await
    }

    async fn get_set(&self, key: &str, value: String) -> Result<Option<String>, StoreError> {
        let now = now_ts();
        self.mutate(|entries| {
            entries
                .insert(
                    key.to_string(),
                    FileEntry {
                        value,
                        expires_at: None,
                    },
                )
                .filter(|e| e.live(now))
                .map(|e| e.value)
        })
        .await
    }
}

/// Shared "is a scan running" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningStatus {
    Scanning,
    Complete,
}

impl RunningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunningStatus::Scanning => "scanning",
            RunningStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned copy of the scheduler's request table.
#[derive(Debug, Clone)]
pub struct TaskTable {
    pub version: u64,
    pub tasks: BTreeMap<String, ScanRequest>,
    pub scanning: bool,
}

#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub host_result_ttl: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            host_result_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Typed access to scan state on top of a [`KvStore`].
#[derive(Clone)]
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
    saved_version: Arc<tokio::sync::Mutex<u64>>,
    limits: StoreLimits,
}

impl fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStore")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KvStore>, limits: StoreLimits) -> Self {
        Self {
            kv,
            saved_version: Arc::new(tokio::sync::Mutex::new(0)),
            limits,
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Persist `table` unless a newer version was already written.
    pub async fn save_tasks(&self, table: &TaskTable) {
        let mut saved = self.saved_version.lock().await;
        if table.version <= *saved {
            debug!(version = table.version, saved = *saved, "skipping stale task table");
            return;
        }
        if let Err(e) = self.put_json(TASKS_KEY, &table.tasks, None).await {
            warn!(error = %e, "failed to persist scan tasks");
            return;
        }
        *saved = table.version;
        let status = if table.scanning {
            RunningStatus::Scanning
        } else {
            RunningStatus::Complete
        };
        self.update_running_status(status).await;
    }

    /// Stored request table; empty when absent or unreadable.
    pub async fn load_tasks(&self) -> BTreeMap<String, ScanRequest> {
        self.get_json(TASKS_KEY).await.unwrap_or_default()
    }

    pub async fn save_host_result(&self, result: &HostResult) {
        let key = format!("{HOST_KEY_PREFIX}{}", result.host);
        if let Err(e) = self
            .put_json(&key, result, Some(self.limits.host_result_ttl))
            .await
        {
            warn!(error = %e, host = %result.host, "failed to persist host result");
        }
    }

    pub async fn host_result(&self, host: &HostId) -> Option<HostResult> {
        self.get_json(&format!("{HOST_KEY_PREFIX}{host}")).await
    }

    /// Monotonic: an older timestamp never replaces a newer one.
    pub async fn set_last_completed_scan_ts(&self, ts: f64) {
        if self.last_completed_scan_ts().await.is_some_and(|cur| cur >= ts) {
            return;
        }
        if let Err(e) = self.kv.set(LAST_COMPLETED_KEY, ts.to_string(), None).await {
            warn!(error = %e, "failed to persist last completed scan time");
        }
    }

    pub async fn last_completed_scan_ts(&self) -> Option<f64> {
        match self.kv.get(LAST_COMPLETED_KEY).await {
            Ok(v) => v.and_then(|s| s.parse().ok()),
            Err(e) => {
                warn!(error = %e, "failed to read last completed scan time");
                None
            }
        }
    }

    /// Set the shared flag; returns true only for the caller that changed it.
    pub async fn update_running_status(&self, status: RunningStatus) -> bool {
        match self.kv.get_set(STATUS_KEY, status.as_str().to_string()).await {
            Ok(previous) => previous.as_deref() != Some(status.as_str()),
            Err(e) => {
                warn!(error = %e, %status, "failed to update running status");
                false
            }
        }
    }

    pub async fn running_status(&self) -> RunningStatus {
        match self.kv.get(STATUS_KEY).await {
            Ok(Some(s)) if s == RunningStatus::Scanning.as_str() => RunningStatus::Scanning,
            Ok(_) => RunningStatus::Complete,
            Err(e) => {
                warn!(error = %e, "failed to read running status");
                RunningStatus::Complete
            }
        }
    }

    /// Latest `latest` requests (all when `None`), findings capped at
    /// `max_result` when given.
    pub async fn snapshot(&self, latest: Option<usize>, max_result: Option<usize>) -> ScanSnapshot {
        let mut tasks = self.load_tasks().await;
        if let Some(n) = latest {
            let keep = latest_task_keys(&tasks, n);
            tasks.retain(|k, _| keep.contains(k));
        }
        if let Some(max) = max_result {
            tasks = limit_results(tasks, max);
        }
        ScanSnapshot {
            tasks,
            last_completed_scan_ts: self.last_completed_scan_ts().await,
        }
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.kv.set(key, raw, ttl).await
    }

    /// Read and decode `key`; failures are logged and read as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(error = %e, key, "store read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, key, "discarding undecodable store value");
                None
            }
        }
    }
}

/// Keys of the `n` most recently created requests, oldest first.
pub fn latest_task_keys(tasks: &BTreeMap<String, ScanRequest>, n: usize) -> Vec<String> {
    let mut keyed: Vec<(&String, f64)> = tasks.iter().map(|(k, t)| (k, t.created_at)).collect();
    keyed.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    let skip = keyed.len().saturating_sub(n);
    keyed.into_iter().skip(skip).map(|(k, _)| k.clone()).collect()
}

/// Drop terminal requests older than `retention`, then evict the oldest
/// terminal requests until at most `max_tasks` remain. Active requests are
/// never evicted. Returns the removed keys.
pub fn prune_tasks(
    tasks: &mut BTreeMap<String, ScanRequest>,
    max_tasks: usize,
    retention: Duration,
    now: f64,
) -> Vec<String> {
    let cutoff = now - retention.as_secs_f64();
    let mut removed: Vec<String> = tasks
        .iter()
        .filter(|(_, t)| t.state.is_terminal() && t.created_at < cutoff)
        .map(|(k, _)| k.clone())
        .collect();
    for key in &removed {
        tasks.remove(key);
    }

    if tasks.len() > max_tasks {
        let mut terminal: Vec<(String, f64)> = tasks
            .iter()
            .filter(|(_, t)| t.state.is_terminal())
            .map(|(k, t)| (k.clone(), t.created_at))
            .collect();
        terminal.sort_by(|a, b| a.1.total_cmp(&b.1));
        let excess = tasks.len() - max_tasks;
        for (key, _) in terminal.into_iter().take(excess) {
            tasks.remove(&key);
            removed.push(key);
        }
    }
    removed
}

/// Cap the total number of findings across `tasks` at `max`.
///
/// Tasks are walked in key order and host results in order. The host result
/// that crosses the cap is truncated, everything after it is dropped, and its
/// task is flagged `overlimit`.
pub fn limit_results(
    tasks: BTreeMap<String, ScanRequest>,
    max: usize,
) -> BTreeMap<String, ScanRequest> {
    let mut count = 0usize;
    let mut limited = BTreeMap::new();
    for (key, mut task) in tasks {
        let mut cut = None;
        for (i, result) in task.results.iter_mut().enumerate() {
            if count + result.findings.len() > max {
                result.findings.truncate(max - count);
                cut = Some(i);
                break;
            }
            count += result.findings.len();
        }
        if let Some(i) = cut {
            task.results.truncate(i + 1);
            task.overlimit = true;
            limited.insert(key, task);
            break;
        }
        limited.insert(key, task);
    }
    limited
}
