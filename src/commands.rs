//! Fire-and-forget command surface.
//!
//! Callers publish [`ScanCommand`]s on a bus and poll the result store; the
//! scheduler side consumes them with [`run_command_loop`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PolicyError;
use crate::policy::{validate_cron, PolicyResolver, ScanPolicy};
use crate::scheduler::Scheduler;
use crate::store::{ResultStore, POLICY_KEY};
use crate::types::{cron_key, now_ts, ScanKind, ScanSnapshot, ScanState, TriState, ALL_HOSTS_TARGET};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ScanCommand {
    ScheduleScan {
        kind: ScanKind,
        target: String,
        /// When the caller issued the command.
        ts: f64,
    },
    StopScan {
        ts: f64,
    },
    ApplyPolicy {
        policy: ScanPolicy,
    },
}

/// One-way command transport. Publishing never waits for the consumer.
pub trait CommandBus: Send + Sync {
    fn publish(&self, cmd: ScanCommand);
}

/// In-process bus over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<ScanCommand>,
}

impl ChannelBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CommandBus for ChannelBus {
    fn publish(&self, cmd: ScanCommand) {
        if self.tx.send(cmd).is_err() {
            warn!("command bus closed, dropping command");
        }
    }
}

struct ArmedPolicy {
    policy: ScanPolicy,
    cancel: CancellationToken,
}

/// Scheduler-side command execution and recurring policy runs.
pub struct CommandHandler {
    scheduler: Arc<Scheduler>,
    resolver: PolicyResolver,
    store: ResultStore,
    cron_floor: Duration,
    armed: Mutex<Option<ArmedPolicy>>,
}

impl CommandHandler {
    pub fn new(
        scheduler: Arc<Scheduler>,
        resolver: PolicyResolver,
        store: ResultStore,
        cron_floor: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            resolver,
            store,
            cron_floor,
            armed: Mutex::new(None),
        })
    }

    pub async fn handle(self: &Arc<Self>, cmd: ScanCommand) -> Result<(), PolicyError> {
        match cmd {
            ScanCommand::ScheduleScan { kind, target, ts } => {
                self.schedule_scan(kind, &target, ts).await.map(|_| ())
            }
            ScanCommand::StopScan { .. } => {
                let stopped = self.scheduler.stop_all().await;
                info!(?stopped, "stop requested");
                Ok(())
            }
            ScanCommand::ApplyPolicy { policy } => self.apply_policy(policy).await,
        }
    }

    /// The armed policy, or the default when none was applied.
    pub fn policy(&self) -> ScanPolicy {
        self.armed
            .lock()
            .as_ref()
            .map(|a| a.policy.clone())
            .unwrap_or_default()
    }

    /// Resolve the target, submit it and kick the pool. Returns the key.
    pub async fn schedule_scan(&self, kind: ScanKind, target: &str, ts: f64) -> Result<String, PolicyError> {
        let policy = self.policy();
        let target = self.resolver.target_for(kind, target, &policy, ts).await?;
        let key = target.key.clone();
        self.scheduler.submit(&key, target.hosts).await;
        self.scheduler.schedule();
        Ok(key)
    }

    /// Validate and arm `policy`, replacing the previous one. On error the
    /// previous policy stays armed. A policy that is on triggers an
    /// immediate run unless a scan already completed after it was applied.
    pub async fn apply_policy(self: &Arc<Self>, mut policy: ScanPolicy) -> Result<(), PolicyError> {
        let schedule = policy
            .cron
            .as_deref()
            .map(|expr| validate_cron(expr, self.cron_floor))
            .transpose()?;
        let ts = *policy.ts.get_or_insert_with(now_ts);

        if let Err(e) = self.store.put_json(POLICY_KEY, &policy, None).await {
            warn!(error = %e, "failed to persist scan policy");
        }

        let cancel = CancellationToken::new();
        let previous = self.armed.lock().replace(ArmedPolicy {
            policy: policy.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        if let Some(schedule) = schedule {
            info!(cron = ?policy.cron, "cron scan armed");
            tokio::spawn(Arc::clone(self).cron_loop(schedule, cancel));
        }

        if policy.state == TriState::On {
            let last = self.store.last_completed_scan_ts().await;
            if last.map_or(true, |last| ts > last) {
                self.run_policy_scan(ts).await;
            }
        }
        Ok(())
    }

    /// Re-arm the persisted policy after a restart.
    pub async fn restore_policy(self: &Arc<Self>) -> Result<bool, PolicyError> {
        let Some(policy) = self.store.get_json::<ScanPolicy>(POLICY_KEY).await else {
            return Ok(false);
        };
        self.apply_policy(policy).await?;
        Ok(true)
    }

    /// Full run of the armed policy, keyed by `ts`.
    pub async fn run_policy_scan(&self, ts: f64) -> String {
        let policy = self.policy();
        let target = self.resolver.resolve(&policy, ts).await;
        let key = target.key.clone();
        self.scheduler.submit(&key, target.hosts).await;
        self.scheduler.schedule();
        key
    }

    async fn cron_loop(self: Arc<Self>, schedule: Schedule, cancel: CancellationToken) {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                debug!("cron schedule exhausted");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let ts = next.timestamp() as f64;
            info!(key = %cron_key(ts), "cron scan fired");
            self.run_policy_scan(ts).await;
        }
    }
}

/// Consume commands until the bus closes.
pub async fn run_command_loop(handler: Arc<CommandHandler>, mut rx: mpsc::UnboundedReceiver<ScanCommand>) {
    while let Some(cmd) = rx.recv().await {
        debug!(?cmd, "command received");
        if let Err(e) = handler.handle(cmd).await {
            warn!(error = %e, "command rejected");
        }
    }
    info!("command bus closed");
}

/// Poll `condition` until it holds or `timeout` elapses. Returns whether it
/// held.
pub async fn wait_condition<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub schedule_wait: Duration,
    pub stop_wait: Duration,
    /// Requests returned per snapshot.
    pub latest: usize,
    /// Findings returned per snapshot.
    pub max_result_size: usize,
    pub cron_floor: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            schedule_wait: Duration::from_secs(5),
            stop_wait: Duration::from_secs(10),
            latest: 10,
            max_result_size: 100,
            cron_floor: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Caller side: publishes commands and reads results from the store.
#[derive(Clone)]
pub struct ScanClient {
    bus: Arc<dyn CommandBus>,
    store: ResultStore,
    settings: ClientSettings,
}

impl ScanClient {
    pub fn new(bus: Arc<dyn CommandBus>, store: ResultStore, settings: ClientSettings) -> Self {
        Self { bus, store, settings }
    }

    /// Request a scan and wait briefly for it to leave the queue.
    pub async fn schedule_scan(&self, kind: ScanKind, target: &str) -> ScanSnapshot {
        let ts = now_ts();
        let key = if kind == ScanKind::Host && target == ALL_HOSTS_TARGET {
            cron_key(ts)
        } else {
            kind.key_for(target)
        };
        self.bus.publish(ScanCommand::ScheduleScan {
            kind,
            target: target.to_string(),
            ts,
        });

        let started = wait_condition(self.settings.schedule_wait, || {
            let store = self.store.clone();
            let key = key.clone();
            async move {
                store.load_tasks().await.get(&key).is_some_and(|t| {
                    t.state == ScanState::Scanning
                        || (t.created_at >= ts && t.state != ScanState::Queued)
                })
            }
        })
        .await;
        if !started {
            debug!(key, "scan not started before wait timeout");
        }
        self.get_scan_result().await
    }

    /// Stop every active request and wait for them to settle.
    pub async fn stop_scan(&self) -> ScanSnapshot {
        self.bus.publish(ScanCommand::StopScan { ts: now_ts() });
        let settled = wait_condition(self.settings.stop_wait, || {
            let store = self.store.clone();
            async move { !store.snapshot(None, None).await.has_active() }
        })
        .await;
        if !settled {
            debug!("scans still active after stop wait");
        }
        self.get_scan_result().await
    }

    pub async fn get_scan_result(&self) -> ScanSnapshot {
        self.store
            .snapshot(Some(self.settings.latest), Some(self.settings.max_result_size))
            .await
    }

    /// Validate the cron expression here so the caller sees the rejection,
    /// then hand the policy to the scheduler.
    pub async fn apply_policy(&self, mut policy: ScanPolicy) -> Result<(), PolicyError> {
        if let Some(expr) = policy.cron.as_deref() {
            validate_cron(expr, self.settings.cron_floor)?;
        }
        policy.ts.get_or_insert_with(now_ts);
        self.bus.publish(ScanCommand::ApplyPolicy { policy });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_tagged() {
        let cmd = ScanCommand::ScheduleScan {
            kind: ScanKind::Intf,
            target: "net1".into(),
            ts: 1.0,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["cmd"], "schedule_scan");
        assert_eq!(json["kind"], "intf");
    }

    #[tokio::test]
    async fn wait_condition_times_out() {
        let held = wait_condition(Duration::from_millis(50), || async { false }).await;
        assert!(!held);
        let held = wait_condition(Duration::from_millis(50), || async { true }).await;
        assert!(held);
    }
}
