#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use cred_scan_rs::error::ProbeError;
use cred_scan_rs::inventory::{HostRecord, InventoryData, JsonInventory};
use cred_scan_rs::notify::{Notifier, ScanSummary};
use cred_scan_rs::probe::HostProbe;
use cred_scan_rs::runner::ProbeRunner;
use cred_scan_rs::scheduler::{Scheduler, SchedulerConfig};
use cred_scan_rs::store::{MemoryStore, ResultStore, StoreLimits};
use cred_scan_rs::types::{Finding, HostId, HostResult, TriState};

/// Host probe whose scans block until released or cancelled.
pub struct FakeProbe {
    gate: Semaphore,
    calls: Mutex<Vec<HostId>>,
    cancelled: Mutex<Vec<HostId>>,
    findings: Mutex<HashMap<HostId, Vec<Finding>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeProbe {
    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            calls: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            findings: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    /// Scans finish right away.
    pub fn open() -> Arc<Self> {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    /// Scans wait for [`FakeProbe::release`].
    pub fn gated() -> Arc<Self> {
        Self::with_permits(0)
    }

    pub fn release(&self, scans: usize) {
        self.gate.add_permits(scans);
    }

    pub fn set_findings(&self, host: &HostId, findings: Vec<Finding>) {
        self.findings.lock().insert(host.clone(), findings);
    }

    pub fn calls(&self) -> Vec<HostId> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, host: &HostId) -> usize {
        self.calls.lock().iter().filter(|h| *h == host).count()
    }

    pub fn cancelled(&self) -> Vec<HostId> {
        self.cancelled.lock().clone()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostProbe for FakeProbe {
    async fn scan(&self, host: &HostId, cancel: CancellationToken) -> Vec<Finding> {
        self.calls.lock().push(host.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        tokio::select! {
            permit = self.gate.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            }
            _ = cancel.cancelled() => {
                self.cancelled.lock().push(host.clone());
            }
        }
        tokio::task::yield_now().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.findings.lock().get(host).cloned().unwrap_or_default()
    }
}

type Respond = dyn Fn(&[String]) -> Result<String, ProbeError> + Send + Sync;

/// Probe runner answering from a closure and recording every argument list.
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    respond: Box<Respond>,
}

impl FakeRunner {
    pub fn new(respond: impl Fn(&[String]) -> Result<String, ProbeError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.join(" ")).collect()
    }
}

#[async_trait]
impl ProbeRunner for FakeRunner {
    async fn run(&self, args: &[String], _timeout: Duration, cancel: &CancellationToken) -> Result<String, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        self.calls.lock().push(args.to_vec());
        (self.respond)(args)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub summaries: Mutex<Vec<ScanSummary>>,
    pub weak: Mutex<Vec<HostResult>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn scan_completed(&self, summary: &ScanSummary) {
        self.summaries.lock().push(summary.clone());
    }

    async fn weak_credentials(&self, result: &HostResult) {
        self.weak.lock().push(result.clone());
    }
}

pub fn memory_store() -> ResultStore {
    ResultStore::new(Arc::new(MemoryStore::new()), StoreLimits::default())
}

pub fn scheduler_with(probe: Arc<FakeProbe>, config: SchedulerConfig) -> (Arc<Scheduler>, ResultStore, Arc<RecordingNotifier>) {
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let scheduler = Scheduler::new(probe, store.clone(), notifier.clone(), config);
    (scheduler, store, notifier)
}

/// Poll `check` every few milliseconds for up to two seconds.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn host(id: &str, network: Option<&str>, tags: &[&str], policy: TriState) -> HostRecord {
    HostRecord {
        id: HostId::new(id),
        network: network.map(String::from),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        policy,
        identity: false,
        addresses: Vec::new(),
    }
}

pub fn inventory(hosts: Vec<HostRecord>, networks: &[(&str, TriState)], groups: &[(&str, TriState)]) -> JsonInventory {
    JsonInventory::new(InventoryData {
        hosts,
        networks: networks.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        groups: groups.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    })
}

pub fn finding(port: u16, service: &str, username: &str, password: &str) -> Finding {
    Finding {
        protocol: "tcp".into(),
        port,
        service_name: service.into(),
        username: username.into(),
        password: password.into(),
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal nmap XML reporting `creds` as valid accounts for `script`.
/// Values are escaped the way nmap writes them, so `<empty>` arrives as
/// `&lt;empty&gt;`.
pub fn accounts_xml(script: &str, creds: &[(&str, &str)]) -> String {
    let tables: String = creds
        .iter()
        .map(|(u, p)| {
            let (u, p) = (xml_escape(u), xml_escape(p));
            format!(
                "<table><elem key=\"username\">{u}</elem><elem key=\"password\">{p}</elem>\
                 <elem key=\"state\">Valid credentials</elem></table>"
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\"?><nmaprun><host><status state=\"up\"/><ports>\
         <port protocol=\"tcp\" portid=\"1\"><state state=\"open\"/>\
         <script id=\"{script}\" output=\"\"><table key=\"Accounts\">{tables}</table></script>\
         </port></ports></host></nmaprun>"
    )
}

pub const EMPTY_XML: &str = "<?xml version=\"1.0\"?><nmaprun><runstats/></nmaprun>";
