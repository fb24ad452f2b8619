use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};

/// Target that expands to the full policy-resolved host set.
pub const ALL_HOSTS_TARGET: &str = "0.0.0.0";

/// Stable identifier of a scan target: a device hardware address or an
/// identity (VPN peer) GUID.
///
/// Hardware addresses are normalized to upper case so `aa:bb:..` and
/// `AA:BB:..` name the same host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if looks_like_mac(&id) {
            HostId(id.to_ascii_uppercase())
        } else {
            HostId(id)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for device hosts keyed by a MAC address.
    pub fn is_mac(&self) -> bool {
        looks_like_mac(&self.0)
    }
}

fn looks_like_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        HostId::new(s)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        HostId::new(s)
    }
}

impl From<HostId> for String {
    fn from(id: HostId) -> Self {
        id.0
    }
}

/// Lifecycle of one logical scan request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Queued,
    Scanning,
    Complete,
    Stopped,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Complete | ScanState::Stopped)
    }
}

/// One weak credential discovered on a host service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub protocol: String,
    pub port: u16,
    pub service_name: String,
    pub username: String,
    pub password: String,
}

/// A username/password pair as reported by a probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Outcome of one physical host probe, shared by every subscribing request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostResult {
    pub host: HostId,
    pub timestamp: f64,
    pub findings: Vec<Finding>,
}

/// One logical scan demand, keyed externally by an opaque string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub state: ScanState,
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    #[serde(default)]
    pub pending_hosts: BTreeSet<HostId>,
    #[serde(default)]
    pub results: Vec<HostResult>,
    /// Set on transport copies whose results were truncated.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overlimit: bool,
}

impl ScanRequest {
    pub fn new(created_at: f64, pending_hosts: BTreeSet<HostId>) -> Self {
        Self {
            state: ScanState::Queued,
            created_at,
            completed_at: None,
            pending_hosts,
            results: Vec::new(),
            overlimit: false,
        }
    }

    pub fn finding_count(&self) -> usize {
        self.results.iter().map(|r| r.findings.len()).sum()
    }
}

/// Three-valued policy setting. Persisted the legacy way as `true`, `false`
/// or `null`/absent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum TriState {
    On,
    Off,
    #[default]
    Unset,
}

impl TriState {
    /// `self` unless it is unset, in which case `fallback`.
    pub fn or(self, fallback: TriState) -> TriState {
        match self {
            TriState::Unset => fallback,
            other => other,
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(v: Option<bool>) -> Self {
        match v {
            Some(true) => TriState::On,
            Some(false) => TriState::Off,
            None => TriState::Unset,
        }
    }
}

impl From<TriState> for Option<bool> {
    fn from(v: TriState) -> Self {
        match v {
            TriState::On => Some(true),
            TriState::Off => Some(false),
            TriState::Unset => None,
        }
    }
}

/// Scope a scan command targets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Host,
    Intf,
    Tag,
}

impl ScanKind {
    /// Request key for a non-policy scan of `target`.
    pub fn key_for(self, target: &str) -> String {
        match self {
            ScanKind::Host => HostId::new(target).to_string(),
            ScanKind::Intf => format!("intf:{target}"),
            ScanKind::Tag => format!("tag:{target}"),
        }
    }
}

impl FromStr for ScanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(ScanKind::Host),
            "intf" | "network" => Ok(ScanKind::Intf),
            "tag" | "group" => Ok(ScanKind::Tag),
            other => Err(format!("unknown scan type: {other}")),
        }
    }
}

/// Request key for a policy-driven full run fired at `ts`.
pub fn cron_key(ts: f64) -> String {
    format!("cron_{}", ts.floor() as i64)
}

/// A request key plus the hosts it expands to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub key: String,
    pub hosts: Vec<HostId>,
}

/// Persisted view handed to polling consumers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub tasks: BTreeMap<String, ScanRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_scan_ts: Option<f64>,
}

impl ScanSnapshot {
    /// True while any request is still queued or scanning.
    pub fn has_active(&self) -> bool {
        self.tasks.values().any(|t| !t.state.is_terminal())
    }
}

/// Current unix time in fractional seconds.
pub fn now_ts() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

/// Render a unix timestamp as RFC 3339 for humans.
pub fn format_ts(ts: f64) -> String {
    OffsetDateTime::from_unix_timestamp(ts.floor() as i64)
        .ok()
        .and_then(|t| t.format(&well_known::Rfc3339).ok())
        .unwrap_or_else(|| String::from("1970-01-01T00:00:00Z"))
}
