use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{format_ts, HostResult, ScanRequest};

/// Summary emitted once per naturally completed request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub key: String,
    pub hosts: usize,
    pub findings: usize,
    pub completed_at: f64,
    /// Human-readable rendering of `completed_at`.
    pub completed_time: String,
}

impl ScanSummary {
    pub fn from_request(key: &str, request: &ScanRequest, completed_at: f64) -> Self {
        Self {
            key: key.to_string(),
            hosts: request.results.len(),
            findings: request.finding_count(),
            completed_at,
            completed_time: format_ts(completed_at),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn scan_completed(&self, summary: &ScanSummary);

    /// A probed host accepted at least one weak credential.
    async fn weak_credentials(&self, result: &HostResult);
}

/// Emits the summary as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn scan_completed(&self, summary: &ScanSummary) {
        info!(
            key = %summary.key,
            hosts = summary.hosts,
            findings = summary.findings,
            completed = %summary.completed_time,
            "weak password scan complete"
        );
    }

    async fn weak_credentials(&self, result: &HostResult) {
        for f in &result.findings {
            // passwords stay out of the log
            warn!(
                host = %result.host,
                protocol = %f.protocol,
                port = f.port,
                service = %f.service_name,
                username = %f.username,
                "weak credential accepted"
            );
        }
    }
}
