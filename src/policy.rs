//! Scan target resolution and recurrence validation.
//!
//! The effective setting of a host is layered network -> group -> host, each
//! layer overriding the previous one unless it is unset. A host is scanned
//! when the effective setting is on, or unset while the global default is on.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PolicyError;
use crate::inventory::{HostRecord, Inventory};
use crate::types::{cron_key, HostId, ScanKind, ScanTarget, TriState, ALL_HOSTS_TARGET};

/// Upcoming firings inspected when measuring a cron's tightest interval.
const CRON_SAMPLES: usize = 64;

/// Global scan policy as applied by the user.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanPolicy {
    #[serde(default)]
    pub state: TriState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Also scan VPN peer identities.
    #[serde(default)]
    pub include_vpn_networks: bool,
    /// When the policy was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
}

/// Effective group setting for a host in several groups: any `on` wins over
/// `off`, and `off` wins over unset.
fn group_value(host: &HostRecord, groups: &BTreeMap<String, TriState>) -> TriState {
    let values: Vec<TriState> = host
        .tags
        .iter()
        .filter_map(|t| groups.get(t).copied())
        .collect();
    if values.contains(&TriState::On) {
        TriState::On
    } else if values.contains(&TriState::Off) {
        TriState::Off
    } else {
        TriState::Unset
    }
}

/// Effective tri-state of one host after all three layers. A network set
/// `off` contributes nothing, so its hosts fall through to the global default.
pub fn effective_state(
    host: &HostRecord,
    networks: &BTreeMap<String, TriState>,
    groups: &BTreeMap<String, TriState>,
) -> TriState {
    let network = host
        .network
        .as_ref()
        .and_then(|n| networks.get(n).copied())
        .filter(|v| *v != TriState::Off)
        .unwrap_or_default();
    host.policy.or(group_value(host, groups).or(network))
}

/// Hosts selected by `policy`, in inventory order.
pub fn resolve_hosts(
    policy: &ScanPolicy,
    hosts: &[HostRecord],
    networks: &BTreeMap<String, TriState>,
    groups: &BTreeMap<String, TriState>,
) -> Vec<HostId> {
    let mut seen = HashSet::new();
    hosts
        .iter()
        .filter(|h| !h.identity || policy.include_vpn_networks)
        .filter(|h| match effective_state(h, networks, groups) {
            TriState::On => true,
            TriState::Off => false,
            TriState::Unset => policy.state == TriState::On,
        })
        .filter(|h| seen.insert(h.id.clone()))
        .map(|h| h.id.clone())
        .collect()
}

/// Map standard cron weekdays (0-7, Sunday = 0 or 7) onto the 1-7,
/// Sunday = 1 numbering the `cron` crate uses. Names pass through.
fn translate_weekdays(field: &str) -> String {
    fn shift(n: &str) -> Option<u32> {
        n.parse::<u32>().ok().map(|d| d % 7 + 1)
    }

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (item, None),
            };
            let mapped = match range.split_once('-') {
                Some((a, b)) => match (a.parse::<u32>().ok(), b.parse::<u32>().ok()) {
                    // from Sunday or Monday through the trailing Sunday is every day
                    (Some(0 | 1), Some(7)) => "1-7".to_string(),
                    // a trailing Sunday (7) wraps, so spell it as two items
                    (Some(a), Some(7)) if a < 7 => format!("{}-7,1", a + 1),
                    (Some(a), Some(b)) => format!("{}-{}", a % 7 + 1, b % 7 + 1),
                    _ => range.to_string(),
                },
                None => shift(range).map_or_else(|| range.to_string(), |d| d.to_string()),
            };
            match step {
                Some(s) => format!("{mapped}/{s}"),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a 5-field (minute-resolution) or 6/7-field cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, PolicyError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            translate_weekdays(fields[4])
        ),
        6 | 7 => fields.join(" "),
        n => {
            return Err(PolicyError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {n}"),
            })
        }
    };
    Schedule::from_str(&normalized).map_err(|e| PolicyError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Smallest gap between consecutive upcoming firings, in seconds.
pub fn min_interval_secs(schedule: &Schedule, after: DateTime<Utc>) -> Option<i64> {
    let firings: Vec<DateTime<Utc>> = schedule.after(&after).take(CRON_SAMPLES).collect();
    firings
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds())
        .min()
}

/// Parse `expr` and reject it when it can fire more often than `floor`.
pub fn validate_cron(expr: &str, floor: Duration) -> Result<Schedule, PolicyError> {
    let schedule = parse_cron(expr)?;
    if schedule.upcoming(Utc).next().is_none() {
        return Err(PolicyError::InvalidCron {
            expr: expr.to_string(),
            reason: "never fires".to_string(),
        });
    }
    if let Some(interval) = min_interval_secs(&schedule, Utc::now()) {
        let floor_secs = floor.as_secs();
        if interval < floor_secs as i64 {
            return Err(PolicyError::CronTooFrequent {
                expr: expr.to_string(),
                interval_secs: interval,
                floor_secs,
            });
        }
    }
    Ok(schedule)
}

/// Computes scan targets from the inventory.
#[derive(Clone)]
pub struct PolicyResolver {
    inventory: Arc<dyn Inventory>,
}

impl PolicyResolver {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    /// Full policy run fired at `ts`.
    pub async fn resolve(&self, policy: &ScanPolicy, ts: f64) -> ScanTarget {
        let hosts = self.inventory.hosts().await;
        let networks = self.inventory.network_policies().await;
        let groups = self.inventory.group_policies().await;
        let selected = resolve_hosts(policy, &hosts, &networks, &groups);
        debug!(count = selected.len(), "resolved policy scan hosts");
        ScanTarget {
            key: cron_key(ts),
            hosts: selected,
        }
    }

    /// Target of an explicit scan command.
    pub async fn target_for(
        &self,
        kind: ScanKind,
        target: &str,
        policy: &ScanPolicy,
        ts: f64,
    ) -> Result<ScanTarget, PolicyError> {
        if kind == ScanKind::Host && target == ALL_HOSTS_TARGET {
            return Ok(self.resolve(policy, ts).await);
        }

        let hosts = self.inventory.hosts().await;
        let unknown = || PolicyError::UnknownTarget {
            kind: format!("{kind:?}").to_lowercase(),
            target: target.to_string(),
        };
        let members: Vec<HostId> = match kind {
            ScanKind::Host => {
                let id = HostId::new(target);
                if !hosts.iter().any(|h| h.id == id) {
                    return Err(unknown());
                }
                vec![id]
            }
            ScanKind::Intf => {
                let known = self.inventory.network_policies().await.contains_key(target);
                let members = members_where(&hosts, |h| h.network.as_deref() == Some(target));
                if members.is_empty() && !known {
                    return Err(unknown());
                }
                members
            }
            ScanKind::Tag => {
                let known = self.inventory.group_policies().await.contains_key(target);
                let members = members_where(&hosts, |h| h.tags.iter().any(|t| t == target));
                if members.is_empty() && !known {
                    return Err(unknown());
                }
                members
            }
        };
        Ok(ScanTarget {
            key: kind.key_for(target),
            hosts: members,
        })
    }
}

fn members_where(hosts: &[HostRecord], pred: impl Fn(&HostRecord) -> bool) -> Vec<HostId> {
    let mut seen = HashSet::new();
    hosts
        .iter()
        .filter(|h| pred(h))
        .filter(|h| seen.insert(h.id.clone()))
        .map(|h| h.id.clone())
        .collect()
}
