//! Host probe execution: invocation generation, recheck and early abort.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ScriptConfig, ServiceConfig, ServiceTable};
use crate::dictionary;
use crate::error::ProbeError;
use crate::inventory::Inventory;
use crate::parser::parse_credentials;
use crate::runner::ProbeRunner;
use crate::store::ResultStore;
use crate::types::{Credential, Finding, HostId};

/// Script whose form definitions multiply into separate invocations.
pub const FORM_SCRIPT: &str = "http-form-brute";
const STRICT_HTTP_SCRIPT: &str = "http-brute";

/// One login form to try with `http-form-brute`. An empty definition means
/// the script's own form detection.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FormExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uservar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passvar: Option<String>,
}

impl FormExtra {
    fn script_args(&self) -> Vec<String> {
        [
            ("path", &self.path),
            ("method", &self.method),
            ("uservar", &self.uservar),
            ("passvar", &self.passvar),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value
                .as_ref()
                .map(|v| format!("{FORM_SCRIPT}.{field}={v}"))
        })
        .collect()
    }
}

/// Extra per-script settings distributed with the dictionary, keyed by
/// script name.
pub type ScanExtras = BTreeMap<String, Vec<FormExtra>>;

/// One copy of `base` per form definition, each extended with that form's
/// arguments.
pub fn multiply_script_args(base: &[String], forms: &[FormExtra]) -> Vec<Vec<String>> {
    forms
        .iter()
        .map(|form| {
            let mut args = base.to_vec();
            args.extend(form.script_args());
            args
        })
        .collect()
}

/// Argument vector for one nmap run. Each `cmd_args` entry may hold several
/// whitespace-separated flags.
pub fn format_nmap_args(ip: &str, port: u16, cmd_args: &[String], script_args: &[String]) -> Vec<String> {
    let mut args = vec!["-n".to_string(), "-p".to_string(), port.to_string()];
    args.extend(
        cmd_args
            .iter()
            .flat_map(|a| a.split_whitespace())
            .map(String::from),
    );
    if !script_args.is_empty() {
        args.push("--script-args".to_string());
        args.push(script_args.join(","));
    }
    args.push(ip.to_string());
    args.extend(["-oX".to_string(), "-".to_string()]);
    args
}

/// A single planned probe run against one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub script_name: String,
    pub port: u16,
    pub other_args: Option<String>,
    pub script_args: Vec<String>,
}

impl Invocation {
    pub fn to_args(&self, ip: &str) -> Vec<String> {
        let mut cmd = vec![format!("--script {}", self.script_name)];
        cmd.extend(self.other_args.clone());
        format_nmap_args(ip, self.port, &cmd, &self.script_args)
    }

    /// Space-joined form of [`Invocation::to_args`], for logs.
    pub fn command_line(&self, ip: &str) -> String {
        self.to_args(ip).join(" ")
    }
}

/// Generates invocations for the default, credential-file and
/// user/password-file categories.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    dict_dir: PathBuf,
    custom_scripts_dir: PathBuf,
    strict_http: bool,
}

impl CommandBuilder {
    pub fn new(dict_dir: impl Into<PathBuf>, custom_scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            dict_dir: dict_dir.into(),
            custom_scripts_dir: custom_scripts_dir.into(),
            strict_http: false,
        }
    }

    pub fn strict_http(mut self, strict: bool) -> Self {
        self.strict_http = strict;
        self
    }

    pub fn dict_dir(&self) -> &Path {
        &self.dict_dir
    }

    fn dict_file(&self, service_name: &str, suffix: &str) -> PathBuf {
        self.dict_dir
            .join(format!("{}_{suffix}.lst", service_name.to_lowercase()))
    }

    fn expand(
        script: &ScriptConfig,
        script_name: &str,
        port: u16,
        category_args: &[String],
        forms: Option<&[FormExtra]>,
    ) -> Vec<Invocation> {
        let mut base: Vec<String> = script.script_args.iter().cloned().collect();
        base.extend(category_args.iter().cloned());
        let sets = match forms {
            Some(forms) if script.script_name == FORM_SCRIPT && !forms.is_empty() => {
                multiply_script_args(&base, forms)
            }
            _ => vec![base],
        };
        sets.into_iter()
            .map(|script_args| Invocation {
                script_name: script_name.to_string(),
                port,
                other_args: script.other_args.clone(),
                script_args,
            })
            .collect()
    }

    /// Built-in wordlists of each script.
    pub fn default_invocations(
        &self,
        port: u16,
        scripts: &[ScriptConfig],
        forms: Option<&[FormExtra]>,
    ) -> Vec<Invocation> {
        scripts
            .iter()
            .flat_map(|script| {
                let name = if self.strict_http && script.script_name == STRICT_HTTP_SCRIPT {
                    self.custom_scripts_dir
                        .join(format!("{STRICT_HTTP_SCRIPT}.nse"))
                        .display()
                        .to_string()
                } else {
                    script.script_name.clone()
                };
                Self::expand(script, &name, port, &[], forms)
            })
            .collect()
    }

    /// Generated `<service>_creds.lst`, when present.
    pub async fn credfile_invocations(
        &self,
        port: u16,
        service_name: &str,
        scripts: &[ScriptConfig],
        forms: Option<&[FormExtra]>,
    ) -> Vec<Invocation> {
        let creds = self.dict_file(service_name, "creds");
        if !file_exists(&creds).await {
            return Vec::new();
        }
        let category = vec![format!(
            "brute.mode=creds,brute.credfile={}",
            creds.display()
        )];
        scripts
            .iter()
            .filter(|s| s.is_brute())
            .flat_map(|s| Self::expand(s, &s.script_name, port, &category, forms))
            .collect()
    }

    /// Generated `<service>_users.lst` / `<service>_pwds.lst`, when either is
    /// present.
    pub async fn userpass_invocations(
        &self,
        port: u16,
        service_name: &str,
        scripts: &[ScriptConfig],
        forms: Option<&[FormExtra]>,
    ) -> Vec<Invocation> {
        let users = self.dict_file(service_name, "users");
        let pwds = self.dict_file(service_name, "pwds");
        let mut category = Vec::new();
        if file_exists(&users).await {
            category.push(format!("userdb={}", users.display()));
        }
        if file_exists(&pwds).await {
            category.push(format!("passdb={}", pwds.display()));
        }
        if category.is_empty() {
            return Vec::new();
        }
        let category = vec![category.join(",")];
        scripts
            .iter()
            .filter(|s| s.is_brute())
            .flat_map(|s| Self::expand(s, &s.script_name, port, &category, forms))
            .collect()
    }

    /// Every invocation for one service, categories in order.
    pub async fn invocations(&self, service: &ServiceConfig, forms: Option<&[FormExtra]>) -> Vec<Invocation> {
        let mut all = self.default_invocations(service.port, &service.scripts, forms);
        all.extend(
            self.credfile_invocations(service.port, &service.service_name, &service.scripts, forms)
                .await,
        );
        all.extend(
            self.userpass_invocations(service.port, &service.service_name, &service.scripts, forms)
                .await,
        );
        all
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Scans one host and returns its findings. Cancelling the token aborts the
/// scan and yields what was found so far.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn scan(&self, host: &HostId, cancel: CancellationToken) -> Vec<Finding>;
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub probe_timeout: Duration,
    pub recheck_timeout: Duration,
    pub skip_verify: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5430),
            recheck_timeout: Duration::from_secs(60),
            skip_verify: false,
        }
    }
}

pub struct NmapHostProbe {
    runner: Arc<dyn ProbeRunner>,
    inventory: Arc<dyn Inventory>,
    store: ResultStore,
    builder: CommandBuilder,
    services: ServiceTable,
    settings: ProbeSettings,
}

impl NmapHostProbe {
    pub fn new(
        runner: Arc<dyn ProbeRunner>,
        inventory: Arc<dyn Inventory>,
        store: ResultStore,
        builder: CommandBuilder,
        services: ServiceTable,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            runner,
            inventory,
            store,
            builder,
            services,
            settings,
        }
    }

    /// Single-address entries only; ranges belong to other peers. Devices
    /// keyed by MAC are probed on their IPv4 address.
    async fn addresses(&self, host: &HostId) -> Vec<IpAddr> {
        let ipv4_only = host.is_mac();
        let mut seen = HashSet::new();
        self.inventory
            .resolve_addresses(host)
            .await
            .into_iter()
            .filter(|net| net.prefix_len() == net.max_prefix_len())
            .map(|net| net.addr())
            .filter(|ip| !ipv4_only || ip.is_ipv4())
            .filter(|ip| seen.insert(*ip))
            .collect()
    }

    async fn run_invocation(
        &self,
        ip: &str,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<Vec<Credential>, ProbeError> {
        let started = Instant::now();
        let output = self
            .runner
            .run(&invocation.to_args(ip), self.settings.probe_timeout, cancel)
            .await?;
        let candidates = parse_credentials(&output, &invocation.script_name)?;
        debug!(
            ip,
            script = %invocation.script_name,
            elapsed = ?started.elapsed(),
            candidates = candidates.len(),
            "probe finished"
        );

        if self.settings.skip_verify || !invocation.script_name.contains("brute") {
            return Ok(candidates);
        }
        let mut confirmed = Vec::with_capacity(candidates.len());
        for cred in candidates {
            if self.recheck(ip, invocation, &cred, cancel).await? {
                confirmed.push(cred);
            } else {
                info!(ip, port = invocation.port, username = %cred.username, "discarding unconfirmed credential");
            }
        }
        Ok(confirmed)
    }

    /// Re-run the script against exactly one credential pair.
    async fn recheck(
        &self,
        ip: &str,
        invocation: &Invocation,
        cred: &Credential,
        cancel: &CancellationToken,
    ) -> Result<bool, ProbeError> {
        let file = self
            .builder
            .dict_dir()
            .join(format!("{ip}_{}_credentials.lst", invocation.port));
        tokio::fs::write(&file, format!("{}/{}\n", cred.username, cred.password)).await?;

        // the form being attacked must stay the same for the check to confirm
        let mut script_args = vec![format!("brute.mode=creds,brute.credfile={}", file.display())];
        script_args.extend(
            invocation
                .script_args
                .iter()
                .filter(|a| a.strip_prefix(FORM_SCRIPT).is_some_and(|rest| rest.starts_with('.')))
                .cloned(),
        );
        let check = Invocation {
            script_name: invocation.script_name.clone(),
            port: invocation.port,
            other_args: invocation.other_args.clone(),
            script_args,
        };
        let outcome = self
            .runner
            .run(&check.to_args(ip), self.settings.recheck_timeout, cancel)
            .await
            .and_then(|out| parse_credentials(&out, &check.script_name));
        if let Err(e) = tokio::fs::remove_file(&file).await {
            debug!(file = %file.display(), error = %e, "failed to remove recheck file");
        }

        match outcome {
            Ok(found) => Ok(found.contains(cred)),
            Err(ProbeError::Cancelled) => Err(ProbeError::Cancelled),
            Err(e) => {
                warn!(ip, port = invocation.port, error = %e, "recheck failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl HostProbe for NmapHostProbe {
    async fn scan(&self, host: &HostId, cancel: CancellationToken) -> Vec<Finding> {
        let ips = self.addresses(host).await;
        if ips.is_empty() {
            info!(%host, "no scannable address for host");
            return Vec::new();
        }
        let extras = dictionary::load_extras(&self.store).await;
        let forms = extras.get(FORM_SCRIPT).map(Vec::as_slice);

        let mut seen = HashSet::new();
        let mut findings = Vec::new();
        'scan: for ip in ips {
            let ip = ip.to_string();
            for service in self.services.values() {
                for invocation in self.builder.invocations(service, forms).await {
                    if cancel.is_cancelled() {
                        info!(%host, "host has no subscribers left, aborting scan");
                        break 'scan;
                    }
                    match self.run_invocation(&ip, &invocation, &cancel).await {
                        Ok(creds) => {
                            for cred in creds {
                                let finding = Finding {
                                    protocol: service.protocol.clone(),
                                    port: service.port,
                                    service_name: service.service_name.clone(),
                                    username: cred.username,
                                    password: cred.password,
                                };
                                if seen.insert(finding.clone()) {
                                    findings.push(finding);
                                }
                            }
                        }
                        Err(ProbeError::Cancelled) => {
                            info!(%host, "probe terminated, returning partial results");
                            break 'scan;
                        }
                        Err(e) => {
                            warn!(%host, ip = %ip, script = %invocation.script_name, error = %e, "probe invocation failed");
                        }
                    }
                }
            }
        }
        info!(%host, findings = findings.len(), "host scan finished");
        findings
    }
}
