use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Upper bound of host probes running at once.
pub const MAX_CONCURRENT_TASKS: usize = 3;

/// One probe script run against a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    pub script_name: String,
    /// Raw `--script-args` fragment, e.g. `unpwdb.timelimit=60m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_args: Option<String>,
    /// Extra command-line flags placed after the script name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_args: Option<String>,
}

impl ScriptConfig {
    pub fn new(script_name: &str) -> Self {
        Self {
            script_name: script_name.to_string(),
            script_args: None,
            other_args: None,
        }
    }

    pub fn with_script_args(mut self, args: &str) -> Self {
        self.script_args = Some(args.to_string());
        self
    }

    pub fn with_other_args(mut self, args: &str) -> Self {
        self.other_args = Some(args.to_string());
        self
    }

    /// Brute scripts accept dictionaries and can be rechecked.
    pub fn is_brute(&self) -> bool {
        self.script_name.contains("brute")
    }
}

/// A port/service pair and the scripts probing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub service_name: String,
    pub protocol: String,
    pub port: u16,
    pub scripts: Vec<ScriptConfig>,
}

/// Services keyed `<protocol>_<port>`, e.g. `tcp_23`.
pub type ServiceTable = BTreeMap<String, ServiceConfig>;

/// Built-in table: telnet, ssh, ftp, http, mysql and redis.
pub fn default_service_table() -> ServiceTable {
    let limit = "unpwdb.timelimit=90m,brute.firstonly=true";
    let services = [
        ServiceConfig {
            service_name: "FTP".into(),
            protocol: "tcp".into(),
            port: 21,
            scripts: vec![ScriptConfig::new("ftp-brute").with_script_args(limit)],
        },
        ServiceConfig {
            service_name: "SSH".into(),
            protocol: "tcp".into(),
            port: 22,
            scripts: vec![ScriptConfig::new("ssh-brute").with_script_args(limit)],
        },
        ServiceConfig {
            service_name: "TELNET".into(),
            protocol: "tcp".into(),
            port: 23,
            scripts: vec![ScriptConfig::new("telnet-brute")
                .with_script_args(limit)
                .with_other_args("-v")],
        },
        ServiceConfig {
            service_name: "HTTP".into(),
            protocol: "tcp".into(),
            port: 80,
            scripts: vec![
                ScriptConfig::new("http-brute").with_script_args(limit),
                ScriptConfig::new("http-form-brute").with_script_args(limit),
            ],
        },
        ServiceConfig {
            service_name: "MYSQL".into(),
            protocol: "tcp".into(),
            port: 3306,
            scripts: vec![ScriptConfig::new("mysql-brute").with_script_args(limit)],
        },
        ServiceConfig {
            service_name: "REDIS".into(),
            protocol: "tcp".into(),
            port: 6379,
            scripts: vec![
                ScriptConfig::new("redis-info"),
                ScriptConfig::new("redis-brute").with_script_args(limit),
            ],
        },
    ];
    services
        .into_iter()
        .map(|s| (format!("{}_{}", s.protocol, s.port), s))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind: String,
    pub nmap_path: PathBuf,
    pub dict_dir: PathBuf,
    pub custom_scripts_dir: PathBuf,
    pub dictionary_url: Option<String>,
    pub inventory_path: PathBuf,
    /// Persisted scan state. `null` keeps everything in memory, so nothing
    /// survives a restart.
    pub store_path: Option<PathBuf>,
    pub max_concurrent_tasks: usize,
    pub probe_timeout_secs: u64,
    pub recheck_timeout_secs: u64,
    pub skip_verify: bool,
    pub strict_http: bool,
    pub cron_floor_secs: u64,
    pub max_tasks: usize,
    pub task_retention_days: u64,
    pub host_result_ttl_secs: u64,
    pub max_result_size: usize,
    pub schedule_wait_secs: u64,
    pub stop_wait_secs: u64,
    pub dictionary_sync_secs: u64,
    pub services: ServiceTable,
}

impl AppConfig {
    /// Load from `path` (or `CRED_SCAN_CONFIG`, or `cred-scan.json`), then
    /// apply `CS_*` environment overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| {
            env::var("CRED_SCAN_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cred-scan.json"))
        });
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("CS_BIND") {
            self.bind = v;
        }
        if let Ok(v) = env::var("CS_NMAP_PATH") {
            self.nmap_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CS_DICT_DIR") {
            self.dict_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CS_DICTIONARY_URL") {
            self.dictionary_url = Some(v);
        }
        if let Ok(v) = env::var("CS_INVENTORY") {
            self.inventory_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CS_STORE_PATH") {
            self.store_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Ok(v) = env::var("CS_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = v.parse().unwrap_or(self.max_concurrent_tasks);
        }
        if let Ok(v) = env::var("CS_SKIP_VERIFY") {
            self.skip_verify = v.parse().unwrap_or(self.skip_verify);
        }
        if let Ok(v) = env::var("CS_STRICT_HTTP") {
            self.strict_http = v.parse().unwrap_or(self.strict_http);
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn recheck_timeout(&self) -> Duration {
        Duration::from_secs(self.recheck_timeout_secs)
    }

    pub fn cron_floor(&self) -> Duration {
        Duration::from_secs(self.cron_floor_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_days * 24 * 60 * 60)
    }

    pub fn host_result_ttl(&self) -> Duration {
        Duration::from_secs(self.host_result_ttl_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8833".to_string(),
            nmap_path: PathBuf::from("nmap"),
            dict_dir: PathBuf::from("run/scan_config"),
            custom_scripts_dir: PathBuf::from("extension/nmap/scripts"),
            dictionary_url: None,
            inventory_path: PathBuf::from("inventory.json"),
            store_path: Some(PathBuf::from("run/cred-scan-state.json")),
            max_concurrent_tasks: MAX_CONCURRENT_TASKS,
            probe_timeout_secs: 5430,
            recheck_timeout_secs: 60,
            skip_verify: false,
            strict_http: false,
            cron_floor_secs: 24 * 60 * 60,
            max_tasks: 10,
            task_retention_days: 30,
            host_result_ttl_secs: 30 * 24 * 60 * 60,
            max_result_size: 100,
            schedule_wait_secs: 5,
            stop_wait_secs: 10,
            dictionary_sync_secs: 24 * 60 * 60,
            services: default_service_table(),
        }
    }
}
