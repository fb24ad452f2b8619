//! Extraction of discovered credentials from nmap XML output (`-oX -`).

use serde::Deserialize;

use crate::error::ProbeError;
use crate::types::Credential;

/// Scripts that report unauthenticated access through the service version
/// instead of an accounts table.
const VERSION_REPORTING_SCRIPTS: &[&str] = &["redis-info"];

#[derive(Debug, Deserialize, Default)]
struct NmapRun {
    #[serde(default)]
    host: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct Host {
    #[serde(default)]
    ports: Option<Ports>,
}

#[derive(Debug, Deserialize)]
struct Ports {
    #[serde(default)]
    port: Vec<Port>,
}

#[derive(Debug, Deserialize)]
struct Port {
    #[serde(default)]
    service: Option<Service>,
    #[serde(default)]
    script: Vec<Script>,
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(rename = "@version", default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Script {
    #[serde(rename = "@id")]
    id: String,
    #[serde(default)]
    table: Vec<Table>,
    #[serde(default)]
    elem: Vec<Elem>,
}

#[derive(Debug, Deserialize)]
struct Table {
    #[serde(default)]
    table: Vec<Table>,
    #[serde(default)]
    elem: Vec<Elem>,
}

#[derive(Debug, Deserialize)]
struct Elem {
    #[serde(rename = "@key", default)]
    key: Option<String>,
    #[serde(rename = "$text", default)]
    value: String,
}

impl Table {
    fn value(&self, key: &str) -> Option<&str> {
        self.elem
            .iter()
            .find(|e| e.key.as_deref() == Some(key))
            .map(|e| e.value.as_str())
    }

    /// Depth-first: every table carrying both a username and a password.
    fn collect_accounts(&self, out: &mut Vec<Credential>) {
        if let (Some(user), Some(pass)) = (self.value("username"), self.value("password")) {
            out.push(Credential::new(normalize(user), normalize(pass)));
        }
        for t in &self.table {
            t.collect_accounts(out);
        }
    }
}

fn normalize(value: &str) -> &str {
    let value = value.trim();
    if value == "<empty>" {
        ""
    } else {
        value
    }
}

/// `/path/to/http-brute.nse` and `http-brute` name the same script.
fn script_id(name: &str) -> &str {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.strip_suffix(".nse").unwrap_or(base)
}

/// Credentials reported by `script_name` in `xml`.
///
/// Version-reporting scripts yield a single empty credential when the
/// service answered with its version, meaning it accepts anonymous access.
pub fn parse_credentials(xml: &str, script_name: &str) -> Result<Vec<Credential>, ProbeError> {
    let run: NmapRun = quick_xml::de::from_str(xml).map_err(|e| ProbeError::Parse(e.to_string()))?;
    let wanted = script_id(script_name);
    let by_version = VERSION_REPORTING_SCRIPTS.contains(&wanted);

    let mut creds = Vec::new();
    let ports = run
        .host
        .iter()
        .filter_map(|h| h.ports.as_ref())
        .flat_map(|p| p.port.iter());
    for port in ports {
        if by_version {
            let service_version = port
                .service
                .as_ref()
                .and_then(|s| s.version.as_deref())
                .is_some_and(|v| !v.is_empty());
            let script_version = port
                .script
                .iter()
                .filter(|s| script_id(&s.id) == wanted)
                .flat_map(|s| s.elem.iter())
                .any(|e| e.key.as_deref() == Some("Version"));
            if service_version || script_version {
                creds.push(Credential::new("", ""));
            }
            continue;
        }
        for script in port.script.iter().filter(|s| script_id(&s.id) == wanted) {
            for table in &script.table {
                table.collect_accounts(&mut creds);
            }
        }
    }
    Ok(creds)
}
