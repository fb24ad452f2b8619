//! Credential dictionary sync.
//!
//! A remote bundle is fetched, compared with the last applied one by sha256,
//! and materialized as per-service `.lst` files next to the probes.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DictionaryError;
use crate::probe::ScanExtras;
use crate::store::{ResultStore, DICT_HASH_KEY, EXTRAS_KEY};

/// Suffixes of generated list files. Anything else in the directory (such as
/// recheck credential files) is left alone.
pub const LIST_SUFFIXES: [&str; 3] = ["_users.lst", "_pwds.lst", "_creds.lst"];

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CredentialPair {
    pub user: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(default)]
    pub passwords: Vec<String>,
    #[serde(default)]
    pub creds: Vec<CredentialPair>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryBundle {
    /// Per-service lists, keyed by lowercase service name.
    #[serde(default)]
    pub custom_creds: BTreeMap<String, CredentialSet>,
    /// Appended to every service's lists.
    #[serde(default)]
    pub common_creds: CredentialSet,
    #[serde(default)]
    pub extras: Option<ScanExtras>,
}

/// Where bundles come from.
#[async_trait]
pub trait DictionarySource: Send + Sync {
    /// Raw bundle JSON, or `None` when no bundle is published.
    async fn fetch(&self) -> Result<Option<String>, DictionaryError>;
}

pub struct HttpDictionarySource {
    client: reqwest::Client,
    url: String,
}

impl HttpDictionarySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl DictionarySource for HttpDictionarySource {
    async fn fetch(&self) -> Result<Option<String>, DictionaryError> {
        let resp = self.client.get(&self.url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.error_for_status()?.text().await?;
        Ok(Some(body))
    }
}

/// Order-preserving union of `first` and `second`.
fn merge<T: Clone + Eq + std::hash::Hash>(first: &[T], second: &[T]) -> Vec<T> {
    let mut seen = HashSet::new();
    first
        .iter()
        .chain(second)
        .filter(|v| seen.insert((*v).clone()))
        .cloned()
        .collect()
}

/// Write `lines` to `dir/name` through a temporary file and a rename.
async fn write_list(dir: &Path, name: &str, lines: &[String]) -> std::io::Result<()> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, dir.join(name)).await
}

/// Write every non-empty list of `bundle` into `dir`; returns the file names.
pub async fn materialize(dir: &Path, bundle: &DictionaryBundle) -> std::io::Result<Vec<String>> {
    let common = &bundle.common_creds;
    let mut written = Vec::new();
    for (service, custom) in &bundle.custom_creds {
        let service = service.to_lowercase();
        let creds: Vec<String> = merge(&custom.creds, &common.creds)
            .into_iter()
            .map(|c| format!("{}/{}", c.user, c.password))
            .collect();
        let lists = [
            ("users", merge(&custom.usernames, &common.usernames)),
            ("pwds", merge(&custom.passwords, &common.passwords)),
            ("creds", creds),
        ];
        for (kind, lines) in lists {
            if lines.is_empty() {
                continue;
            }
            let name = format!("{service}_{kind}.lst");
            write_list(dir, &name, &lines).await?;
            written.push(name);
        }
    }
    Ok(written)
}

/// Sorted names of regular files in `dir` ending in `suffix`. A missing
/// directory has none.
pub async fn list_suffix_files(dir: &Path, suffix: &str) -> std::io::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(suffix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Delete files ending in `suffix` that are not in `keep`; returns the
/// deleted names.
pub async fn clean_diff_files(dir: &Path, suffix: &str, keep: &[String]) -> std::io::Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in list_suffix_files(dir, suffix).await? {
        if keep.contains(&name) {
            continue;
        }
        fs::remove_file(dir.join(&name)).await?;
        removed.push(name);
    }
    Ok(removed)
}

/// Form definitions last distributed with the dictionary.
pub async fn load_extras(store: &ResultStore) -> ScanExtras {
    store.get_json(EXTRAS_KEY).await.unwrap_or_default()
}

pub async fn save_extras(store: &ResultStore, extras: Option<&ScanExtras>) -> Result<(), DictionaryError> {
    match extras {
        Some(extras) if !extras.is_empty() => store.put_json(EXTRAS_KEY, extras, None).await?,
        _ => store.kv().delete(EXTRAS_KEY).await?,
    }
    Ok(())
}

pub struct DictionarySync {
    source: Arc<dyn DictionarySource>,
    dir: PathBuf,
    store: ResultStore,
}

impl DictionarySync {
    pub fn new(source: Arc<dyn DictionarySource>, dir: impl Into<PathBuf>, store: ResultStore) -> Self {
        Self {
            source,
            dir: dir.into(),
            store,
        }
    }

    /// Fetch and apply the bundle if it changed. Returns whether files were
    /// rewritten.
    pub async fn sync(&self) -> Result<bool, DictionaryError> {
        let Some(raw) = self.source.fetch().await? else {
            debug!("no dictionary bundle published");
            return Ok(false);
        };
        let hash = hex::encode(Sha256::digest(raw.as_bytes()));
        if self.store.kv().get(DICT_HASH_KEY).await?.as_deref() == Some(hash.as_str()) {
            debug!(%hash, "dictionary unchanged");
            return Ok(false);
        }

        let bundle: DictionaryBundle = serde_json::from_str(&raw)?;
        self.apply(&bundle).await?;
        self.store.kv().set(DICT_HASH_KEY, hash.clone(), None).await?;
        info!(%hash, services = bundle.custom_creds.len(), "dictionary updated");
        Ok(true)
    }

    /// Materialize `bundle`, drop lists it no longer produces and store its
    /// extras.
    pub async fn apply(&self, bundle: &DictionaryBundle) -> Result<(), DictionaryError> {
        fs::create_dir_all(&self.dir).await?;
        let written = materialize(&self.dir, bundle).await?;
        for suffix in LIST_SUFFIXES {
            let removed = clean_diff_files(&self.dir, suffix, &written).await?;
            if !removed.is_empty() {
                debug!(?removed, "removed stale dictionary files");
            }
        }
        save_extras(&self.store, bundle.extras.as_ref()).await
    }

    /// Remove every generated list and the stored extras and hash.
    pub async fn cleanup(&self) -> Result<(), DictionaryError> {
        for suffix in LIST_SUFFIXES {
            clean_diff_files(&self.dir, suffix, &[]).await?;
        }
        self.store.kv().delete(EXTRAS_KEY).await?;
        self.store.kv().delete(DICT_HASH_KEY).await?;
        Ok(())
    }

    /// Sync every `every` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(error = %e, "dictionary sync failed");
                    }
                }
            }
        }
    }
}
