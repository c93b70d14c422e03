//! Checkpoint cache for executable invocations
//!
//! Every checkpointed call computes a key from the executable name and the
//! canonical JSON of its arguments (after structured-value unwrapping);
//! timestamps and environment state never enter the key. The cache is a
//! plain-JSON directory, one file per key, under `<cache_root>/<script>/`.
//!
//! `--resume` invalidates entries before a run. Targets:
//! `@fn` (every call site), `@fn:idx` (one site), `@fn("prefix")` (fuzzy
//! match on the first argument, invalidating from the first match onward),
//! `"name"` (named checkpoint; exact match wins over prefix, ambiguous
//! prefixes fail). `--fork` seeds reads from another script's cache while
//! writing misses locally.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MlldError;
use crate::platform::FileSystem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub key: String,
    pub fn_name: String,
    pub args: serde_json::Value,
    pub output: String,
    pub created_at: String,
    /// Order of first execution within the script, per function
    pub site_index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub named_checkpoints: Vec<String>,
}

/// A parsed `--resume` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    /// `@fn`: all call sites
    AllSites(String),
    /// `@fn:idx`: one call site
    Site(String, usize),
    /// `@fn("prefix")`: first-argument prefix, first match onward
    Prefix(String, String),
    /// `"name"`: named checkpoint
    Named(String),
    /// Bare `--resume`: everything
    Everything,
}

impl ResumeTarget {
    pub fn parse(raw: &str) -> Result<Self, MlldError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(ResumeTarget::Everything);
        }
        let Some(rest) = raw.strip_prefix('@') else {
            let name = raw.trim_matches('"').trim_matches('\'');
            return Ok(ResumeTarget::Named(name.to_string()));
        };
        if let Some((name, arg)) = rest.split_once('(') {
            let arg = arg
                .strip_suffix(')')
                .ok_or_else(|| MlldError::execution(format!("malformed resume target {raw}")))?;
            let arg = arg.trim().trim_matches('"').trim_matches('\'');
            return Ok(ResumeTarget::Prefix(name.to_string(), arg.to_string()));
        }
        if let Some((name, idx)) = rest.split_once(':') {
            let idx: usize = idx
                .parse()
                .map_err(|_| MlldError::execution(format!("malformed resume target {raw}")))?;
            return Ok(ResumeTarget::Site(name.to_string(), idx));
        }
        Ok(ResumeTarget::AllSites(rest.to_string()))
    }
}

pub struct CheckpointManager {
    fs: Rc<dyn FileSystem>,
    root: PathBuf,
    entries: FxHashMap<String, CheckpointEntry>,
    /// Read-only entries seeded by `--fork`
    forked: FxHashMap<String, CheckpointEntry>,
    /// Next site index per function for this run
    site_counters: FxHashMap<String, usize>,
}

impl CheckpointManager {
    /// Open (or create) the cache for one script
    pub fn open(fs: Rc<dyn FileSystem>, cache_root: &Path, script: &str) -> Self {
        let root = cache_root.join(script);
        let entries = Self::load_dir(fs.as_ref(), &root);
        Self {
            fs,
            root,
            entries,
            forked: FxHashMap::default(),
            site_counters: FxHashMap::default(),
        }
    }

    fn load_dir(fs: &dyn FileSystem, root: &Path) -> FxHashMap<String, CheckpointEntry> {
        let mut out = FxHashMap::default();
        let Ok(files) = fs.glob(root, "*.json") else {
            return out;
        };
        for file in files {
            let Ok(text) = fs.read_to_string(&file) else {
                continue;
            };
            if let Ok(entry) = serde_json::from_str::<CheckpointEntry>(&text) {
                out.insert(entry.key.clone(), entry);
            }
        }
        out
    }

    /// Seed reads from another script's cache; its entries are never written
    pub fn fork_from(&mut self, cache_root: &Path, other_script: &str) {
        let other = cache_root.join(other_script);
        self.forked = Self::load_dir(self.fs.as_ref(), &other);
    }

    /// `H(name, canonical_args)`
    pub fn cache_key(fn_name: &str, canonical_args: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fn_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_args.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn lookup(&self, fn_name: &str, canonical_args: &str) -> Option<String> {
        let key = Self::cache_key(fn_name, canonical_args);
        self.entries
            .get(&key)
            .or_else(|| self.forked.get(&key))
            .map(|e| e.output.clone())
    }

    pub fn store(
        &mut self,
        fn_name: &str,
        args: serde_json::Value,
        canonical_args: &str,
        output: &str,
        created_at: &str,
    ) -> Result<(), MlldError> {
        let key = Self::cache_key(fn_name, canonical_args);
        let counter = self.site_counters.entry(fn_name.to_string()).or_insert(0);
        let site_index = *counter;
        *counter += 1;
        let entry = CheckpointEntry {
            key: key.clone(),
            fn_name: fn_name.to_string(),
            args,
            output: output.to_string(),
            created_at: created_at.to_string(),
            site_index,
            named_checkpoints: Vec::new(),
        };
        self.persist(&entry)?;
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Attach a `/checkpoint "name"` label to the most recent entry
    pub fn name_latest(&mut self, name: &str) -> Result<(), MlldError> {
        let latest = self
            .entries
            .values_mut()
            .max_by_key(|e| (e.site_index, e.created_at.clone()));
        let Some(entry) = latest else {
            return Ok(());
        };
        if !entry.named_checkpoints.iter().any(|n| n == name) {
            entry.named_checkpoints.push(name.to_string());
        }
        let entry = entry.clone();
        self.persist(&entry)
    }

    fn persist(&self, entry: &CheckpointEntry) -> Result<(), MlldError> {
        let path = self.root.join(format!("{}.json", entry.key));
        let text = serde_json::to_string_pretty(entry)
            .map_err(|e| MlldError::internal(format!("checkpoint serialization: {e}")))?;
        self.fs.write(&path, &text)
    }

    /// Apply a `--resume` target, removing matching entries. Returns how
    /// many entries were invalidated.
    pub fn invalidate(&mut self, target: &ResumeTarget) -> Result<usize, MlldError> {
        let keys: Vec<String> = match target {
            ResumeTarget::Everything => self.entries.keys().cloned().collect(),
            ResumeTarget::AllSites(fn_name) => self
                .entries
                .values()
                .filter(|e| &e.fn_name == fn_name)
                .map(|e| e.key.clone())
                .collect(),
            ResumeTarget::Site(fn_name, idx) => self
                .entries
                .values()
                .filter(|e| &e.fn_name == fn_name && e.site_index == *idx)
                .map(|e| e.key.clone())
                .collect(),
            ResumeTarget::Prefix(fn_name, prefix) => {
                let mut sites: Vec<&CheckpointEntry> = self
                    .entries
                    .values()
                    .filter(|e| &e.fn_name == fn_name)
                    .collect();
                sites.sort_by_key(|e| e.site_index);
                let first_match = sites.iter().position(|e| first_arg_matches(e, prefix));
                match first_match {
                    Some(at) => sites.iter().skip(at).map(|e| e.key.clone()).collect(),
                    None => Vec::new(),
                }
            }
            ResumeTarget::Named(name) => {
                let exact: Vec<String> = self
                    .entries
                    .values()
                    .filter(|e| e.named_checkpoints.iter().any(|n| n == name))
                    .map(|e| e.key.clone())
                    .collect();
                if !exact.is_empty() {
                    exact
                } else {
                    let by_prefix: Vec<String> = self
                        .entries
                        .values()
                        .filter(|e| e.named_checkpoints.iter().any(|n| n.starts_with(name)))
                        .map(|e| e.key.clone())
                        .collect();
                    let distinct: std::collections::BTreeSet<&str> = self
                        .entries
                        .values()
                        .flat_map(|e| e.named_checkpoints.iter())
                        .filter(|n| n.starts_with(name))
                        .map(String::as_str)
                        .collect();
                    if distinct.len() > 1 {
                        return Err(MlldError::execution(format!(
                            "ambiguous checkpoint name '{name}': matches {}",
                            distinct.into_iter().collect::<Vec<_>>().join(", ")
                        )));
                    }
                    by_prefix
                }
            }
        };
        for key in &keys {
            self.entries.remove(key);
            // Stale cache files are overwritten on the next store with the
            // same key; removal from the in-memory map is what disables hits
        }
        Ok(keys.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn first_arg_matches(entry: &CheckpointEntry, prefix: &str) -> bool {
    match entry.args.as_array().and_then(|a| a.first()) {
        Some(serde_json::Value::String(s)) => s.starts_with(prefix),
        Some(other) => other.to_string().starts_with(prefix),
        None => false,
    }
}
