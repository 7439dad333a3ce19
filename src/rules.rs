use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use tracing::{debug, info, warn};

pub const STORAGE_KEY: &str = "replacements";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub original: String,
    pub replacement: String,
    #[serde(rename = "hostname")]
    pub site: String,
    pub selector: String,
}

impl Rule {
    pub fn new(original: &str, replacement: &str, site: &str, selector: &str) -> Self {
        Self {
            original: original.to_string(),
            replacement: replacement.to_string(),
            site: site.to_string(),
            selector: selector.to_string(),
        }
    }

    /// Same (site, selector, original) triple.
    pub fn same_target(&self, other: &Rule) -> bool {
        self.site == other.site && self.selector == other.selector && self.original == other.original
    }
}

pub trait Storage {
    fn load(&self) -> Result<Vec<Rule>>;
    fn save(&self, rules: &[Rule]) -> Result<()>;
}

/// JSON file holding `{"replacements": [...]}`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::data_dir().context("Could not determine data directory")?;
        Ok(base.join("retext").join("replacements.json"))
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Vec<Rule>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        let Some(entries) = value.get(STORAGE_KEY).and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        let mut rules = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            match Rule::deserialize(entry) {
                Ok(rule) => rules.push(rule),
                Err(err) => warn!(idx, %err, "skipping malformed stored rule"),
            }
        }
        Ok(rules)
    }

    fn save(&self, rules: &[Rule]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let text = serde_json::to_string_pretty(&serde_json::json!({ STORAGE_KEY: rules }))
            .context("Failed to serialize rules")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(text.as_bytes())
            .context("Failed to write rules")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = rules.len(), "rules saved");
        Ok(())
    }
}

/// In-process storage; clones share the same backing list.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    rules: std::rc::Rc<std::cell::RefCell<Vec<Rule>>>,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn snapshot(&self) -> Vec<Rule> {
        self.rules.borrow().clone()
    }
}

#[cfg(test)]
impl Storage for MemoryStorage {
    fn load(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.borrow().clone())
    }

    fn save(&self, rules: &[Rule]) -> Result<()> {
        *self.rules.borrow_mut() = rules.to_vec();
        Ok(())
    }
}

/// Working set of rules for this session, mirrored to `Storage` after every
/// change.
pub struct RuleStore {
    rules: Vec<Rule>,
    storage: Box<dyn Storage>,
}

impl RuleStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            rules: Vec::new(),
            storage,
        }
    }

    pub fn load(&mut self) -> Result<usize> {
        self.rules = self.storage.load()?;
        info!(count = self.rules.len(), "rules loaded");
        Ok(self.rules.len())
    }

    pub fn save(&self) -> Result<()> {
        self.storage.save(&self.rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Replaces the rule with the same triple or appends. Returns its index.
    pub fn upsert(&mut self, rule: Rule) -> Result<usize> {
        let index = match self.rules.iter().position(|r| r.same_target(&rule)) {
            Some(idx) => {
                self.rules[idx] = rule;
                idx
            }
            None => {
                self.rules.push(rule);
                self.rules.len() - 1
            }
        };
        self.save()?;
        Ok(index)
    }

    /// `Ok(None)` when the index no longer exists.
    pub fn remove(&mut self, index: usize) -> Result<Option<Rule>> {
        if index >= self.rules.len() {
            return Ok(None);
        }
        let removed = self.rules.remove(index);
        self.save()?;
        Ok(Some(removed))
    }

    /// Removes every rule, or every rule of one site. Returns how many went.
    pub fn clear(&mut self, site: Option<&str>) -> Result<usize> {
        let before = self.rules.len();
        match site {
            Some(site) => self.rules.retain(|r| r.site != site),
            None => self.rules.clear(),
        }
        let removed = before - self.rules.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    /// Rules of exactly `site`, with their index in the full list.
    pub fn for_site<'a>(&'a self, site: &'a str) -> impl Iterator<Item = (usize, &'a Rule)> + 'a {
        self.rules
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.site == site)
    }
}

/// Watches the storage file for writes by other processes.
pub fn watch_storage(
    path: &Path,
    tx: Sender<notify::Result<notify::Event>>,
) -> Result<RecommendedWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    Ok(watcher)
}

/// Whether a watcher event touches the storage file.
pub fn touches(event: &notify::Event, path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    event
        .paths
        .iter()
        .any(|p| p == path || p.file_name() == Some(name))
}
