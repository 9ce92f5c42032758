use crate::error::{Result, RuleError};
use crate::model::Rule;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// In-memory rule set backed by a directory of `.rule` files.
///
/// Disk is the source of truth: additions are written before the map is
/// updated, deletions unlink before the map forgets the rule. A
/// persistence failure therefore never leaves the two views disagreeing.
pub struct RuleStore {
    dir: PathBuf,
    rules: HashMap<String, Rule>,
}

impl RuleStore {
    pub fn open(dir: impl Into<PathBuf>) -> RuleStore {
        RuleStore {
            dir: dir.into(),
            rules: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.rule"))
    }

    /// Loads every `*.rule` file or symlink in the store directory.
    /// Files that fail to parse are logged and skipped; they never abort
    /// the scan. Returns the names of the rules that were loaded.
    pub fn load_all(&mut self) -> Result<Vec<String>> {
        tracing::info!(dir = %self.dir.display(), "Reading rules");

        let mut loaded = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let is_rule_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".rule"));
            if !is_rule_file || path.is_dir() {
                continue;
            }
            match self.load_file(&path) {
                Ok(name) => loaded.push(name),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to load rule");
                }
            }
        }
        Ok(loaded)
    }

    /// Loads one rule file, replacing any same-named rule in memory.
    /// Returns the rule name.
    pub fn load_file(&mut self, path: &Path) -> Result<String> {
        let json = fs::read_to_string(path)?;
        let rule = Rule::parse(&json)?;
        let name = rule.name().to_string();
        tracing::info!(rule = %name, path = %path.display(), "Rule loaded");
        self.rules.insert(name.clone(), rule);
        Ok(name)
    }

    /// Persists the rule and inserts it, replacing any same-named rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::SaveFailure`] when the file cannot be written;
    /// the in-memory map is left untouched in that case.
    pub fn add(&mut self, rule: Rule) -> Result<()> {
        let path = self.path_for(rule.name());
        fs::write(&path, rule.serialize()).map_err(|e| RuleError::SaveFailure {
            path: path.clone(),
            source: e,
        })?;
        self.rules.insert(rule.name().to_string(), rule);
        Ok(())
    }

    /// Removes the rule from disk, then from memory.
    ///
    /// # Errors
    ///
    /// [`RuleError::DoesNotExist`] when the name is unknown,
    /// [`RuleError::CanNotRemove`] when the file cannot be unlinked (the
    /// rule then stays in the store).
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !self.rules.contains_key(name) {
            return Err(RuleError::DoesNotExist(name.to_string()));
        }
        let path = self.path_for(name);
        fs::remove_file(&path).map_err(|e| RuleError::CanNotRemove { path, source: e })?;
        self.rules.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
