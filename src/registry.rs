//! Directory-scoped registry of stores keyed by name.
//!
//! Maps `name` to `<dir>/<name>.fskv`, caching open databases so repeated
//! opens share one engine. Dropping a registry entry releases the store once
//! the last caller handle goes away.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::database::Database;
use crate::error::{Error, Result};

const STORE_EXTENSION: &str = "fskv";

pub struct Registry {
    dir: PathBuf,
    config: Config,
    databases: Mutex<HashMap<String, Arc<Database>>>,
}

impl Registry {
    /// Creates a registry rooted at `dir`; every store it opens shares
    /// `config`.
    pub fn new<P: Into<PathBuf>>(dir: P, config: Config) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            config,
            databases: Mutex::new(HashMap::new()),
        })
    }

    /// Opens (or returns the already open) database called `name`.
    pub fn open(&self, name: &str) -> Result<Arc<Database>> {
        check_name(name)?;
        let mut databases = self.databases.lock()?;
        if let Some(database) = databases.get(name) {
            return Ok(database.clone());
        }
        let path = self.dir.join(format!("{name}.{STORE_EXTENSION}"));
        let database = Arc::new(Database::open(path, self.config.clone())?);
        databases.insert(name.to_string(), database.clone());
        Ok(database)
    }

    /// Names of every store file in the directory, open or not.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(STORE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Drops the registry's handle on `name`. The store closes once the last
    /// caller handle is gone.
    pub fn close(&self, name: &str) -> Result<bool> {
        Ok(self.databases.lock()?.remove(name).is_some())
    }

    pub fn close_all(&self) -> Result<()> {
        self.databases.lock()?.clear();
        Ok(())
    }

    /// Flushes every open database.
    pub fn flush_all(&self) -> Result<()> {
        let databases: Vec<Arc<Database>> = self.databases.lock()?.values().cloned().collect();
        for database in databases {
            database.flush()?;
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::InvalidInput(format!("invalid store name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quiet() -> Config {
        Config::new()
            .flush_interval(Duration::ZERO)
            .stats_interval(Duration::ZERO)
    }

    #[test]
    fn test_registry_caches_open_stores() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), quiet()).unwrap();

        let users = registry.open("users").unwrap();
        users.set(b"alice", b"1").unwrap();

        // The same engine comes back for the same name.
        let again = registry.open("users").unwrap();
        assert!(Arc::ptr_eq(&users, &again));
        assert_eq!(again.get(b"alice").unwrap(), Some(b"1".to_vec()));

        let events = registry.open("events").unwrap();
        assert!(!Arc::ptr_eq(&users, &events));
    }

    #[test]
    fn test_registry_names_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), quiet()).unwrap();

        registry.open("users").unwrap().flush().unwrap();
        registry.open("events").unwrap().flush().unwrap();
        assert_eq!(registry.names().unwrap(), vec!["events", "users"]);

        assert!(registry.close("users").unwrap());
        assert!(!registry.close("users").unwrap());
        // Closed stores are still on disk.
        assert_eq!(registry.names().unwrap(), vec!["events", "users"]);

        // And can be reopened after the handle is gone.
        let users = registry.open("users").unwrap();
        users.set(b"bob", b"2").unwrap();
    }

    #[test]
    fn test_registry_rejects_path_tricks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), quiet()).unwrap();
        assert!(registry.open("").is_err());
        assert!(registry.open("../escape").is_err());
        assert!(registry.open("a/b").is_err());
    }
}
