//! Application context and the persistence adapter behind it
//!
//! Credential and theme live in a key/value store handed to every component
//! at construction instead of process-wide globals.

use crate::config::ClientConfig;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const CREDENTIAL_KEY: &str = "session_token";
pub const THEME_KEY: &str = "theme";

/// Emitted on every successful `set` / `remove`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub value: Option<String>,
}

pub trait PersistenceAdapter: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicked writer leaves a complete map behind
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn notify(tx: &broadcast::Sender<StoreChange>, key: &str, value: Option<&str>) {
    // no subscribers is fine
    let _ = tx.send(StoreChange {
        key: key.to_string(),
        value: value.map(str::to_string),
    });
}

pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            values: Mutex::new(BTreeMap::new()),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceAdapter for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        notify(&self.changes, key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if lock(&self.values).remove(key).is_some() {
            notify(&self.changes, key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Flat JSON object on disk, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl JsonFileStore {
    /// Load `path`, or start empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        let (changes, _) = broadcast::channel(32);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        // write then rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PersistenceAdapter for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut values = lock(&self.values);
            values.insert(key.to_string(), value.to_string());
            self.persist(&values)?;
        }
        notify(&self.changes, key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        {
            let mut values = lock(&self.values);
            if values.remove(key).is_none() {
                return Ok(());
            }
            self.persist(&values)?;
        }
        notify(&self.changes, key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

/// Shared handles every component is constructed with
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ClientConfig>,
    pub store: Arc<dyn PersistenceAdapter>,
}

impl AppContext {
    pub fn new(config: ClientConfig, store: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            config: Arc::new(config),
            store,
        }
    }

    /// In-memory context, mostly for tests.
    pub fn in_memory(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    pub fn credential(&self) -> Option<String> {
        self.store
            .get(CREDENTIAL_KEY)
            .filter(|token| !token.trim().is_empty())
    }

    pub fn set_credential(&self, token: &str) -> Result<()> {
        self.store.set(CREDENTIAL_KEY, token.trim())
    }

    pub fn clear_credential(&self) -> Result<()> {
        self.store.remove(CREDENTIAL_KEY)
    }

    pub fn theme(&self) -> Theme {
        match self.store.get(THEME_KEY).as_deref() {
            Some("dark") => Theme::Dark,
            Some("light") | None => Theme::Light,
            Some(other) => {
                warn!("Unknown theme {:?}, using light", other);
                Theme::Light
            }
        }
    }

    pub fn set_theme(&self, theme: Theme) -> Result<()> {
        self.store.set(THEME_KEY, theme.as_str())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }
}
