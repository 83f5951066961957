//! Persisted group state / 分组状态持久化
//!
//! Selectors remember their last pick and UI groups their expand flag through
//! a narrow load/store contract keyed by group tag. Store failures are
//! reported to the caller, which logs them and carries on.

use anyhow::Context;
use parking_lot::Mutex;
use sb_config::CacheFileOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait CacheStore: Send + Sync {
    fn load_selected(&self, group: &str) -> Option<String>;
    fn store_selected(&self, group: &str, selected: &str) -> anyhow::Result<()>;
    fn load_group_expand(&self, group: &str) -> Option<bool>;
    fn store_group_expand(&self, group: &str, expand: bool) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct CacheData {
    selected: HashMap<String, String>,
    group_expand: HashMap<String, bool>,
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    data: Mutex<CacheData>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load_selected(&self, group: &str) -> Option<String> {
        self.data.lock().selected.get(group).cloned()
    }

    fn store_selected(&self, group: &str, selected: &str) -> anyhow::Result<()> {
        self.data.lock().selected.insert(group.to_string(), selected.to_string());
        Ok(())
    }

    fn load_group_expand(&self, group: &str) -> Option<bool> {
        self.data.lock().group_expand.get(group).copied()
    }

    fn store_group_expand(&self, group: &str, expand: bool) -> anyhow::Result<()> {
        self.data.lock().group_expand.insert(group.to_string(), expand);
        Ok(())
    }
}

/// JSON file store; every write replaces the file atomically.
#[derive(Debug)]
pub struct JsonCacheStore {
    path: PathBuf,
    data: Mutex<CacheData>,
}

impl JsonCacheStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => CacheData::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decode cache file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheData::default(),
            Err(e) => return Err(e).with_context(|| format!("read cache file {}", path.display())),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, f: impl FnOnce(&mut CacheData)) -> anyhow::Result<()> {
        let mut data = self.data.lock();
        f(&mut data);
        let bytes = serde_json::to_vec_pretty(&*data)?;
        write_atomic(&self.path, &bytes).with_context(|| format!("write cache file {}", self.path.display()))
    }
}

impl CacheStore for JsonCacheStore {
    fn load_selected(&self, group: &str) -> Option<String> {
        self.data.lock().selected.get(group).cloned()
    }

    fn store_selected(&self, group: &str, selected: &str) -> anyhow::Result<()> {
        self.update(|d| {
            d.selected.insert(group.to_string(), selected.to_string());
        })
    }

    fn load_group_expand(&self, group: &str) -> Option<bool> {
        self.data.lock().group_expand.get(group).copied()
    }

    fn store_group_expand(&self, group: &str, expand: bool) -> anyhow::Result<()> {
        self.update(|d| {
            d.group_expand.insert(group.to_string(), expand);
        })
    }
}

/// Store for selector persistence, or `None` when disabled.
pub fn from_options(options: &CacheFileOptions) -> anyhow::Result<Option<Arc<dyn CacheStore>>> {
    if !options.enabled || !options.store_selected {
        return Ok(None);
    }
    if options.path.is_empty() {
        return Ok(Some(Arc::new(MemoryCacheStore::new())));
    }
    Ok(Some(Arc::new(JsonCacheStore::open(&options.path)?)))
}

/// Write to a sibling temp file, sync, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp = dir.join(format!(".sbcache-{}.tmp", std::process::id()));
    let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    drop(f);
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}
