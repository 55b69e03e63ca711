//! Durable query cache: cache key → coordinates-or-null.
//!
//! Null coordinates record a confirmed-unresolvable query (negative caching)
//! so repeat failures never reach the network again. Entries are only ever
//! added; flushing to disk is the batch orchestrator's job, not the callers'.

use crate::types::GeocodeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One cached outcome. `lat`/`lon` both set, or both null for a negative
/// entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn coords(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.lat.is_none()
    }
}

/// The durable geocode cache.
pub struct GeoCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
    dirty: bool,
}

impl GeoCache {
    /// Open the cache at `path`. A missing file starts fresh; an unreadable
    /// or corrupt file is fatal; silently discarding a cache would re-issue
    /// every external query of previous runs.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GeocodeError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                GeocodeError::CacheStore(format!("corrupt cache {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(GeocodeError::CacheStore(format!(
                    "cannot read cache {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self { path, entries, dirty: false })
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Record a successful resolution.
    pub fn put(&mut self, key: impl Into<String>, lat: f64, lon: f64) {
        self.insert(key.into(), Some(lat), Some(lon));
    }

    /// Record a confirmed-unresolvable query.
    pub fn put_negative(&mut self, key: impl Into<String>) {
        self.insert(key.into(), None, None);
    }

    fn insert(&mut self, key: String, lat: Option<f64>, lon: Option<f64>) {
        let entry = CacheEntry {
            lat,
            lon,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    /// Persist to disk if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<(), GeocodeError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                GeocodeError::CacheStore(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string(&self.entries)
            .map_err(|e| GeocodeError::CacheStore(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| {
            GeocodeError::CacheStore(format!("cannot write {}: {}", self.path.display(), e))
        })?;
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
