//! File-backed response cache, one JSON file per request signature.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::params::Params;
use crate::request::Request;
use crate::site::Site;

/// What is stored on disk for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub signature: String,
    pub cache_time: DateTime<Utc>,
    pub data: Value,
}

impl CacheEntry {
    pub fn is_fresh(&self, expiry: Duration) -> bool {
        match (Utc::now() - self.cache_time).to_std() {
            Ok(age) => age < expiry,
            // timestamp in the future
            Err(_) => true,
        }
    }
}

/// Generate the cache file stem for a signature (SHA-256, hex encoded).
pub fn cache_key(signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A [`Request`] answered from disk while its entry is younger than `expiry`.
#[derive(Debug, Clone)]
pub struct CachedRequest {
    request: Request,
    expiry: Duration,
    /// Payload of the last load or submit.
    pub data: Option<Value>,
    /// When the loaded entry was written; `None` after a live fetch.
    pub cache_time: Option<DateTime<Utc>>,
}

impl CachedRequest {
    pub fn new(expiry: Duration, params: Params) -> Self {
        Self::from_request(expiry, Request::new(params))
    }

    pub fn from_request(expiry: Duration, request: Request) -> Self {
        Self {
            request,
            expiry,
            data: None,
            cache_time: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Endpoint identity (API URL and user) followed by the sorted parameters.
    pub fn signature(&self, site: &Site) -> String {
        format!(
            "{}|{}|{}",
            site.api_url(),
            site.user().unwrap_or("anon"),
            self.request.params().encode()
        )
    }

    pub fn key(&self, site: &Site) -> String {
        cache_key(&self.signature(site))
    }

    /// Fills `data` and `cache_time` from a fresh matching entry and reports whether it did.
    pub fn load_cache(&mut self, site: &Site) -> Result<bool> {
        let signature = self.signature(site);
        let Some(entry) = site.cache_store().read(&cache_key(&signature))? else {
            return Ok(false);
        };
        if entry.signature != signature {
            log::debug!("cache key collision for {signature}, ignoring entry");
            return Ok(false);
        }
        if !entry.is_fresh(self.expiry) {
            log::debug!("cache entry from {} expired", entry.cache_time);
            return Ok(false);
        }
        log::debug!("cache hit from {}", entry.cache_time);
        self.cache_time = Some(entry.cache_time);
        self.data = Some(entry.data);
        Ok(true)
    }

    pub fn submit(&mut self, site: &mut Site) -> Result<Value> {
        if self.load_cache(site)?
            && let Some(data) = &self.data
        {
            return Ok(data.clone());
        }
        let data = self.request.submit(site)?;
        let entry = CacheEntry {
            signature: self.signature(site),
            cache_time: Utc::now(),
            data: data.clone(),
        };
        site.cache_store().write(&entry)?;
        self.cache_time = None;
        self.data = Some(data.clone());
        Ok(data)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// The cache directory and its maintenance operations.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// The entry stored under `key`. Unreadable or corrupt files count as misses.
    pub fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                log::warn!("failed to read cache entry {}: {error}", path.display());
                return Ok(None);
            }
        };
        match serde_json::from_str(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(error) => {
                log::warn!("ignoring corrupt cache entry {}: {error}", path.display());
                Ok(None)
            }
        }
    }

    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.path_for(&cache_key(&entry.signature));
        let content = serde_json::to_string(entry)?;
        fs::write(&path, content).map_err(|e| Error::io(&path, e))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for path in self.entry_paths()? {
            let metadata = fs::metadata(&path).map_err(|e| Error::io(&path, e))?;
            stats.entries += 1;
            stats.bytes += metadata.len();
        }
        Ok(stats)
    }

    /// Deletes entries older than `max_age`, and corrupt ones. Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_paths()? {
            let stale = match fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<CacheEntry>(&content).ok())
            {
                Some(entry) => !entry.is_fresh(max_age),
                None => true,
            };
            if stale {
                fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize> {
        let paths = self.entry_paths()?;
        for path in &paths {
            fs::remove_file(path).map_err(|e| Error::io(path, e))?;
        }
        Ok(paths.len())
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::io(&self.dir, e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            paths.push(path.to_path_buf());
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    use super::{CacheEntry, CacheStore, CachedRequest, cache_key};
    use crate::config::ClientConfig;
    use crate::site::tests::{fake_site, fake_site_with_config, test_config};

    const HOUR: Duration = Duration::from_secs(3600);

    fn config_in(dir: &std::path::Path) -> ClientConfig {
        let mut config = test_config();
        config.cache.dir = Some(dir.to_path_buf());
        config
    }

    #[test]
    fn repeated_requests_are_served_from_disk() {
        let temp = tempdir().expect("tempdir");
        let mut served = 0;
        let (mut site, calls) = fake_site_with_config(config_in(temp.path()), move |_, _| {
            served += 1;
            Ok(json!({"query": {"general": {"sitename": "Test"}}, "served": served}))
        });
        let params = params!["action" => "query", "meta" => "siteinfo"];

        let mut first = CachedRequest::new(HOUR, params.clone());
        let data1 = first.submit(&mut site).expect("first");
        assert!(first.cache_time.is_none());

        let mut second = CachedRequest::new(HOUR, params.clone());
        let data2 = second.submit(&mut site).expect("second");
        let mut third = CachedRequest::new(HOUR, params);
        let data3 = third.submit(&mut site).expect("third");

        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(data1, data2);
        assert_eq!(data2, data3);
        assert!(second.cache_time.is_some());
        assert_eq!(second.cache_time, third.cache_time);
    }

    #[test]
    fn expired_entries_trigger_a_live_request() {
        let temp = tempdir().expect("tempdir");
        let (mut site, calls) =
            fake_site_with_config(config_in(temp.path()), |_, _| Ok(json!({"ok": true})));
        let params = params!["action" => "query", "meta" => "userinfo"];
        CachedRequest::new(Duration::ZERO, params.clone())
            .submit(&mut site)
            .expect("first");
        let mut again = CachedRequest::new(Duration::ZERO, params);
        assert!(!again.load_cache(&site).expect("load"));
        again.submit(&mut site).expect("second");
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn signature_tracks_values_not_insertion_order() {
        let (site, _calls) = fake_site(|_, _| Ok(json!({})));
        let a = CachedRequest::new(HOUR, params!["action" => "query", "titles" => "A"]);
        let b = CachedRequest::new(HOUR, params!["titles" => "A", "action" => "query"]);
        let c = CachedRequest::new(HOUR, params!["action" => "query", "titles" => "B"]);
        assert_eq!(a.signature(&site), b.signature(&site));
        assert_ne!(a.signature(&site), c.signature(&site));
        assert!(a.signature(&site).contains("|anon|"));
        assert_eq!(a.key(&site).len(), 64);
    }

    #[test]
    fn corrupt_entries_are_misses() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path());
        let key = cache_key("sig");
        fs::write(store.path_for(&key), "{not json").expect("write");
        assert!(store.read(&key).expect("read").is_none());
        assert!(store.read(&cache_key("absent")).expect("read").is_none());
    }

    #[test]
    fn stats_prune_and_clear() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path().join("apicache"));
        assert_eq!(store.stats().expect("stats").entries, 0);

        store
            .write(&CacheEntry {
                signature: "fresh".into(),
                cache_time: Utc::now(),
                data: json!({"a": 1}),
            })
            .expect("write fresh");
        store
            .write(&CacheEntry {
                signature: "old".into(),
                cache_time: Utc::now() - TimeDelta::hours(2),
                data: json!({"b": 2}),
            })
            .expect("write old");
        fs::write(store.dir().join("notes.txt"), "ignored").expect("write other");

        let stats = store.stats().expect("stats");
        assert_eq!(stats.entries, 2);
        assert!(stats.bytes > 0);

        assert_eq!(store.prune(HOUR).expect("prune"), 1);
        assert!(store.read(&cache_key("fresh")).expect("read").is_some());
        assert!(store.read(&cache_key("old")).expect("read").is_none());

        assert_eq!(store.clear().expect("clear"), 1);
        assert_eq!(store.stats().expect("stats").entries, 0);
        assert!(store.dir().join("notes.txt").exists());
    }
}
