//! In-memory response cache.
//!
//! Byte- and count-bounded LRU with absolute per-entry expiry. Reads evict
//! expired entries lazily and silently; inserts, replacements, and LRU
//! evictions publish update events. All state sits behind one mutex.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

/// JSON with object keys sorted recursively, so logically-equal `vary`
/// values hash identically.
pub fn stable_json(v: &serde_json::Value) -> String {
    fn sort(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(m) => {
                let mut sorted: Vec<(&String, &serde_json::Value)> = m.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, val) in sorted {
                    out.insert(k.clone(), sort(val));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(a) => {
                serde_json::Value::Array(a.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(v).to_string()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn url_hash(url: &str) -> String {
    sha256_hex(url.as_bytes())[..32].to_string()
}

/// `"<namespace>:<urlHash>[.<varyHash>]"`.
pub fn cache_key(namespace: &str, url: &str, vary: Option<&serde_json::Value>) -> String {
    let mut key = format!("{namespace}:{}", url_hash(url));
    if let Some(v) = vary {
        let vh = &sha256_hex(stable_json(v).as_bytes())[..16];
        key.push('.');
        key.push_str(vh);
    }
    key
}

pub fn resource_uri(namespace: &str, url_hash: &str) -> String {
    format!("internal://cache/{namespace}/{url_hash}")
}

/// Inverse of `resource_uri`: `(namespace, urlHash)`.
pub fn parse_resource_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("internal://cache/")?;
    let (ns, hash) = rest.split_once('/')?;
    if ns.is_empty() || hash.is_empty() {
        return None;
    }
    Some((ns.to_string(), hash.to_string()))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub url: String,
    pub title: Option<String>,
    pub content: Vec<u8>,
    pub fetched_at: SystemTime,
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub key: String,
    pub namespace: String,
    pub url_hash: String,
    /// True when the set of live keys changed (insert or eviction; a
    /// replacement keeps the key set intact).
    pub list_changed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_bytes: usize,
    pub max_entry_bytes: usize,
    pub max_entries: usize,
    pub ttl: Duration,
}

struct Stored {
    entry: CacheEntry,
    size: usize,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Stored>,
    bytes: usize,
    next_seq: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, key: &str) -> Option<Stored> {
        let stored = self.entries.remove(key)?;
        self.bytes -= stored.size;
        Some(stored)
    }

    fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, s)| s.seq)
            .map(|(k, _)| k.clone())
    }
}

pub struct ResponseCache {
    enabled: bool,
    limits: CacheLimits,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CacheUpdate>,
}

impl ResponseCache {
    pub fn new(enabled: bool, limits: CacheLimits) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            enabled,
            limits,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, key: &str, list_changed: bool) {
        let (namespace, rest) = key.split_once(':').unwrap_or(("", key));
        let url_hash = rest.split('.').next().unwrap_or(rest);
        // Nobody listening is fine; listeners can never fail the cache path.
        let _ = self.events.send(CacheUpdate {
            key: key.to_string(),
            namespace: namespace.to_string(),
            url_hash: url_hash.to_string(),
            list_changed,
        });
    }

    fn expired(entry: &CacheEntry, now: SystemTime) -> bool {
        now > entry.expires_at
    }

    /// Read and touch. Expired entries are dropped silently (no event).
    pub fn get(&self, key: &str, force: bool) -> Option<CacheEntry> {
        if !self.enabled && !force {
            return None;
        }
        let now = SystemTime::now();
        let mut inner = self.lock();
        if Self::expired(&inner.entries.get(key)?.entry, now) {
            inner.remove(key);
            return None;
        }
        let seq = inner.bump();
        let stored = inner.entries.get_mut(key)?;
        stored.seq = seq;
        Some(stored.entry.clone())
    }

    /// Read without touching the LRU position.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let now = SystemTime::now();
        let mut inner = self.lock();
        if Self::expired(&inner.entries.get(key)?.entry, now) {
            inner.remove(key);
            return None;
        }
        Some(inner.entries[key].entry.clone())
    }

    /// Insert (or replace). Returns false when the entry was rejected for
    /// size or the cache is disabled.
    pub fn set(&self, key: &str, content: Vec<u8>, url: &str, title: Option<String>, force: bool) -> bool {
        if !self.enabled && !force {
            return false;
        }
        let size = content.len();
        if size > self.limits.max_entry_bytes {
            tracing::warn!(
                key,
                size,
                max = self.limits.max_entry_bytes,
                "cache entry exceeds per-entry byte limit; not cached"
            );
            return false;
        }

        let now = SystemTime::now();
        let entry = CacheEntry {
            url: url.to_string(),
            title,
            content,
            fetched_at: now,
            expires_at: now + self.limits.ttl,
        };

        let mut evicted: Vec<String> = Vec::new();
        let replaced;
        {
            let mut inner = self.lock();
            replaced = inner.remove(key).is_some();

            // Evict oldest until both budgets hold.
            while !inner.entries.is_empty()
                && (inner.bytes + size > self.limits.max_bytes
                    || inner.entries.len() + 1 > self.limits.max_entries)
            {
                let Some(oldest) = inner.oldest_key() else { break };
                inner.remove(&oldest);
                evicted.push(oldest);
            }

            let seq = inner.bump();
            inner.bytes += size;
            inner.entries.insert(key.to_string(), Stored { entry, size, seq });
        }

        for key in &evicted {
            self.emit(key, true);
        }
        self.emit(key, !replaced);
        true
    }

    /// All non-expired keys.
    pub fn keys(&self) -> Vec<String> {
        let now = SystemTime::now();
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, s)| !Self::expired(&s.entry, now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Look an entry up by its resource coordinates (`namespace`,
    /// `urlHash`), ignoring any vary suffix. Does not touch LRU order.
    pub fn peek_by_resource(&self, namespace: &str, url_hash: &str) -> Option<CacheEntry> {
        let prefix = format!("{namespace}:{url_hash}");
        let key = {
            let inner = self.lock();
            inner
                .entries
                .keys()
                .find(|k| **k == prefix || k.starts_with(&format!("{prefix}.")))
                .cloned()?
        };
        self.peek(&key)
    }

    /// `(live entries, live bytes)`.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.entries.len(), inner.bytes)
    }
}
