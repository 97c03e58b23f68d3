//! Session store.
//!
//! Move-to-end LRU keyed by session id, with an in-flight counter that
//! reserves capacity for sessions still completing their initialize
//! handshake. A background sweeper closes sessions idle past the TTL.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

const SWEEP_BATCH: usize = 10;

/// Seam to whatever carries the session's transport; `close` must be safe to
/// call more than once.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

/// A handle for transports with nothing to tear down (stdio, tests).
pub struct NoopHandle;

#[async_trait]
impl SessionHandle for NoopHandle {
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub created_at: SystemTime,
    pub last_seen: Instant,
    pub protocol_initialized: bool,
    pub negotiated_protocol_version: Option<String>,
    pub auth_fingerprint: Option<String>,
    pub transport: Arc<dyn SessionHandle>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>, transport: Arc<dyn SessionHandle>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: SystemTime::now(),
            last_seen: Instant::now(),
            protocol_initialized: false,
            negotiated_protocol_version: None,
            auth_fingerprint: None,
            transport,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, SessionEntry>,
    /// LRU order, oldest at the front. Parallel to `entries`.
    order: VecDeque<String>,
    in_flight: usize,
}

impl Inner {
    fn move_to_end(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
            self.order.push_back(id.to_string());
        }
    }

    fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        Some(entry)
    }
}

#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<Inner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Reserve a slot for a session being initialized. The caller must
    /// `release_slot` once the session is inserted (or abandoned).
    pub fn reserve_slot(&self, max_sessions: usize) -> bool {
        let mut inner = self.lock();
        if inner.entries.len() + inner.in_flight < max_sessions {
            inner.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn release_slot(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    pub fn insert(&self, entry: SessionEntry) {
        let mut inner = self.lock();
        let id = entry.session_id.clone();
        if inner.entries.insert(id.clone(), entry).is_none() {
            inner.order.push_back(id);
        } else {
            inner.move_to_end(&id);
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// Update `last_seen` and make the session MRU. Unknown ids are ignored.
    pub fn touch(&self, id: &str) {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some(entry) = inner.entries.get_mut(id) {
            // Instant is monotonic; max() guards same-tick races.
            entry.last_seen = entry.last_seen.max(now);
            inner.move_to_end(id);
        }
    }

    pub fn mark_initialized(&self, id: &str, protocol_version: Option<String>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.protocol_initialized = true;
            entry.negotiated_protocol_version = protocol_version;
        }
    }

    pub fn remove(&self, id: &str) -> Option<SessionEntry> {
        self.lock().remove(id)
    }

    /// Remove and return exactly the sessions idle past `ttl`.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<SessionEntry> {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| inner.remove(id))
            .collect()
    }

    /// Remove and return the least-recently-touched session.
    pub fn evict_oldest(&self) -> Option<SessionEntry> {
        let mut inner = self.lock();
        let oldest = inner.order.front().cloned()?;
        inner.remove(&oldest)
    }

    /// True when a new session fits. At capacity, optionally evicts the
    /// oldest session once (returned for external close) and rechecks.
    pub fn ensure_capacity(
        &self,
        max_sessions: usize,
        evict_oldest: bool,
    ) -> (bool, Option<SessionEntry>) {
        {
            let inner = self.lock();
            if inner.entries.len() + inner.in_flight < max_sessions {
                return (true, None);
            }
        }
        if !evict_oldest {
            return (false, None);
        }
        let evicted = self.evict_oldest();
        let inner = self.lock();
        (inner.entries.len() + inner.in_flight < max_sessions, evicted)
    }
}

/// Sweep cadence: half the TTL, clamped to [10 s, 60 s], unless overridden.
pub fn sweep_interval(session_ttl: Duration, override_interval: Option<Duration>) -> Duration {
    if let Some(i) = override_interval {
        return i;
    }
    (session_ttl / 2).clamp(Duration::from_secs(10), Duration::from_secs(60))
}

async fn close_session(entry: &SessionEntry) {
    if let Err(e) = entry.transport.close().await {
        tracing::warn!(session_id = %entry.session_id, error = %e, "session close failed");
    }
}

/// Periodic TTL sweep. Expired sessions are closed in batches with bounded
/// parallelism; cancellation stops cleanly between batches.
pub async fn run_sweeper(
    store: Arc<SessionStore>,
    session_ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let expired = store.evict_expired(session_ttl);
        if expired.is_empty() {
            continue;
        }
        tracing::debug!(count = expired.len(), "closing expired sessions");
        for batch in expired.chunks(SWEEP_BATCH) {
            if cancel.is_cancelled() {
                return;
            }
            futures_util::future::join_all(batch.iter().map(close_session)).await;
        }
    }
}

/// Close every live session (shutdown fan-out).
pub async fn close_all(store: &SessionStore) {
    let mut entries = Vec::new();
    while let Some(e) = store.evict_oldest() {
        entries.push(e);
    }
    for batch in entries.chunks(SWEEP_BATCH) {
        futures_util::future::join_all(batch.iter().map(close_session)).await;
    }
}
