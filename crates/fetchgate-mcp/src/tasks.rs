//! Owner-scoped task manager for asynchronous tool invocations.
//!
//! Tasks live in memory with an absolute TTL. Terminal states freeze the
//! record; capacity quotas count only non-expired entries, so an expired
//! task can never wedge an owner's quota. Every task carries an abort token
//! that cancellation (and shutdown) triggers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const MIN_TTL_MS: u64 = 1_000;
pub const MAX_TTL_MS: u64 = 86_400_000;
pub const DEFAULT_TTL_MS: u64 = 300_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
/// Remaining lifetime granted once a task's result has been delivered.
const DELIVERY_GRACE: Duration = Duration::from_secs(60);

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    #[serde(skip)]
    pub owner_key: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at_ms: u64,
    #[serde(rename = "ttl")]
    pub ttl_ms: u64,
    #[serde(rename = "pollInterval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task capacity exceeded: {0}")]
    Capacity(String),
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("wait cancelled")]
    Cancelled,
}

#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub status_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

/// Derive the quota/visibility scope of a caller: session id, else auth
/// client id, else a digest of the bearer token, else a shared default.
pub fn owner_key(
    session_id: Option<&str>,
    client_id: Option<&str>,
    bearer_token: Option<&str>,
) -> String {
    if let Some(s) = session_id.filter(|s| !s.is_empty()) {
        return format!("session:{s}");
    }
    if let Some(c) = client_id.filter(|s| !s.is_empty()) {
        return format!("client:{c}");
    }
    if let Some(t) = bearer_token.filter(|s| !s.is_empty()) {
        return format!("token:{}", hex::encode(Sha256::digest(t.as_bytes())));
    }
    "default".to_string()
}

pub fn normalize_ttl_ms(ttl_ms: Option<u64>) -> u64 {
    ttl_ms.unwrap_or(DEFAULT_TTL_MS).clamp(MIN_TTL_MS, MAX_TTL_MS)
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn encode_cursor(created_at_ms: u64, task_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{created_at_ms}:{task_id}"))
}

fn decode_cursor(cursor: &str) -> Result<(u64, String), TaskError> {
    if cursor.len() > 256 {
        return Err(TaskError::InvalidCursor);
    }
    let raw = URL_SAFE_NO_PAD
        .decode(cursor.as_bytes())
        .map_err(|_| TaskError::InvalidCursor)?;
    let s = String::from_utf8(raw).map_err(|_| TaskError::InvalidCursor)?;
    let (ms, id) = s.split_once(':').ok_or(TaskError::InvalidCursor)?;
    let ms: u64 = ms.parse().map_err(|_| TaskError::InvalidCursor)?;
    if id.is_empty() {
        return Err(TaskError::InvalidCursor);
    }
    Ok((ms, id.to_string()))
}

struct TaskRecord {
    task: Task,
    expires_at: Instant,
    terminal_tx: watch::Sender<TaskStatus>,
    abort: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskLimits {
    pub max_total: usize,
    pub max_per_owner: usize,
}

pub struct TaskManager {
    limits: TaskLimits,
    inner: Mutex<HashMap<String, TaskRecord>>,
}

#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub next_cursor: Option<String>,
}

impl TaskManager {
    pub fn new(limits: TaskLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop expired records, cancelling their executions. Called lazily
    /// from every accounting-sensitive operation.
    fn prune_expired(records: &mut HashMap<String, TaskRecord>) {
        let now = Instant::now();
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, r)| now >= r.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for id in expired {
            if let Some(r) = records.remove(&id) {
                r.abort.cancel();
            }
        }
    }

    pub fn create_task(
        &self,
        ttl_ms: Option<u64>,
        status_message: impl Into<String>,
        owner: &str,
    ) -> Result<(Task, CancellationToken), TaskError> {
        let mut records = self.lock();
        Self::prune_expired(&mut records);

        if records.len() >= self.limits.max_total {
            return Err(TaskError::Capacity(format!(
                "{} tasks already live",
                records.len()
            )));
        }
        let owned = records
            .values()
            .filter(|r| r.task.owner_key == owner)
            .count();
        if owned >= self.limits.max_per_owner {
            return Err(TaskError::Capacity(format!(
                "{owned} tasks already live for this owner"
            )));
        }

        let ttl_ms = normalize_ttl_ms(ttl_ms);
        let now_ms = now_epoch_ms();
        let task = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            owner_key: owner.to_string(),
            status: TaskStatus::Working,
            status_message: Some(status_message.into()),
            result: None,
            error: None,
            created_at_ms: now_ms,
            last_updated_at_ms: now_ms,
            ttl_ms,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        };
        let abort = CancellationToken::new();
        let (terminal_tx, _) = watch::channel(task.status);
        records.insert(
            task.task_id.clone(),
            TaskRecord {
                task: task.clone(),
                expires_at: Instant::now() + Duration::from_millis(ttl_ms),
                terminal_tx,
                abort: abort.clone(),
            },
        );
        Ok((task, abort))
    }

    pub fn get_task(&self, id: &str, owner: &str) -> Option<Task> {
        let mut records = self.lock();
        Self::prune_expired(&mut records);
        records
            .get(id)
            .filter(|r| r.task.owner_key == owner)
            .map(|r| r.task.clone())
    }

    /// Stable listing ordered by `(createdAt, taskId)` with an opaque
    /// cursor.
    pub fn list_tasks(
        &self,
        owner: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<TaskPage, TaskError> {
        let after = cursor.map(decode_cursor).transpose()?;
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        let mut records = self.lock();
        Self::prune_expired(&mut records);
        let mut tasks: Vec<Task> = records
            .values()
            .filter(|r| r.task.owner_key == owner)
            .map(|r| r.task.clone())
            .collect();
        tasks.sort_by(|a, b| {
            (a.created_at_ms, a.task_id.as_str()).cmp(&(b.created_at_ms, b.task_id.as_str()))
        });
        if let Some((ms, id)) = after {
            tasks.retain(|t| (t.created_at_ms, t.task_id.as_str()) > (ms, id.as_str()));
        }

        let more = tasks.len() > limit;
        tasks.truncate(limit);
        let next_cursor = if more {
            tasks
                .last()
                .map(|t| encode_cursor(t.created_at_ms, &t.task_id))
        } else {
            None
        };
        Ok(TaskPage { tasks, next_cursor })
    }

    /// Apply `patch`. Terminal tasks are frozen: the call is a no-op and the
    /// frozen snapshot is returned.
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Option<Task> {
        let mut records = self.lock();
        Self::prune_expired(&mut records);
        let record = records.get_mut(id)?;
        if record.task.status.is_terminal() {
            return Some(record.task.clone());
        }
        if let Some(status) = patch.status {
            record.task.status = status;
        }
        if let Some(msg) = patch.status_message {
            record.task.status_message = Some(msg);
        }
        if let Some(result) = patch.result {
            record.task.result = Some(result);
        }
        if let Some(error) = patch.error {
            record.task.error = Some(error);
        }
        record.task.last_updated_at_ms = now_epoch_ms();
        let _ = record.terminal_tx.send(record.task.status);
        Some(record.task.clone())
    }

    /// Cancel; idempotent on already-terminal tasks. Triggers the task's
    /// abort token.
    pub fn cancel_task(&self, id: &str, owner: &str, message: &str) -> Option<Task> {
        {
            let records = self.lock();
            let record = records.get(id)?;
            if record.task.owner_key != owner {
                return None;
            }
            if record.task.status.is_terminal() {
                return Some(record.task.clone());
            }
            record.abort.cancel();
        }
        self.update_task(
            id,
            TaskPatch {
                status: Some(TaskStatus::Cancelled),
                status_message: Some(message.to_string()),
                ..TaskPatch::default()
            },
        )
    }

    /// Cancel every non-terminal task of `owner`; returns the set cancelled.
    pub fn cancel_tasks_by_owner(&self, owner: &str, message: &str) -> Vec<Task> {
        let ids: Vec<String> = {
            let mut records = self.lock();
            Self::prune_expired(&mut records);
            records
                .values()
                .filter(|r| r.task.owner_key == owner && !r.task.status.is_terminal())
                .map(|r| r.task.task_id.clone())
                .collect()
        };
        ids.iter()
            .filter_map(|id| self.cancel_task(id, owner, message))
            .collect()
    }

    /// Resolve once the task reaches a terminal state, or `None` once its
    /// TTL elapses. The cancel signal aborts the wait.
    pub async fn wait_for_terminal(
        &self,
        id: &str,
        owner: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Task>, TaskError> {
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        loop {
            let (mut rx, deadline) = {
                let mut records = self.lock();
                Self::prune_expired(&mut records);
                let Some(record) = records.get(id).filter(|r| r.task.owner_key == owner) else {
                    return Ok(None);
                };
                if record.task.status.is_terminal() {
                    return Ok(Some(record.task.clone()));
                }
                (record.terminal_tx.subscribe(), record.expires_at)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    // TTL elapsed; the next loop pass prunes and returns None.
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// After the result has been handed to the caller, shrink the remaining
    /// TTL to a short grace window.
    pub fn shrink_ttl_after_delivery(&self, id: &str) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(id) {
            record.expires_at = record.expires_at.min(Instant::now() + DELIVERY_GRACE);
        }
    }

    /// Cancel every in-flight execution (shutdown).
    pub fn abort_all(&self) {
        let records = self.lock();
        for record in records.values() {
            record.abort.cancel();
        }
    }

    pub fn live_count(&self) -> usize {
        let mut records = self.lock();
        Self::prune_expired(&mut records);
        records.len()
    }
}
