//! Streamable-HTTP front.
//!
//! `POST /mcp` carries JSON-RPC requests and notifications, `GET /mcp` is the
//! session's SSE channel, `DELETE /mcp` tears the session down. Dispatch is
//! by method name onto the same service core the stdio front uses; this is
//! also the consumer of the session store.

use crate::cache;
use crate::context::{self, RequestContext};
use crate::mcp::RELATED_TASK_META;
use crate::service::{error_payload, FetchService, FetchUrlRequest};
use crate::session::{self, SessionEntry, SessionHandle, SessionStore};
use crate::tasks::{self, TaskError, TaskStatus};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Headers that are single-value by construction; duplicates are a smuggling
/// smell and rejected outright.
const SINGLE_VALUE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "host",
    "origin",
    "content-length",
    "mcp-session-id",
];

const NOTIFY_BUFFER: usize = 64;

/// Per-session channel + subscription state behind the store's close seam.
pub struct HttpSessionHandle {
    tx: mpsc::Sender<serde_json::Value>,
    rx: Mutex<Option<mpsc::Receiver<serde_json::Value>>>,
    subscriptions: Mutex<BTreeSet<String>>,
    closed: CancellationToken,
}

impl HttpSessionHandle {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            subscriptions: Mutex::new(BTreeSet::new()),
            closed: CancellationToken::new(),
        })
    }

    fn notify(&self, value: serde_json::Value) {
        // Best-effort: a full or detached channel never blocks the sender.
        let _ = self.tx.try_send(value);
    }

    fn subscribe(&self, uri: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uri.to_string());
    }

    fn unsubscribe(&self, uri: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uri);
    }

    fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(uri)
    }

    fn has_subscriptions(&self) -> bool {
        !self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

#[async_trait]
impl SessionHandle for HttpSessionHandle {
    async fn close(&self) -> anyhow::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

pub struct HttpState {
    pub service: Arc<FetchService>,
    pub sessions: Arc<SessionStore>,
    channels: Mutex<HashMap<String, Arc<HttpSessionHandle>>>,
}

impl HttpState {
    pub fn new(service: Arc<FetchService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            sessions: Arc::new(SessionStore::new()),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn channel(&self, session_id: &str) -> Option<Arc<HttpSessionHandle>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    fn register_channel(&self, session_id: &str, handle: Arc<HttpSessionHandle>) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), handle);
    }

    fn prune_closed_channels(&self) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, h| !h.closed.is_cancelled());
    }

    fn live_channels(&self) -> Vec<(String, Arc<HttpSessionHandle>)> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| !h.closed.is_cancelled())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Fan cache update events out to subscribed SSE channels.
pub async fn run_cache_fanout(state: Arc<HttpState>, cancel: CancellationToken) {
    let mut rx = state.service.cache.subscribe();
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return,
            u = rx.recv() => match u {
                Ok(u) => u,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        };
        state.prune_closed_channels();
        let uri = cache::resource_uri(&update.namespace, &update.url_hash);
        for (_, handle) in state.live_channels() {
            if handle.is_subscribed(&uri) {
                handle.notify(serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/resources/updated",
                    "params": { "uri": uri },
                }));
            }
            if update.list_changed && handle.has_subscriptions() {
                handle.notify(serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/resources/list_changed",
                }));
            }
        }
    }
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route(
            "/mcp",
            get(handle_get).post(handle_post).delete(handle_delete),
        )
        .with_state(state)
}

/// Serve until `cancel` fires. Also runs the session sweeper and the cache
/// update fan-out.
pub async fn serve_http(
    service: Arc<FetchService>,
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = HttpState::new(service);
    let config = &state.service.config;
    tokio::spawn(session::run_sweeper(
        state.sessions.clone(),
        config.session_ttl,
        session::sweep_interval(config.session_ttl, config.session_sweep_interval),
        cancel.clone(),
    ));
    tokio::spawn(run_cache_fanout(state.clone(), cancel.clone()));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "streamable http listening");
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    session::close_all(&state.sessions).await;
    Ok(())
}

fn rpc_error(id: serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn rpc_result(id: serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn duplicated_single_value_header(headers: &HeaderMap) -> Option<&'static str> {
    SINGLE_VALUE_HEADERS
        .iter()
        .find(|name| headers.get_all(**name).iter().count() > 1)
        .copied()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn accept_allows_stream(headers: &HeaderMap) -> bool {
    let accept = header_str(headers, "accept").unwrap_or("");
    let accept = accept.to_ascii_lowercase();
    accept.contains("application/json") && accept.contains("text/event-stream")
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(rpc_error(serde_json::Value::Null, -32600, message)),
    )
        .into_response()
}

async fn handle_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(name) = duplicated_single_value_header(&headers) {
        return bad_request(&format!("duplicate {name} header"));
    }
    let message: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(rpc_error(serde_json::Value::Null, -32700, "parse error")),
            )
                .into_response();
        }
    };
    let method = message.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = message.get("id").cloned();
    let params = message.get("params").cloned().unwrap_or(serde_json::Value::Null);

    if method == "initialize" {
        return initialize(&state, &headers, id, params).await;
    }

    // Everything after initialize needs a live session.
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER).map(str::to_string) else {
        return bad_request("missing mcp-session-id header");
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(rpc_error(
                id.unwrap_or(serde_json::Value::Null),
                -32001,
                "unknown session",
            )),
        )
            .into_response();
    };
    state.sessions.touch(&session_id);

    if method == "notifications/initialized" {
        if id.is_some() {
            return bad_request("notifications/initialized must not carry an id");
        }
        state.sessions.mark_initialized(
            &session_id,
            session.negotiated_protocol_version.clone(),
        );
        return StatusCode::ACCEPTED.into_response();
    }

    if session.protocol_initialized && header_str(&headers, PROTOCOL_VERSION_HEADER).is_none() {
        return bad_request("missing mcp-protocol-version header");
    }

    // Notifications get no response body.
    let Some(id) = id else {
        return StatusCode::ACCEPTED.into_response();
    };

    let ctx = RequestContext::new(Some(session_id.clone()));
    let reply = context::run_with_request_context(ctx, dispatch(
        state.clone(),
        session_id,
        method.to_string(),
        params,
        id.clone(),
    ))
    .await;
    (StatusCode::OK, Json(reply)).into_response()
}

async fn initialize(
    state: &Arc<HttpState>,
    headers: &HeaderMap,
    id: Option<serde_json::Value>,
    params: serde_json::Value,
) -> Response {
    let Some(id) = id else {
        return bad_request("initialize must be a request");
    };
    if header_str(headers, SESSION_ID_HEADER).is_some() {
        return bad_request("session is already initialized");
    }
    if !accept_allows_stream(headers) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(rpc_error(
                id,
                -32600,
                "Accept must include application/json and text/event-stream",
            )),
        )
            .into_response();
    }

    let max_sessions = state.service.config.max_sessions;
    if !state.sessions.reserve_slot(max_sessions) {
        let (ok, evicted) = state.sessions.ensure_capacity(max_sessions, true);
        if let Some(evicted) = evicted {
            let _ = evicted.transport.close().await;
        }
        if !ok || !state.sessions.reserve_slot(max_sessions) {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(rpc_error(id, -32000, "session capacity exhausted")),
            )
                .into_response();
        }
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let handle = HttpSessionHandle::new();
    let mut entry = SessionEntry::new(session_id.clone(), handle.clone());
    entry.negotiated_protocol_version = params
        .get("protocolVersion")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| Some(PROTOCOL_VERSION.to_string()));
    entry.auth_fingerprint = header_str(headers, "authorization")
        .map(|a| hex::encode(Sha256::digest(a.as_bytes())));
    state.sessions.insert(entry);
    state.sessions.release_slot();
    state.register_channel(&session_id, handle);

    let result = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "subscribe": true, "listChanged": true },
        },
        "serverInfo": {
            "name": "fetchgate",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    (
        StatusCode::OK,
        [(SESSION_ID_HEADER, session_id)],
        Json(rpc_result(id, result)),
    )
        .into_response()
}

fn fetch_url_tool_descriptor() -> serde_json::Value {
    serde_json::json!({
        "name": "fetch-url",
        "description": "Fetch a public web URL safely and convert it to Markdown (cached; supports async task mode)",
        "inputSchema": {
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch" },
                "forceRefresh": { "type": "boolean", "description": "Bypass the cache read; the fresh result is still cached" },
                "skipNoiseRemoval": { "type": "boolean", "description": "Pass raw HTML to the Markdown translator" },
                "maxBytes": { "type": "integer", "description": "Cap on bytes read from the response body" },
                "task": {
                    "type": "object",
                    "description": "Present: run asynchronously and return a task summary",
                    "properties": { "ttl": { "type": "integer", "minimum": 1000, "maximum": 86400000 } }
                }
            }
        }
    })
}

fn call_tool_reply(payload: serde_json::Value, is_error: bool) -> serde_json::Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
        "structuredContent": payload,
        "isError": is_error,
    })
}

async fn dispatch(
    state: Arc<HttpState>,
    session_id: String,
    method: String,
    params: serde_json::Value,
    id: serde_json::Value,
) -> serde_json::Value {
    let owner = tasks::owner_key(Some(&session_id), None, None);
    match method.as_str() {
        "tools/list" => rpc_result(id, serde_json::json!({ "tools": [fetch_url_tool_descriptor()] })),
        "tools/call" => tools_call(&state, &owner, params, id).await,
        "tasks/get" => {
            let Some(task_id) = params.get("taskId").and_then(|v| v.as_str()) else {
                return rpc_error(id, -32602, "taskId is required");
            };
            match state.service.tasks.get_task(task_id, &owner) {
                Some(task) => rpc_result(id, serde_json::json!({ "task": task })),
                None => rpc_error(id, -32002, "task not found"),
            }
        }
        "tasks/list" => {
            let cursor = params.get("cursor").and_then(|v| v.as_str());
            let limit = params.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
            match state.service.tasks.list_tasks(&owner, cursor, limit) {
                Ok(page) => {
                    let mut result = serde_json::json!({ "tasks": page.tasks });
                    if let Some(next) = page.next_cursor {
                        result["nextCursor"] = serde_json::json!(next);
                    }
                    rpc_result(id, result)
                }
                Err(TaskError::InvalidCursor) => rpc_error(id, -32602, "invalid cursor"),
                Err(e) => rpc_error(id, -32000, &e.to_string()),
            }
        }
        "tasks/cancel" => {
            let Some(task_id) = params.get("taskId").and_then(|v| v.as_str()) else {
                return rpc_error(id, -32602, "taskId is required");
            };
            let message = params
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("cancelled by client");
            match state.service.tasks.cancel_task(task_id, &owner, message) {
                Some(task) => rpc_result(id, serde_json::json!({ "task": task })),
                None => rpc_error(id, -32002, "task not found"),
            }
        }
        "tasks/result" => {
            let Some(task_id) = params.get("taskId").and_then(|v| v.as_str()) else {
                return rpc_error(id, -32602, "taskId is required");
            };
            match state.service.tasks.wait_for_terminal(task_id, &owner, None).await {
                Ok(Some(task)) => {
                    state.service.tasks.shrink_ttl_after_delivery(task_id);
                    match task.status {
                        TaskStatus::Completed => {
                            let payload = task.result.clone().unwrap_or(serde_json::json!({}));
                            rpc_result(id, call_tool_reply(payload, false))
                        }
                        TaskStatus::Failed => {
                            let err = task.error.clone().unwrap_or(serde_json::json!({
                                "code": -32000, "message": "task failed",
                            }));
                            serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": err })
                        }
                        TaskStatus::Cancelled => rpc_error(id, -32000, "task was cancelled"),
                        _ => rpc_error(id, -32000, "task is not terminal"),
                    }
                }
                Ok(None) => rpc_error(id, -32002, "task not found or expired"),
                Err(e) => rpc_error(id, -32000, &e.to_string()),
            }
        }
        "resources/read" => {
            let Some(uri) = params.get("uri").and_then(|v| v.as_str()) else {
                return rpc_error(id, -32602, "uri is required");
            };
            let Some((ns, hash)) = cache::parse_resource_uri(uri) else {
                return rpc_error(id, -32602, "unrecognized resource uri");
            };
            match state.service.cache.peek_by_resource(&ns, &hash) {
                Some(entry) => rpc_result(
                    id,
                    serde_json::json!({
                        "contents": [{
                            "uri": uri,
                            "mimeType": "text/markdown",
                            "text": String::from_utf8_lossy(&entry.content),
                        }],
                    }),
                ),
                None => rpc_error(id, -32002, "resource not found"),
            }
        }
        "resources/subscribe" | "resources/unsubscribe" => {
            let Some(uri) = params.get("uri").and_then(|v| v.as_str()) else {
                return rpc_error(id, -32602, "uri is required");
            };
            let Some(handle) = state.channel(&session_id) else {
                return rpc_error(id, -32001, "session has no channel");
            };
            if method == "resources/subscribe" {
                handle.subscribe(uri);
            } else {
                handle.unsubscribe(uri);
            }
            rpc_result(id, serde_json::json!({}))
        }
        "completion/complete" => rpc_result(
            id,
            serde_json::json!({
                "completion": { "values": [], "total": 0, "hasMore": false },
            }),
        ),
        _ => rpc_error(id, -32601, &format!("method not found: {method}")),
    }
}

async fn tools_call(
    state: &Arc<HttpState>,
    owner: &str,
    params: serde_json::Value,
    id: serde_json::Value,
) -> serde_json::Value {
    let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    if name != "fetch-url" {
        return rpc_error(id, -32602, &format!("unknown tool: {name}"));
    }
    let args = params.get("arguments").cloned().unwrap_or(serde_json::Value::Null);
    let Some(url) = args.get("url").and_then(|v| v.as_str()).filter(|s| !s.trim().is_empty())
    else {
        return rpc_result(
            id,
            call_tool_reply(
                serde_json::json!({ "error": "url must be a non-empty string", "url": "" }),
                true,
            ),
        );
    };
    let req = FetchUrlRequest {
        url: url.to_string(),
        force_refresh: args
            .get("forceRefresh")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        skip_noise_removal: args
            .get("skipNoiseRemoval")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        max_bytes: args
            .get("maxBytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize),
    };

    if let Some(task_opts) = args.get("task") {
        let ttl = task_opts.get("ttl").and_then(|v| v.as_u64());
        return match state.service.start_fetch_task(req, ttl, owner) {
            Ok(task) => {
                let task_id = task.task_id.clone();
                let mut result = serde_json::json!({ "task": task });
                result["_meta"] = serde_json::json!({ RELATED_TASK_META: { "taskId": task_id } });
                rpc_result(id, result)
            }
            Err(e) => rpc_result(
                id,
                call_tool_reply(
                    serde_json::json!({ "error": e.to_string(), "url": url }),
                    true,
                ),
            ),
        };
    }

    let cancel = CancellationToken::new();
    let budget = state.service.config.fetch_timeout + std::time::Duration::from_secs(5);
    let outcome = tokio::time::timeout(budget, state.service.fetch_url(&req, &cancel)).await;
    match outcome {
        Ok(Ok(result)) => {
            let payload = serde_json::to_value(&result).unwrap_or(serde_json::json!({}));
            rpc_result(id, call_tool_reply(payload, false))
        }
        Ok(Err(e)) => rpc_result(id, call_tool_reply(error_payload(&e, url), true)),
        Err(_) => {
            cancel.cancel();
            let e = fetchgate_core::FetchError::new(
                fetchgate_core::ErrorKind::Timeout,
                "tool call timed out",
            );
            rpc_result(id, call_tool_reply(error_payload(&e, url), true))
        }
    }
}

async fn handle_get(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Some(name) = duplicated_single_value_header(&headers) {
        return bad_request(&format!("duplicate {name} header"));
    }
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return bad_request("missing mcp-session-id header");
    };
    if state.sessions.get(session_id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.sessions.touch(session_id);
    let Some(handle) = state.channel(session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(rx) = handle
        .rx
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    else {
        return StatusCode::CONFLICT.into_response();
    };

    let closed = handle.closed.clone();
    let stream = futures_util::stream::unfold((rx, closed), |(mut rx, closed)| async move {
        tokio::select! {
            _ = closed.cancelled() => None,
            item = rx.recv() => item.map(|v| {
                (
                    Ok::<Event, Infallible>(Event::default().event("message").data(v.to_string())),
                    (rx, closed),
                )
            }),
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_delete(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Some(name) = duplicated_single_value_header(&headers) {
        return bad_request(&format!("duplicate {name} header"));
    }
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let Some(entry) = state.sessions.remove(session_id) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    // Cancel the owner's in-flight tasks along with the session.
    let owner = tasks::owner_key(Some(session_id), None, None);
    state
        .service
        .tasks
        .cancel_tasks_by_owner(&owner, "session closed");
    if let Err(e) = entry.transport.close().await {
        tracing::warn!(session_id, error = %e, "session close failed");
    }
    state.prune_closed_channels();
    StatusCode::OK.into_response()
}
