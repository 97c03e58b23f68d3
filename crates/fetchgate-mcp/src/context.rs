//! Ambient request context.
//!
//! A `{ requestId, operationId, sessionId? }` carrier established at request
//! ingress and visible to everything the request runs, including spawned
//! task executions (which re-enter the scope with a snapshot).

use fetchgate_net::telemetry::AmbientIds;
use std::future::Future;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub operation_id: String,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            operation_id: uuid::Uuid::new_v4().to_string(),
            session_id,
        }
    }
}

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Run `f` with `ctx` established as the ambient context.
pub async fn run_with_request_context<F>(ctx: RequestContext, f: F) -> F::Output
where
    F: Future,
{
    REQUEST_CONTEXT.scope(ctx, f).await
}

/// Snapshot of the current carrier, if one is established.
pub fn current() -> Option<RequestContext> {
    REQUEST_CONTEXT.try_with(|c| c.clone()).ok()
}

pub fn request_id() -> Option<String> {
    REQUEST_CONTEXT.try_with(|c| c.request_id.clone()).ok()
}

pub fn operation_id() -> Option<String> {
    REQUEST_CONTEXT.try_with(|c| c.operation_id.clone()).ok()
}

pub fn session_id() -> Option<String> {
    REQUEST_CONTEXT.try_with(|c| c.session_id.clone()).ok().flatten()
}

/// The ids telemetry wants, in its own shape.
pub fn ambient_ids() -> AmbientIds {
    match current() {
        Some(c) => AmbientIds {
            request_id: Some(c.request_id),
            operation_id: Some(c.operation_id),
        },
        None => AmbientIds::default(),
    }
}
