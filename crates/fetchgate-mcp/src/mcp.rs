//! MCP stdio front: the `fetch-url` tool plus companion task tools.
//!
//! The stdio framing library does not carry the experimental `tasks/*`
//! methods, so the task surface is exposed here as tools over the same task
//! manager the HTTP front dispatches to.

use crate::context::{self, RequestContext};
use crate::service::{error_payload, FetchService, FetchUrlRequest};
use crate::tasks::{self, TaskError, TaskStatus};
use fetchgate_core::{ErrorKind, FetchError};
use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) const RELATED_TASK_META: &str = "io.modelcontextprotocol/related-task";

fn tool_result(payload: serde_json::Value) -> CallToolResult {
    // Structured content for machine consumers plus a text fallback for
    // clients that only read `content[0].text`.
    let mut r = CallToolResult::structured(payload.clone());
    r.content = vec![Content::text(payload.to_string())];
    r
}

fn error_result(payload: serde_json::Value) -> CallToolResult {
    let mut r = tool_result(payload);
    r.is_error = Some(true);
    r
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TaskOptions {
    /// Task lifetime in milliseconds, clamped to [1s, 24h].
    #[serde(default)]
    ttl: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct FetchUrlArgs {
    /// The URL to fetch (required).
    #[serde(default)]
    url: Option<String>,
    /// Bypass the cache read; the fresh result is still cached.
    #[serde(default)]
    force_refresh: Option<bool>,
    /// Pass raw HTML to the Markdown translator.
    #[serde(default)]
    skip_noise_removal: Option<bool>,
    /// Cap on bytes read from the response body (bounded by server config).
    #[serde(default)]
    max_bytes: Option<u64>,
    /// Present: run asynchronously and return a task summary immediately.
    #[serde(default)]
    task: Option<TaskOptions>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct TaskIdArgs {
    /// Task id (required).
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct TaskListArgs {
    /// Opaque cursor from a previous page.
    #[serde(default)]
    cursor: Option<String>,
    /// Page size (bounded).
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
struct TaskCancelArgs {
    /// Task id (required).
    #[serde(default)]
    task_id: Option<String>,
    /// Optional status message recorded on the cancelled task.
    #[serde(default)]
    message: Option<String>,
}

fn missing(field: &str) -> CallToolResult {
    error_result(serde_json::json!({
        "error": format!("{field} must be a non-empty string"),
        "url": "",
    }))
}

fn task_not_found(id: &str) -> CallToolResult {
    error_result(serde_json::json!({
        "error": format!("task {id} not found or expired"),
        "taskId": id,
    }))
}

#[derive(Clone)]
pub struct FetchGateMcp {
    tool_router: RmcpToolRouter<Self>,
    service: Arc<FetchService>,
}

#[tool_router]
impl FetchGateMcp {
    pub fn new(service: Arc<FetchService>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            service,
        }
    }

    /// Owner scope of the stdio transport: one anonymous caller.
    fn owner(&self) -> String {
        tasks::owner_key(context::session_id().as_deref(), None, None)
    }

    fn task_payload(task: &crate::tasks::Task) -> serde_json::Value {
        serde_json::to_value(task).unwrap_or_else(|_| serde_json::json!({}))
    }

    #[tool(
        name = "fetch-url",
        description = "Fetch a public web URL safely and convert it to Markdown (cached; supports async task mode)"
    )]
    async fn fetch_url(
        &self,
        params: Parameters<Option<FetchUrlArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let ctx = RequestContext::new(None);
        let service = self.service.clone();
        let owner = self.owner();
        context::run_with_request_context(ctx, async move {
            let Some(url) = args.url.filter(|u| !u.trim().is_empty()) else {
                return Ok(missing("url"));
            };
            let req = FetchUrlRequest {
                url: url.clone(),
                force_refresh: args.force_refresh.unwrap_or(false),
                skip_noise_removal: args.skip_noise_removal.unwrap_or(false),
                max_bytes: args.max_bytes.map(|n| n as usize),
            };

            if let Some(task_opts) = args.task {
                return Ok(match service.start_fetch_task(req, task_opts.ttl, &owner) {
                    Ok(task) => tool_result(serde_json::json!({
                        "task": Self::task_payload(&task),
                        "_meta": { RELATED_TASK_META: { "taskId": task.task_id } },
                    })),
                    Err(e) => error_result(serde_json::json!({
                        "error": e.to_string(),
                        "url": url,
                    })),
                });
            }

            // Tool budget: the fetch timeout plus padding for translation.
            let budget = service.config.fetch_timeout + Duration::from_secs(5);
            let cancel = CancellationToken::new();
            let outcome = tokio::time::timeout(budget, service.fetch_url(&req, &cancel)).await;
            let outcome = match outcome {
                Ok(r) => r,
                Err(_) => {
                    cancel.cancel();
                    Err(FetchError::new(ErrorKind::Timeout, "tool call timed out").with_url(&url))
                }
            };
            Ok(match outcome {
                Ok(result) => tool_result(
                    serde_json::to_value(&result)
                        .unwrap_or_else(|_| serde_json::json!({})),
                ),
                Err(e) => error_result(error_payload(&e, &url)),
            })
        })
        .await
    }

    #[tool(name = "task-get", description = "Get the current snapshot of a fetch task")]
    async fn task_get(
        &self,
        params: Parameters<Option<TaskIdArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let Some(id) = args.task_id.filter(|s| !s.trim().is_empty()) else {
            return Ok(missing("taskId"));
        };
        Ok(match self.service.tasks.get_task(&id, &self.owner()) {
            Some(task) => tool_result(serde_json::json!({ "task": Self::task_payload(&task) })),
            None => task_not_found(&id),
        })
    }

    #[tool(name = "task-list", description = "List fetch tasks (cursor-paginated)")]
    async fn task_list(
        &self,
        params: Parameters<Option<TaskListArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        Ok(
            match self
                .service
                .tasks
                .list_tasks(&self.owner(), args.cursor.as_deref(), args.limit)
            {
                Ok(page) => {
                    let mut payload = serde_json::json!({
                        "tasks": page.tasks.iter().map(Self::task_payload).collect::<Vec<_>>(),
                    });
                    if let Some(cursor) = page.next_cursor {
                        payload["nextCursor"] = serde_json::json!(cursor);
                    }
                    tool_result(payload)
                }
                Err(TaskError::InvalidCursor) => error_result(serde_json::json!({
                    "error": "invalid cursor",
                })),
                Err(e) => error_result(serde_json::json!({ "error": e.to_string() })),
            },
        )
    }

    #[tool(name = "task-cancel", description = "Cancel a fetch task (idempotent)")]
    async fn task_cancel(
        &self,
        params: Parameters<Option<TaskCancelArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let Some(id) = args.task_id.filter(|s| !s.trim().is_empty()) else {
            return Ok(missing("taskId"));
        };
        let message = args.message.unwrap_or_else(|| "cancelled by client".to_string());
        Ok(
            match self.service.tasks.cancel_task(&id, &self.owner(), &message) {
                Some(task) => tool_result(serde_json::json!({ "task": Self::task_payload(&task) })),
                None => task_not_found(&id),
            },
        )
    }

    #[tool(
        name = "task-result",
        description = "Wait for a fetch task to finish and return its result"
    )]
    async fn task_result(
        &self,
        params: Parameters<Option<TaskIdArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let Some(id) = args.task_id.filter(|s| !s.trim().is_empty()) else {
            return Ok(missing("taskId"));
        };
        let owner = self.owner();
        let task = match self.service.tasks.wait_for_terminal(&id, &owner, None).await {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(task_not_found(&id)),
            Err(e) => {
                return Ok(error_result(serde_json::json!({ "error": e.to_string() })));
            }
        };

        Ok(match task.status {
            TaskStatus::Completed => {
                self.service.tasks.shrink_ttl_after_delivery(&id);
                let mut payload = task.result.clone().unwrap_or_else(|| serde_json::json!({}));
                payload["_meta"] =
                    serde_json::json!({ RELATED_TASK_META: { "taskId": task.task_id } });
                tool_result(payload)
            }
            TaskStatus::Failed => {
                self.service.tasks.shrink_ttl_after_delivery(&id);
                error_result(task.error.clone().unwrap_or_else(
                    || serde_json::json!({ "error": "task failed", "taskId": task.task_id }),
                ))
            }
            TaskStatus::Cancelled => error_result(serde_json::json!({
                "error": "task was cancelled",
                "taskId": task.task_id,
            })),
            // wait_for_terminal never hands back a non-terminal task.
            _ => error_result(serde_json::json!({
                "error": "task is not terminal",
                "taskId": task.task_id,
            })),
        })
    }
}

#[tool_handler]
impl rmcp::ServerHandler for FetchGateMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Safe URL fetching: fetch-url validates the target, resolves it through an \
                 SSRF guard, follows redirects with pinned connections, and returns Markdown. \
                 Pass task:{ttl} for async mode; poll with task-get / task-result."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub async fn serve_stdio(service: Arc<FetchService>) -> Result<(), McpError> {
    let svc = FetchGateMcp::new(service);
    let running = svc
        .serve(stdio())
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    // Keep the stdio server alive until the client closes.
    running
        .waiting()
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}
