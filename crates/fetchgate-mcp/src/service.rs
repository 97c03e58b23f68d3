//! The `fetch-url` pipeline and its task-mode dispatch.
//!
//! Both fronts (stdio tool router and the streamable-HTTP endpoint) funnel
//! into this service, so cache, tasks, and the fetcher behave identically
//! regardless of transport.

use crate::cache::{self, CacheLimits, ResponseCache};
use crate::config::Config;
use crate::context;
use crate::markdown::TextTranslator;
use crate::tasks::{Task, TaskError, TaskLimits, TaskManager, TaskPatch, TaskStatus};
use fetchgate_core::{ErrorKind, FetchError, HtmlTranslator, Result};
use fetchgate_net::policy::HostPolicy;
use fetchgate_net::resolve::HickoryDns;
use fetchgate_net::telemetry::LogSink;
use fetchgate_net::{rewrite, urlnorm, FetcherConfig, SafeFetcher};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const CACHE_NAMESPACE: &str = "fetch-url";

#[derive(Debug, Clone, Default)]
pub struct FetchUrlRequest {
    pub url: String,
    pub force_refresh: bool,
    pub skip_noise_removal: bool,
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchUrlResult {
    pub markdown: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub truncated: bool,
    pub final_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_resource_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub source: &'static str,
    pub elapsed_ms: u128,
}

/// The `{ error, url, … }` object embedded in error tool results.
pub fn error_payload(e: &FetchError, requested_url: &str) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "error": e.message,
        "url": e.url.as_deref().unwrap_or(requested_url),
        "details": e.details(),
    });
    if let Some(status) = e.surfaced_status() {
        payload["statusCode"] = serde_json::json!(status);
    }
    payload
}

pub struct FetchService {
    pub config: Config,
    fetcher: SafeFetcher,
    translator: Arc<dyn HtmlTranslator>,
    pub cache: Arc<ResponseCache>,
    pub tasks: Arc<TaskManager>,
}

impl FetchService {
    pub fn new(config: Config) -> Self {
        let policy = Arc::new(HostPolicy::new(config.allow_local_fetch));
        let fetcher = SafeFetcher::new(
            FetcherConfig {
                user_agent: config.user_agent.clone(),
                timeout: config.fetch_timeout,
                max_redirects: config.max_redirects,
                max_bytes: config.max_html_bytes,
                max_url_length: config.max_url_length,
            },
            policy,
            Arc::new(HickoryDns::from_system()),
            Arc::new(LogSink),
        );
        let cache = Arc::new(ResponseCache::new(
            config.cache_enabled,
            CacheLimits {
                max_bytes: config.cache_max_bytes,
                max_entry_bytes: config.cache_max_entry_bytes,
                max_entries: config.cache_max_entries,
                ttl: config.cache_ttl,
            },
        ));
        let tasks = Arc::new(TaskManager::new(TaskLimits {
            max_total: config.tasks_max_total,
            max_per_owner: config.tasks_max_per_owner,
        }));
        Self {
            config,
            fetcher,
            translator: Arc::new(TextTranslator::default()),
            cache,
            tasks,
        }
    }

    pub fn policy(&self) -> &Arc<HostPolicy> {
        self.fetcher.policy()
    }

    /// Validate → rewrite → cache read → fetch → translate → cache write.
    pub async fn fetch_url(
        &self,
        req: &FetchUrlRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchUrlResult> {
        let t0 = std::time::Instant::now();

        let normalized = urlnorm::normalize(
            &req.url,
            self.policy(),
            self.config.max_url_length,
        )
        .map_err(|e| e.with_url(&req.url))?;

        let rewritten = rewrite::transform_to_raw(normalized.as_str());
        let resolved_url = rewritten.transformed.then(|| rewritten.url.clone());
        let effective_url = rewritten.url;

        let vary = req
            .skip_noise_removal
            .then(|| serde_json::json!({ "skipNoiseRemoval": true }));
        let key = cache::cache_key(CACHE_NAMESPACE, &effective_url, vary.as_ref());
        let resource = cache::resource_uri(CACHE_NAMESPACE, &cache::url_hash(&effective_url));

        if !req.force_refresh {
            if let Some(entry) = self.cache.get(&key, false) {
                tracing::debug!(url = %effective_url, "cache hit");
                return Ok(FetchUrlResult {
                    markdown: String::from_utf8_lossy(&entry.content).into_owned(),
                    title: entry.title,
                    truncated: false,
                    final_url: entry.url,
                    resolved_url,
                    cache_resource_uri: Some(resource),
                    status_code: None,
                    source: "cache",
                    elapsed_ms: t0.elapsed().as_millis(),
                });
            }
        }

        let doc = self
            .fetcher
            .fetch_text(&effective_url, context::ambient_ids(), req.max_bytes, cancel)
            .await?;

        // Translation is CPU-bound; keep it off the async worker.
        let translator = self.translator.clone();
        let body = doc.text.clone();
        let content_type = doc.content_type.clone();
        let skip = req.skip_noise_removal;
        let translated = tokio::task::spawn_blocking(move || {
            translator.translate(&body, content_type.as_deref(), skip)
        })
        .await
        .map_err(|e| {
            FetchError::new(ErrorKind::Unknown, format!("translation task failed: {e}"))
        })??;

        let mut markdown = translated.markdown;
        let mut truncated = doc.truncated;
        let cap = self.config.max_inline_content_chars;
        if cap > 0 && markdown.chars().count() > cap {
            markdown = markdown.chars().take(cap).collect();
            truncated = true;
        }

        let cached = self.cache.set(
            &key,
            markdown.clone().into_bytes(),
            &doc.final_url,
            translated.title.clone(),
            false,
        );

        Ok(FetchUrlResult {
            markdown,
            title: translated.title,
            truncated,
            final_url: doc.final_url,
            resolved_url,
            cache_resource_uri: cached.then_some(resource),
            status_code: Some(doc.status),
            source: "network",
            elapsed_ms: t0.elapsed().as_millis(),
        })
    }

    /// Task-mode dispatch: create the task, run the pipeline on a background
    /// execution bound to the task's abort token, and record the outcome.
    pub fn start_fetch_task(
        self: &Arc<Self>,
        req: FetchUrlRequest,
        ttl_ms: Option<u64>,
        owner: &str,
    ) -> std::result::Result<Task, TaskError> {
        let (task, abort) = self.tasks.create_task(
            ttl_ms,
            format!("fetching {}", req.url),
            owner,
        )?;

        let svc = self.clone();
        let task_id = task.task_id.clone();
        let ctx = context::current()
            .unwrap_or_else(|| context::RequestContext::new(None));
        tokio::spawn(context::run_with_request_context(ctx, async move {
            let requested_url = req.url.clone();
            let outcome = svc.fetch_url(&req, &abort).await;
            match outcome {
                Ok(result) => {
                    svc.tasks.update_task(
                        &task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Completed),
                            status_message: Some("fetch completed".to_string()),
                            result: serde_json::to_value(&result).ok(),
                            ..TaskPatch::default()
                        },
                    );
                }
                Err(e) if abort.is_cancelled() => {
                    // Cancellation already transitioned the task; keep the
                    // frozen record as-is.
                    tracing::debug!(task_id = %task_id, error = %e, "task aborted");
                }
                Err(e) => {
                    svc.tasks.update_task(
                        &task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Failed),
                            status_message: Some(e.message.clone()),
                            error: Some(serde_json::json!({
                                "code": -32000,
                                "message": e.message,
                                "data": error_payload(&e, &requested_url),
                            })),
                            ..TaskPatch::default()
                        },
                    );
                }
            }
        }));
        Ok(task)
    }

    /// Shutdown fan-out: abort every running task execution.
    pub fn abort_all_task_executions(&self) {
        self.tasks.abort_all();
    }
}
