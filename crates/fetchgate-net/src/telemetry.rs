//! Per-fetch telemetry: one `start`, then exactly one terminal `end` or
//! `error`. URLs are redacted (userinfo, query, fragment) before they reach
//! any sink, and publication is infallible by construction.

use fetchgate_core::FetchError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Wall-clock threshold past which a completed fetch logs a warning.
const SLOW_FETCH_MS: u128 = 5_000;

/// Strip userinfo, query, and fragment; the path is considered safe.
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut u) => {
            let _ = u.set_username("");
            let _ = u.set_password(None);
            u.set_query(None);
            u.set_fragment(None);
            u.to_string()
        }
        // Not parseable: keep everything before query/fragment markers.
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct AmbientIds {
    pub request_id: Option<String>,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    Start {
        ids: AmbientIds,
        method: &'static str,
        url: String,
    },
    End {
        ids: AmbientIds,
        method: &'static str,
        url: String,
        status: u16,
        duration_ms: u128,
    },
    Error {
        ids: AmbientIds,
        method: &'static str,
        url: String,
        message: String,
        duration_ms: u128,
    },
}

/// Sinks must be cheap and must not block; the signature keeps them from
/// failing the fetch path.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, event: &FetchEvent);
}

/// Default sink: structured tracing events.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn publish(&self, event: &FetchEvent) {
        match event {
            FetchEvent::Start { ids, method, url } => {
                tracing::info!(
                    request_id = ids.request_id.as_deref(),
                    operation_id = ids.operation_id.as_deref(),
                    method,
                    url = %url,
                    "fetch start"
                );
            }
            FetchEvent::End {
                ids,
                method,
                url,
                status,
                duration_ms,
            } => {
                tracing::info!(
                    request_id = ids.request_id.as_deref(),
                    operation_id = ids.operation_id.as_deref(),
                    method,
                    url = %url,
                    status,
                    duration_ms,
                    "fetch end"
                );
            }
            FetchEvent::Error {
                ids,
                method,
                url,
                message,
                duration_ms,
            } => {
                tracing::info!(
                    request_id = ids.request_id.as_deref(),
                    operation_id = ids.operation_id.as_deref(),
                    method,
                    url = %url,
                    error = %message,
                    duration_ms,
                    "fetch error"
                );
            }
        }
    }
}

/// Tracks one fetch from `start` to its single terminal event.
pub struct FetchSpan {
    sink: Arc<dyn TelemetrySink>,
    ids: AmbientIds,
    method: &'static str,
    url: String,
    started: Instant,
    finished: AtomicBool,
}

impl FetchSpan {
    pub fn start(
        sink: Arc<dyn TelemetrySink>,
        ids: AmbientIds,
        method: &'static str,
        url: &str,
    ) -> Self {
        let url = redact_url(url);
        sink.publish(&FetchEvent::Start {
            ids: ids.clone(),
            method,
            url: url.clone(),
        });
        Self {
            sink,
            ids,
            method,
            url,
            started: Instant::now(),
            finished: AtomicBool::new(false),
        }
    }

    fn finish(&self) -> Option<u128> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return None;
        }
        let duration_ms = self.started.elapsed().as_millis();
        if duration_ms > SLOW_FETCH_MS {
            tracing::warn!(url = %self.url, duration_ms, "slow fetch");
        }
        Some(duration_ms)
    }

    pub fn record_end(&self, status: u16) {
        let Some(duration_ms) = self.finish() else {
            return;
        };
        self.sink.publish(&FetchEvent::End {
            ids: self.ids.clone(),
            method: self.method,
            url: self.url.clone(),
            status,
            duration_ms,
        });
    }

    pub fn record_error(&self, err: &FetchError) {
        let Some(duration_ms) = self.finish() else {
            return;
        };
        self.sink.publish(&FetchEvent::Error {
            ids: self.ids.clone(),
            method: self.method,
            url: self.url.clone(),
            message: err.to_string(),
            duration_ms,
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records events for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<FetchEvent>>,
    }

    impl TelemetrySink for RecordingSink {
        fn publish(&self, event: &FetchEvent) {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
        }
    }
}
