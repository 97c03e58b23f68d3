use crate::policy::HostPolicy;
use crate::resolve::{DnsBackend, SafeResolver};
use crate::telemetry::{AmbientIds, FetchSpan, TelemetrySink};
use crate::urlnorm::NormalizedUrl;
use fetchgate_core::{parse_retry_after, ErrorKind, FetchError, Result};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod decode;
pub mod policy;
pub mod reader;
pub mod resolve;
pub mod rewrite;
pub mod telemetry;
pub mod urlnorm;

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    /// Per-fetch timeout applied to each hop; composed any-of with the
    /// caller's cancellation token.
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Response byte cap. `0` means unlimited.
    pub max_bytes: usize,
    pub max_url_length: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "fetchgate/0.1".to_string(),
            timeout: Duration::from_secs(15),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_bytes: DEFAULT_MAX_BODY_BYTES,
            max_url_length: urlnorm::DEFAULT_MAX_URL_LENGTH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDoc {
    pub requested_url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub text: String,
    pub size: usize,
    pub truncated: bool,
    pub charset: String,
    pub decode_fell_back: bool,
}

/// The SSRF-guarded HTTP fetcher: normalizes, resolves through the policy
/// walk, follows redirects manually with each hop pinned to its
/// pre-validated address, and reads the body under the byte cap.
pub struct SafeFetcher {
    config: FetcherConfig,
    policy: Arc<HostPolicy>,
    resolver: SafeResolver,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SafeFetcher {
    pub fn new(
        config: FetcherConfig,
        policy: Arc<HostPolicy>,
        dns: Arc<dyn DnsBackend>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let resolver = SafeResolver::new(policy.clone(), dns);
        Self {
            config,
            policy,
            resolver,
            telemetry,
        }
    }

    pub fn policy(&self) -> &Arc<HostPolicy> {
        &self.policy
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Fetch `url` and return its decoded text body. `max_bytes_override`
    /// narrows (never widens) the configured cap.
    pub async fn fetch_text(
        &self,
        url: &str,
        ids: AmbientIds,
        max_bytes_override: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<FetchedDoc> {
        let span = FetchSpan::start(self.telemetry.clone(), ids, "GET", url);
        let result = self.fetch_inner(url, max_bytes_override, cancel).await;
        match &result {
            Ok(doc) => span.record_end(doc.status),
            Err(e) => span.record_error(e),
        }
        result
    }

    async fn fetch_inner(
        &self,
        url: &str,
        max_bytes_override: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<FetchedDoc> {
        let normalized = urlnorm::normalize(url, &self.policy, self.config.max_url_length)
            .map_err(|e| e.with_url(url))?;
        let requested_url = normalized.as_str().to_string();

        let (resp, final_url) = self.fetch_with_redirects(normalized, cancel).await?;
        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after = parse_retry_after(
                resp.headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(
                FetchError::rate_limited(retry_after, format!("rate limited by {final_url}"))
                    .with_url(&final_url),
            );
        }
        if status >= 400 {
            return Err(
                FetchError::http(status, format!("upstream returned HTTP {status}"))
                    .with_url(&final_url),
            );
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if let Some(ct) = content_type.as_deref() {
            if !reader::is_text_like_media_type(ct) {
                return Err(FetchError::new(
                    ErrorKind::BinaryContent,
                    format!("unsupported content type: {ct}"),
                )
                .with_url(&final_url));
            }
        }
        let declared_charset = content_type
            .as_deref()
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_string()));

        let max_bytes = match max_bytes_override {
            Some(n) if self.config.max_bytes == 0 => n,
            Some(n) => n.min(self.config.max_bytes),
            None => self.config.max_bytes,
        };
        let body = reader::read_text(
            resp,
            &final_url,
            max_bytes,
            cancel,
            declared_charset.as_deref(),
        )
        .await?;
        if body.decode_fell_back {
            tracing::warn!(url = %telemetry::redact_url(&final_url), "served undecoded body after decode failure");
        }

        Ok(FetchedDoc {
            requested_url,
            final_url,
            status,
            content_type,
            text: body.text,
            size: body.size,
            truncated: body.truncated,
            charset: body.charset.to_string(),
            decode_fell_back: body.decode_fell_back,
        })
    }

    /// Manual redirect loop. Each hop is preflight-resolved and the
    /// connection pinned to the resolved address so the dialed IP cannot
    /// drift from the validated one.
    async fn fetch_with_redirects(
        &self,
        start: NormalizedUrl,
        cancel: &CancellationToken,
    ) -> Result<(reqwest::Response, String)> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut current: Url = start.url;

        for hop in 0..=self.config.max_redirects {
            let current_str = current.to_string();
            if !visited.insert(current_str.clone()) {
                return Err(FetchError::new(
                    ErrorKind::TooManyRedirects,
                    "redirect loop detected",
                )
                .with_url(&current_str));
            }

            let host = current
                .host_str()
                .ok_or_else(|| {
                    FetchError::new(ErrorKind::Validation, "url lost its host")
                        .with_url(&current_str)
                })?
                .to_string();
            let ip = self
                .resolver
                .resolve_and_validate(&host, cancel)
                .await
                .map_err(|e| e.with_url(&current_str))?;

            let resp = self
                .send_pinned(&current, &host, ip, cancel)
                .await
                .map_err(|e| e.with_url(&current_str))?;

            let status = resp.status().as_u16();
            if !matches!(status, 301 | 302 | 303 | 307 | 308) {
                return Ok((resp, current_str));
            }

            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    FetchError::new(
                        ErrorKind::MissingRedirectLocation,
                        format!("redirect ({status}) without a Location header"),
                    )
                    .with_url(&current_str)
                })?;
            if hop == self.config.max_redirects {
                return Err(FetchError::new(
                    ErrorKind::TooManyRedirects,
                    format!("more than {} redirects", self.config.max_redirects),
                )
                .with_url(&current_str));
            }

            let next = current.join(&location).map_err(|e| {
                FetchError::new(
                    ErrorKind::BadRedirect,
                    format!("unresolvable redirect location {location:?}: {e}"),
                )
                .with_url(&current_str)
            })?;
            if !matches!(next.scheme(), "http" | "https") {
                return Err(FetchError::new(
                    ErrorKind::UnsupportedRedirectProtocol,
                    format!("redirect to unsupported scheme \"{}\"", next.scheme()),
                )
                .with_url(&current_str));
            }
            if !next.username().is_empty() || next.password().is_some() {
                return Err(FetchError::new(
                    ErrorKind::BadRedirect,
                    "redirect target carries credentials",
                )
                .with_url(&current_str));
            }

            let normalized =
                urlnorm::normalize(next.as_str(), &self.policy, self.config.max_url_length)
                    .map_err(|e| e.with_url(next.as_str()))?;
            tracing::debug!(
                from = %telemetry::redact_url(&current_str),
                to = %telemetry::redact_url(normalized.as_str()),
                hop,
                "following redirect"
            );
            current = normalized.url;
        }

        // 0..=max_redirects either returned or failed at the bound.
        Err(FetchError::new(
            ErrorKind::TooManyRedirects,
            format!("more than {} redirects", self.config.max_redirects),
        ))
    }

    /// One GET with the connection pinned to `ip` (hostname hops only; IP
    /// literals dial directly). The per-hop client is dropped on return.
    async fn send_pinned(
        &self,
        url: &Url,
        host: &str,
        ip: std::net::IpAddr,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(self.config.timeout);
        if HostPolicy::normalize_ip(host).is_none() {
            let port = url.port_or_known_default().unwrap_or(80);
            builder = builder.resolve(host, SocketAddr::new(ip, port));
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::new(ErrorKind::Network, format!("client build failed: {e}")))?;

        let request = client
            .get(url.clone())
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(FetchError::new(ErrorKind::Canceled, "request aborted"))
            }
            r = request.send() => r.map_err(classify_reqwest_error),
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::new(ErrorKind::Timeout, format!("request timed out: {e}"))
    } else {
        FetchError::new(ErrorKind::Network, format!("request failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{DnsError, HickoryDns};
    use crate::telemetry::test_support::RecordingSink;
    use crate::telemetry::FetchEvent;
    use async_trait::async_trait;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::net::IpAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    struct StaticDns {
        hosts: BTreeMap<String, IpAddr>,
    }

    #[async_trait]
    impl DnsBackend for StaticDns {
        async fn cname(&self, _host: &str) -> std::result::Result<Option<String>, DnsError> {
            Ok(None)
        }
        async fn lookup_ips(&self, host: &str) -> std::result::Result<Vec<IpAddr>, DnsError> {
            match self.hosts.get(host) {
                Some(ip) => Ok(vec![*ip]),
                None => Err(DnsError::NoRecords(host.to_string())),
            }
        }
    }

    fn local_fetcher(config: FetcherConfig) -> (SafeFetcher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let fetcher = SafeFetcher::new(
            config,
            Arc::new(HostPolicy::new(true)),
            Arc::new(HickoryDns::from_system()),
            sink.clone(),
        );
        (fetcher, sink)
    }

    fn fetch_url(addr: SocketAddr, path: &str) -> String {
        format!("http://{addr}{path}")
    }

    #[tokio::test]
    async fn fetches_plain_text() {
        let app = Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "hello") }),
        );
        let addr = serve(app).await;
        let (fetcher, sink) = local_fetcher(FetcherConfig::default());
        let doc = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(doc.status, 200);
        assert_eq!(doc.text, "hello");
        assert!(!doc.truncated);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], FetchEvent::End { status: 200, .. }));
    }

    #[tokio::test]
    async fn follows_redirect_chain_and_reports_final_url() {
        let app = Router::new()
            .route(
                "/a",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/b")], "") }),
            )
            .route(
                "/b",
                get(|| async { (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/c")], "") }),
            )
            .route(
                "/c",
                get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "landed") }),
            );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let doc = fetcher
            .fetch_text(
                &fetch_url(addr, "/a"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(doc.text, "landed");
        assert!(doc.final_url.ends_with("/c"), "{}", doc.final_url);
    }

    #[tokio::test]
    async fn redirect_to_metadata_endpoint_is_blocked() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, "http://169.254.169.254/latest/meta-data")],
                    "",
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, sink) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::BlockedHost);
        assert_eq!(e.code(), Some("EBLOCKED"));
        assert_eq!(e.surfaced_status(), Some(400));
        assert!(e.message.contains("Blocked"), "{}", e.message);

        let events = sink.events.lock().unwrap();
        assert!(matches!(events[1], FetchEvent::Error { .. }));
    }

    #[tokio::test]
    async fn redirect_at_the_bound_succeeds_and_past_it_fails() {
        let redirect_to = |target: &'static str| {
            get(move || async move { (StatusCode::FOUND, [(header::LOCATION, target)], "") })
        };
        let app = Router::new()
            .route("/1", redirect_to("/2"))
            .route("/2", redirect_to("/3"))
            .route("/3", get(|| async { "done" }));
        let addr = serve(app).await;

        let config = FetcherConfig {
            max_redirects: 2,
            ..FetcherConfig::default()
        };
        let (fetcher, _) = local_fetcher(config.clone());
        let doc = fetcher
            .fetch_text(
                &fetch_url(addr, "/1"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(doc.text, "done");

        let config = FetcherConfig {
            max_redirects: 1,
            ..config
        };
        let (fetcher, _) = local_fetcher(config);
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/1"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::TooManyRedirects);
    }

    #[tokio::test]
    async fn redirect_loop_is_detected() {
        let app = Router::new()
            .route(
                "/x",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/y")], "") }),
            )
            .route(
                "/y",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/x")], "") }),
            );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/x"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::TooManyRedirects);
    }

    #[tokio::test]
    async fn redirect_without_location_fails() {
        let app = Router::new().route(
            "/",
            get(|| async { StatusCode::FOUND }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::MissingRedirectLocation);
    }

    #[tokio::test]
    async fn credentialed_redirect_is_rejected() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, "http://user:pw@example.com/")],
                    "",
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::BadRedirect);
        assert_eq!(e.code(), Some("EBADREDIRECT"));
    }

    #[tokio::test]
    async fn non_http_redirect_scheme_is_rejected() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, "ftp://example.com/file")],
                    "",
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::UnsupportedRedirectProtocol);
        assert_eq!(e.code(), Some("EUNSUPPORTEDPROTOCOL"));
    }

    #[tokio::test]
    async fn pdf_magic_bytes_reject_despite_html_content_type() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    b"%PDF-1.7 not really html".to_vec(),
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::BinaryContent);
        assert_eq!(e.code(), Some("binary_content_detected"));
    }

    #[tokio::test]
    async fn body_is_truncated_at_the_cap() {
        let app = Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "a".repeat(500)) }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let doc = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                Some(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(doc.size, 100);
        assert_eq!(doc.text, "a".repeat(100));
        assert!(doc.truncated);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, "7")],
                    "slow down",
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::RateLimited);
        assert_eq!(e.retry_after_s, Some(7));
        assert_eq!(e.surfaced_status(), Some(429));
    }

    #[tokio::test]
    async fn gzip_bodies_decode_transparently() {
        let app = Router::new().route(
            "/",
            get(|| async {
                let mut e =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                e.write_all(b"compressed greetings").unwrap();
                (
                    [
                        (header::CONTENT_TYPE, "text/plain".to_string()),
                        (header::CONTENT_ENCODING, "gzip".to_string()),
                    ],
                    e.finish().unwrap(),
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let doc = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(doc.text, "compressed greetings");
        assert!(!doc.decode_fell_back);
    }

    #[tokio::test]
    async fn unknown_content_encoding_rejects_with_415() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [
                        (header::CONTENT_TYPE, "text/plain"),
                        (header::CONTENT_ENCODING, "zstd"),
                    ],
                    "whatever",
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::UnsupportedContentEncoding);
        assert_eq!(e.surfaced_status(), Some(415));
    }

    #[tokio::test]
    async fn non_text_content_type_is_gated() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    "bytes",
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::BinaryContent);
    }

    #[tokio::test]
    async fn http_error_statuses_surface_as_received() {
        let app = Router::new().route("/", get(|| async { (StatusCode::NOT_FOUND, "gone") }));
        let addr = serve(app).await;
        let (fetcher, _) = local_fetcher(FetcherConfig::default());
        let e = fetcher
            .fetch_text(
                &fetch_url(addr, "/"),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::Http);
        assert_eq!(e.surfaced_status(), Some(404));
    }

    #[tokio::test]
    async fn hostname_hops_are_pinned_to_the_resolved_address() {
        let app = Router::new().route(
            "/pinned",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "via pin") }),
        );
        let addr = serve(app).await;

        let sink = Arc::new(RecordingSink::default());
        let mut hosts = BTreeMap::new();
        hosts.insert("good.example".to_string(), addr.ip());
        let fetcher = SafeFetcher::new(
            FetcherConfig::default(),
            Arc::new(HostPolicy::new(true)),
            Arc::new(StaticDns { hosts }),
            sink,
        );

        let doc = fetcher
            .fetch_text(
                &format!("http://good.example:{}/pinned", addr.port()),
                AmbientIds::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(doc.text, "via pin");
        assert!(doc.final_url.starts_with("http://good.example:"));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_records_one_error_event() {
        use axum::body::Body;
        use futures_util::stream;

        let app = Router::new().route(
            "/slow",
            get(|| async {
                let chunks = stream::unfold(0u32, |n| async move {
                    if n == 0 {
                        Some((Ok::<_, std::io::Error>("first chunk ".repeat(10)), n + 1))
                    } else {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Some((Ok("never delivered".to_string()), n + 1))
                    }
                });
                (
                    [(header::CONTENT_TYPE, "text/plain")],
                    Body::from_stream(chunks),
                )
            }),
        );
        let addr = serve(app).await;
        let (fetcher, sink) = local_fetcher(FetcherConfig::default());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let e = fetcher
            .fetch_text(&fetch_url(addr, "/slow"), AmbientIds::default(), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::AbortedDuringRead);
        assert_eq!(e.surfaced_status(), Some(499));

        let events = sink.events.lock().unwrap();
        let errors = events
            .iter()
            .filter(|e| matches!(e, FetchEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1, "exactly one terminal error event");
    }
}
