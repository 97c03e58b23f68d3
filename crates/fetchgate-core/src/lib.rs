use serde::{Deserialize, Serialize};

/// Closed classification of everything that can go wrong between accepting a
/// URL and handing back Markdown. New failure modes must be mapped into one
/// of these kinds; callers match on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The caller aborted before the request completed.
    Canceled,
    /// The caller aborted while the body was being read.
    AbortedDuringRead,
    Timeout,
    RateLimited,
    /// Upstream answered with an HTTP error status (>= 400).
    Http,
    TooManyRedirects,
    MissingRedirectLocation,
    /// Transport-level failure (connect, TLS, reset, ...).
    Network,
    Validation,
    BlockedHost,
    BadRedirect,
    NoData,
    InvalidArg,
    UnsupportedContentEncoding,
    BinaryContent,
    UnsupportedRedirectProtocol,
    Unknown,
}

impl ErrorKind {
    /// Stable string code surfaced in `details`, where one exists.
    pub fn code(self) -> Option<&'static str> {
        match self {
            Self::Validation => Some("VALIDATION_ERROR"),
            Self::BlockedHost => Some("EBLOCKED"),
            Self::BadRedirect => Some("EBADREDIRECT"),
            Self::NoData => Some("ENODATA"),
            Self::InvalidArg => Some("EINVAL"),
            Self::UnsupportedContentEncoding => Some("unsupported_content_encoding"),
            Self::BinaryContent => Some("binary_content_detected"),
            Self::UnsupportedRedirectProtocol => Some("EUNSUPPORTEDPROTOCOL"),
            _ => None,
        }
    }

    /// HTTP-status equivalent for kinds that have one. `Http` carries its
    /// received status on the error value instead.
    pub fn http_status(self) -> Option<u16> {
        match self {
            Self::Canceled | Self::AbortedDuringRead => Some(499),
            Self::Timeout => Some(504),
            Self::RateLimited => Some(429),
            Self::TooManyRedirects | Self::MissingRedirectLocation => Some(500),
            Self::Validation
            | Self::BlockedHost
            | Self::BadRedirect
            | Self::NoData
            | Self::InvalidArg => Some(400),
            Self::UnsupportedContentEncoding => Some(415),
            Self::BinaryContent => Some(500),
            Self::Http
            | Self::Network
            | Self::UnsupportedRedirectProtocol
            | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
    /// The URL the failure is attributed to. For redirect chains this is the
    /// failing hop, not the URL the caller originally passed.
    pub url: Option<String>,
    /// Explicit status: the received upstream status for `Http`, unset
    /// otherwise (the kind default applies).
    pub status: Option<u16>,
    pub retry_after_s: Option<u64>,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            url: None,
            status: None,
            retry_after_s: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Http, message);
        e.status = Some(status);
        e
    }

    pub fn rate_limited(retry_after_s: u64, message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::RateLimited, message);
        e.retry_after_s = Some(retry_after_s);
        e
    }

    /// The status a caller should surface: received status for `Http`,
    /// otherwise the kind's equivalent.
    pub fn surfaced_status(&self) -> Option<u16> {
        self.status.or_else(|| self.kind.http_status())
    }

    pub fn code(&self) -> Option<&'static str> {
        self.kind.code()
    }

    /// Structured `details` object for tool results and task errors.
    pub fn details(&self) -> serde_json::Value {
        let mut m = serde_json::Map::new();
        match self.code() {
            Some(c) => {
                m.insert("code".to_string(), serde_json::json!(c));
            }
            None => {
                m.insert("reason".to_string(), serde_json::json!(self.kind));
            }
        }
        if let Some(s) = self.surfaced_status() {
            m.insert("status".to_string(), serde_json::json!(s));
        }
        if let Some(ra) = self.retry_after_s {
            m.insert("retryAfter".to_string(), serde_json::json!(ra));
        }
        serde_json::Value::Object(m)
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Parse a `Retry-After` header value into seconds.
///
/// Accepts a non-negative integer (delta seconds) or an HTTP-date; an
/// HTTP-date in the past yields 0. Absent or unparseable values default
/// to 60.
pub fn parse_retry_after(value: Option<&str>) -> u64 {
    let Some(v) = value else { return 60 };
    let v = v.trim();
    if !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = v.parse::<u64>() {
            return n;
        }
    }
    if let Ok(t) = chrono::DateTime::parse_from_rfc2822(v) {
        let delta_ms = t
            .with_timezone(&chrono::Utc)
            .signed_duration_since(chrono::Utc::now())
            .num_milliseconds();
        if delta_ms <= 0 {
            return 0;
        }
        return ((delta_ms + 999) / 1000) as u64;
    }
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatedDoc {
    pub markdown: String,
    pub title: Option<String>,
}

/// External collaborator: HTML (or plain text) to Markdown.
///
/// Translation quality is out of scope for this crate; implementations only
/// need to be deterministic and never panic on arbitrary input.
pub trait HtmlTranslator: Send + Sync {
    fn translate(
        &self,
        body: &str,
        content_type: Option<&str>,
        skip_noise_removal: bool,
    ) -> Result<TranslatedDoc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_integer_and_default() {
        assert_eq!(parse_retry_after(Some("60")), 60);
        assert_eq!(parse_retry_after(Some("0")), 0);
        assert_eq!(parse_retry_after(Some(" 15 ")), 15);
        assert_eq!(parse_retry_after(None), 60);
        assert_eq!(parse_retry_after(Some("soon")), 60);
        // Negative integers are not "non-negative integers".
        assert_eq!(parse_retry_after(Some("-5")), 60);
    }

    #[test]
    fn retry_after_http_date_in_past_is_zero() {
        assert_eq!(parse_retry_after(Some("Sun, 06 Nov 1994 08:49:37 GMT")), 0);
    }

    #[test]
    fn retry_after_http_date_in_future_rounds_up() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let s = future.to_rfc2822();
        let got = parse_retry_after(Some(&s));
        // Ceil of the remaining delta; allow scheduling slack.
        assert!((88..=91).contains(&got), "got {got}");
    }

    #[test]
    fn surfaced_status_prefers_received_status() {
        let e = FetchError::http(503, "upstream unavailable");
        assert_eq!(e.surfaced_status(), Some(503));
        let e = FetchError::new(ErrorKind::BlockedHost, "blocked");
        assert_eq!(e.surfaced_status(), Some(400));
        assert_eq!(e.code(), Some("EBLOCKED"));
    }

    #[test]
    fn details_carries_code_or_reason() {
        let e = FetchError::new(ErrorKind::BinaryContent, "binary content detected");
        assert_eq!(e.details()["code"], "binary_content_detected");

        let e = FetchError::rate_limited(30, "slow down");
        assert_eq!(e.details()["retryAfter"], 30);
        assert_eq!(e.details()["reason"], "rate_limited");

        let e = FetchError::new(ErrorKind::Network, "connection reset").with_url("https://x.test/");
        assert_eq!(e.details()["reason"], "network");
        assert_eq!(e.surfaced_status(), None);
    }
}
