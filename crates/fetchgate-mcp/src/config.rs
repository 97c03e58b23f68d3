//! Environment-variable configuration.
//!
//! All knobs are read once at startup; clamping and defaults live here so
//! the rest of the server only ever sees resolved values.

use std::time::Duration;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub fetch_timeout: Duration,
    pub max_html_bytes: usize,
    /// Cap on inline Markdown characters in tool results. `0` = unlimited.
    pub max_inline_content_chars: usize,
    pub allow_local_fetch: bool,
    pub user_agent: String,
    pub max_redirects: usize,
    pub max_url_length: usize,
    pub tasks_max_total: usize,
    pub tasks_max_per_owner: usize,
    pub cache_enabled: bool,
    pub cache_max_bytes: usize,
    pub cache_max_entry_bytes: usize,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    pub session_ttl: Duration,
    pub max_sessions: usize,
    /// Sweep-interval override; derived from the TTL when unset.
    pub session_sweep_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(15_000),
            max_html_bytes: 10 * 1024 * 1024,
            max_inline_content_chars: 0,
            allow_local_fetch: false,
            user_agent: "fetchgate/0.1".to_string(),
            max_redirects: 5,
            max_url_length: 2048,
            tasks_max_total: 100,
            tasks_max_per_owner: 10,
            cache_enabled: true,
            cache_max_bytes: 50 * 1024 * 1024,
            cache_max_entry_bytes: 10 * 1024 * 1024,
            cache_max_entries: 100,
            cache_ttl: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(30 * 60),
            max_sessions: 100,
            session_sweep_interval: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fetch_timeout: Duration::from_millis(
                env_u64("FETCH_TIMEOUT_MS")
                    .map(|v| v.clamp(1_000, 60_000))
                    .unwrap_or(d.fetch_timeout.as_millis() as u64),
            ),
            max_html_bytes: env_u64("MAX_HTML_BYTES")
                .map(|v| v as usize)
                .unwrap_or(d.max_html_bytes),
            max_inline_content_chars: env_u64("MAX_INLINE_CONTENT_CHARS")
                .map(|v| v as usize)
                .unwrap_or(d.max_inline_content_chars),
            allow_local_fetch: env_bool("ALLOW_LOCAL_FETCH", d.allow_local_fetch),
            user_agent: env_string("USER_AGENT").unwrap_or(d.user_agent),
            max_redirects: env_u64("MAX_REDIRECTS")
                .map(|v| (v as usize).min(20))
                .unwrap_or(d.max_redirects),
            max_url_length: env_u64("MAX_URL_LENGTH")
                .map(|v| (v as usize).max(16))
                .unwrap_or(d.max_url_length),
            tasks_max_total: env_u64("TASKS_MAX_TOTAL")
                .map(|v| (v as usize).max(1))
                .unwrap_or(d.tasks_max_total),
            tasks_max_per_owner: env_u64("TASKS_MAX_PER_OWNER")
                .map(|v| (v as usize).max(1))
                .unwrap_or(d.tasks_max_per_owner),
            cache_enabled: env_bool("CACHE_ENABLED", d.cache_enabled),
            cache_max_bytes: env_u64("CACHE_MAX_BYTES")
                .map(|v| v as usize)
                .unwrap_or(d.cache_max_bytes),
            cache_max_entry_bytes: env_u64("CACHE_MAX_ENTRY_BYTES")
                .map(|v| v as usize)
                .unwrap_or(d.cache_max_entry_bytes),
            cache_max_entries: env_u64("CACHE_MAX_ENTRIES")
                .map(|v| (v as usize).max(1))
                .unwrap_or(d.cache_max_entries),
            cache_ttl: env_u64("CACHE_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.cache_ttl),
            session_ttl: env_u64("SESSION_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.session_ttl),
            max_sessions: env_u64("MAX_SESSIONS")
                .map(|v| (v as usize).max(1))
                .unwrap_or(d.max_sessions),
            session_sweep_interval: env_u64("SESSION_SWEEP_INTERVAL_MS").map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let saved: Vec<(String, Option<String>)> = keys
                .iter()
                .map(|k| (k.to_string(), std::env::var(k).ok()))
                .collect();
            for (k, _) in &saved {
                std::env::remove_var(k);
            }
            Self { _lock: lock, saved }
        }

        fn set(&self, k: &str, v: &str) {
            std::env::set_var(k, v);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn defaults_without_env() {
        let _env = EnvGuard::new(&["FETCH_TIMEOUT_MS", "CACHE_ENABLED", "ALLOW_LOCAL_FETCH"]);
        let c = Config::from_env();
        assert_eq!(c.fetch_timeout, Duration::from_millis(15_000));
        assert!(c.cache_enabled);
        assert!(!c.allow_local_fetch);
        assert_eq!(c.max_html_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn fetch_timeout_is_clamped() {
        let env = EnvGuard::new(&["FETCH_TIMEOUT_MS"]);
        env.set("FETCH_TIMEOUT_MS", "10");
        assert_eq!(Config::from_env().fetch_timeout, Duration::from_millis(1_000));
        env.set("FETCH_TIMEOUT_MS", "600000");
        assert_eq!(Config::from_env().fetch_timeout, Duration::from_millis(60_000));
        env.set("FETCH_TIMEOUT_MS", "garbage");
        assert_eq!(Config::from_env().fetch_timeout, Duration::from_millis(15_000));
    }

    #[test]
    fn booleans_accept_the_usual_spellings() {
        let env = EnvGuard::new(&["ALLOW_LOCAL_FETCH", "CACHE_ENABLED"]);
        for v in ["1", "true", "YES", "on"] {
            env.set("ALLOW_LOCAL_FETCH", v);
            assert!(Config::from_env().allow_local_fetch, "{v}");
        }
        env.set("CACHE_ENABLED", "false");
        assert!(!Config::from_env().cache_enabled);
    }
}
