//! SSRF-safe DNS resolution.
//!
//! Resolution order: literal IPs are classified directly; host names are
//! checked against the policy before any lookup; CNAME targets are chased
//! (bounded, cycle-safe) and each intermediate name re-checked; finally every
//! returned address must clear the IP guard.

use crate::policy::{normalize_host, HostPolicy};
use async_trait::async_trait;
use fetchgate_core::{ErrorKind, FetchError, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_CNAME_DEPTH: usize = 5;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("no records found for {0}")]
    NoRecords(String),
    #[error("dns lookup failed: {0}")]
    Other(String),
}

/// Backend seam so the resolver's policy walk is testable without real DNS.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// CNAME target of `host`, if any. NXDOMAIN/NODATA is `Ok(None)`.
    async fn cname(&self, host: &str) -> std::result::Result<Option<String>, DnsError>;
    async fn lookup_ips(&self, host: &str) -> std::result::Result<Vec<IpAddr>, DnsError>;
}

pub struct HickoryDns {
    resolver: TokioAsyncResolver,
}

impl HickoryDns {
    /// System resolv.conf when available, public defaults otherwise.
    pub fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

#[async_trait]
impl DnsBackend for HickoryDns {
    async fn cname(&self, host: &str) -> std::result::Result<Option<String>, DnsError> {
        match self.resolver.lookup(host, RecordType::CNAME).await {
            Ok(lookup) => Ok(lookup
                .record_iter()
                .find_map(|r| r.data().and_then(|d| d.as_cname()).map(|c| c.0.to_utf8()))),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                _ => Err(DnsError::Other(e.to_string())),
            },
        }
    }

    async fn lookup_ips(&self, host: &str) -> std::result::Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(DnsError::NoRecords(host.to_string())),
                _ => Err(DnsError::Other(e.to_string())),
            },
        }
    }
}

pub struct SafeResolver {
    policy: Arc<HostPolicy>,
    backend: Arc<dyn DnsBackend>,
}

fn blocked(msg: impl Into<String>) -> FetchError {
    FetchError::new(ErrorKind::BlockedHost, msg)
}

fn is_plausible_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

impl SafeResolver {
    pub fn new(policy: Arc<HostPolicy>, backend: Arc<dyn DnsBackend>) -> Self {
        Self { policy, backend }
    }

    pub fn policy(&self) -> &HostPolicy {
        &self.policy
    }

    /// Resolve `host` to a dialable address, enforcing the host policy on
    /// the name, every CNAME hop, and every returned address.
    pub async fn resolve_and_validate(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<IpAddr> {
        let host = normalize_host(host);

        // Literal addresses skip DNS entirely.
        if let Some(ip) = HostPolicy::normalize_ip(&host) {
            if self.policy.is_metadata_ip(ip) {
                return Err(blocked(format!("Blocked IP range: {ip} (cloud metadata)")));
            }
            if self.policy.is_blocked_ip(ip) {
                return Err(blocked(format!("Blocked IP range: {ip}")));
            }
            return Ok(ip);
        }

        if !is_plausible_hostname(&host) {
            return Err(FetchError::new(
                ErrorKind::InvalidArg,
                format!("invalid hostname: {host:?}"),
            ));
        }
        if self.policy.is_metadata_host(&host)
            || self.policy.is_blocked_host(&host)
            || self.policy.is_blocked_suffix(&host)
        {
            return Err(blocked(format!("Blocked host: {host}")));
        }

        self.chase_cnames(&host, cancel).await?;

        let ips = match self.bounded(self.backend.lookup_ips(&host), cancel).await? {
            Ok(ips) => ips,
            Err(DnsError::NoRecords(h)) => {
                return Err(FetchError::new(
                    ErrorKind::NoData,
                    format!("no address records for {h}"),
                ));
            }
            Err(DnsError::Other(msg)) => {
                return Err(FetchError::new(
                    ErrorKind::Network,
                    format!("dns lookup failed for {host}: {msg}"),
                ));
            }
        };
        if ips.is_empty() {
            return Err(FetchError::new(
                ErrorKind::NoData,
                format!("no address records for {host}"),
            ));
        }

        // Every returned address must pass; a single blocked address poisons
        // the whole answer (rebinding answers mix public and private).
        for ip in &ips {
            let ip = match ip {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(*v6)),
                v4 => *v4,
            };
            if self.policy.is_metadata_ip(ip) {
                return Err(blocked(format!(
                    "Blocked IP range: {host} resolves to {ip} (cloud metadata)"
                )));
            }
            if self.policy.is_blocked_ip(ip) {
                return Err(blocked(format!("Blocked IP range: {host} resolves to {ip}")));
            }
        }
        Ok(ips[0])
    }

    /// Walk the CNAME chain (depth-bounded, cycle-safe). Any blocked
    /// intermediate name aborts; lookup failures other than cancellation are
    /// treated as "no CNAME".
    async fn chase_cnames(&self, host: &str, cancel: &CancellationToken) -> Result<()> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        seen.insert(host.to_string());
        let mut current = host.to_string();
        for _ in 0..MAX_CNAME_DEPTH {
            let target = match self.bounded(self.backend.cname(&current), cancel).await {
                Ok(Ok(Some(t))) => t,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => {
                    tracing::debug!(host = %current, error = %e, "cname lookup failed; continuing without cname");
                    return Ok(());
                }
                Err(e) if e.kind == ErrorKind::Canceled => return Err(e),
                Err(e) => {
                    tracing::debug!(host = %current, error = %e, "cname lookup timed out; continuing without cname");
                    return Ok(());
                }
            };
            let target = normalize_host(&target);
            if self.policy.host_is_blocked(&target) {
                return Err(blocked(format!(
                    "Blocked host: {host} aliases {target} via CNAME"
                )));
            }
            if !seen.insert(target.clone()) {
                // CNAME cycle; the address lookup will settle it.
                return Ok(());
            }
            current = target;
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = T>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::new(ErrorKind::Canceled, "dns lookup aborted")),
            r = tokio::time::timeout(DNS_TIMEOUT, fut) => {
                r.map_err(|_| FetchError::new(ErrorKind::Timeout, "dns lookup timed out"))
            }
        }
    }
}
