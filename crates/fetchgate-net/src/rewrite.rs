//! Raw-URL rewrites (bounded, deterministic).
//!
//! Source-hosting "view" pages are low-signal HTML shells; when the raw text
//! artifact has a well-known address we rewrite to it. The rewrite is
//! advisory: the result goes through the same normalization and DNS
//! validation as any other URL, and never skips either.

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRewrite {
    pub url: String,
    pub transformed: bool,
    pub platform: Option<&'static str>,
}

impl RawRewrite {
    fn unchanged(url: &str) -> Self {
        Self {
            url: url.to_string(),
            transformed: false,
            platform: None,
        }
    }
}

fn host_matches(host: &str, pat: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    if host == pat {
        return true;
    }
    host.ends_with(&format!(".{pat}"))
}

fn host_with_port(u: &Url) -> String {
    let host = u.host_str().unwrap_or_default();
    match u.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// `github.com/<owner>/<repo>/blob/<ref>/<path...>` →
/// `raw.githubusercontent.com/<owner>/<repo>/<ref>/<path...>`.
fn github_blob_raw(u: &Url) -> Option<String> {
    let host = u.host_str()?;
    if !host_matches(host, "github.com") || host_matches(host, "gist.github.com") {
        return None;
    }
    let parts: Vec<&str> = u.path().trim_matches('/').split('/').collect();
    // owner/repo/blob/<ref>/<path...>
    if parts.len() < 5 || parts[2] != "blob" {
        return None;
    }
    let (owner, repo, rf) = (parts[0].trim(), parts[1].trim(), parts[3].trim());
    if owner.is_empty() || repo.is_empty() || rf.is_empty() {
        return None;
    }
    let rel_path = parts[4..].join("/");
    if rel_path.trim().is_empty() {
        return None;
    }
    let scheme = u.scheme();
    Some(format!(
        "{scheme}://raw.githubusercontent.com/{owner}/{repo}/{rf}/{rel_path}"
    ))
}

/// Gist fragments spell the filename with dashes (`#file-readme-md`); the
/// raw path wants the real name, so the last dash becomes the extension dot.
fn gist_file_from_fragment(fragment: &str) -> Option<String> {
    let name = fragment.strip_prefix("file-")?;
    if name.is_empty() {
        return None;
    }
    Some(match name.rfind('-') {
        Some(i) => format!("{}.{}", &name[..i], &name[i + 1..]),
        None => name.to_string(),
    })
}

/// `gist.github.com/<user>/<id>` → `gist.githubusercontent.com/<user>/<id>/raw`,
/// with the `#file-…` hash appended as a concrete file path when present.
fn gist_raw(u: &Url) -> Option<String> {
    let host = u.host_str()?;
    if !host_matches(host, "gist.github.com") {
        return None;
    }
    let parts: Vec<&str> = u.path().trim_matches('/').split('/').collect();
    if parts.len() != 2 {
        return None;
    }
    let (user, gist_id) = (parts[0].trim(), parts[1].trim());
    if user.is_empty() || gist_id.is_empty() {
        return None;
    }
    let scheme = u.scheme();
    let mut out = format!("{scheme}://gist.githubusercontent.com/{user}/{gist_id}/raw");
    if let Some(file) = u.fragment().and_then(gist_file_from_fragment) {
        out.push('/');
        out.push_str(&file);
    }
    Some(out)
}

/// GitLab file views live under `/-/blob/<ref>/<path>` on any GitLab host
/// (gitlab.com or a subhost); the raw artifact is the same origin with
/// `/-/blob/` swapped for `/-/raw/`.
fn gitlab_blob_raw(u: &Url) -> Option<String> {
    let host = u.host_str()?;
    if !host_matches(host, "gitlab.com") {
        return None;
    }
    let path = u.path();
    let idx = path.find("/-/blob/")?;
    let after = &path[idx + "/-/blob/".len()..];
    // Need at least <ref>/<file>.
    if after.trim_matches('/').splitn(2, '/').count() < 2 || idx == 0 {
        return None;
    }
    let scheme = u.scheme();
    let hostp = host_with_port(u);
    let new_path = format!("{}/-/raw/{}", &path[..idx], after);
    Some(format!("{scheme}://{hostp}{new_path}"))
}

/// `bitbucket.org/<owner>/<repo>/src/<ref>/<path...>` → same origin with
/// `/src/` swapped for `/raw/`.
fn bitbucket_src_raw(u: &Url) -> Option<String> {
    let host = u.host_str()?;
    if !host_matches(host, "bitbucket.org") {
        return None;
    }
    let parts: Vec<&str> = u.path().trim_matches('/').split('/').collect();
    if parts.len() < 5 || parts[2] != "src" {
        return None;
    }
    let (owner, repo, rf) = (parts[0].trim(), parts[1].trim(), parts[3].trim());
    if owner.is_empty() || repo.is_empty() || rf.is_empty() {
        return None;
    }
    let rel_path = parts[4..].join("/");
    if rel_path.trim().is_empty() {
        return None;
    }
    let scheme = u.scheme();
    let hostp = host_with_port(u);
    Some(format!("{scheme}://{hostp}/{owner}/{repo}/raw/{rf}/{rel_path}"))
}

/// True when the URL already points at a raw artifact; such URLs pass
/// through unchanged so the transform is idempotent.
fn is_already_raw(u: &Url) -> bool {
    let Some(host) = u.host_str() else {
        return false;
    };
    if host_matches(host, "raw.githubusercontent.com")
        || host_matches(host, "gist.githubusercontent.com")
    {
        return true;
    }
    if host_matches(host, "gitlab.com") && u.path().contains("/-/raw/") {
        return true;
    }
    if host_matches(host, "bitbucket.org") {
        let parts: Vec<&str> = u.path().trim_matches('/').split('/').collect();
        if parts.len() >= 4 && parts[2] == "raw" {
            return true;
        }
    }
    false
}

/// Rewrite a well-known source-hosting view URL to its raw-content
/// equivalent. Unrecognized and already-raw URLs come back unchanged.
pub fn transform_to_raw(url: &str) -> RawRewrite {
    let Ok(u) = Url::parse(url.trim()) else {
        return RawRewrite::unchanged(url);
    };
    if is_already_raw(&u) {
        return RawRewrite::unchanged(url);
    }
    if let Some(out) = github_blob_raw(&u) {
        return RawRewrite {
            url: out,
            transformed: true,
            platform: Some("github"),
        };
    }
    if let Some(out) = gist_raw(&u) {
        return RawRewrite {
            url: out,
            transformed: true,
            platform: Some("gist"),
        };
    }
    if let Some(out) = gitlab_blob_raw(&u) {
        return RawRewrite {
            url: out,
            transformed: true,
            platform: Some("gitlab"),
        };
    }
    if let Some(out) = bitbucket_src_raw(&u) {
        return RawRewrite {
            url: out,
            transformed: true,
            platform: Some("bitbucket"),
        };
    }
    RawRewrite::unchanged(url)
}
