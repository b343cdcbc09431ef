use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use http::Uri;
use tracing::{debug, warn};

use crate::config::{ReverseProxy, RuntimeConfig};
use crate::credential::Credential;
use crate::headers::{Headers, header_set_if_absent};

pub const DEFAULT_BAN_TTL: Duration = Duration::from_secs(5 * 60);

const BAN_BODY_MARKERS: [&str; 4] = [
    "request detail",
    "status 404",
    "\"status\":404",
    "/v1/v1/messages",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResolution {
    pub url: String,
    /// Resolved proxy, reported even when the call goes direct.
    pub proxy_id: Option<String>,
    pub proxied: bool,
}

/// Reverse-proxy route resolution plus the per-proxy ban gate.
///
/// Routing tables come from the caller's config snapshot; only the ban map
/// lives here, for the lifetime of the service.
#[derive(Debug, Default)]
pub struct ReverseProxyRouter {
    bans: Mutex<HashMap<String, SystemTime>>,
}

impl ReverseProxyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bans(&self) -> MutexGuard<'_, HashMap<String, SystemTime>> {
        self.bans.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ban(&self, proxy_id: &str, ttl: Duration) {
        self.ban_at(proxy_id, ttl, SystemTime::now());
    }

    /// Records `now + ttl`; an existing later expiry is kept.
    pub fn ban_at(&self, proxy_id: &str, ttl: Duration, now: SystemTime) {
        let id = proxy_id.trim();
        if id.is_empty() {
            return;
        }
        let until = now.checked_add(ttl).unwrap_or(now);
        let mut bans = self.bans();
        let entry = bans.entry(id.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Bans with the default TTL after a qualifying failure and logs why.
    pub fn ban_for_failure(&self, proxy_id: &str, provider: &str, status: u16, detail: &str) {
        self.ban(proxy_id, DEFAULT_BAN_TTL);
        warn!(
            event = "reverse_proxy_banned",
            proxy_id = %proxy_id,
            provider = %provider,
            status = status,
            ttl_secs = DEFAULT_BAN_TTL.as_secs(),
            detail = %shorten_reason(detail)
        );
    }

    pub fn is_banned(&self, proxy_id: &str) -> bool {
        self.is_banned_at(proxy_id, SystemTime::now())
    }

    /// Banned while `now < until`. Expired entries are dropped on read.
    pub fn is_banned_at(&self, proxy_id: &str, now: SystemTime) -> bool {
        let id = proxy_id.trim();
        if id.is_empty() {
            return false;
        }
        let mut bans = self.bans();
        match bans.get(id) {
            Some(until) if now < *until => true,
            Some(_) => {
                bans.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn banned_until(&self, proxy_id: &str) -> Option<SystemTime> {
        self.bans().get(proxy_id.trim()).copied()
    }

    /// Number of ban entries currently held, expired or not.
    pub fn tracked_bans(&self) -> usize {
        self.bans().len()
    }

    pub fn resolve_route(
        &self,
        cfg: &RuntimeConfig,
        provider: &str,
        credential: Option<&Credential>,
        original_url: &str,
    ) -> RouteResolution {
        let mut result = RouteResolution {
            url: original_url.to_string(),
            proxy_id: None,
            proxied: false,
        };
        let Some(proxy_id) = routed_proxy_id(cfg, provider, credential) else {
            return result;
        };
        result.proxy_id = Some(proxy_id.to_string());
        if self.is_banned(proxy_id) {
            debug!(
                event = "reverse_proxy_skipped",
                proxy_id = %proxy_id,
                provider = %provider,
                reason = "banned"
            );
            return result;
        }
        let Some(proxy) = cfg.usable_proxy(proxy_id) else {
            debug!(
                event = "reverse_proxy_skipped",
                proxy_id = %proxy_id,
                provider = %provider,
                reason = "missing_or_disabled"
            );
            return result;
        };
        result.url = rewrite_url(cfg, proxy, provider, original_url);
        result.proxied = result.url != original_url;
        result
    }

    /// Copies the resolved proxy's headers without overwriting existing ones.
    pub fn apply_headers(
        &self,
        cfg: &RuntimeConfig,
        headers: &mut Headers,
        provider: &str,
        credential: Option<&Credential>,
    ) {
        let Some(proxy_id) = routed_proxy_id(cfg, provider, credential) else {
            return;
        };
        if self.is_banned(proxy_id) {
            return;
        }
        let Some(proxy) = cfg.usable_proxy(proxy_id) else {
            return;
        };
        for (key, value) in &proxy.headers {
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            header_set_if_absent(headers, key, value);
        }
    }
}

/// Credential-level mapping (id, index, file name) wins over provider-level.
fn routed_proxy_id<'a>(
    cfg: &'a RuntimeConfig,
    provider: &str,
    credential: Option<&Credential>,
) -> Option<&'a str> {
    if let Some(credential) = credential
        && !cfg.proxy_routing_auth.is_empty()
    {
        let candidates = [
            Some(credential.id.trim().to_string()),
            credential.index_for_match(),
            Some(credential.file_name.trim().to_string()),
        ];
        for key in candidates.into_iter().flatten() {
            if key.is_empty() {
                continue;
            }
            if let Some(proxy_id) = cfg
                .proxy_routing_auth
                .get(&key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
            {
                return Some(proxy_id);
            }
        }
    }
    cfg.proxy_routing
        .get(provider.trim())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Path prefix a reverse proxy uses to tell upstreams apart.
pub fn provider_prefix(provider: &str, upstream_host: &str) -> String {
    match provider {
        "antigravity" => match upstream_host {
            "daily-cloudcode-pa.sandbox.googleapis.com" => "/antigravity-sandbox",
            "daily-cloudcode-pa.googleapis.com" => "/antigravity-daily",
            "cloudcode-pa.googleapis.com" => "/antigravity-cloudcode",
            _ => "/antigravity-sandbox",
        }
        .to_string(),
        "codex" => "/codex".to_string(),
        other => format!("/{other}"),
    }
}

/// `base + prefix + path [?query]`, or the bridge form when a worker applies.
pub fn rewrite_url(
    cfg: &RuntimeConfig,
    proxy: &ReverseProxy,
    provider: &str,
    original_url: &str,
) -> String {
    let Ok(parsed) = original_url.parse::<Uri>() else {
        warn!(
            event = "reverse_proxy_rewrite_failed",
            url = %original_url,
            provider = %provider
        );
        return original_url.to_string();
    };
    let prefix = provider_prefix(provider, parsed.host().unwrap_or_default());
    let path = match parsed.path() {
        "" => "/".to_string(),
        p if p.starts_with('/') => p.to_string(),
        p => format!("/{p}"),
    };
    let query = parsed.query().unwrap_or_default();

    if let Some(bridged) = build_worker_url(
        &cfg.reverse_proxy_worker_url,
        &proxy.base_url,
        &prefix,
        &path,
        query,
    ) {
        return bridged;
    }

    let mut url = format!("{}{}{}", proxy.base_url.trim_end_matches('/'), prefix, path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Wraps a proxied path through the bridge worker. `None` when no worker is
/// configured, either URL lacks a host, or the worker is the proxy itself.
pub fn build_worker_url(
    worker_base: &str,
    proxy_base_url: &str,
    prefix: &str,
    path: &str,
    query: &str,
) -> Option<String> {
    let worker_base = worker_base.trim();
    if worker_base.is_empty() {
        return None;
    }
    let Some(worker_host) = parse_host(worker_base) else {
        warn!(event = "invalid_worker_url", url = %worker_base);
        return None;
    };
    let Some(proxy_host) = parse_host(proxy_base_url.trim()) else {
        warn!(event = "invalid_reverse_proxy_base_url", url = %proxy_base_url);
        return None;
    };
    if worker_host.eq_ignore_ascii_case(&proxy_host) {
        return None;
    }

    let prefix = format!("/{}", prefix.trim().trim_matches('/'));
    let path = if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let base_path = format!("{prefix}{path}");
    let mut target = format!(
        "{}{}/{}",
        worker_base.trim_end_matches('/'),
        base_path.trim_end_matches('/'),
        proxy_host
    );
    if !query.is_empty() {
        target.push('?');
        target.push_str(query);
    }
    Some(target)
}

fn parse_host(url: &str) -> Option<String> {
    let uri = url.parse::<Uri>().ok()?;
    let host = uri.host()?.trim();
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

/// Whether a failure seen through a reverse proxy should take it out of rotation.
pub fn should_ban(status: u16, body: &str) -> bool {
    if matches!(status, 404 | 502 | 503 | 504 | 520..=524) {
        return true;
    }
    let msg = body.trim().to_lowercase();
    if msg.is_empty() {
        return false;
    }
    if msg.contains("请求详情") {
        return true;
    }
    BAN_BODY_MARKERS.iter().any(|marker| msg.contains(marker))
}

fn shorten_reason(detail: &str) -> String {
    const MAX_LEN: usize = 256;
    let trimmed = detail.trim();
    if trimmed.len() <= MAX_LEN {
        return trimmed.to_string();
    }
    let mut end = MAX_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
