use std::collections::HashSet;

use http::{HeaderMap, StatusCode};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use keyrelay_provider_core::{Credential, CredentialStore, RuntimeConfig};

/// Which credentials a client key may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowed {
    /// The key has no `api_key_auth` entry.
    Unrestricted,
    /// Credential ids the key may use. Empty means deny-all.
    Restricted(HashSet<String>),
}

impl Allowed {
    pub fn is_deny_all(&self) -> bool {
        matches!(self, Allowed::Restricted(ids) if ids.is_empty())
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, Allowed::Restricted(_))
    }

    pub fn permits(&self, credential_id: &str) -> bool {
        match self {
            Allowed::Unrestricted => true,
            Allowed::Restricted(ids) => ids.contains(credential_id),
        }
    }

    /// `None` when unrestricted, for store lookups.
    pub fn as_filter(&self) -> Option<&HashSet<String>> {
        match self {
            Allowed::Unrestricted => None,
            Allowed::Restricted(ids) => Some(ids),
        }
    }
}

/// Resolves a client key against the live credential list.
pub async fn resolve_allowed(
    config: &RuntimeConfig,
    store: &CredentialStore,
    client_key: &str,
) -> Allowed {
    let Some(refs) = permission_refs(config, client_key) else {
        return Allowed::Unrestricted;
    };
    if refs.is_empty() {
        return Allowed::Restricted(HashSet::new());
    }
    Allowed::Restricted(store.matching_ids(&refs).await)
}

/// Same as [`resolve_allowed`] over an already-loaded credential list.
pub fn resolve_allowed_in(
    config: &RuntimeConfig,
    credentials: &[Credential],
    client_key: &str,
) -> Allowed {
    let Some(refs) = permission_refs(config, client_key) else {
        return Allowed::Unrestricted;
    };
    if refs.is_empty() {
        return Allowed::Restricted(HashSet::new());
    }
    Allowed::Restricted(
        credentials
            .iter()
            .filter(|cred| cred.matches_any_ref(&refs))
            .map(|cred| cred.id.clone())
            .collect(),
    )
}

/// `None` for unrestricted keys; otherwise the trimmed, non-blank refs.
fn permission_refs(config: &RuntimeConfig, client_key: &str) -> Option<HashSet<String>> {
    let key = client_key.trim();
    if key.is_empty() {
        return None;
    }
    let refs = config.api_key_auth.get(key)?;
    Some(
        refs.iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Authorization,
    GoogApiKey,
    ApiKey,
    QueryKey,
    QueryAuthToken,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::Authorization => "authorization",
            KeySource::GoogApiKey => "x-goog-api-key",
            KeySource::ApiKey => "x-api-key",
            KeySource::QueryKey => "query-key",
            KeySource::QueryAuthToken => "query-auth-token",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPrincipal {
    pub key: String,
    pub source: KeySource,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("missing API key")]
    NoCredentials,
    #[error("invalid API key")]
    InvalidKey,
    #[error("API key expired")]
    Expired,
}

impl AccessError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

/// Authenticates a client request against the configured client keys.
///
/// Candidates are tried in order: bearer token, `X-Goog-Api-Key`,
/// `X-Api-Key`, `?key=`, `?auth_token=`. The first configured key wins.
pub fn authenticate(
    config: &RuntimeConfig,
    headers: &HeaderMap,
    query: Option<&str>,
    now: OffsetDateTime,
) -> Result<ClientPrincipal, AccessError> {
    let authorization = header_value(headers, "authorization");
    let goog = header_value(headers, "x-goog-api-key");
    let api_key = header_value(headers, "x-api-key");
    let (query_key, query_token) = query_keys(query);

    let candidates = [
        (authorization.as_deref().map(bearer_token), KeySource::Authorization),
        (goog.as_deref(), KeySource::GoogApiKey),
        (api_key.as_deref(), KeySource::ApiKey),
        (query_key.as_deref(), KeySource::QueryKey),
        (query_token.as_deref(), KeySource::QueryAuthToken),
    ];
    if candidates
        .iter()
        .all(|(value, _)| value.is_none_or(str::is_empty))
    {
        return Err(AccessError::NoCredentials);
    }

    for (value, source) in candidates {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        if !config.has_client_key(value) {
            continue;
        }
        if let Some(expires_at) = expiry_for(config, value)
            && expires_at <= now
        {
            return Err(AccessError::Expired);
        }
        return Ok(ClientPrincipal {
            key: value.to_string(),
            source,
        });
    }
    Err(AccessError::InvalidKey)
}

fn expiry_for(config: &RuntimeConfig, key: &str) -> Option<OffsetDateTime> {
    let raw = config.api_key_expiry.get(key)?.trim();
    if raw.is_empty() {
        return None;
    }
    match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(at) => Some(at),
        Err(err) => {
            warn!(event = "invalid_api_key_expiry", value = %raw, error = %err);
            None
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

/// Bearer token when the header has that shape, else the raw header.
fn bearer_token(header: &str) -> &str {
    match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => header,
    }
}

fn query_keys(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return (None, None);
    };
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    let mut key = None;
    let mut token = None;
    for (name, value) in pairs {
        match name.as_str() {
            "key" if key.is_none() => key = Some(value),
            "auth_token" if token.is_none() => token = Some(value),
            _ => {}
        }
    }
    (key, token)
}
