use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use keyrelay_core::bootstrap::hash_admin_key;
use keyrelay_core::{AppState, ConfigEditError, known_refs};
use keyrelay_provider_core::{
    Credential, CredentialStatus, ReverseProxy, RuntimeConfig, normalize_api_key_auth,
    normalize_routing_map,
};

use crate::error::AdminError;

type AdminResult = Result<Response, AdminError>;

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/reverse-proxies", get(list_proxies).post(create_proxy))
        .route(
            "/reverse-proxies/{id}",
            axum::routing::put(update_proxy).delete(delete_proxy),
        )
        .route(
            "/reverse-proxy-worker-url",
            get(get_worker_url)
                .put(put_worker_url)
                .delete(delete_worker_url),
        )
        .route("/proxy-routing", get(get_routing).put(put_routing))
        .route(
            "/proxy-routing-auth",
            get(get_routing_auth).put(put_routing_auth),
        )
        .route(
            "/api-keys",
            get(get_api_keys)
                .put(put_api_keys)
                .patch(patch_api_key)
                .delete(delete_api_key),
        )
        .route("/api-key-auth", get(get_api_key_auth).put(put_api_key_auth))
        .route(
            "/api-key-expiry",
            get(get_api_key_expiry).put(put_api_key_expiry),
        )
        .route("/auth-files", get(list_auth_files).post(register_auth_file))
        .route("/auth-files/{id}", axum::routing::delete(delete_auth_file))
        .route("/auth-files/{id}/status", patch(set_auth_file_status))
        .route("/auth-files/{id}/refresh", post(refresh_auth_file))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AdminError> {
    let key = extract_admin_key(req.headers(), req.uri())
        .ok_or_else(|| AdminError::unauthorized("missing management key"))?;
    if hash_admin_key(&key) != state.global.load().admin_key_hash {
        return Err(AdminError::unauthorized("invalid management key"));
    }
    Ok(next.run(req).await)
}

fn extract_admin_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get("x-management-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(auth) = value.to_str()
    {
        let auth = auth.trim();
        if let Some((scheme, token)) = auth.split_once(' ')
            && scheme.eq_ignore_ascii_case("bearer")
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let query = uri.query()?;
    let parsed: std::collections::HashMap<String, String> =
        serde_urlencoded::from_str(query).ok()?;
    let key = parsed.get("admin_key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

fn ok(body: Value) -> AdminResult {
    Ok(Json(body).into_response())
}

// reverse proxies

async fn list_proxies(State(state): State<Arc<AppState>>) -> AdminResult {
    ok(json!({ "reverse-proxies": state.runtime().reverse_proxies }))
}

async fn create_proxy(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ReverseProxy>, JsonRejection>,
) -> AdminResult {
    let Json(mut proxy) = body?;
    proxy.name = proxy.name.trim().to_string();
    proxy.base_url = proxy.base_url.trim().to_string();
    if proxy.name.is_empty() || proxy.base_url.is_empty() {
        return Err(AdminError::bad_request("name and base-url are required"));
    }
    proxy.id = uuid::Uuid::new_v4().to_string();
    proxy.created_at = now_rfc3339();
    proxy.enabled = true;

    let created = proxy.clone();
    state
        .update_config(move |cfg| {
            cfg.reverse_proxies.push(proxy);
            Ok(())
        })
        .await?;
    info!(event = "reverse_proxy_created", proxy_id = %created.id, name = %created.name);
    ok(json!({ "message": "reverse proxy created", "proxy": created }))
}

async fn update_proxy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<ReverseProxy>, JsonRejection>,
) -> AdminResult {
    let Json(mut proxy) = body?;
    let updated = state
        .update_config(move |cfg| {
            let Some(existing) = cfg.reverse_proxies.iter_mut().find(|p| p.id == id) else {
                return Err(ConfigEditError::not_found("proxy not found"));
            };
            proxy.id = existing.id.clone();
            proxy.created_at = existing.created_at.clone();
            *existing = proxy.clone();
            Ok(proxy)
        })
        .await?;
    ok(json!({ "message": "reverse proxy updated", "proxy": updated }))
}

async fn delete_proxy(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> AdminResult {
    state
        .update_config(|cfg| {
            let before = cfg.reverse_proxies.len();
            cfg.reverse_proxies.retain(|p| p.id != id);
            if cfg.reverse_proxies.len() == before {
                return Err(ConfigEditError::not_found("proxy not found"));
            }
            cfg.proxy_routing.retain(|_, target| target.trim() != id);
            cfg.proxy_routing_auth.retain(|_, target| target.trim() != id);
            Ok(())
        })
        .await?;
    info!(event = "reverse_proxy_deleted", proxy_id = %id);
    ok(json!({ "message": "reverse proxy deleted" }))
}

// worker url

async fn get_worker_url(State(state): State<Arc<AppState>>) -> AdminResult {
    ok(json!({ "reverse-proxy-worker-url": state.runtime().reverse_proxy_worker_url }))
}

#[derive(Debug, Deserialize)]
struct ValueBody {
    value: Option<String>,
}

async fn put_worker_url(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ValueBody>, JsonRejection>,
) -> AdminResult {
    let Some(value) = body.ok().and_then(|Json(body)| body.value) else {
        return Err(AdminError::bad_request("invalid body"));
    };
    let value = value.trim().to_string();
    validate_worker_url(&value)?;
    let stored = value.clone();
    state
        .update_config(move |cfg| {
            cfg.reverse_proxy_worker_url = stored;
            Ok(())
        })
        .await?;
    ok(json!({
        "message": "reverse proxy worker url updated",
        "reverse-proxy-worker-url": value,
    }))
}

async fn delete_worker_url(State(state): State<Arc<AppState>>) -> AdminResult {
    state
        .update_config(|cfg| {
            cfg.reverse_proxy_worker_url.clear();
            Ok(())
        })
        .await?;
    ok(json!({
        "message": "reverse proxy worker url deleted",
        "reverse-proxy-worker-url": "",
    }))
}

/// Empty clears. Otherwise an absolute http(s) URL with a host.
fn validate_worker_url(value: &str) -> Result<(), AdminError> {
    if value.is_empty() {
        return Ok(());
    }
    let Ok(uri) = value.parse::<Uri>() else {
        return Err(AdminError::bad_request("invalid reverse-proxy-worker-url"));
    };
    if uri.host().is_none_or(str::is_empty) {
        return Err(AdminError::bad_request("invalid reverse-proxy-worker-url"));
    }
    match uri.scheme_str() {
        Some("http") | Some("https") => Ok(()),
        _ => Err(AdminError::bad_request(
            "reverse-proxy-worker-url must use http or https",
        )),
    }
}

// routing

async fn get_routing(State(state): State<Arc<AppState>>) -> AdminResult {
    ok(json!({ "proxy-routing": state.runtime().proxy_routing }))
}

async fn put_routing(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BTreeMap<String, String>>, JsonRejection>,
) -> AdminResult {
    let Json(map) = body?;
    let clean = normalize_routing_map(&map);
    let stored = clean.clone();
    state
        .update_config(move |cfg| {
            cfg.proxy_routing = stored;
            Ok(())
        })
        .await?;
    ok(json!({ "message": "proxy routing updated", "proxy-routing": clean }))
}

async fn get_routing_auth(State(state): State<Arc<AppState>>) -> AdminResult {
    let known = known_refs(&state.store.list().await);
    let current = state.runtime().proxy_routing_auth.clone();
    let (clean, changed) = sanitize_routing_auth(&current, &known);
    if !changed {
        return ok(json!({ "proxy-routing-auth": clean }));
    }
    // Re-sanitize the live map so a concurrent PUT is not overwritten.
    let clean = match state
        .update_config(move |cfg| {
            let (fresh, _) = sanitize_routing_auth(&cfg.proxy_routing_auth, &known);
            cfg.proxy_routing_auth = fresh.clone();
            Ok(fresh)
        })
        .await
    {
        Ok(fresh) => fresh,
        Err(err) => {
            warn!(event = "routing_auth_cleanup_failed", error = %err);
            clean
        }
    };
    ok(json!({ "proxy-routing-auth": clean }))
}

async fn put_routing_auth(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BTreeMap<String, String>>, JsonRejection>,
) -> AdminResult {
    let Json(map) = body?;
    let clean = normalize_routing_map(&map);
    let stored = clean.clone();
    state
        .update_config(move |cfg| {
            cfg.proxy_routing_auth = stored;
            Ok(())
        })
        .await?;
    ok(json!({ "message": "proxy routing auth updated", "proxy-routing-auth": clean }))
}

/// Trims entries and drops keys that name no known credential. With no
/// known refs at all, only trimming applies.
fn sanitize_routing_auth(
    current: &BTreeMap<String, String>,
    known: &HashSet<String>,
) -> (BTreeMap<String, String>, bool) {
    let mut clean = normalize_routing_map(current);
    if !known.is_empty() {
        clean.retain(|key, _| known.contains(key));
    }
    let changed = &clean != current;
    (clean, changed)
}

// client keys

async fn get_api_keys(State(state): State<Arc<AppState>>) -> AdminResult {
    ok(json!({ "api-keys": state.runtime().api_keys }))
}

/// Either a bare array or `{"items": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyListBody {
    List(Vec<String>),
    Items { items: Vec<String> },
}

async fn put_api_keys(
    State(state): State<Arc<AppState>>,
    body: Result<Json<KeyListBody>, JsonRejection>,
) -> AdminResult {
    let Json(body) = body?;
    let raw = match body {
        KeyListBody::List(items) | KeyListBody::Items { items } => items,
    };
    let keys = dedupe_keys(raw);
    let stored = keys.clone();
    state
        .update_config(move |cfg| {
            cfg.api_keys = stored;
            prune_key_maps(cfg);
            Ok(())
        })
        .await?;
    ok(json!({ "message": "api keys updated", "api-keys": keys }))
}

#[derive(Debug, Default, Deserialize)]
struct KeyPatchBody {
    old: Option<String>,
    new: Option<String>,
    index: Option<usize>,
    value: Option<String>,
}

async fn patch_api_key(
    State(state): State<Arc<AppState>>,
    body: Result<Json<KeyPatchBody>, JsonRejection>,
) -> AdminResult {
    let Json(body) = body?;
    let replacement = body
        .new
        .or(body.value)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AdminError::bad_request("new value is required"))?;
    if body.old.is_none() && body.index.is_none() {
        return Err(AdminError::bad_request("old or index is required"));
    }

    let keys = state
        .update_config(move |cfg| {
            let pos = match (body.old.as_deref(), body.index) {
                (Some(old), _) => cfg.api_keys.iter().position(|k| k.trim() == old.trim()),
                (None, Some(index)) => (index < cfg.api_keys.len()).then_some(index),
                (None, None) => None,
            }
            .ok_or_else(|| ConfigEditError::not_found("item not found"))?;
            let old = std::mem::replace(&mut cfg.api_keys[pos], replacement.clone());
            if old != replacement {
                if let Some(refs) = cfg.api_key_auth.remove(&old) {
                    cfg.api_key_auth.entry(replacement.clone()).or_insert(refs);
                }
                if let Some(expiry) = cfg.api_key_expiry.remove(&old) {
                    cfg.api_key_expiry.entry(replacement.clone()).or_insert(expiry);
                }
            }
            cfg.api_keys = dedupe_keys(std::mem::take(&mut cfg.api_keys));
            Ok(cfg.api_keys.clone())
        })
        .await?;
    ok(json!({ "message": "api key updated", "api-keys": keys }))
}

#[derive(Debug, Default, Deserialize)]
struct KeyDeleteQuery {
    value: Option<String>,
    index: Option<usize>,
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyDeleteQuery>,
) -> AdminResult {
    if query.value.is_none() && query.index.is_none() {
        return Err(AdminError::bad_request("value or index is required"));
    }
    let keys = state
        .update_config(move |cfg| {
            let pos = match (query.value.as_deref(), query.index) {
                (Some(value), _) => cfg.api_keys.iter().position(|k| k.trim() == value.trim()),
                (None, Some(index)) => (index < cfg.api_keys.len()).then_some(index),
                (None, None) => None,
            }
            .ok_or_else(|| ConfigEditError::not_found("item not found"))?;
            let removed = cfg.api_keys.remove(pos);
            cfg.api_key_auth.remove(removed.trim());
            cfg.api_key_expiry.remove(removed.trim());
            Ok(cfg.api_keys.clone())
        })
        .await?;
    ok(json!({ "message": "api key deleted", "api-keys": keys }))
}

fn dedupe_keys(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for key in raw {
        let key = key.trim();
        if !key.is_empty() && !out.iter().any(|known| known == key) {
            out.push(key.to_string());
        }
    }
    out
}

/// Drops permission and expiry entries for keys no longer configured.
fn prune_key_maps(cfg: &mut RuntimeConfig) {
    let mut auth = normalize_api_key_auth(&cfg.api_key_auth, &cfg.api_keys);
    let keys: HashSet<&str> = cfg.api_keys.iter().map(String::as_str).collect();
    auth.retain(|key, _| keys.contains(key.as_str()));
    cfg.api_key_auth = auth;
    cfg.api_key_expiry.retain(|key, _| keys.contains(key.as_str()));
}

async fn get_api_key_auth(State(state): State<Arc<AppState>>) -> AdminResult {
    let cfg = state.runtime();
    ok(json!({ "api-key-auth": normalize_api_key_auth(&cfg.api_key_auth, &cfg.api_keys) }))
}

async fn put_api_key_auth(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BTreeMap<String, Vec<String>>>, JsonRejection>,
) -> AdminResult {
    let Json(map) = body?;
    let clean = state
        .update_config(move |cfg| {
            cfg.api_key_auth = normalize_api_key_auth(&map, &cfg.api_keys);
            Ok(cfg.api_key_auth.clone())
        })
        .await?;
    ok(json!({ "message": "api key auth updated", "api-key-auth": clean }))
}

async fn get_api_key_expiry(State(state): State<Arc<AppState>>) -> AdminResult {
    ok(json!({ "api-key-expiry": state.runtime().api_key_expiry }))
}

async fn put_api_key_expiry(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BTreeMap<String, String>>, JsonRejection>,
) -> AdminResult {
    let Json(map) = body?;
    let clean = normalize_routing_map(&map);
    for (key, value) in &clean {
        if OffsetDateTime::parse(value, &Rfc3339).is_err() {
            return Err(AdminError::bad_request(format!(
                "invalid expiry for key {key}: expected RFC3339"
            )));
        }
    }
    let stored = clean.clone();
    state
        .update_config(move |cfg| {
            cfg.api_key_expiry = stored;
            Ok(())
        })
        .await?;
    ok(json!({ "message": "api key expiry updated", "api-key-expiry": clean }))
}

// credentials

fn auth_file_entry(state: &AppState, cred: &Credential) -> Value {
    let usage = state.manager.usage().get(&cred.id);
    json!({
        "id": cred.id,
        "provider": cred.provider,
        "index": cred.index,
        "file_name": cred.file_name,
        "label": cred.label,
        "status": cred.status.as_str(),
        "status_message": cred.status_message,
        "proxy_url": cred.proxy_url,
        "requests": usage.requests,
        "success": usage.success,
        "failure": usage.failure,
    })
}

async fn list_auth_files(State(state): State<Arc<AppState>>) -> AdminResult {
    let files: Vec<Value> = state
        .store
        .list()
        .await
        .iter()
        .map(|cred| auth_file_entry(&state, cred))
        .collect();
    ok(json!({ "files": files }))
}

async fn register_auth_file(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Credential>, JsonRejection>,
) -> AdminResult {
    let Json(cred) = body?;
    let registered = state.register_credential(cred).await?;
    ok(json!({
        "message": "auth file registered",
        "file": auth_file_entry(&state, &registered),
    }))
}

async fn delete_auth_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AdminResult {
    state.remove_credential(id.trim()).await?;
    ok(json!({ "message": "auth file deleted" }))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: Option<String>,
    disabled: Option<bool>,
    message: Option<String>,
}

async fn set_auth_file_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> AdminResult {
    let Json(body) = body?;
    let status = match (body.status.as_deref(), body.disabled) {
        (Some(raw), _) => CredentialStatus::parse(raw)
            .ok_or_else(|| AdminError::bad_request(format!("unknown status: {raw}")))?,
        (None, Some(true)) => CredentialStatus::Disabled,
        (None, Some(false)) => CredentialStatus::Active,
        (None, None) => return Err(AdminError::bad_request("status is required")),
    };
    let message = body
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    let cred = state
        .set_credential_status(id.trim(), status, message)
        .await?;
    ok(json!({
        "message": "auth file status updated",
        "file": auth_file_entry(&state, &cred),
    }))
}

async fn refresh_auth_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AdminResult {
    let cred = state.refresh_credential(id.trim()).await?;
    ok(json!({
        "message": "auth file refreshed",
        "file": auth_file_entry(&state, &cred),
    }))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_url_validation() {
        assert!(validate_worker_url("").is_ok());
        assert!(validate_worker_url("https://bridge.example.workers.dev").is_ok());
        assert!(validate_worker_url("http://10.0.0.2:8787/base").is_ok());
        assert_eq!(
            validate_worker_url("ftp://bridge.example").unwrap_err().message,
            "reverse-proxy-worker-url must use http or https"
        );
        assert_eq!(
            validate_worker_url("/relative/only").unwrap_err().message,
            "invalid reverse-proxy-worker-url"
        );
        assert!(validate_worker_url("not a url").is_err());
    }

    #[test]
    fn routing_auth_sanitize_drops_unknown_refs() {
        let current = BTreeMap::from([
            (" a.json ".to_string(), "p1".to_string()),
            ("gone.json".to_string(), "p1".to_string()),
        ]);
        let known = HashSet::from(["a.json".to_string()]);
        let (clean, changed) = sanitize_routing_auth(&current, &known);
        assert!(changed);
        assert_eq!(clean, BTreeMap::from([("a.json".to_string(), "p1".to_string())]));

        let (clean, changed) = sanitize_routing_auth(&clean, &HashSet::new());
        assert!(!changed);
        assert_eq!(clean.len(), 1);
    }

    #[test]
    fn key_lists_are_trimmed_and_deduped() {
        assert_eq!(
            dedupe_keys(vec![" a ".into(), "a".into(), "".into(), "b".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
