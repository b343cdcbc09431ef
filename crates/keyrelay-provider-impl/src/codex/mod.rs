mod tokens;
mod usage;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};
use uuid::Uuid;

use keyrelay_provider_core::{
    Credential, ExecCtx, ExecRequest, ExecResponse, ExecResult, ExecStream, Executor,
    ExecutorError, Format, Headers, HttpMethod, TokenCounter, UpstreamFailure,
    UpstreamHttpRequest, header_set, header_set_if_absent, merge_hint, retry_after,
};

use crate::auth_extractor::{
    apply_attribute_headers, credential_token, set_accept, set_bearer, set_content_type_json,
    set_user_agent,
};
use crate::session_cache::SessionCache;
use crate::sse::{data_payload, forward_lines};
use crate::tokenizer::TiktokenCounter;
use crate::upstream::send_routed;

pub use usage::{CODEX_QUOTA_SECTIONS, USAGE_LOOKUP_TIMEOUT, codex_cooldown};

pub const PROVIDER: &str = "codex";
pub const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
pub const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub const COMPACT_ALT: &str = "responses/compact";
const CLIENT_VERSION: &str = "0.98.0";
pub(crate) const DEFAULT_USER_AGENT: &str =
    "codex_cli_rs/0.98.0 (Mac OS 26.0.1; arm64) Apple_Terminal/464";
const STREAM_DISCONNECTED: &str =
    "stream error: stream disconnected before completion: stream closed before response.completed";

/// ChatGPT-backed Responses API.
pub struct CodexExecutor {
    sessions: SessionCache,
    counter: Arc<dyn TokenCounter>,
}

impl Default for CodexExecutor {
    fn default() -> Self {
        Self::new(Arc::new(TiktokenCounter))
    }
}

impl CodexExecutor {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            sessions: SessionCache::default(),
            counter,
        }
    }

    /// Prompt-cache id shared by consecutive requests of one conversation.
    fn prompt_cache_id(&self, req: &ExecRequest) -> Option<String> {
        let payload = serde_json::from_slice::<Value>(&req.payload).ok()?;
        match req.source_format {
            Format::Claude => {
                let user_id = match payload.pointer("/metadata/user_id")? {
                    Value::Null => return None,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let key = format!("{}-{}", req.model, user_id);
                Some(self.sessions.get_or_create(&key))
            }
            Format::OpenAIResponse => payload
                .get("prompt_cache_key")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    fn build_body(
        &self,
        ctx: &ExecCtx,
        req: &ExecRequest,
        compact: bool,
    ) -> ExecResult<(Bytes, Option<String>)> {
        let translated = ctx.translator.translate_request(
            req.source_format,
            Format::Codex,
            &req.model,
            req.payload.clone(),
            !compact,
        )?;
        let mut body = serde_json::from_slice::<Value>(&translated)?;
        let obj = body.as_object_mut().ok_or_else(|| {
            ExecutorError::Validation("request body must be a JSON object".to_string())
        })?;
        obj.insert("model".to_string(), Value::String(req.model.clone()));
        if compact {
            obj.remove("stream");
        } else {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
        obj.remove("previous_response_id");
        obj.remove("prompt_cache_retention");
        obj.remove("safety_identifier");
        if !obj.contains_key("instructions") {
            obj.insert("instructions".to_string(), Value::String(String::new()));
        }

        let cache_id = self.prompt_cache_id(req);
        if let Some(id) = &cache_id {
            obj.insert("prompt_cache_key".to_string(), Value::String(id.clone()));
        }
        Ok((Bytes::from(serde_json::to_vec(&body)?), cache_id))
    }

    fn build_request(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        url: String,
        body: Bytes,
        cache_id: Option<&str>,
        stream: bool,
    ) -> ExecResult<UpstreamHttpRequest> {
        let mut req = UpstreamHttpRequest::new(HttpMethod::Post, url);
        req.body = Some(body);
        req.is_stream = stream;
        if let Some(id) = cache_id {
            header_set(&mut req.headers, "Conversation_id", id);
            header_set(&mut req.headers, "Session_id", id);
        }
        apply_codex_headers(&mut req.headers, credential, ctx.user_agent.as_deref(), stream)?;
        Ok(req)
    }

    /// Turns an upstream failure into the executor error, attaching the
    /// cooldown for 429s.
    async fn status_error(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        base_url: &str,
        failure: UpstreamFailure,
    ) -> ExecutorError {
        let (headers, body) = match failure {
            UpstreamFailure::Http {
                status: 429,
                headers,
                body,
            } => (headers, body),
            other => return other.into(),
        };
        let now = SystemTime::now();
        let header_delay = retry_after(&headers, now);
        let mut hint = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|payload| codex_cooldown(&payload, now));
        if hint.is_none() {
            hint = usage::fetch_usage_hint(ctx, credential, base_url).await;
        }
        let (retry_after, reason) = merge_hint(header_delay, hint, now);
        debug!(
            event = "codex_quota_exhausted",
            trace_id = %ctx.trace_id,
            credential_id = %credential.id,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            reason = reason.unwrap_or_default()
        );
        ExecutorError::RateLimited {
            retry_after,
            reason,
            body,
        }
    }

    async fn execute_compact(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        let base = base_url(credential);
        let (body, cache_id) = self.build_body(ctx, &req, true)?;
        let upstream = self.build_request(
            ctx,
            credential,
            format!("{base}/responses/compact"),
            body,
            cache_id.as_deref(),
            false,
        )?;
        let response = match send_routed(ctx, PROVIDER, "compact", credential, upstream).await {
            Ok(response) => response,
            Err(failure) => return Err(self.status_error(ctx, credential, &base, failure).await),
        };
        let data = response.body.collect().await;
        let payload =
            ctx.translator
                .translate_response(Format::Codex, req.source_format, &req.model, data)?;
        Ok(ExecResponse {
            payload,
            headers: json_headers(),
        })
    }
}

#[async_trait]
impl Executor for CodexExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        credential: &Credential,
    ) -> ExecResult<()> {
        apply_codex_headers(&mut req.headers, credential, None, req.is_stream)
    }

    async fn execute(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        if is_compact(&req) {
            if req.stream {
                return Err(compact_stream_error());
            }
            return self.execute_compact(ctx, credential, req).await;
        }
        let base = base_url(credential);
        let (body, cache_id) = self.build_body(ctx, &req, false)?;
        let upstream = self.build_request(
            ctx,
            credential,
            format!("{base}/responses"),
            body,
            cache_id.as_deref(),
            true,
        )?;
        let response = match send_routed(ctx, PROVIDER, "execute", credential, upstream).await {
            Ok(response) => response,
            Err(failure) => return Err(self.status_error(ctx, credential, &base, failure).await),
        };
        let data = response.body.collect().await;
        let Some(completed) = find_completed(&data) else {
            return Err(ExecutorError::Upstream {
                status: 408,
                headers: Headers::new(),
                body: Bytes::from_static(STREAM_DISCONNECTED.as_bytes()),
            });
        };
        let payload = ctx.translator.translate_response(
            Format::Codex,
            req.source_format,
            &req.model,
            completed,
        )?;
        Ok(ExecResponse {
            payload,
            headers: json_headers(),
        })
    }

    async fn execute_stream(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecStream> {
        if is_compact(&req) {
            return Err(compact_stream_error());
        }
        let base = base_url(credential);
        let (body, cache_id) = self.build_body(ctx, &req, false)?;
        let upstream = self.build_request(
            ctx,
            credential,
            format!("{base}/responses"),
            body,
            cache_id.as_deref(),
            true,
        )?;
        let response =
            match send_routed(ctx, PROVIDER, "execute_stream", credential, upstream).await {
                Ok(response) => response,
                Err(failure) => {
                    return Err(self.status_error(ctx, credential, &base, failure).await);
                }
            };
        Ok(forward_lines(
            ctx,
            Format::Codex,
            req.source_format,
            req.model,
            response.body,
        ))
    }

    async fn count_tokens(
        &self,
        ctx: &ExecCtx,
        _credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        let translated = ctx.translator.translate_request(
            req.source_format,
            Format::Codex,
            &req.model,
            req.payload.clone(),
            false,
        )?;
        let body = serde_json::from_slice::<Value>(&translated)?;
        let text = tokens::input_segments(&body).join("\n");
        let count = self.counter.count(&req.model, &text)?;
        let usage = json!({
            "response": {
                "usage": {
                    "input_tokens": count,
                    "output_tokens": 0,
                    "total_tokens": count
                }
            }
        });
        let payload = ctx.translator.translate_response(
            Format::Codex,
            req.source_format,
            &req.model,
            Bytes::from(serde_json::to_vec(&usage)?),
        )?;
        Ok(ExecResponse {
            payload,
            headers: json_headers(),
        })
    }

    async fn refresh(&self, ctx: &ExecCtx, credential: &Credential) -> ExecResult<Credential> {
        let Some(refresh_token) = credential.metadata_str("refresh_token") else {
            return Ok(credential.clone());
        };
        let tokens = refresh_access_token(ctx, credential, refresh_token).await?;
        let claims = tokens
            .id_token
            .as_deref()
            .map(parse_id_token_claims)
            .unwrap_or_default();

        let now = OffsetDateTime::now_utc();
        let mut refreshed = credential.clone();
        let meta: &mut Map<String, Value> = &mut refreshed.metadata;
        meta.insert(
            "id_token".to_string(),
            Value::String(tokens.id_token.clone().unwrap_or_default()),
        );
        meta.insert(
            "access_token".to_string(),
            Value::String(tokens.access_token.clone()),
        );
        if let Some(rotated) = tokens.refresh_token.filter(|t| !t.is_empty()) {
            meta.insert("refresh_token".to_string(), Value::String(rotated));
        }
        if let Some(account_id) = claims.account_id.filter(|id| !id.is_empty()) {
            meta.insert("account_id".to_string(), Value::String(account_id));
        }
        meta.insert(
            "email".to_string(),
            Value::String(claims.email.unwrap_or_default()),
        );
        if let Some(expires_in) = tokens.expires_in.filter(|secs| *secs > 0) {
            meta.insert(
                "expired".to_string(),
                Value::String(rfc3339(now + time::Duration::seconds(expires_in))?),
            );
        }
        meta.insert("type".to_string(), Value::String(PROVIDER.to_string()));
        meta.insert("last_refresh".to_string(), Value::String(rfc3339(now)?));
        info!(
            event = "credential_refreshed",
            trace_id = %ctx.trace_id,
            provider = PROVIDER,
            credential_id = %credential.id
        );
        Ok(refreshed)
    }
}

fn base_url(credential: &Credential) -> String {
    credential
        .attribute("base_url")
        .unwrap_or(DEFAULT_BASE_URL)
        .trim_end_matches('/')
        .to_string()
}

fn is_compact(req: &ExecRequest) -> bool {
    req.alt
        .as_deref()
        .is_some_and(|alt| alt.trim().trim_matches('/') == COMPACT_ALT)
}

fn compact_stream_error() -> ExecutorError {
    ExecutorError::Validation("streaming not supported for /responses/compact".to_string())
}

fn json_headers() -> Headers {
    vec![("Content-Type".to_string(), "application/json".to_string())]
}

fn rfc3339(at: OffsetDateTime) -> ExecResult<String> {
    at.format(&Rfc3339)
        .map_err(|err| ExecutorError::Other(err.to_string()))
}

fn apply_codex_headers(
    headers: &mut Headers,
    credential: &Credential,
    client_ua: Option<&str>,
    stream: bool,
) -> ExecResult<()> {
    let Some((token, is_api_key)) = credential_token(credential) else {
        return Err(ExecutorError::Validation(format!(
            "credential {} has neither api_key nor access_token",
            credential.id
        )));
    };
    set_content_type_json(headers);
    set_bearer(headers, token);
    header_set_if_absent(headers, "Version", CLIENT_VERSION);
    header_set_if_absent(headers, "Openai-Beta", "responses=experimental");
    header_set_if_absent(headers, "Session_id", Uuid::new_v4().to_string());
    set_user_agent(headers, client_ua, DEFAULT_USER_AGENT);
    set_accept(headers, stream);
    header_set(headers, "Connection", "Keep-Alive");
    if !is_api_key {
        header_set(headers, "Originator", "codex_cli_rs");
        if let Some(account_id) = credential.metadata_str("account_id") {
            header_set(headers, "Chatgpt-Account-Id", account_id);
        }
    }
    apply_attribute_headers(headers, credential);
    Ok(())
}

/// The `response.completed` event payload from a buffered SSE body.
fn find_completed(data: &[u8]) -> Option<Bytes> {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .filter_map(data_payload)
        .find(|payload| {
            serde_json::from_str::<Value>(payload)
                .ok()
                .and_then(|event| {
                    event
                        .get("type")
                        .and_then(Value::as_str)
                        .map(|t| t == "response.completed")
                })
                .unwrap_or(false)
        })
        .map(|payload| Bytes::copy_from_slice(payload.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

async fn refresh_access_token(
    ctx: &ExecCtx,
    credential: &Credential,
    refresh_token: &str,
) -> ExecResult<TokenResponse> {
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}&scope={}",
        urlencoding::encode(refresh_token),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode("openid profile email"),
    );
    let mut req = UpstreamHttpRequest::new(HttpMethod::Post, TOKEN_URL);
    header_set(
        &mut req.headers,
        "Content-Type",
        "application/x-www-form-urlencoded",
    );
    set_accept(&mut req.headers, false);
    req.body = Some(Bytes::from(body));
    req.outbound_proxy = ctx
        .config
        .outbound_proxy_for(credential.proxy_url.as_deref());

    let response = ctx.send(req).await.map_err(|failure| match failure {
        UpstreamFailure::Http { status, body, .. } => ExecutorError::Other(format!(
            "refresh_token_failed: {status} {}",
            String::from_utf8_lossy(&body)
        )),
        transport => transport.into(),
    })?;
    let status = response.status;
    let bytes = response.body.collect().await;
    if !(200..300).contains(&status) {
        return Err(ExecutorError::Other(format!(
            "refresh_token_failed: {status} {}",
            String::from_utf8_lossy(&bytes)
        )));
    }
    serde_json::from_slice::<TokenResponse>(&bytes)
        .map_err(|err| ExecutorError::Other(format!("refresh_token_failed: {err}")))
}

#[derive(Debug, Default)]
struct IdTokenClaims {
    email: Option<String>,
    account_id: Option<String>,
}

/// Reads profile claims from an unverified JWT payload.
fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let mut parts = id_token.split('.');
    let payload_b64 = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(_)) if !h.is_empty() && !p.is_empty() => p,
        _ => return claims,
    };
    let Ok(payload_bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64)
    else {
        return claims;
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&payload_bytes) else {
        return claims;
    };

    claims.email = payload
        .get("email")
        .and_then(Value::as_str)
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);
    claims.account_id = payload
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    claims
}
