use std::time::{Duration, SystemTime};

use serde_json::Value;
use tracing::debug;

use keyrelay_provider_core::{
    CooldownHint, Credential, ExecCtx, HttpMethod, QuotaSection, UpstreamBody,
    UpstreamHttpRequest, header_set, recover_at,
};

use crate::auth_extractor::{credential_token, set_accept, set_bearer};

use super::{DEFAULT_USER_AGENT, PROVIDER};

pub const USAGE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

pub const CODEX_QUOTA_SECTIONS: [QuotaSection; 2] = [
    QuotaSection {
        keys: &["rate_limit", "rateLimit"],
        short_reason: "codex_5h_limit",
        long_reason: "codex_weekly_limit",
    },
    QuotaSection {
        keys: &["code_review_rate_limit", "codeReviewRateLimit"],
        short_reason: "codex_code_review_limit",
        long_reason: "codex_code_review_limit",
    },
];

/// Cooldown hint from a codex usage payload.
pub fn codex_cooldown(payload: &Value, now: SystemTime) -> Option<CooldownHint> {
    recover_at(payload, now, &CODEX_QUOTA_SECTIONS)
}

pub(super) fn usage_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/codex").unwrap_or(base);
    format!("{base}/wham/usage")
}

/// Best-effort usage lookup after a 429. Any failure yields `None`.
pub(super) async fn fetch_usage_hint(
    ctx: &ExecCtx,
    credential: &Credential,
    base_url: &str,
) -> Option<CooldownHint> {
    let (token, _) = credential_token(credential)?;
    let mut req = UpstreamHttpRequest::new(HttpMethod::Get, usage_url(base_url));
    set_bearer(&mut req.headers, token);
    set_accept(&mut req.headers, false);
    header_set(&mut req.headers, "User-Agent", DEFAULT_USER_AGENT);
    if let Some(account_id) = credential.metadata_str("account_id") {
        header_set(&mut req.headers, "Chatgpt-Account-Id", account_id);
    }
    req.timeout = Some(USAGE_LOOKUP_TIMEOUT);
    req.outbound_proxy = ctx
        .config
        .outbound_proxy_for(credential.proxy_url.as_deref());

    let response = match tokio::time::timeout(USAGE_LOOKUP_TIMEOUT, ctx.send(req)).await {
        Ok(Ok(response)) if response.is_success() => response,
        Ok(Ok(response)) => {
            debug!(
                event = "usage_lookup_failed",
                trace_id = %ctx.trace_id,
                provider = PROVIDER,
                status = response.status
            );
            return None;
        }
        Ok(Err(_)) | Err(_) => {
            debug!(
                event = "usage_lookup_failed",
                trace_id = %ctx.trace_id,
                provider = PROVIDER,
                status = "error"
            );
            return None;
        }
    };
    let body = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        stream => stream.collect().await,
    };
    if body.is_empty() {
        return None;
    }
    let payload = serde_json::from_slice::<Value>(&body).ok()?;
    codex_cooldown(&payload, SystemTime::now())
}
