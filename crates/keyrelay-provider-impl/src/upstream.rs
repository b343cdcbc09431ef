use std::time::{Duration, Instant};

use tracing::{info, warn};

use keyrelay_provider_core::{
    Credential, ExecCtx, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, should_ban,
};

/// Sends a provider call through the reverse-proxy route for `credential`.
///
/// Non-2xx responses come back as `UpstreamFailure::Http` with the body
/// collected. When the call went through a reverse proxy and the failure
/// looks like the proxy's fault, the proxy is banned and the request is sent
/// once more straight to the original URL. Transport errors are returned as
/// they are.
pub async fn send_routed(
    ctx: &ExecCtx,
    provider: &str,
    op: &str,
    credential: &Credential,
    req: UpstreamHttpRequest,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let original_url = req.url.clone();
    let route = ctx
        .router
        .resolve_route(&ctx.config, provider, Some(credential), &original_url);

    let mut routed = req.clone();
    routed.url = route.url.clone();
    if route.proxied {
        ctx.router
            .apply_headers(&ctx.config, &mut routed.headers, provider, Some(credential));
        if let Some(secs) = route
            .proxy_id
            .as_deref()
            .and_then(|id| ctx.config.find_proxy(id))
            .and_then(|proxy| proxy.timeout)
            .filter(|secs| *secs > 0)
        {
            routed.timeout = Some(Duration::from_secs(secs));
        }
    }
    fill_outbound_proxy(ctx, credential, &mut routed);

    let first = send_logged(ctx, provider, op, routed).await;
    let (status, headers, body) = match first {
        Err(UpstreamFailure::Http {
            status,
            headers,
            body,
        }) => (status, headers, body),
        other => return other,
    };

    let Some(proxy_id) = route.proxy_id.as_deref().filter(|_| route.proxied) else {
        return Err(UpstreamFailure::Http {
            status,
            headers,
            body,
        });
    };
    let detail = String::from_utf8_lossy(&body);
    if !should_ban(status, &detail) {
        return Err(UpstreamFailure::Http {
            status,
            headers,
            body,
        });
    }
    ctx.router.ban_for_failure(proxy_id, provider, status, &detail);

    let mut direct = req;
    direct.url = original_url;
    // Proxy headers are skipped while the ban holds.
    ctx.router
        .apply_headers(&ctx.config, &mut direct.headers, provider, Some(credential));
    fill_outbound_proxy(ctx, credential, &mut direct);
    info!(
        event = "reverse_proxy_fallback",
        trace_id = %ctx.trace_id,
        provider = %provider,
        op = %op,
        proxy_id = %proxy_id
    );
    send_logged(ctx, provider, op, direct).await
}

fn fill_outbound_proxy(ctx: &ExecCtx, credential: &Credential, req: &mut UpstreamHttpRequest) {
    if req.outbound_proxy.is_none() {
        req.outbound_proxy = ctx
            .config
            .outbound_proxy_for(credential.proxy_url.as_deref());
    }
}

async fn send_logged(
    ctx: &ExecCtx,
    provider: &str,
    op: &str,
    req: UpstreamHttpRequest,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let method = req.method.as_str();
    let target = loggable_url(&req.url).to_string();
    let is_stream = req.is_stream;
    info!(
        event = "upstream_request",
        trace_id = %ctx.trace_id,
        provider = %provider,
        op = %op,
        method = %method,
        url = %target,
        is_stream = is_stream
    );
    let started_at = Instant::now();
    let response = match ctx.send(req).await {
        Ok(response) => response,
        Err(err) => {
            let elapsed_ms = started_at.elapsed().as_millis();
            match &err {
                UpstreamFailure::Transport { kind, message } => warn!(
                    event = "upstream_response",
                    trace_id = %ctx.trace_id,
                    provider = %provider,
                    op = %op,
                    status = "error",
                    elapsed_ms = elapsed_ms,
                    kind = ?kind,
                    error = %message
                ),
                UpstreamFailure::Http { status, .. } => warn!(
                    event = "upstream_response",
                    trace_id = %ctx.trace_id,
                    provider = %provider,
                    op = %op,
                    status = *status,
                    elapsed_ms = elapsed_ms
                ),
            }
            return Err(err);
        }
    };
    let elapsed_ms = started_at.elapsed().as_millis();
    if response.is_success() {
        info!(
            event = "upstream_response",
            trace_id = %ctx.trace_id,
            provider = %provider,
            op = %op,
            status = response.status,
            elapsed_ms = elapsed_ms,
            is_stream = is_stream
        );
        return Ok(response);
    }
    warn!(
        event = "upstream_response",
        trace_id = %ctx.trace_id,
        provider = %provider,
        op = %op,
        status = response.status,
        elapsed_ms = elapsed_ms,
        is_stream = is_stream
    );
    let UpstreamHttpResponse {
        status,
        headers,
        body,
    } = response;
    let body = match body {
        UpstreamBody::Bytes(bytes) => bytes,
        stream => stream.collect().await,
    };
    Err(UpstreamFailure::Http {
        status,
        headers,
        body,
    })
}

/// Drops the query string so keys passed as `?key=` never reach the logs.
fn loggable_url(url: &str) -> &str {
    url.split_once('?').map(|(head, _)| head).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::loggable_url;

    #[test]
    fn query_is_not_logged() {
        assert_eq!(
            loggable_url("https://example.com/v1beta/models/x:streamGenerateContent?alt=sse&key=k"),
            "https://example.com/v1beta/models/x:streamGenerateContent"
        );
        assert_eq!(loggable_url("https://example.com/a"), "https://example.com/a");
    }
}
