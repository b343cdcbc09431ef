use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use keyrelay_core::{AppState, CallMeta, ClientPrincipal, authenticate, resolve_allowed};
use keyrelay_provider_core::{ExecRequest, ExecResponse, Format};
use keyrelay_provider_impl::codex::COMPACT_ALT;

use crate::error::ApiError;

pub fn client_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/usage/auth-files", get(usage_auth_files))
        .route("/{provider}/{*path}", post(dispatch))
        .layer(middleware::from_fn_with_state(state.clone(), client_auth))
        .with_state(state)
}

async fn client_auth(
    State(state): State<Arc<AppState>>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = authenticate(
        &state.runtime(),
        req.headers(),
        req.uri().query(),
        OffsetDateTime::now_utc(),
    )?;
    debug!(event = "client_authenticated", source = principal.source.as_str());
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

async fn usage_auth_files(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<ClientPrincipal>,
) -> Response {
    let allowed = resolve_allowed(&state.runtime(), &state.store, &principal.key).await;
    let usage = state.manager.usage();

    let (mut total, mut success, mut failure) = (0u64, 0u64, 0u64);
    let mut files = Vec::new();
    for cred in state.store.list().await {
        if !allowed.permits(&cred.id) {
            continue;
        }
        let counts = usage.get(&cred.id);
        total += counts.requests;
        success += counts.success;
        failure += counts.failure;
        files.push(json!({
            "id": cred.id,
            "index": cred.index,
            "file_name": cred.file_name,
            "provider": cred.provider,
            "status": cred.status.as_str(),
            "requests": counts.requests,
            "success": counts.success,
            "failure": counts.failure,
        }));
    }

    Json(json!({
        "total_requests": total,
        "success_count": success,
        "failure_count": failure,
        "auth_files": files,
    }))
    .into_response()
}

/// How a downstream path maps onto one executor call.
#[derive(Debug, PartialEq, Eq)]
struct CallShape {
    format: Format,
    model_from_path: Option<String>,
    stream_from_path: bool,
    count_tokens: bool,
    alt: Option<String>,
}

fn call_shape(provider: &str, path: &str) -> CallShape {
    let path = path.trim_matches('/');
    let (route, action) = match path.rsplit_once(':') {
        Some((route, action)) if !action.contains('/') => (route, Some(action)),
        _ => (path, None),
    };

    let model_from_path = route
        .split_once("models/")
        .map(|(_, model)| model.trim_matches('/').to_string())
        .filter(|model| !model.is_empty() && action.is_some());

    let format = if action.is_some() {
        Format::Gemini
    } else if route.ends_with("chat/completions") {
        Format::OpenAI
    } else if route.contains("responses") {
        Format::OpenAIResponse
    } else if route.ends_with("messages") || route.ends_with("messages/count_tokens") {
        Format::Claude
    } else {
        Format::parse(provider).unwrap_or(Format::OpenAI)
    };

    let count_tokens = matches!(action, Some("countTokens"))
        || route.ends_with("count_tokens")
        || route.ends_with("input_tokens");

    let alt = route
        .ends_with(COMPACT_ALT)
        .then(|| COMPACT_ALT.to_string());

    CallShape {
        format,
        model_from_path,
        stream_from_path: matches!(action, Some("streamGenerateContent")),
        count_tokens,
        alt,
    }
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<ClientPrincipal>,
    Path((provider, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let shape = call_shape(&provider, &path);
    let parsed: Option<Value> = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))?,
        )
    };

    let model = shape
        .model_from_path
        .clone()
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|v| v.get("model"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    let stream = shape.stream_from_path
        || parsed
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

    let mut req = ExecRequest::new(model, shape.format, body);
    req.stream = stream && !shape.count_tokens;
    req.alt = shape.alt;

    let meta = CallMeta {
        client_key: principal.key,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        timeout: request_timeout(&headers),
    };
    let providers = vec![provider];

    if shape.count_tokens {
        let resp = state.manager.count_tokens(&providers, &meta, req).await?;
        return Ok(json_response(resp));
    }
    if req.stream {
        let rx = state.manager.execute_stream(&providers, &meta, req).await?;
        return Ok(sse_response(rx));
    }
    let resp = state.manager.execute(&providers, &meta, req).await?;
    Ok(json_response(resp))
}

/// `X-Request-Timeout` in whole seconds; absent, blank, zero or malformed means none.
fn request_timeout(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get("x-request-timeout")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn json_response(resp: ExecResponse) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(h) = builder.headers_mut() {
        for (name, value) in &resp.headers {
            if is_hop_by_hop_or_framing_header(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                h.append(name, value);
            }
        }
        h.entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
    }
    builder.body(Body::from(resp.payload)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn sse_response(rx: keyrelay_provider_core::ExecStream) -> Response {
    let stream = ReceiverStream::new(rx);
    let mut resp = Response::new(Body::from_stream(stream));
    let h = resp.headers_mut();
    h.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    resp
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
            | "content-length"
            | "content-encoding"
    )
}
