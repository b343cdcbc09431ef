use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use keyrelay_provider_core::{
    Credential, ExecCtx, ExecRequest, ExecResponse, ExecResult, ExecStream, Executor,
    ExecutorError, Format, HttpMethod, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, header_set, retry_after,
};

use crate::auth_extractor::{apply_attribute_headers, set_accept, set_content_type_json};
use crate::sse::forward_lines;
use crate::upstream::send_routed;

pub const PROVIDER: &str = "gemini";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google AI Studio, authenticated with an API key.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiExecutor;

impl GeminiExecutor {
    fn model_url(credential: &Credential, model: &str, action: &str) -> ExecResult<String> {
        let model = model.trim().trim_start_matches("models/");
        if model.is_empty() {
            return Err(ExecutorError::Validation("model is required".to_string()));
        }
        let base = credential
            .attribute("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        Ok(format!("{base}/v1beta/models/{model}:{action}"))
    }

    fn build_request(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        url: String,
        req: &ExecRequest,
        stream: bool,
    ) -> ExecResult<UpstreamHttpRequest> {
        let body = ctx.translator.translate_request(
            req.source_format,
            Format::Gemini,
            &req.model,
            req.payload.clone(),
            stream,
        )?;
        let mut upstream = UpstreamHttpRequest::new(HttpMethod::Post, url);
        upstream.body = Some(body);
        upstream.is_stream = stream;
        self.prepare_request(&mut upstream, credential)?;
        Ok(upstream)
    }

    async fn send(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        op: &str,
        upstream: UpstreamHttpRequest,
    ) -> ExecResult<UpstreamHttpResponse> {
        send_routed(ctx, PROVIDER, op, credential, upstream)
            .await
            .map_err(status_error)
    }

    async fn unary(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        op: &str,
        action: &str,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        let url = Self::model_url(credential, &req.model, action)?;
        let upstream = self.build_request(ctx, credential, url, &req, false)?;
        let response = self.send(ctx, credential, op, upstream).await?;
        let headers = response.headers.clone();
        let data: Bytes = response.body.collect().await;
        let payload =
            ctx.translator
                .translate_response(Format::Gemini, req.source_format, &req.model, data)?;
        Ok(ExecResponse { payload, headers })
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        credential: &Credential,
    ) -> ExecResult<()> {
        let Some(api_key) = credential.attribute("api_key") else {
            return Err(ExecutorError::Validation(format!(
                "credential {} has no api_key",
                credential.id
            )));
        };
        header_set(&mut req.headers, "x-goog-api-key", api_key);
        set_content_type_json(&mut req.headers);
        set_accept(&mut req.headers, req.is_stream);
        apply_attribute_headers(&mut req.headers, credential);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        self.unary(ctx, credential, "execute", "generateContent", req)
            .await
    }

    async fn execute_stream(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecStream> {
        let url = format!(
            "{}?alt=sse",
            Self::model_url(credential, &req.model, "streamGenerateContent")?
        );
        let upstream = self.build_request(ctx, credential, url, &req, true)?;
        let response = self.send(ctx, credential, "execute_stream", upstream).await?;
        Ok(forward_lines(
            ctx,
            Format::Gemini,
            req.source_format,
            req.model,
            response.body,
        ))
    }

    async fn count_tokens(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        self.unary(ctx, credential, "count_tokens", "countTokens", req)
            .await
    }
}

fn status_error(failure: UpstreamFailure) -> ExecutorError {
    match failure {
        UpstreamFailure::Http {
            status: 429,
            headers,
            body,
        } => ExecutorError::RateLimited {
            retry_after: retry_after(&headers, SystemTime::now()),
            reason: None,
            body,
        },
        other => other.into(),
    }
}
