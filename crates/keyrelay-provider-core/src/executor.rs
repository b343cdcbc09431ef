use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::config::RuntimeConfig;
use crate::credential::Credential;
use crate::errors::{ExecResult, ExecutorError};
use crate::headers::Headers;
use crate::routing::ReverseProxyRouter;
use crate::translate::{IdentityTranslator, Translator};
use crate::upstream::{
    UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    OpenAI,
    OpenAIResponse,
    Claude,
    Gemini,
    Codex,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::OpenAI => "openai",
            Format::OpenAIResponse => "openai-response",
            Format::Claude => "claude",
            Format::Gemini => "gemini",
            Format::Codex => "codex",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Format::OpenAI),
            "openai-response" | "openai-responses" => Some(Format::OpenAIResponse),
            "claude" => Some(Format::Claude),
            "gemini" => Some(Format::Gemini),
            "codex" => Some(Format::Codex),
            _ => None,
        }
    }
}

/// Per-request context handed to executors.
///
/// `config` is the snapshot loaded when the request started; executors must
/// not look up configuration anywhere else.
#[derive(Clone)]
pub struct ExecCtx {
    pub trace_id: String,
    pub config: Arc<RuntimeConfig>,
    pub router: Arc<ReverseProxyRouter>,
    pub client: Arc<dyn UpstreamClient>,
    pub translator: Arc<dyn Translator>,
    pub user_agent: Option<String>,
    pub deadline: Option<Instant>,
}

impl ExecCtx {
    pub fn new(
        trace_id: impl Into<String>,
        config: Arc<RuntimeConfig>,
        router: Arc<ReverseProxyRouter>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            config,
            router,
            client,
            translator: Arc::new(IdentityTranslator),
            user_agent: None,
            deadline: None,
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sends through the upstream client, bounded by the request deadline.
    pub async fn send(
        &self,
        req: UpstreamHttpRequest,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        let fut = self.client.send(req);
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut).await.map_err(|_| {
                UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Timeout,
                    message: "request deadline exceeded".to_string(),
                }
            })?,
            None => fut.await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub model: String,
    pub payload: Bytes,
    pub source_format: Format,
    pub stream: bool,
    /// Provider-specific response variant (e.g. `sse`).
    pub alt: Option<String>,
}

impl ExecRequest {
    pub fn new(model: impl Into<String>, source_format: Format, payload: impl Into<Bytes>) -> Self {
        Self {
            model: model.into(),
            payload: payload.into(),
            source_format,
            stream: false,
            alt: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecResponse {
    pub payload: Bytes,
    pub headers: Headers,
}

pub type ExecStream = tokio::sync::mpsc::Receiver<ExecResult<Bytes>>;

/// One implementation per provider, registered by `identifier`.
#[async_trait]
pub trait Executor: Send + Sync {
    fn identifier(&self) -> &'static str;

    /// Injects credential auth into a request built elsewhere.
    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        credential: &Credential,
    ) -> ExecResult<()>;

    async fn execute(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse>;

    async fn execute_stream(
        &self,
        _ctx: &ExecCtx,
        _credential: &Credential,
        _req: ExecRequest,
    ) -> ExecResult<ExecStream> {
        Err(ExecutorError::Unsupported("execute_stream"))
    }

    async fn count_tokens(
        &self,
        _ctx: &ExecCtx,
        _credential: &Credential,
        _req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        Err(ExecutorError::Unsupported("count_tokens"))
    }

    /// Returns the credential with rotated material. Default: unchanged.
    async fn refresh(&self, _ctx: &ExecCtx, credential: &Credential) -> ExecResult<Credential> {
        Ok(credential.clone())
    }

    /// Raw authenticated request against the provider.
    async fn http_request(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        mut req: UpstreamHttpRequest,
    ) -> ExecResult<UpstreamHttpResponse> {
        self.prepare_request(&mut req, credential)?;
        if req.outbound_proxy.is_none() {
            req.outbound_proxy = ctx
                .config
                .outbound_proxy_for(credential.proxy_url.as_deref());
        }
        Ok(ctx.send(req).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use super::*;
    use crate::upstream::HttpMethod;

    struct StalledClient;

    impl UpstreamClient for StalledClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            Box::pin(std::future::pending())
        }
    }

    fn ctx() -> ExecCtx {
        ExecCtx::new(
            "t",
            Arc::new(RuntimeConfig::default()),
            Arc::new(ReverseProxyRouter::new()),
            Arc::new(StalledClient),
        )
    }

    #[tokio::test]
    async fn send_gives_up_at_deadline() {
        let ctx = ctx().with_deadline(Some(Instant::now()));
        let result = ctx
            .send(UpstreamHttpRequest::new(HttpMethod::Post, "http://upstream/v1"))
            .await;
        match result {
            Err(UpstreamFailure::Transport { kind, message }) => {
                assert_eq!(kind, UpstreamTransportErrorKind::Timeout);
                assert_eq!(message, "request deadline exceeded");
            }
            _ => panic!("expected a deadline timeout"),
        }
    }
}
