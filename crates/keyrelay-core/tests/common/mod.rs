#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;

use keyrelay_core::CredentialManager;
use keyrelay_provider_core::{
    Credential, CredentialStore, ExecCtx, ExecRequest, ExecResponse, ExecResult, Executor,
    ExecutorError, ReverseProxyRouter, RuntimeConfig, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};

/// Never reached by the fake executors.
pub struct OfflineClient;

impl UpstreamClient for OfflineClient {
    fn send<'a>(
        &'a self,
        _req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async {
            Err(UpstreamFailure::Transport {
                kind: UpstreamTransportErrorKind::Connect,
                message: "offline".to_string(),
            })
        })
    }
}

/// Echoes the chosen credential id; fails for ids listed in `failing`.
pub struct EchoExecutor {
    pub provider: &'static str,
    pub failing: Vec<&'static str>,
    pub calls: Mutex<Vec<String>>,
    pub deadlines: Mutex<Vec<Option<tokio::time::Instant>>>,
}

impl EchoExecutor {
    pub fn new(provider: &'static str) -> Arc<Self> {
        Arc::new(Self {
            provider,
            failing: Vec::new(),
            calls: Mutex::new(Vec::new()),
            deadlines: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(provider: &'static str, failing: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            failing,
            calls: Mutex::new(Vec::new()),
            deadlines: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deadlines(&self) -> Vec<Option<tokio::time::Instant>> {
        self.deadlines.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    fn identifier(&self) -> &'static str {
        self.provider
    }

    fn prepare_request(
        &self,
        _req: &mut UpstreamHttpRequest,
        _credential: &Credential,
    ) -> ExecResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecCtx,
        credential: &Credential,
        _req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        self.calls.lock().unwrap().push(credential.id.clone());
        self.deadlines.lock().unwrap().push(ctx.deadline);
        if self.failing.contains(&credential.id.as_str()) {
            return Err(ExecutorError::Upstream {
                status: 500,
                headers: Vec::new(),
                body: Bytes::from_static(b"boom"),
            });
        }
        Ok(ExecResponse {
            payload: Bytes::from(credential.id.clone()),
            headers: Vec::new(),
        })
    }

    async fn refresh(&self, _ctx: &ExecCtx, credential: &Credential) -> ExecResult<Credential> {
        let mut next = credential.clone();
        next.attributes
            .insert("access_token".to_string(), "rotated".to_string());
        Ok(next)
    }
}

pub async fn manager(
    config: RuntimeConfig,
    credentials: Vec<Credential>,
) -> (Arc<CredentialManager>, Arc<ArcSwap<RuntimeConfig>>) {
    manager_with(config, credentials, |manager| manager).await
}

pub async fn manager_with(
    config: RuntimeConfig,
    credentials: Vec<Credential>,
    customize: impl FnOnce(CredentialManager) -> CredentialManager,
) -> (Arc<CredentialManager>, Arc<ArcSwap<RuntimeConfig>>) {
    let config = Arc::new(ArcSwap::from_pointee(config));
    let store = Arc::new(CredentialStore::new());
    for cred in credentials {
        store.register(cred).await.unwrap();
    }
    let manager = CredentialManager::new(
        store,
        config.clone(),
        Arc::new(ReverseProxyRouter::new()),
        Arc::new(OfflineClient),
    );
    (Arc::new(customize(manager)), config)
}
