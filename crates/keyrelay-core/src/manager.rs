use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::Instant;
use tracing::{info, warn};

use keyrelay_provider_core::{
    Credential, CredentialStore, ExecCtx, ExecRequest, ExecResponse, ExecResult, ExecStream,
    Executor, ExecutorError, IdentityTranslator, ReverseProxyRouter, RuntimeConfig, Translator,
    UpstreamClient,
};

use crate::access::{Allowed, resolve_allowed};
use crate::usage::UsageTracker;

/// Picks one credential out of an ordered, non-empty candidate list.
pub trait Selector: Send + Sync {
    fn pick(&self, candidates: &[Credential]) -> Option<usize>;
}

/// Always the first candidate in registration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FillFirst;

impl Selector for FillFirst {
    fn pick(&self, candidates: &[Credential]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl Selector for RoundRobin {
    fn pick(&self, candidates: &[Credential]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

/// Caller facts the manager needs beyond the payload.
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    pub client_key: String,
    pub user_agent: Option<String>,
    /// Budget for the whole call, counted from credential selection.
    pub timeout: Option<Duration>,
}

pub struct CredentialManager {
    store: Arc<CredentialStore>,
    config: Arc<ArcSwap<RuntimeConfig>>,
    router: Arc<ReverseProxyRouter>,
    client: Arc<dyn UpstreamClient>,
    translator: Arc<dyn Translator>,
    selector: Arc<dyn Selector>,
    executors: ArcSwap<HashMap<String, Arc<dyn Executor>>>,
    usage: UsageTracker,
}

impl CredentialManager {
    pub fn new(
        store: Arc<CredentialStore>,
        config: Arc<ArcSwap<RuntimeConfig>>,
        router: Arc<ReverseProxyRouter>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            store,
            config,
            router,
            client,
            translator: Arc::new(IdentityTranslator),
            selector: Arc::new(FillFirst),
            executors: ArcSwap::from_pointee(HashMap::new()),
            usage: UsageTracker::new(),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        let mut map = self.executors.load().as_ref().clone();
        map.insert(executor.identifier().to_string(), executor);
        self.executors.store(Arc::new(map));
    }

    pub fn executor(&self, provider: &str) -> Option<Arc<dyn Executor>> {
        self.executors.load().get(provider).cloned()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<ReverseProxyRouter> {
        &self.router
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Chooses a credential for `providers`.
    ///
    /// A deny-all key fails before any enumeration. An empty candidate set
    /// is `Forbidden` for restricted keys and `NoEligibleCredential` otherwise.
    pub async fn select(&self, providers: &[String], allowed: &Allowed) -> ExecResult<Credential> {
        if allowed.is_deny_all() {
            return Err(ExecutorError::Forbidden);
        }
        let mut candidates = self
            .store
            .active_candidates(providers, allowed.as_filter())
            .await;
        if candidates.is_empty() {
            if allowed.is_restricted() {
                return Err(ExecutorError::Forbidden);
            }
            return Err(ExecutorError::NoEligibleCredential(providers.join(",")));
        }
        let idx = self
            .selector
            .pick(&candidates)
            .filter(|idx| *idx < candidates.len())
            .unwrap_or(0);
        Ok(candidates.swap_remove(idx))
    }

    fn context(
        &self,
        config: Arc<RuntimeConfig>,
        user_agent: Option<String>,
        timeout: Option<Duration>,
    ) -> ExecCtx {
        ExecCtx::new(
            uuid::Uuid::new_v4().to_string(),
            config,
            self.router.clone(),
            self.client.clone(),
        )
        .with_translator(self.translator.clone())
        .with_user_agent(user_agent)
        .with_deadline(timeout.map(|budget| Instant::now() + budget))
    }

    /// Snapshot, access check, selection. No lock survives this call.
    async fn prepare(
        &self,
        providers: &[String],
        meta: &CallMeta,
    ) -> ExecResult<(ExecCtx, Credential, Arc<dyn Executor>)> {
        let config = self.config.load_full();
        let allowed = resolve_allowed(&config, &self.store, &meta.client_key).await;
        let credential = self.select(providers, &allowed).await?;
        let executor = self.executor(&credential.provider).ok_or_else(|| {
            ExecutorError::NotFound(format!("executor for provider {}", credential.provider))
        })?;
        let ctx = self.context(config, meta.user_agent.clone(), meta.timeout);
        info!(
            event = "credential_selected",
            trace_id = %ctx.trace_id,
            provider = %credential.provider,
            credential_id = %credential.id,
        );
        Ok((ctx, credential, executor))
    }

    fn finish<T>(&self, ctx: &ExecCtx, credential: &Credential, result: &ExecResult<T>) {
        self.usage.record(&credential.id, result.is_ok());
        if let Err(err) = result {
            warn!(
                event = "execution_failed",
                trace_id = %ctx.trace_id,
                provider = %credential.provider,
                credential_id = %credential.id,
                status = err.status_code(),
                kind = err.kind(),
                error = %err,
            );
        }
    }

    pub async fn execute(
        &self,
        providers: &[String],
        meta: &CallMeta,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        let (ctx, credential, executor) = self.prepare(providers, meta).await?;
        let result = executor.execute(&ctx, &credential, req).await;
        self.finish(&ctx, &credential, &result);
        result
    }

    pub async fn execute_stream(
        &self,
        providers: &[String],
        meta: &CallMeta,
        req: ExecRequest,
    ) -> ExecResult<ExecStream> {
        let (ctx, credential, executor) = self.prepare(providers, meta).await?;
        let result = executor.execute_stream(&ctx, &credential, req).await;
        self.finish(&ctx, &credential, &result);
        result
    }

    pub async fn count_tokens(
        &self,
        providers: &[String],
        meta: &CallMeta,
        req: ExecRequest,
    ) -> ExecResult<ExecResponse> {
        let (ctx, credential, executor) = self.prepare(providers, meta).await?;
        let result = executor.count_tokens(&ctx, &credential, req).await;
        self.finish(&ctx, &credential, &result);
        result
    }

    /// Refreshes one credential and writes the result back into the store.
    pub async fn refresh(&self, id: &str) -> ExecResult<Credential> {
        let credential = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ExecutorError::NotFound(format!("credential {id}")))?;
        let executor = self.executor(&credential.provider).ok_or_else(|| {
            ExecutorError::NotFound(format!("executor for provider {}", credential.provider))
        })?;
        let ctx = self.context(self.config.load_full(), None, None);
        let refreshed = executor.refresh(&ctx, &credential).await?;
        if !self.store.update(refreshed.clone()).await {
            return Err(ExecutorError::NotFound(format!("credential {id}")));
        }
        Ok(refreshed)
    }
}

/// Every string a permission list or routing key may use to name a
/// credential: id, basename of id, index, file name, the `path` attribute
/// and its basename.
pub fn known_refs(credentials: &[Credential]) -> HashSet<String> {
    let mut out = HashSet::new();
    for cred in credentials {
        for value in [
            Some(cred.id.as_str()),
            Some(basename(&cred.id)),
            Some(cred.index.as_str()),
            Some(cred.file_name.as_str()),
            cred.attribute("path"),
            cred.attribute("path").map(basename),
        ]
        .into_iter()
        .flatten()
        {
            let value = value.trim();
            if !value.is_empty() {
                out.insert(value.to_string());
            }
        }
        if let Some(index) = cred.index_for_match() {
            out.insert(index);
        }
    }
    out
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Removes every reference to `removed` from the permission lists and the
/// auth-keyed routing map. Keys stay present even when their list empties,
/// which turns them into deny-all. Returns whether anything changed.
pub fn cleanup_auth_mappings(config: &mut RuntimeConfig, removed: &Credential) -> bool {
    let mut refs: HashSet<String> = [removed.id.as_str(), removed.file_name.as_str()]
        .into_iter()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(index) = removed.index_for_match() {
        refs.insert(index);
    }

    let mut changed = false;
    for list in config.api_key_auth.values_mut() {
        let before = list.len();
        list.retain(|entry| !refs.contains(entry.trim()));
        changed |= list.len() != before;
    }
    let before = config.proxy_routing_auth.len();
    config
        .proxy_routing_auth
        .retain(|key, _| !refs.contains(key.trim()));
    changed |= config.proxy_routing_auth.len() != before;
    changed
}
