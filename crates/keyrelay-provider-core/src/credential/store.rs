use std::collections::HashSet;

use tokio::sync::RwLock;

use super::{Credential, CredentialStatus};
use crate::errors::{ExecResult, ExecutorError};

/// Registration-ordered credential list.
///
/// Reads take the read lock; structural changes take the write lock. Callers
/// get clones, so no guard outlives a method call.
#[derive(Debug, Default)]
pub struct CredentialStore {
    creds: RwLock<Vec<Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces by id. A replaced credential keeps its position.
    pub async fn register(&self, mut cred: Credential) -> ExecResult<Credential> {
        cred.id = cred.id.trim().to_string();
        cred.provider = cred.provider.trim().to_string();
        if cred.id.is_empty() {
            return Err(ExecutorError::Validation("credential id is required".into()));
        }
        if cred.provider.is_empty() {
            return Err(ExecutorError::Validation(
                "credential provider is required".into(),
            ));
        }
        cred.ensure_index();

        let mut guard = self.creds.write().await;
        match guard.iter_mut().find(|existing| existing.id == cred.id) {
            Some(existing) => *existing = cred.clone(),
            None => guard.push(cred.clone()),
        }
        Ok(cred)
    }

    pub async fn deregister(&self, id: &str) -> Option<Credential> {
        let mut guard = self.creds.write().await;
        let idx = guard.iter().position(|cred| cred.id == id)?;
        Some(guard.remove(idx))
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.creds
            .read()
            .await
            .iter()
            .find(|cred| cred.id == id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Credential> {
        self.creds.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.creds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.creds.read().await.is_empty()
    }

    pub async fn list_for_provider(&self, provider: &str) -> Vec<Credential> {
        self.creds
            .read()
            .await
            .iter()
            .filter(|cred| cred.provider == provider)
            .cloned()
            .collect()
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: CredentialStatus,
        message: Option<String>,
    ) -> Option<Credential> {
        let mut guard = self.creds.write().await;
        let cred = guard.iter_mut().find(|cred| cred.id == id)?;
        cred.status = status;
        cred.status_message = message;
        Some(cred.clone())
    }

    /// Replaces an already registered credential. Returns false if unknown.
    pub async fn update(&self, mut cred: Credential) -> bool {
        cred.ensure_index();
        let mut guard = self.creds.write().await;
        match guard.iter_mut().find(|existing| existing.id == cred.id) {
            Some(existing) => {
                *existing = cred;
                true
            }
            None => false,
        }
    }

    /// Ids of every credential referenced by one of `refs`.
    pub async fn matching_ids(&self, refs: &HashSet<String>) -> HashSet<String> {
        if refs.is_empty() {
            return HashSet::new();
        }
        self.creds
            .read()
            .await
            .iter()
            .filter(|cred| cred.matches_any_ref(refs))
            .map(|cred| cred.id.clone())
            .collect()
    }

    /// Active credentials for `providers`, provider order first, then
    /// registration order. `allowed` restricts by credential id.
    pub async fn active_candidates(
        &self,
        providers: &[String],
        allowed: Option<&HashSet<String>>,
    ) -> Vec<Credential> {
        let guard = self.creds.read().await;
        let mut out = Vec::new();
        for provider in providers {
            let provider = provider.trim();
            out.extend(
                guard
                    .iter()
                    .filter(|cred| cred.provider == provider && cred.is_active())
                    .filter(|cred| allowed.is_none_or(|ids| ids.contains(&cred.id)))
                    .cloned(),
            );
        }
        out
    }
}
