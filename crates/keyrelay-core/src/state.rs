use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::info;

use keyrelay_common::GlobalConfig;
use keyrelay_provider_core::{
    Credential, CredentialStatus, CredentialStore, ReverseProxyRouter, RuntimeConfig,
};
use keyrelay_storage::{ConfigStore, PersistedConfig, StorageError};

use crate::manager::{CredentialManager, cleanup_auth_mappings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigEditError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("failed to save config: {0}")]
    Save(#[from] StorageError),
}

impl ConfigEditError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigEditError::Invalid(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ConfigEditError::NotFound(message.into())
    }
}

/// Everything request handlers read, plus the serialized write path.
///
/// Reads go through `config`/`store`. Every mutation holds `doc`, saves the
/// updated document, and only then publishes the new in-memory state; a
/// failed save leaves memory as it was.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub config: Arc<ArcSwap<RuntimeConfig>>,
    pub store: Arc<CredentialStore>,
    pub router: Arc<ReverseProxyRouter>,
    pub manager: Arc<CredentialManager>,
    persist: Arc<dyn ConfigStore>,
    doc: Mutex<PersistedConfig>,
}

impl AppState {
    pub fn new(
        global: GlobalConfig,
        doc: PersistedConfig,
        persist: Arc<dyn ConfigStore>,
        manager: Arc<CredentialManager>,
        config: Arc<ArcSwap<RuntimeConfig>>,
    ) -> Self {
        config.store(Arc::new(doc.runtime_config()));
        Self {
            global: ArcSwap::from_pointee(global),
            store: manager.store().clone(),
            router: manager.router().clone(),
            config,
            manager,
            persist,
            doc: Mutex::new(doc),
        }
    }

    pub fn runtime(&self) -> Arc<RuntimeConfig> {
        self.config.load_full()
    }

    /// Applies `mutate` to a copy of the runtime config, persists, then swaps.
    pub async fn update_config<T>(
        &self,
        mutate: impl FnOnce(&mut RuntimeConfig) -> Result<T, ConfigEditError>,
    ) -> Result<T, ConfigEditError> {
        let mut doc = self.doc.lock().await;
        let mut next = self.config.load().as_ref().clone();
        let out = mutate(&mut next)?;
        let mut next_doc = doc.clone();
        next_doc.apply_runtime(&next);
        self.persist.save(&next_doc).await?;
        *doc = next_doc;
        self.config.store(Arc::new(next));
        Ok(out)
    }

    /// Registers (or replaces) a credential and persists it.
    pub async fn register_credential(
        &self,
        mut cred: Credential,
    ) -> Result<Credential, ConfigEditError> {
        cred.id = cred.id.trim().to_string();
        cred.provider = cred.provider.trim().to_string();
        if cred.id.is_empty() || cred.provider.is_empty() {
            return Err(ConfigEditError::invalid("id and provider are required"));
        }
        cred.ensure_index();

        let mut doc = self.doc.lock().await;
        let mut next_doc = doc.clone();
        match next_doc.credentials.iter_mut().find(|c| c.id == cred.id) {
            Some(existing) => *existing = cred.clone(),
            None => next_doc.credentials.push(cred.clone()),
        }
        self.persist.save(&next_doc).await?;
        *doc = next_doc;
        let registered = self
            .store
            .register(cred)
            .await
            .map_err(|err| ConfigEditError::invalid(err.to_string()))?;
        info!(
            event = "credential_registered",
            credential_id = %registered.id,
            provider = %registered.provider,
        );
        Ok(registered)
    }

    /// Deregisters a credential and scrubs every config reference to it.
    pub async fn remove_credential(&self, id: &str) -> Result<Credential, ConfigEditError> {
        let mut doc = self.doc.lock().await;
        let Some(removed) = self.store.get(id).await else {
            return Err(ConfigEditError::not_found("credential not found"));
        };
        let mut next = self.config.load().as_ref().clone();
        let scrubbed = cleanup_auth_mappings(&mut next, &removed);

        let mut next_doc = doc.clone();
        next_doc.credentials.retain(|c| c.id != removed.id);
        next_doc.apply_runtime(&next);
        self.persist.save(&next_doc).await?;
        *doc = next_doc;
        self.store.deregister(&removed.id).await;
        self.manager.usage().forget(&removed.id);
        self.config.store(Arc::new(next));
        info!(
            event = "credential_removed",
            credential_id = %removed.id,
            provider = %removed.provider,
            mappings_scrubbed = scrubbed,
        );
        Ok(removed)
    }

    pub async fn set_credential_status(
        &self,
        id: &str,
        status: CredentialStatus,
        message: Option<String>,
    ) -> Result<Credential, ConfigEditError> {
        let mut doc = self.doc.lock().await;
        let Some(mut cred) = self.store.get(id).await else {
            return Err(ConfigEditError::not_found("credential not found"));
        };
        cred.status = status;
        cred.status_message = message.clone();

        let mut next_doc = doc.clone();
        match next_doc.credentials.iter_mut().find(|c| c.id == cred.id) {
            Some(existing) => *existing = cred.clone(),
            None => next_doc.credentials.push(cred.clone()),
        }
        self.persist.save(&next_doc).await?;
        *doc = next_doc;
        self.store.set_status(id, status, message).await;
        Ok(cred)
    }

    /// Refreshes through the owning executor and persists the rotated material.
    pub async fn refresh_credential(&self, id: &str) -> Result<Credential, RefreshError> {
        let refreshed = self.manager.refresh(id).await?;
        let mut doc = self.doc.lock().await;
        let mut next_doc = doc.clone();
        if let Some(existing) = next_doc.credentials.iter_mut().find(|c| c.id == refreshed.id) {
            *existing = refreshed.clone();
            self.persist
                .save(&next_doc)
                .await
                .map_err(ConfigEditError::from)?;
            *doc = next_doc;
        }
        Ok(refreshed)
    }

    pub async fn document(&self) -> PersistedConfig {
        self.doc.lock().await.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Executor(#[from] keyrelay_provider_core::ExecutorError),
    #[error(transparent)]
    Config(#[from] ConfigEditError),
}
