use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{info, warn};

use keyrelay_common::{GlobalConfig, GlobalConfigPatch};
use keyrelay_provider_core::{ReverseProxyRouter, RuntimeConfig};
use keyrelay_provider_impl::{TiktokenCounter, builtin_executors};
use keyrelay_storage::{ConfigStore, FileConfigStore, PersistedConfig};

use crate::manager::CredentialManager;
use crate::state::AppState;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "keyrelay",
    version,
    about = "Multi-credential AI provider gateway"
)]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "KEYRELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "KEYRELAY_PORT")]
    pub port: Option<String>,

    /// Management key (plaintext). Only its hash is kept.
    #[arg(long, env = "KEYRELAY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Outbound proxy for credentials without their own.
    #[arg(long, env = "KEYRELAY_PROXY")]
    pub proxy: Option<String>,

    /// Path of the JSON configuration document.
    #[arg(long, env = "KEYRELAY_CONFIG")]
    pub config: Option<String>,
}

pub struct Bootstrap {
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let config_path =
        sanitize_optional_env_value(args.config.clone()).unwrap_or_else(|| "keyrelay.json".into());
    let persist = Arc::new(FileConfigStore::new(&config_path));
    let doc = persist.load().await.context("load config document")?;
    bootstrap_with_store(args, persist, doc).await
}

/// Shared by the file-backed startup path and tests that bring their own store.
pub async fn bootstrap_with_store(
    args: CliArgs,
    persist: Arc<dyn ConfigStore>,
    mut doc: PersistedConfig,
) -> anyhow::Result<Bootstrap> {
    let host = sanitize_optional_env_value(args.host.clone());
    let port = parse_u16_env_value(args.port.clone(), "KEYRELAY_PORT")?;
    let admin_key = sanitize_optional_env_value(args.admin_key.clone());
    let proxy = sanitize_optional_env_value(args.proxy.clone());
    let config_path = sanitize_optional_env_value(args.config.clone());

    doc.sanitize();

    // clap already applies CLI > ENV per field; that layer goes over the document.
    let mut merged = GlobalConfigPatch {
        host: doc.host.clone(),
        port: doc.port,
        proxy: doc.proxy_url.clone(),
        ..Default::default()
    };
    let admin_key_hash = match admin_key.as_deref() {
        Some(key_plain) => hash_admin_key(key_plain),
        None => {
            let key_plain = generate_admin_key();
            eprintln!("generated admin key: {key_plain}");
            hash_admin_key(&key_plain)
        }
    };
    merged.overlay(GlobalConfigPatch {
        host,
        port,
        admin_key_hash: Some(admin_key_hash),
        proxy,
        config_path,
    });
    let global: GlobalConfig = merged
        .into_config()
        .context("finalize merged global config")?;

    // Persist the merged values back so the document reflects what is running.
    let before = doc.clone();
    doc.host = Some(global.host.clone());
    doc.port = Some(global.port);
    doc.proxy_url = global.proxy.clone();
    if doc != before {
        persist
            .save(&doc)
            .await
            .context("persist merged config document")?;
    }

    let client = WreqUpstreamClient::new(UpstreamClientConfig::from_global(&global))
        .context("build upstream client")?;
    let config = Arc::new(ArcSwap::from_pointee(RuntimeConfig::default()));
    let manager = Arc::new(CredentialManager::new(
        Arc::default(),
        config.clone(),
        Arc::new(ReverseProxyRouter::new()),
        Arc::new(client),
    ));
    for executor in builtin_executors(Arc::new(TiktokenCounter)) {
        manager.register_executor(executor);
    }

    for cred in &doc.credentials {
        if let Err(err) = manager.store().register(cred.clone()).await {
            warn!(event = "credential_skipped", credential_id = %cred.id, error = %err);
        }
    }
    info!(
        event = "bootstrap_loaded",
        credentials = manager.store().len().await,
        client_keys = doc.api_keys.len(),
        reverse_proxies = doc.reverse_proxies.len(),
    );

    let state = AppState::new(global, doc, persist, manager, config);
    Ok(Bootstrap {
        state: Arc::new(state),
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved placeholders such as `${VAR}` count as unset.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

pub fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn generate_admin_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_count_as_unset() {
        assert_eq!(sanitize_optional_env_value(Some("${PORT}".into())), None);
        assert_eq!(sanitize_optional_env_value(Some("   ".into())), None);
        assert_eq!(
            sanitize_optional_env_value(Some(" 0.0.0.0 ".into())).as_deref(),
            Some("0.0.0.0")
        );
    }

    #[test]
    fn port_must_parse() {
        assert_eq!(parse_u16_env_value(Some("9000".into()), "P").unwrap(), Some(9000));
        assert_eq!(parse_u16_env_value(None, "P").unwrap(), None);
        assert!(parse_u16_env_value(Some("http".into()), "P").is_err());
    }

    #[test]
    fn admin_key_hash_is_blake3_hex() {
        let hash = hash_admin_key("secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_admin_key("secret"));
        assert_ne!(hash, hash_admin_key("secret2"));
    }
}
