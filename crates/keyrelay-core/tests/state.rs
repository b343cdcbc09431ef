use std::collections::BTreeMap;
use std::sync::Arc;

use keyrelay_core::{CliArgs, ConfigEditError, bootstrap_with_store};
use keyrelay_provider_core::{Credential, CredentialStatus};
use keyrelay_storage::{FileConfigStore, MemoryConfigStore, PersistedConfig};

fn args() -> CliArgs {
    CliArgs {
        admin_key: Some("admin".to_string()),
        ..Default::default()
    }
}

fn seeded_doc() -> PersistedConfig {
    PersistedConfig {
        api_keys: vec!["k1".to_string(), "k2".to_string()],
        api_key_auth: BTreeMap::from([
            ("k1".to_string(), vec!["a.json".to_string()]),
            ("k2".to_string(), vec!["a".to_string(), "b".to_string()]),
        ]),
        proxy_routing_auth: BTreeMap::from([("a.json".to_string(), "p1".to_string())]),
        credentials: vec![
            Credential::new("a", "codex").with_file_name("a.json"),
            Credential::new("b", "gemini").with_attribute("api_key", "g-key"),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn bootstrap_registers_document_credentials() {
    let persist = Arc::new(MemoryConfigStore::new(PersistedConfig::default()));
    let boot = bootstrap_with_store(args(), persist.clone(), seeded_doc())
        .await
        .unwrap();
    let state = boot.state;

    assert_eq!(state.store.len().await, 2);
    assert!(state.manager.executor("codex").is_some());
    assert!(state.manager.executor("gemini").is_some());
    assert_eq!(state.runtime().api_keys.len(), 2);
    assert_eq!(state.global.load().port, 8317);
    // Host and port are written back into the document.
    assert_eq!(persist.snapshot().await.port, Some(8317));
}

#[tokio::test]
async fn failed_save_leaves_memory_untouched() {
    let persist = Arc::new(MemoryConfigStore::new(PersistedConfig::default()));
    let state = bootstrap_with_store(args(), persist.clone(), seeded_doc())
        .await
        .unwrap()
        .state;
    persist.set_fail_saves(true);

    let err = state
        .update_config(|cfg| {
            cfg.api_keys.push("k3".to_string());
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigEditError::Save(_)));
    assert!(err.to_string().starts_with("failed to save config: "));
    assert_eq!(state.runtime().api_keys.len(), 2);

    let err = state.remove_credential("a").await.unwrap_err();
    assert!(matches!(err, ConfigEditError::Save(_)));
    assert!(state.store.get("a").await.is_some());
}

#[tokio::test]
async fn removing_a_credential_scrubs_permissions() {
    let persist = Arc::new(MemoryConfigStore::new(PersistedConfig::default()));
    let state = bootstrap_with_store(args(), persist.clone(), seeded_doc())
        .await
        .unwrap()
        .state;

    state.remove_credential("a").await.unwrap();

    let runtime = state.runtime();
    assert_eq!(runtime.api_key_auth.get("k1"), Some(&Vec::new()));
    assert_eq!(runtime.api_key_auth.get("k2"), Some(&vec!["b".to_string()]));
    assert!(runtime.proxy_routing_auth.is_empty());
    assert!(state.store.get("a").await.is_none());

    let saved = persist.snapshot().await;
    assert_eq!(saved.credentials.len(), 1);
    assert_eq!(saved.api_key_auth.get("k1"), Some(&Vec::new()));

    let err = state.remove_credential("a").await.unwrap_err();
    assert!(matches!(err, ConfigEditError::NotFound(_)));
}

#[tokio::test]
async fn status_changes_are_persisted() {
    let persist = Arc::new(MemoryConfigStore::new(PersistedConfig::default()));
    let state = bootstrap_with_store(args(), persist.clone(), seeded_doc())
        .await
        .unwrap()
        .state;

    state
        .set_credential_status("b", CredentialStatus::Disabled, Some("paused".into()))
        .await
        .unwrap();
    assert_eq!(
        state.store.get("b").await.unwrap().status,
        CredentialStatus::Disabled
    );
    let saved = persist.snapshot().await;
    let b = saved.credentials.iter().find(|c| c.id == "b").unwrap();
    assert_eq!(b.status, CredentialStatus::Disabled);
    assert_eq!(b.status_message.as_deref(), Some("paused"));
}

#[tokio::test]
async fn registration_round_trips_through_the_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyrelay.json");
    let persist = Arc::new(FileConfigStore::new(&path));
    let state = bootstrap_with_store(args(), persist.clone(), PersistedConfig::default())
        .await
        .unwrap()
        .state;

    let cred = state
        .register_credential(Credential::new(" c9 ", "codex").with_file_name("c9.json"))
        .await
        .unwrap();
    assert_eq!(cred.id, "c9");
    assert_eq!(cred.index.len(), 16);

    let raw = std::fs::read_to_string(&path).unwrap();
    let doc: PersistedConfig = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc.credentials[0].id, "c9");
    assert_eq!(doc.credentials[0].index, cred.index);

    let err = state
        .register_credential(Credential::new("", "codex"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigEditError::Invalid(_)));
}
