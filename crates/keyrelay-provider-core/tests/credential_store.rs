use std::collections::HashSet;

use keyrelay_provider_core::{Credential, CredentialStatus, CredentialStore, ExecutorError};

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn register_keeps_registration_order_on_upsert() {
    let store = CredentialStore::new();
    store.register(Credential::new("a", "codex")).await.unwrap();
    store.register(Credential::new("b", "codex")).await.unwrap();
    store
        .register(Credential::new("a", "codex").with_file_name("a.json"))
        .await
        .unwrap();

    let ids: Vec<String> = store.list().await.into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    let a = store.get("a").await.unwrap();
    assert_eq!(a.file_name, "a.json");
    assert!(!a.index.is_empty());
}

#[tokio::test]
async fn register_rejects_blank_identity() {
    let store = CredentialStore::new();
    let err = store.register(Credential::new("  ", "codex")).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Validation(_)));
    let err = store.register(Credential::new("x", "")).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Validation(_)));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn active_candidates_filter_status_provider_and_allowed() {
    let store = CredentialStore::new();
    store.register(Credential::new("c1", "codex")).await.unwrap();
    store.register(Credential::new("g1", "gemini")).await.unwrap();
    store.register(Credential::new("c2", "codex")).await.unwrap();
    store.register(Credential::new("c3", "codex")).await.unwrap();
    store
        .set_status("c1", CredentialStatus::Error, Some("refresh failed".into()))
        .await
        .unwrap();

    let providers = vec!["gemini".to_string(), "codex".to_string()];
    let ids: Vec<String> = store
        .active_candidates(&providers, None)
        .await
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec!["g1", "c2", "c3"]);

    let allowed = set(&["c3"]);
    let ids: Vec<String> = store
        .active_candidates(&providers, Some(&allowed))
        .await
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec!["c3"]);

    let empty = HashSet::new();
    assert!(store.active_candidates(&providers, Some(&empty)).await.is_empty());
}

#[tokio::test]
async fn matching_ids_uses_id_index_and_file_name() {
    let store = CredentialStore::new();
    let a = store
        .register(Credential::new("auth-a", "codex").with_file_name("codex-a.json"))
        .await
        .unwrap();
    store
        .register(Credential::new("auth-b", "gemini").with_attribute("api_key", "sk-b"))
        .await
        .unwrap();

    assert_eq!(store.matching_ids(&set(&["codex-a.json"])).await, set(&["auth-a"]));
    assert_eq!(store.matching_ids(&set(&[a.index.as_str()])).await, set(&["auth-a"]));
    assert_eq!(
        store.matching_ids(&set(&["auth-b", "missing"])).await,
        set(&["auth-b"])
    );
    assert!(store.matching_ids(&HashSet::new()).await.is_empty());
}

#[tokio::test]
async fn update_and_deregister() {
    let store = CredentialStore::new();
    store.register(Credential::new("a", "codex")).await.unwrap();
    let mut changed = store.get("a").await.unwrap();
    changed.metadata.insert("access_token".into(), "new".into());
    assert!(store.update(changed).await);
    assert!(!store.update(Credential::new("ghost", "codex")).await);
    assert_eq!(
        store.get("a").await.unwrap().metadata_str("access_token"),
        Some("new")
    );
    assert_eq!(store.deregister("a").await.unwrap().id, "a");
    assert!(store.deregister("a").await.is_none());
    assert_eq!(store.len().await, 0);
}
