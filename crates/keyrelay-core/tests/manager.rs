mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keyrelay_core::{CallMeta, RoundRobin, resolve_allowed};
use keyrelay_provider_core::{
    Credential, CredentialStatus, ExecRequest, ExecutorError, Format, RuntimeConfig, stable_index,
};

use common::{EchoExecutor, manager, manager_with};

fn providers(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn meta(key: &str) -> CallMeta {
    CallMeta {
        client_key: key.to_string(),
        user_agent: None,
        timeout: None,
    }
}

fn request() -> ExecRequest {
    ExecRequest::new("gpt-5", Format::OpenAIResponse, "{}")
}

fn permissions(entries: &[(&str, &[&str])]) -> RuntimeConfig {
    RuntimeConfig {
        api_keys: entries.iter().map(|(key, _)| key.to_string()).collect(),
        api_key_auth: entries
            .iter()
            .map(|(key, refs)| {
                (
                    key.to_string(),
                    refs.iter().map(|r| r.to_string()).collect(),
                )
            })
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    }
}

#[tokio::test]
async fn fill_first_follows_provider_then_registration_order() {
    let (manager, _) = manager(
        RuntimeConfig::default(),
        vec![
            Credential::new("g1", "gemini"),
            Credential::new("c1", "codex"),
            Credential::new("c2", "codex"),
        ],
    )
    .await;
    let codex = EchoExecutor::new("codex");
    manager.register_executor(codex.clone());
    manager.register_executor(EchoExecutor::new("gemini"));

    let resp = manager
        .execute(&providers(&["codex", "gemini"]), &meta("free"), request())
        .await
        .unwrap();
    assert_eq!(resp.payload.as_ref(), b"c1");
    assert_eq!(codex.calls(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn deny_all_is_forbidden_even_with_active_credentials() {
    let (manager, config) = manager(
        permissions(&[("locked", &[])]),
        vec![Credential::new("c1", "codex")],
    )
    .await;
    let codex = EchoExecutor::new("codex");
    manager.register_executor(codex.clone());

    let allowed = resolve_allowed(&config.load(), manager.store(), "locked").await;
    assert!(allowed.is_deny_all());
    let err = manager
        .execute(&providers(&["codex"]), &meta("locked"), request())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Forbidden));
    assert_eq!(err.status_code(), 403);
    assert!(codex.calls().is_empty());
}

#[tokio::test]
async fn restriction_picks_matching_credential_by_file_name() {
    let (manager, _) = manager(
        permissions(&[("team", &["b.json"])]),
        vec![
            Credential::new("a", "codex").with_file_name("a.json"),
            Credential::new("b", "codex").with_file_name("b.json"),
        ],
    )
    .await;
    manager.register_executor(EchoExecutor::new("codex"));

    let resp = manager
        .execute(&providers(&["codex"]), &meta("team"), request())
        .await
        .unwrap();
    assert_eq!(resp.payload.as_ref(), b"b");
}

#[tokio::test]
async fn restriction_picks_matching_credential_by_derived_index() {
    let index = stable_index("file:x.json");
    let (manager, _) = manager(
        permissions(&[("team", &[index.as_str()])]),
        vec![
            Credential::new("decoy", "codex").with_file_name("y.json"),
            Credential::new("c1", "codex").with_file_name("x.json"),
        ],
    )
    .await;
    let codex = EchoExecutor::new("codex");
    manager.register_executor(codex.clone());

    let resp = manager
        .execute(&providers(&["codex"]), &meta("team"), request())
        .await
        .unwrap();
    assert_eq!(resp.payload.as_ref(), b"c1");
    assert_eq!(codex.calls(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn call_timeout_becomes_context_deadline() {
    let (manager, _) = manager(RuntimeConfig::default(), vec![Credential::new("c1", "codex")]).await;
    let codex = EchoExecutor::new("codex");
    manager.register_executor(codex.clone());

    manager
        .execute(&providers(&["codex"]), &meta("free"), request())
        .await
        .unwrap();
    let before = tokio::time::Instant::now();
    let timed = CallMeta {
        timeout: Some(Duration::from_secs(30)),
        ..meta("free")
    };
    manager
        .execute(&providers(&["codex"]), &timed, request())
        .await
        .unwrap();

    let deadlines = codex.deadlines();
    assert_eq!(deadlines.len(), 2);
    assert!(deadlines[0].is_none());
    let deadline = deadlines[1].unwrap();
    assert!(deadline >= before + Duration::from_secs(30));
    assert!(deadline <= tokio::time::Instant::now() + Duration::from_secs(30));
}

#[tokio::test]
async fn empty_candidates_split_by_restriction() {
    let (manager, _) = manager(
        permissions(&[("team", &["ghost"])]),
        vec![Credential::new("c1", "codex")],
    )
    .await;
    manager.register_executor(EchoExecutor::new("codex"));

    let restricted = manager
        .execute(&providers(&["codex"]), &meta("team"), request())
        .await
        .unwrap_err();
    assert!(matches!(restricted, ExecutorError::Forbidden));

    manager
        .store()
        .set_status("c1", CredentialStatus::Disabled, None)
        .await;
    let open = manager
        .execute(&providers(&["codex"]), &meta("free"), request())
        .await
        .unwrap_err();
    assert!(matches!(open, ExecutorError::NoEligibleCredential(_)));
    assert_eq!(open.status_code(), 503);
}

#[tokio::test]
async fn missing_executor_is_not_found() {
    let (manager, _) = manager(RuntimeConfig::default(), vec![Credential::new("x", "claude")]).await;
    let err = manager
        .execute(&providers(&["claude"]), &meta(""), request())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn usage_counts_success_and_failure() {
    let (manager, _) = manager_with(
        RuntimeConfig::default(),
        vec![Credential::new("c1", "codex"), Credential::new("c2", "codex")],
        |manager| manager.with_selector(Arc::new(RoundRobin::default())),
    )
    .await;
    manager.register_executor(EchoExecutor::failing("codex", vec!["c2"]));

    for _ in 0..4 {
        let _ = manager
            .execute(&providers(&["codex"]), &meta(""), request())
            .await;
    }
    let c1 = manager.usage().get("c1");
    let c2 = manager.usage().get("c2");
    assert_eq!((c1.requests, c1.success, c1.failure), (2, 2, 0));
    assert_eq!((c2.requests, c2.success, c2.failure), (2, 0, 2));
}

#[tokio::test]
async fn refresh_writes_back_into_store() {
    let (manager, _) = manager(RuntimeConfig::default(), vec![Credential::new("c1", "codex")]).await;
    manager.register_executor(EchoExecutor::new("codex"));

    let refreshed = manager.refresh("c1").await.unwrap();
    assert_eq!(refreshed.attribute("access_token"), Some("rotated"));
    let stored = manager.store().get("c1").await.unwrap();
    assert_eq!(stored.attribute("access_token"), Some("rotated"));

    assert_eq!(manager.refresh("ghost").await.unwrap_err().status_code(), 404);
}
