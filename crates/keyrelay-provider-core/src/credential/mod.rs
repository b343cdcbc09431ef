use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod store;

pub use store::CredentialStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    #[default]
    Active,
    Error,
    Disabled,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Error => "error",
            CredentialStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(CredentialStatus::Active),
            "error" => Some(CredentialStatus::Error),
            "disabled" => Some(CredentialStatus::Disabled),
            _ => None,
        }
    }
}

/// One upstream account or API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Credential {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            file_name: String::new(),
            index: String::new(),
            status: CredentialStatus::Active,
            status_message: None,
            label: None,
            attributes: BTreeMap::new(),
            metadata: Map::new(),
            proxy_url: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Trimmed, non-empty attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Trimmed, non-empty string metadata value.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Explicit index, else one derived from the first available seed:
    /// file name, `api_key` attribute, then id.
    pub fn index_for_match(&self) -> Option<String> {
        let explicit = self.index.trim();
        if !explicit.is_empty() {
            return Some(explicit.to_string());
        }
        let file_name = self.file_name.trim();
        let seed = if !file_name.is_empty() {
            format!("file:{file_name}")
        } else if let Some(api_key) = self.attribute("api_key") {
            format!("api_key:{api_key}")
        } else {
            let id = self.id.trim();
            if id.is_empty() {
                return None;
            }
            format!("id:{id}")
        };
        Some(stable_index(&seed))
    }

    /// Fills `index` from the derived value if it is still empty.
    pub fn ensure_index(&mut self) -> &str {
        if self.index.trim().is_empty()
            && let Some(index) = self.index_for_match()
        {
            self.index = index;
        }
        self.index.as_str()
    }

    /// Every identifier an operator may use to reference this credential.
    pub fn refs(&self) -> Vec<String> {
        let mut refs = Vec::with_capacity(3);
        for value in [
            Some(self.id.trim().to_string()),
            self.index_for_match(),
            Some(self.file_name.trim().to_string()),
        ]
        .into_iter()
        .flatten()
        {
            if !value.is_empty() && !refs.contains(&value) {
                refs.push(value);
            }
        }
        refs
    }

    /// Whether any of id, index or file name is in `allowed`.
    pub fn matches_any_ref(&self, allowed: &HashSet<String>) -> bool {
        if allowed.is_empty() {
            return false;
        }
        let id = self.id.trim();
        if !id.is_empty() && allowed.contains(id) {
            return true;
        }
        if let Some(index) = self.index_for_match()
            && allowed.contains(&index)
        {
            return true;
        }
        let file_name = self.file_name.trim();
        !file_name.is_empty() && allowed.contains(file_name)
    }
}

/// Deterministic short token for a seed string.
pub fn stable_index(seed: &str) -> String {
    let hash = blake3::hash(seed.as_bytes());
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn index_prefers_file_name_then_api_key_then_id() {
        let by_file = Credential::new("a", "codex")
            .with_file_name("codex-a.json")
            .with_attribute("api_key", "sk-1");
        assert_eq!(
            by_file.index_for_match().unwrap(),
            stable_index("file:codex-a.json")
        );

        let by_key = Credential::new("b", "gemini").with_attribute("api_key", " sk-2 ");
        assert_eq!(
            by_key.index_for_match().unwrap(),
            stable_index("api_key:sk-2")
        );

        let by_id = Credential::new("c", "gemini");
        assert_eq!(by_id.index_for_match().unwrap(), stable_index("id:c"));

        let mut explicit = Credential::new("d", "gemini");
        explicit.index = "custom".to_string();
        assert_eq!(explicit.index_for_match().as_deref(), Some("custom"));
    }

    #[test]
    fn stable_index_is_short_and_deterministic() {
        let a = stable_index("file:x.json");
        assert_eq!(a.len(), 16);
        assert_eq!(a, stable_index("file:x.json"));
        assert_ne!(a, stable_index("file:y.json"));
    }

    #[test]
    fn ensure_index_persists_derived_value() {
        let mut cred = Credential::new("a", "codex").with_file_name("a.json");
        let derived = cred.ensure_index().to_string();
        assert_eq!(cred.index, derived);
        assert_eq!(cred.refs(), vec!["a".to_string(), derived, "a.json".to_string()]);
    }

    #[test]
    fn matches_by_any_identifier() {
        let cred = Credential::new("auth-1", "codex").with_file_name("codex-1.json");
        let index = cred.index_for_match().unwrap();
        for r in ["auth-1", index.as_str(), "codex-1.json"] {
            let allowed: HashSet<String> = [r.to_string()].into_iter().collect();
            assert!(cred.matches_any_ref(&allowed), "{r}");
        }
        assert!(!cred.matches_any_ref(&HashSet::new()));
    }

    #[test]
    fn deserializes_with_defaults() {
        let value = json!({
            "id": "codex-a",
            "provider": "codex",
            "status": "disabled",
            "metadata": {"access_token": "tok", "account_id": "acc"}
        });
        let cred: Credential = serde_json::from_value(value).unwrap();
        assert_eq!(cred.status, CredentialStatus::Disabled);
        assert_eq!(cred.metadata_str("account_id"), Some("acc"));
        assert!(cred.attributes.is_empty());
        assert!(cred.file_name.is_empty());
    }
}
