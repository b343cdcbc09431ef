use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use keyrelay_provider_core::{
    Credential, ReverseProxy, RuntimeConfig, normalize_api_key_auth, normalize_routing_map,
};

/// The on-disk configuration document.
///
/// Keys this version does not know about land in `extra` and are written back
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PersistedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Present-but-empty lists mean deny-all and must survive a round trip.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_key_auth: BTreeMap<String, Vec<String>>,
    #[serde(default, alias = "apiKeyExpiry", skip_serializing_if = "BTreeMap::is_empty")]
    pub api_key_expiry: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reverse_proxies: Vec<ReverseProxy>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reverse_proxy_worker_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proxy_routing: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proxy_routing_auth: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<Credential>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PersistedConfig {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            proxy_url: self
                .proxy_url
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            api_keys: self.api_keys.clone(),
            api_key_auth: self.api_key_auth.clone(),
            api_key_expiry: self.api_key_expiry.clone(),
            reverse_proxies: self.reverse_proxies.clone(),
            reverse_proxy_worker_url: self.reverse_proxy_worker_url.clone(),
            proxy_routing: self.proxy_routing.clone(),
            proxy_routing_auth: self.proxy_routing_auth.clone(),
        }
    }

    /// Writes every runtime field back, leaving host/port, credentials and
    /// unknown keys alone.
    pub fn apply_runtime(&mut self, cfg: &RuntimeConfig) {
        self.proxy_url = cfg.proxy_url.clone();
        self.api_keys = cfg.api_keys.clone();
        self.api_key_auth = cfg.api_key_auth.clone();
        self.api_key_expiry = cfg.api_key_expiry.clone();
        self.reverse_proxies = cfg.reverse_proxies.clone();
        self.reverse_proxy_worker_url = cfg.reverse_proxy_worker_url.clone();
        self.proxy_routing = cfg.proxy_routing.clone();
        self.proxy_routing_auth = cfg.proxy_routing_auth.clone();
    }

    /// Trims client keys and cleans the permission and routing maps.
    pub fn sanitize(&mut self) {
        let mut keys: Vec<String> = Vec::with_capacity(self.api_keys.len());
        for key in &self.api_keys {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|known| known == key) {
                keys.push(key.to_string());
            }
        }
        self.api_keys = keys;
        self.api_key_auth = normalize_api_key_auth(&self.api_key_auth, &self.api_keys);
        self.proxy_routing = normalize_routing_map(&self.proxy_routing);
        self.proxy_routing_auth = normalize_routing_map(&self.proxy_routing_auth);
        self.reverse_proxy_worker_url = self.reverse_proxy_worker_url.trim().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_round_trip() {
        let raw = json!({
            "api-keys": ["k1"],
            "api-key-auth": {"k1": []},
            "debug": true,
            "remote-management": {"allow-remote": false}
        });
        let doc: PersistedConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.extra.get("debug"), Some(&json!(true)));
        assert_eq!(doc.api_key_auth.get("k1"), Some(&Vec::new()));
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn legacy_expiry_alias_is_accepted() {
        let doc: PersistedConfig = serde_json::from_value(json!({
            "api-keys": ["k1"],
            "apiKeyExpiry": {"k1": "2030-01-01T00:00:00Z"}
        }))
        .unwrap();
        assert_eq!(
            doc.api_key_expiry.get("k1").map(String::as_str),
            Some("2030-01-01T00:00:00Z")
        );
        let back = serde_json::to_value(&doc).unwrap();
        assert!(back.get("api-key-expiry").is_some());
        assert!(back.get("apiKeyExpiry").is_none());
    }

    #[test]
    fn sanitize_keeps_deny_all_entries() {
        let mut doc = PersistedConfig {
            api_keys: vec![" k1 ".to_string(), "k1".to_string(), "".to_string()],
            api_key_auth: BTreeMap::from([
                ("k1".to_string(), vec![]),
                ("ghost".to_string(), vec!["c1".to_string()]),
            ]),
            ..Default::default()
        };
        doc.sanitize();
        assert_eq!(doc.api_keys, vec!["k1".to_string()]);
        assert_eq!(doc.api_key_auth.len(), 1);
        assert_eq!(doc.api_key_auth.get("k1"), Some(&Vec::new()));
    }

    #[test]
    fn runtime_fields_are_written_back() {
        let mut doc = PersistedConfig {
            host: Some("127.0.0.1".to_string()),
            ..Default::default()
        };
        doc.extra.insert("debug".to_string(), json!(true));
        let mut cfg = doc.runtime_config();
        cfg.reverse_proxy_worker_url = "https://worker.example".to_string();
        cfg.api_keys.push("k2".to_string());
        doc.apply_runtime(&cfg);
        assert_eq!(doc.runtime_config(), cfg);
        assert_eq!(doc.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(doc.extra.get("debug"), Some(&json!(true)));
    }
}
