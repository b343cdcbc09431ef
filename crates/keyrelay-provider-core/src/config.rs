use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReverseProxy {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Injected on outgoing requests only when the header is not already set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
}

/// Immutable configuration snapshot read once per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub proxy_url: Option<String>,
    pub api_keys: Vec<String>,
    pub api_key_auth: BTreeMap<String, Vec<String>>,
    pub api_key_expiry: BTreeMap<String, String>,
    pub reverse_proxies: Vec<ReverseProxy>,
    pub reverse_proxy_worker_url: String,
    pub proxy_routing: BTreeMap<String, String>,
    pub proxy_routing_auth: BTreeMap<String, String>,
}

impl RuntimeConfig {
    pub fn find_proxy(&self, id: &str) -> Option<&ReverseProxy> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        self.reverse_proxies.iter().find(|proxy| proxy.id == id)
    }

    /// A proxy is usable only when it exists and is enabled.
    pub fn usable_proxy(&self, id: &str) -> Option<&ReverseProxy> {
        self.find_proxy(id).filter(|proxy| proxy.enabled)
    }

    pub fn has_client_key(&self, key: &str) -> bool {
        self.api_keys.iter().any(|known| known.trim() == key)
    }

    /// Outbound forward proxy: the credential's own override, else the global one.
    pub fn outbound_proxy_for(&self, credential_proxy: Option<&str>) -> Option<String> {
        credential_proxy
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.proxy_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            })
            .map(str::to_string)
    }
}

/// Trims and dedupes the refs of each client key, keeping present-but-empty
/// lists. Entries for keys outside `known_keys` are dropped when any key is known.
pub fn normalize_api_key_auth(
    map: &BTreeMap<String, Vec<String>>,
    known_keys: &[String],
) -> BTreeMap<String, Vec<String>> {
    let known: HashSet<&str> = known_keys
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .collect();
    let mut out = BTreeMap::new();
    for (key, refs) in map {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if !known.is_empty() && !known.contains(key) {
            continue;
        }
        let mut cleaned: Vec<String> = Vec::with_capacity(refs.len());
        for r in refs {
            let r = r.trim();
            if r.is_empty() || cleaned.iter().any(|existing| existing == r) {
                continue;
            }
            cleaned.push(r.to_string());
        }
        out.insert(key.to_string(), cleaned);
    }
    out
}

/// Trims keys and values and drops entries where either is empty.
pub fn normalize_routing_map(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(key, value)| {
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn api_key_auth_filters_unknown_keys_and_dedupes() {
        let mut input = BTreeMap::new();
        input.insert("key-1".to_string(), refs(&["auth-a", "auth-a", "  "]));
        input.insert("key-2".to_string(), refs(&["auth-b"]));
        input.insert("key-3".to_string(), Vec::new());
        input.insert("junk".to_string(), refs(&["[object Object]"]));

        let got = normalize_api_key_auth(&input, &refs(&["key-1", "key-2", "key-3"]));
        assert_eq!(got.len(), 3);
        assert_eq!(got["key-1"], refs(&["auth-a"]));
        assert_eq!(got["key-2"], refs(&["auth-b"]));
        assert!(got["key-3"].is_empty());
        assert!(!got.contains_key("junk"));
    }

    #[test]
    fn api_key_auth_keeps_everything_without_known_keys() {
        let mut input = BTreeMap::new();
        input.insert(" client ".to_string(), refs(&[" a "]));
        let got = normalize_api_key_auth(&input, &[]);
        assert_eq!(got["client"], refs(&["a"]));
    }

    #[test]
    fn routing_map_drops_blank_entries() {
        let mut input = BTreeMap::new();
        input.insert(" codex ".to_string(), " p1 ".to_string());
        input.insert("gemini".to_string(), "  ".to_string());
        input.insert(" ".to_string(), "p2".to_string());
        let got = normalize_routing_map(&input);
        assert_eq!(got.len(), 1);
        assert_eq!(got["codex"], "p1");
    }

    #[test]
    fn outbound_proxy_prefers_credential_override() {
        let cfg = RuntimeConfig {
            proxy_url: Some("http://global:8080".to_string()),
            ..Default::default()
        };
        assert_eq!(
            cfg.outbound_proxy_for(Some("socks5://cred:1080")).as_deref(),
            Some("socks5://cred:1080")
        );
        assert_eq!(
            cfg.outbound_proxy_for(Some("  ")).as_deref(),
            Some("http://global:8080")
        );
        assert_eq!(RuntimeConfig::default().outbound_proxy_for(None), None);
    }

    #[test]
    fn disabled_proxy_is_not_usable() {
        let cfg = RuntimeConfig {
            reverse_proxies: vec![ReverseProxy {
                id: "p1".to_string(),
                name: "edge".to_string(),
                base_url: "https://edge.example".to_string(),
                enabled: false,
                headers: BTreeMap::new(),
                timeout: None,
                created_at: String::new(),
            }],
            ..Default::default()
        };
        assert!(cfg.find_proxy("p1").is_some());
        assert!(cfg.usable_proxy("p1").is_none());
    }
}
