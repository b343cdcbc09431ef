use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > persisted document > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// blake3 hex digest of the management key.
    pub admin_key_hash: String,
    /// Outbound forward proxy applied when a credential carries none.
    pub proxy: Option<String>,
    /// Path of the persisted JSON configuration document.
    pub config_path: String,
}

impl GlobalConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfigPatch {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub admin_key_hash: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.config_path.is_some() {
            self.config_path = other.config_path;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let admin_key_hash = self
            .admin_key_hash
            .filter(|hash| !hash.trim().is_empty())
            .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?;
        let port = self.port.unwrap_or(8317);
        if port == 0 {
            return Err(GlobalConfigError::InvalidField {
                field: "port",
                detail: "port must be non-zero".to_string(),
            });
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            admin_key_hash,
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            config_path: self
                .config_path
                .unwrap_or_else(|| "keyrelay.json".to_string()),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            config_path: Some(value.config_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            admin_key_hash: Some("persisted".to_string()),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(9100),
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert_eq!(config.admin_key_hash, "persisted");
        assert_eq!(config.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(config.config_path, "keyrelay.json");
    }

    #[test]
    fn admin_key_hash_is_required() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("admin_key_hash")));
    }

    #[test]
    fn blank_proxy_is_dropped() {
        let config = GlobalConfigPatch {
            admin_key_hash: Some("h".to_string()),
            proxy: Some("  ".to_string()),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        assert_eq!(config.proxy, None);
        assert_eq!(config.bind_addr(), "0.0.0.0:8317");
    }
}
