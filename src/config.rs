//! JSON configuration.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level config: ingress URL, egress URL, route mode and the
/// optional host rules feeding the matcher.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("can not load config file {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("can not parse config file {}: {}", path.display(), e)))
    }
}

/// Classic Shadowsocks client config; converts into the URL pair the
/// supervisor consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct SsConfig {
    pub server: String,
    pub server_port: u16,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_local_address")]
    pub local_address: String,
    pub password: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub timeout: u64,
}

fn default_local_port() -> u16 {
    1080
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

impl SsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<SsConfig> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("can not load config file {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("can not parse config file {}: {}", path.display(), e)))
    }

    /// Equivalent `{local, remote}` pair: a SOCKS5 ingress and an
    /// `ss://` egress, everything proxied.
    pub fn into_config(self) -> Config {
        let method = if self.method.is_empty() {
            "aes-128-gcm".to_string()
        } else {
            self.method
        };
        Config {
            local: format!("socks5://{}:{}", self.local_address, self.local_port),
            remote: format!(
                "ss://{}:{}@{}:{}",
                method, self.password, self.server, self.server_port
            ),
            route: String::new(),
            rules: Vec::new(),
        }
    }
}
