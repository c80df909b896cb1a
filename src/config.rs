use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::lite::strategy::{parse_backend, Strategy};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the game listener binds to.
    pub bind: String,
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
    /// Registered backend servers by name. Names are unique by construction.
    pub servers: HashMap<String, ServerConfig>,
    /// Preference order used when choosing an eligible backend.
    #[serde(rename = "try")]
    pub try_servers: Vec<String>,
    pub motd: MotdConfig,
    pub lite: LiteConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".into(),
            connection_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            servers: HashMap::new(),
            try_servers: Vec::new(),
            motd: MotdConfig::default(),
            lite: LiteConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default)]
    pub passthrough_motd: bool,
    /// Zero disables ping caching for this server.
    #[serde(default, with = "duration_serde")]
    pub cache_ping_ttl: Duration,
}

impl ServerConfig {
    pub fn cache_ping_enabled(&self) -> bool {
        self.passthrough_motd && !self.cache_ping_ttl.is_zero()
    }
}

/// The proxy's own status response, served when no passthrough server is
/// configured or reachable.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MotdConfig {
    pub description: serde_json::Value,
    pub version_name: String,
    pub protocol: i32,
    pub max_players: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

impl Default for MotdConfig {
    fn default() -> Self {
        Self {
            description: serde_json::json!({"text": "A Craftgate Proxy"}),
            version_name: "Craftgate".into(),
            protocol: 767,
            max_players: 100,
            favicon: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LiteConfig {
    pub enabled: bool,
    pub routes: Vec<RouteConfig>,
    #[serde(with = "duration_serde")]
    pub latency_probe_interval: Duration,
}

impl Default for LiteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            routes: Vec::new(),
            latency_probe_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Host patterns, case-insensitive; "*." wildcards a single label.
    #[serde(alias = "host")]
    pub hosts: Vec<String>,
    /// Backend addresses, optionally weighted as "address#weight".
    #[serde(default, alias = "backend")]
    pub backends: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub real_ip_from_tcpshield: bool,
    #[serde(default)]
    pub modify_virtual_host: bool,
    #[serde(default, with = "duration_serde")]
    pub cache_ping_ttl: Duration,
    /// Static status served when no backend is reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<FallbackVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<FallbackPlayers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackPlayers {
    pub online: i32,
    pub max: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8804".into(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        let (warnings, errors) = config.validate();
        for warning in &warnings {
            warn!("config: {}", warning);
        }
        if !errors.is_empty() {
            anyhow::bail!("config validation failed: {}", errors.join("; "));
        }
        Ok(config)
    }

    /// Validate configuration. Pure: returns warnings and errors without
    /// touching any state.
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push("bind address cannot be empty".into());
        }
        if self.api.enabled && self.api.bind.is_empty() {
            errors.push("api bind address cannot be empty when the api is enabled".into());
        }

        for (name, server) in &self.servers {
            if name.is_empty() {
                errors.push("server name cannot be empty".into());
            }
            if server.address.is_empty() {
                errors.push(format!("server '{}' has an empty address", name));
            }
        }

        for name in &self.try_servers {
            if !self.servers.contains_key(name) {
                warnings.push(format!("try list references unknown server '{}'", name));
            }
        }

        if self.lite.enabled && self.lite.routes.is_empty() {
            warnings.push("lite mode is enabled but no routes are configured".into());
        }
        for (i, route) in self.lite.routes.iter().enumerate() {
            if route.hosts.is_empty() || route.hosts.iter().any(|h| h.is_empty()) {
                errors.push(format!("lite route #{} must declare non-empty host patterns", i));
            }
            if route.backends.is_empty() && route.fallback.is_none() {
                errors.push(format!(
                    "lite route #{} needs at least one backend or a fallback status",
                    i
                ));
            }
            for backend in &route.backends {
                if backend.is_empty() {
                    errors.push(format!("lite route #{} has an empty backend address", i));
                    continue;
                }
                if let Some((_, weight)) = backend.rsplit_once('#') {
                    if weight.parse::<u32>().map_or(true, |w| w == 0) {
                        errors.push(format!(
                            "lite route #{} backend '{}' has an invalid weight",
                            i, backend
                        ));
                    }
                }
                let (address, _) = parse_backend(backend);
                if address.is_empty() {
                    errors.push(format!("lite route #{} has an empty backend address", i));
                }
            }
        }

        (warnings, errors)
    }
}

pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(num) = s.strip_suffix("ms") {
            let num: u64 = num.parse()?;
            Ok(Duration::from_millis(num))
        } else if let Some(num) = s.strip_suffix('s') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num))
        } else if let Some(num) = s.strip_suffix('m') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }
}
