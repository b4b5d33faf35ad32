use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
        }
    }
}

/// One chained upstream relay. Requests whose host matches one of the
/// `domains` patterns (NO_PROXY format) are forwarded through it; an empty
/// pattern list matches every host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    // Domain patterns in NO_PROXY format
    // Supports: "example.com", ".example.com", "*.example.com", "sub.example.com"
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    // Basic authentication required from proxy clients
    #[serde(default)]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:3333".parse().expect("default listen address")
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout_secs(),
            proxy_username: None,
            proxy_password: None,
            upstreams: Vec::new(),
            logging: None,
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr.port(), 3333);
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(config.upstreams.is_empty());
        assert!(config.proxy_username.is_none());
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, default_listen_addr());
        assert_eq!(config.connect_timeout_secs, 10);
    }

    #[test]
    fn test_upstream_config_parses() {
        let json = r#"{
            "upstreams": [{
                "host": "relay.example.net",
                "port": 9999,
                "username": "u",
                "password": "p",
                "domains": [".internal.example.com"]
            }]
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.upstreams.len(), 1);
        let upstream = &config.upstreams[0];
        assert_eq!(upstream.host, "relay.example.net");
        assert_eq!(upstream.port, 9999);
        assert_eq!(upstream.username.as_deref(), Some("u"));
        assert_eq!(upstream.domains, vec![".internal.example.com".to_string()]);
    }
}
