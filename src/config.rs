use serde::{Deserialize, Serialize};

use crate::routing::RoutingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing_mode: String,
    pub dns_servers: Vec<DnsServerConfig>,
    pub upstream_proxies: Vec<UpstreamProxyConfig>,
    pub interfaces: Vec<String>,
    pub health_check_interval: u64,
    pub accessibility_timeout: u64,
    pub dns_timeout: f64,
    pub network_timeout: u64,
    pub user_validation_timeout: u64,
    pub max_concurrent_connections: usize,
    pub max_connections_per_runway: usize,
    pub success_rate_threshold: f64,
    pub success_rate_window: usize,
    pub log_level: String,
    pub log_file: String,
    pub log_max_bytes: u64,
    pub log_backup_count: usize,
    pub proxy_listen_host: String,
    pub proxy_listen_port: u16,
    pub webui_enabled: bool,
    pub webui_listen_host: String,
    pub webui_listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsServerConfig {
    pub host: String,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub host: String,
    pub port: u16,
}

fn default_dns_port() -> u16 {
    53
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing_mode: "latency".to_string(),
            dns_servers: vec![],
            upstream_proxies: vec![],
            interfaces: vec!["auto".to_string()],
            health_check_interval: 60,
            accessibility_timeout: 5,
            dns_timeout: 3.0,
            network_timeout: 10,
            user_validation_timeout: 15,
            max_concurrent_connections: 100,
            max_connections_per_runway: 10,
            success_rate_threshold: 0.5,
            success_rate_window: 10,
            log_level: "INFO".to_string(),
            log_file: "logs/proxy.log".to_string(),
            log_max_bytes: 10_485_760,
            log_backup_count: 5,
            proxy_listen_host: "127.0.0.1".to_string(),
            proxy_listen_port: 2123,
            webui_enabled: false,
            webui_listen_host: "127.0.0.1".to_string(),
            webui_listen_port: 2124,
        }
    }
}

impl Config {
    /// Loads a config file, falling back to defaults on any read or parse
    /// failure. A missing or malformed file must never abort startup.
    pub fn load(path: &str) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Could not read config {}: {} (using defaults)", path, e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Config>(&content) {
            Ok(config) => config.sanitized(),
            Err(e) => {
                log::warn!("Malformed config {}: {} (using defaults)", path, e);
                Self::default()
            }
        }
    }

    fn sanitized(mut self) -> Self {
        self.success_rate_threshold = self.success_rate_threshold.clamp(0.0, 1.0);
        if self.success_rate_window == 0 {
            self.success_rate_window = Self::default().success_rate_window;
        }
        if self.max_concurrent_connections == 0 {
            self.max_concurrent_connections = Self::default().max_concurrent_connections;
        }
        self
    }

    pub fn routing_mode(&self) -> RoutingMode {
        match self.routing_mode.as_str() {
            "latency" => RoutingMode::Latency,
            "first_accessible" => RoutingMode::FirstAccessible,
            "round_robin" => RoutingMode::RoundRobin,
            other => {
                log::warn!("Unknown routing mode {:?}, defaulting to latency", other);
                RoutingMode::Latency
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_on_missing_file() {
        let config = Config::load("/nonexistent/flightpath.json");
        assert_eq!(config.proxy_listen_port, 2123);
        assert_eq!(config.success_rate_window, 10);
        assert_eq!(config.interfaces, vec!["auto".to_string()]);
    }

    #[test]
    fn defaults_on_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = Config::load(path.to_str().unwrap());
        assert_eq!(config.network_timeout, 10);
    }

    #[test]
    fn unknown_keys_ignored() {
        let parsed: Config = serde_json::from_str(
            r#"{"proxy_listen_port": 9999, "not_a_real_key": [1, 2, 3]}"#,
        )
        .unwrap();
        assert_eq!(parsed.proxy_listen_port, 9999);
        assert_eq!(parsed.network_timeout, 10);
    }

    #[test]
    fn dns_server_port_defaults_to_53() {
        let parsed: DnsServerConfig =
            serde_json::from_str(r#"{"host": "9.9.9.9", "name": "quad9"}"#).unwrap();
        assert_eq!(parsed.port, 53);
        assert_eq!(parsed.host, "9.9.9.9");
    }

    #[test]
    fn round_trip_preserves_recognised_keys() {
        let mut config = Config::default();
        config.routing_mode = "round_robin".to_string();
        config.dns_servers.push(DnsServerConfig {
            host: "1.1.1.1".to_string(),
            port: 53,
            name: "cf".to_string(),
        });
        config.upstream_proxies.push(UpstreamProxyConfig {
            proxy_type: "http".to_string(),
            host: "10.0.0.2".to_string(),
            port: 3128,
        });

        let text = serde_json::to_string(&config).unwrap();
        let reparsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed.routing_mode, "round_robin");
        assert_eq!(reparsed.dns_servers, config.dns_servers);
        assert_eq!(reparsed.upstream_proxies, config.upstream_proxies);
        assert_eq!(reparsed.success_rate_threshold, config.success_rate_threshold);
    }

    #[test]
    fn threshold_clamped_to_unit_interval() {
        let parsed: Config =
            serde_json::from_str(r#"{"success_rate_threshold": 7.5}"#).unwrap();
        assert_eq!(parsed.sanitized().success_rate_threshold, 1.0);
    }
}
