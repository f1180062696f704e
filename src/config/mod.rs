use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxy server settings
    pub proxy: ProxyConfig,
    /// Certificate settings
    pub cert: CertConfig,
    /// Rule file settings
    pub rules: RulesConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            cert: CertConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub host: String,
    /// Proxy listen port
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8899,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    /// Root CA certificate path
    pub ca_cert: String,
    /// Root CA private key path
    pub ca_key: String,
    /// Auto-generate the root CA if not found
    pub auto_generate: bool,
    /// Root CA validity in days
    pub ca_validity_days: u32,
    /// Minted leaf certificate validity in days
    pub cert_validity_days: u32,
    /// Leaf certificate cache capacity (hosts)
    pub cache_capacity: usize,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            ca_cert: "~/.rewire/rootCA.pem".to_string(),
            ca_key: "~/.rewire/rootCA.key".to_string(),
            auto_generate: true,
            ca_validity_days: 1825,
            cert_validity_days: 365,
            cache_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule DSL file, watched for changes
    pub file: String,
    /// Legacy JSON rule file, loaded once when the DSL file is absent
    pub legacy_file: String,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            file: "rules.txt".to_string(),
            legacy_file: "rules/rules.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: text, json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a default configuration file
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Config::default();
        config.save(path)?;
        Ok(config)
    }

    /// Expand tilde in paths
    pub fn expand_paths(&mut self) {
        if let Some(home) = dirs_home() {
            self.cert.ca_cert = self.cert.ca_cert.replace('~', &home);
            self.cert.ca_key = self.cert.ca_key.replace('~', &home);
        }
    }
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.proxy.port, 8899);
        assert_eq!(config.rules.file, "rules.txt");
        assert_eq!(config.cert.cache_capacity, 1000);
    }

    #[test]
    fn test_yaml_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.proxy.port, config.proxy.port);
        assert_eq!(parsed.rules.legacy_file, config.rules.legacy_file);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("proxy:\n  port: 9000\n").unwrap();
        assert_eq!(parsed.proxy.port, 9000);
        assert_eq!(parsed.proxy.host, "127.0.0.1");
        assert_eq!(parsed.cert.cert_validity_days, 365);
    }
}
