//! Configuration for MailTrust

use crate::types::DkimAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "MAILTRUST_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// DKIM configuration
    #[serde(default)]
    pub dkim: DkimConfig,

    /// DANE configuration
    #[serde(default)]
    pub dane: DaneConfig,

    /// MTA-STS configuration
    #[serde(default)]
    pub mta_sts: MtaStsConfig,

    /// Trust record cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// TLS reporting configuration
    #[serde(default)]
    pub tls_reporting: TlsReportingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname of this MTA
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL
    #[serde(default = "default_db_url")]
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_db_url() -> String {
    "sqlite://mailtrust.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// DKIM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Algorithm used when generating or rotating keys
    #[serde(default = "default_key_type")]
    pub key_type: DkimAlgorithm,

    /// RSA modulus size in bits
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,

    /// Header fields covered by outbound signatures
    #[serde(default = "default_headers_to_sign")]
    pub headers_to_sign: Vec<String>,

    /// Timeout for DKIM key TXT lookups
    #[serde(default = "default_dkim_dns_timeout")]
    pub dns_timeout_secs: u64,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            key_type: default_key_type(),
            rsa_key_bits: default_rsa_key_bits(),
            headers_to_sign: default_headers_to_sign(),
            dns_timeout_secs: default_dkim_dns_timeout(),
        }
    }
}

impl DkimConfig {
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }
}

fn default_key_type() -> DkimAlgorithm {
    DkimAlgorithm::Rsa
}

fn default_rsa_key_bits() -> usize {
    2048
}

fn default_headers_to_sign() -> Vec<String> {
    [
        "From",
        "To",
        "Subject",
        "Date",
        "Message-ID",
        "MIME-Version",
        "Content-Type",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

fn default_dkim_dns_timeout() -> u64 {
    10
}

/// DANE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaneConfig {
    /// Validating resolver queried for TLSA records
    #[serde(default = "default_dane_resolver")]
    pub resolver: String,

    /// Per-query timeout
    #[serde(default = "default_dane_timeout")]
    pub timeout_secs: u64,

    /// Advertised EDNS(0) UDP payload size
    #[serde(default = "default_edns_payload")]
    pub edns_payload: u16,

    /// Never trust TLSA records the resolver did not authenticate
    #[serde(default = "default_require_dnssec")]
    pub require_dnssec: bool,
}

impl Default for DaneConfig {
    fn default() -> Self {
        Self {
            resolver: default_dane_resolver(),
            timeout_secs: default_dane_timeout(),
            edns_payload: default_edns_payload(),
            require_dnssec: default_require_dnssec(),
        }
    }
}

impl DaneConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_dane_resolver() -> String {
    "8.8.8.8:53".to_string()
}

fn default_dane_timeout() -> u64 {
    5
}

fn default_edns_payload() -> u16 {
    4096
}

fn default_require_dnssec() -> bool {
    true
}

/// MTA-STS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtaStsConfig {
    /// Timeout for the HTTPS policy fetch
    #[serde(default = "default_mta_sts_timeout")]
    pub timeout_secs: u64,

    /// Largest accepted policy body
    #[serde(default = "default_max_policy_bytes")]
    pub max_policy_bytes: usize,
}

impl Default for MtaStsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_mta_sts_timeout(),
            max_policy_bytes: default_max_policy_bytes(),
        }
    }
}

impl MtaStsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_mta_sts_timeout() -> u64 {
    30
}

fn default_max_policy_bytes() -> usize {
    64 * 1024
}

/// Trust record cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Interval between expired-entry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    300
}

/// TLS reporting (RFC 8460) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsReportingConfig {
    /// Organization named in generated reports; the server hostname when unset
    pub organization_name: Option<String>,

    /// Contact address included in generated reports
    pub contact_info: Option<String>,

    /// Interval at which collected observations become queued reports
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for TlsReportingConfig {
    fn default() -> Self {
        Self {
            organization_name: None,
            contact_info: None,
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl TlsReportingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_flush_interval() -> u64 {
    86_400
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `MAILTRUST_CONFIG` or the default locations.
    ///
    /// Falls back to built-in defaults when no file exists.
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./mailtrust.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/mailtrust/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::from_file(&path);
            }
        }

        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Reject values that would weaken or break the trust engine
    pub fn validate(&self) -> crate::Result<()> {
        if self.dkim.rsa_key_bits < 1024 {
            return Err(crate::Error::Config(format!(
                "dkim.rsa_key_bits must be at least 1024, got {}",
                self.dkim.rsa_key_bits
            )));
        }

        if self.dane.edns_payload < 4096 {
            return Err(crate::Error::Config(format!(
                "dane.edns_payload must be at least 4096, got {}",
                self.dane.edns_payload
            )));
        }

        let timeouts = [
            ("dkim.dns_timeout_secs", self.dkim.dns_timeout_secs),
            ("dane.timeout_secs", self.dane.timeout_secs),
            ("mta_sts.timeout_secs", self.mta_sts.timeout_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
            (
                "tls_reporting.flush_interval_secs",
                self.tls_reporting.flush_interval_secs,
            ),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(crate::Error::Config(format!("{} must be non-zero", name)));
            }
        }

        if !self
            .dkim
            .headers_to_sign
            .iter()
            .any(|h| h.eq_ignore_ascii_case("from"))
        {
            return Err(crate::Error::Config(
                "dkim.headers_to_sign must include From".to_string(),
            ));
        }

        Ok(())
    }

    /// Organization name written into TLS reports
    pub fn report_organization(&self) -> &str {
        self.tls_reporting
            .organization_name
            .as_deref()
            .unwrap_or(&self.server.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.hostname, "localhost");
        assert_eq!(config.database.url, "sqlite://mailtrust.db?mode=rwc");
        assert_eq!(config.dkim.key_type, DkimAlgorithm::Rsa);
        assert_eq!(config.dkim.rsa_key_bits, 2048);
        assert_eq!(config.dkim.headers_to_sign.len(), 7);
        assert_eq!(config.dane.resolver, "8.8.8.8:53");
        assert_eq!(config.dane.edns_payload, 4096);
        assert!(config.dane.require_dnssec);
        assert_eq!(config.mta_sts.timeout(), Duration::from_secs(30));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mx.example.com"

[database]
url = "sqlite::memory:"

[logging]
level = "debug"
format = "text"

[dkim]
key_type = "ed25519"

[dane]
resolver = "9.9.9.9"
require_dnssec = false

[tls_reporting]
contact_info = "tlsrpt@example.com"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.hostname, "mx.example.com");
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.dkim.key_type, DkimAlgorithm::Ed25519);
        assert_eq!(config.dane.resolver, "9.9.9.9");
        assert!(!config.dane.require_dnssec);
        assert_eq!(config.report_organization(), "mx.example.com");
        assert_eq!(
            config.tls_reporting.contact_info.as_deref(),
            Some("tlsrpt@example.com")
        );
    }

    #[test]
    fn test_validate_rejects_weak_settings() {
        let mut config = Config::default();
        config.dkim.rsa_key_bits = 512;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dane.edns_payload = 1232;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mta_sts.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dkim.headers_to_sign = vec!["Subject".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_key_type_rejected() {
        let toml = r#"
[dkim]
key_type = "dsa"
"#;
        assert!(Config::from_toml(toml).is_err());
    }
}
