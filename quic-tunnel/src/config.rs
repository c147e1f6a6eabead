//! JSON configuration files for `quic-tunnel client` and `quic-tunnel server`.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("remoteAddr is required")]
    MissingRemoteAddr,

    #[error("cert and key are required")]
    MissingCertOrKey,

    #[error("Invalid auth: {source}")]
    InvalidAuth {
        #[from]
        source: crate::auth::InvalidCredentials,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Local port of the HTTP proxy
    pub listen: u16,
    /// `host:port` of the tunnel server
    pub remote_addr: String,
    #[serde(default)]
    pub skip_cert_verify: bool,
    /// `user:secret` proxy clients must present
    pub auth: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// UDP port of the QUIC endpoint
    pub listen: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl ClientConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_json(path).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_addr.is_empty() {
            return Err(ConfigError::MissingRemoteAddr);
        }
        self.credentials()?;
        Ok(())
    }

    pub fn credentials(&self) -> Result<crate::auth::Credentials, ConfigError> {
        Ok(self.auth.parse()?)
    }
}

impl ServerConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_json(path).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert.as_os_str().is_empty() || self.key.as_os_str().is_empty() {
            return Err(ConfigError::MissingCertOrKey);
        }
        Ok(())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `tracing` filter directive for a configured `logLevel`.
///
/// Unknown levels fall back to `info`.
pub fn log_filter(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" | "NOTICE" => "info",
        "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}
