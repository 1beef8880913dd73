//! Server configuration
//!
//! Environment variables:
//! - SHOOTS_HOST: bind address (default: 127.0.0.1)
//! - SHOOTS_PORT: bind port (default: 8081)
//! - SHOOTS_BUCKET_DIR: root directory for buckets (default: buckets)
//! - SHOOTS_CERT_FILE / SHOOTS_KEY_FILE: PEM certificate and key, both or neither
//! - SHOOTS_SECRET: token signing secret; enables authentication when set
//! - SHOOTS_SHUTDOWN_GRACE_SECS: drain period after shutdown is signalled (default: 10)
//! - SHOOTS_TOKEN_TTL_SECS: default admin token lifetime (default: 365 days)
//! - SHOOTS_MAX_MESSAGE_BYTES: gRPC message size limit (default: 64 MiB)
//! - SHOOTS_LOG_LEVEL: log level (default: info)

use crate::{Error, Result};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tonic::transport::Identity;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_BUCKET_DIR: &str = "buckets";
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub bucket_dir: PathBuf,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub secret: Option<String>,
    pub shutdown_grace_secs: u64,
    pub token_ttl_secs: u64,
    pub max_message_bytes: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            bucket_dir: PathBuf::from(DEFAULT_BUCKET_DIR),
            cert_file: None,
            key_file: None,
            secret: None,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or blank values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            host: get("SHOOTS_HOST").unwrap_or(defaults.host),
            port: parse_var("SHOOTS_PORT", get("SHOOTS_PORT"))?.unwrap_or(defaults.port),
            bucket_dir: get("SHOOTS_BUCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.bucket_dir),
            cert_file: get("SHOOTS_CERT_FILE").map(PathBuf::from),
            key_file: get("SHOOTS_KEY_FILE").map(PathBuf::from),
            secret: get("SHOOTS_SECRET"),
            shutdown_grace_secs: parse_var(
                "SHOOTS_SHUTDOWN_GRACE_SECS",
                get("SHOOTS_SHUTDOWN_GRACE_SECS"),
            )?
            .unwrap_or(defaults.shutdown_grace_secs),
            token_ttl_secs: parse_var("SHOOTS_TOKEN_TTL_SECS", get("SHOOTS_TOKEN_TTL_SECS"))?
                .unwrap_or(defaults.token_ttl_secs),
            max_message_bytes: parse_var(
                "SHOOTS_MAX_MESSAGE_BYTES",
                get("SHOOTS_MAX_MESSAGE_BYTES"),
            )?
            .unwrap_or(defaults.max_message_bytes),
            log_level: get("SHOOTS_LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Config(
                    "cert_file and key_file must be given together".to_string(),
                ));
            }
            _ => {}
        }
        if self.secret.as_deref() == Some("") {
            return Err(Error::Config("secret must not be empty".to_string()));
        }
        if self.token_ttl_secs == 0 {
            return Err(Error::Config("token_ttl_secs must be positive".to_string()));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::Config("max_message_bytes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Client-facing location, e.g. `grpc+tls://127.0.0.1:8081`.
    pub fn location(&self) -> String {
        let scheme = if self.tls_enabled() { "grpc+tls" } else { "grpc" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Load the PEM certificate and key when TLS is configured.
    pub fn tls_identity(&self) -> Result<Option<Identity>> {
        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            return Ok(None);
        };
        let cert = std::fs::read(cert_file).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", cert_file.display()))
        })?;
        let key = std::fs::read(key_file).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", key_file.display()))
        })?;
        Ok(Some(Identity::from_pem(cert, key)))
    }
}

fn parse_var<T>(name: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|raw| {
        raw.parse::<T>()
            .map_err(|e| Error::Config(format!("{name} is invalid ('{raw}'): {e}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.location(), "grpc://127.0.0.1:8081");
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert!(config.tls_identity().unwrap().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("SHOOTS_HOST", "0.0.0.0"),
            ("SHOOTS_PORT", "9000"),
            ("SHOOTS_BUCKET_DIR", "/data/buckets"),
            ("SHOOTS_SECRET", "s3cret"),
            ("SHOOTS_SHUTDOWN_GRACE_SECS", "3"),
            ("SHOOTS_MAX_MESSAGE_BYTES", "1024"),
            ("SHOOTS_LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.bucket_dir, PathBuf::from("/data/buckets"));
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.shutdown_grace_secs, 3);
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = from_vars(&[("SHOOTS_PORT", " "), ("SHOOTS_SECRET", "")]).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.secret.is_none());
    }

    #[test]
    fn test_invalid_port() {
        let err = from_vars(&[("SHOOTS_PORT", "http")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("SHOOTS_PORT"));
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let err = from_vars(&[("SHOOTS_CERT_FILE", "cert.pem")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = from_vars(&[
            ("SHOOTS_CERT_FILE", "cert.pem"),
            ("SHOOTS_KEY_FILE", "key.pem"),
        ])
        .unwrap();
        assert_eq!(config.location(), "grpc+tls://127.0.0.1:8081");
        assert!(config.tls_identity().is_err());
    }
}
