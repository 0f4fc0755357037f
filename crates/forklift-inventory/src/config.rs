//! Inventory client configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

use forklift_common::settings::Env;

use crate::error::InventoryError;

/// Inventory service location, TLS material and cache TTL
#[derive(Clone, Debug, PartialEq)]
pub struct InventoryConfig {
    /// Service host
    pub host: String,
    /// Service port
    pub port: u16,
    /// Use https
    pub tls_enabled: bool,
    /// Client certificate (PEM)
    pub tls_certificate: Option<PathBuf>,
    /// Client key (PEM)
    pub tls_key: Option<PathBuf>,
    /// Extra CA bundle (PEM)
    pub tls_ca: Option<PathBuf>,
    /// Response cache TTL; zero disables caching
    pub cache_ttl: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8443,
            tls_enabled: true,
            tls_certificate: None,
            tls_key: None,
            tls_ca: None,
            cache_ttl: Duration::from_secs(10),
        }
    }
}

fn flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl InventoryConfig {
    /// Read `API_HOST`, `API_PORT`, `API_TLS_ENABLED`, `API_TLS_CERTIFICATE`,
    /// `API_TLS_KEY`, `API_TLS_CA` and `INVENTORY_CACHE_TTL_SECONDS`
    pub fn from_env(env: &dyn Env) -> Result<Self, InventoryError> {
        let d = Self::default();
        let path = |key: &str| env.var(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let port = match env.var("API_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| InventoryError::Config(format!("API_PORT '{raw}' is not a port")))?,
            None => d.port,
        };
        let tls_enabled = match env.var("API_TLS_ENABLED") {
            Some(raw) => flag(&raw).ok_or_else(|| {
                InventoryError::Config(format!("API_TLS_ENABLED '{raw}' is not a boolean"))
            })?,
            None => d.tls_enabled,
        };
        let cache_ttl = match env.var("INVENTORY_CACHE_TTL_SECONDS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                InventoryError::Config(format!(
                    "INVENTORY_CACHE_TTL_SECONDS '{raw}' is not a number"
                ))
            })?),
            None => d.cache_ttl,
        };

        let config = Self {
            host: env.var("API_HOST").filter(|h| !h.is_empty()).unwrap_or(d.host),
            port,
            tls_enabled,
            tls_certificate: path("API_TLS_CERTIFICATE"),
            tls_key: path("API_TLS_KEY"),
            tls_ca: path("API_TLS_CA"),
            cache_ttl,
        };
        if config.tls_certificate.is_some() != config.tls_key.is_some() {
            return Err(InventoryError::Config(
                "API_TLS_CERTIFICATE and API_TLS_KEY must be set together".to_string(),
            ));
        }
        Ok(config)
    }

    /// `scheme://host:port`
    pub fn base_url(&self) -> String {
        let scheme = if self.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}
