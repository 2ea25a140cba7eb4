//! Cart engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CART_API_URL` - Base URL of the remote cart service
//!
//! ## Optional
//! - `CATALOG_API_URL` - Base URL of the catalog service (default: `CART_API_URL`)
//! - `CART_API_TOKEN` - Bearer token for both services
//! - `CART_REQUEST_TIMEOUT_MS` - Per-call timeout in milliseconds (default: 10000)
//! - `CART_LOCAL_STORE_DIR` - Directory for guest cart snapshots (default: .cart)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LOCAL_STORE_DIR: &str = ".cart";

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Cart engine configuration.
///
/// Implements `Debug` manually to redact the API token.
#[derive(Clone)]
pub struct CartConfig {
    /// Remote cart service base URL
    pub cart_api_url: Url,
    /// Catalog service base URL
    pub catalog_api_url: Url,
    /// Bearer token sent to the cart and catalog services
    pub api_token: Option<SecretString>,
    /// Upper bound for any single remote call
    pub request_timeout: Duration,
    /// Where guest snapshots are written, one file per session
    pub local_store_dir: PathBuf,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g. "production")
    pub sentry_environment: Option<String>,
}

impl std::fmt::Debug for CartConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartConfig")
            .field("cart_api_url", &self.cart_api_url.as_str())
            .field("catalog_api_url", &self.catalog_api_url.as_str())
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout", &self.request_timeout)
            .field("local_store_dir", &self.local_store_dir)
            .field("sentry_dsn", &self.sentry_dsn)
            .field("sentry_environment", &self.sentry_environment)
            .finish()
    }
}

impl CartConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let cart_api_url = parse_url("CART_API_URL", &get_required(&lookup, "CART_API_URL")?)?;
        let catalog_api_url = match lookup("CATALOG_API_URL") {
            Some(raw) => parse_url("CATALOG_API_URL", &raw)?,
            None => cart_api_url.clone(),
        };

        let timeout_ms = get_or_default(
            &lookup,
            "CART_REQUEST_TIMEOUT_MS",
            &DEFAULT_REQUEST_TIMEOUT_MS.to_string(),
        )
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidEnvVar("CART_REQUEST_TIMEOUT_MS".to_string(), e.to_string()))?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "CART_REQUEST_TIMEOUT_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            cart_api_url,
            catalog_api_url,
            api_token: lookup("CART_API_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            request_timeout: Duration::from_millis(timeout_ms),
            local_store_dir: PathBuf::from(get_or_default(
                &lookup,
                "CART_LOCAL_STORE_DIR",
                DEFAULT_LOCAL_STORE_DIR,
            )),
            sentry_dsn: lookup("SENTRY_DSN"),
            sentry_environment: lookup("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required variable.
fn get_required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get a variable with a default value.
fn get_or_default(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

/// Parse a base URL, normalizing it to end with a slash so relative joins
/// (`cart/sync`) append instead of replacing the last path segment.
fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    let mut url =
        Url::parse(raw).map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            "must be an absolute http(s) URL".to_string(),
        ));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_cart_url() {
        let err = CartConfig::from_source(source(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "CART_API_URL"));
    }

    #[test]
    fn test_defaults() {
        let config =
            CartConfig::from_source(source(&[("CART_API_URL", "https://api.example.test/v1")]))
                .unwrap();
        assert_eq!(config.cart_api_url.as_str(), "https://api.example.test/v1/");
        assert_eq!(config.catalog_api_url, config.cart_api_url);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.local_store_dir, PathBuf::from(".cart"));
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = CartConfig::from_source(source(&[
            ("CART_API_URL", "https://cart.example.test/"),
            ("CATALOG_API_URL", "https://catalog.example.test/api"),
            ("CART_API_TOKEN", "tok_live_8f2k"),
            ("CART_REQUEST_TIMEOUT_MS", "2500"),
            ("CART_LOCAL_STORE_DIR", "/tmp/carts"),
        ]))
        .unwrap();
        assert_eq!(
            config.catalog_api_url.as_str(),
            "https://catalog.example.test/api/"
        );
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(
            config.api_token.as_ref().unwrap().expose_secret(),
            "tok_live_8f2k"
        );
        assert_eq!(config.local_store_dir, PathBuf::from("/tmp/carts"));
    }

    #[test]
    fn test_invalid_timeout() {
        let err = CartConfig::from_source(source(&[
            ("CART_API_URL", "https://cart.example.test/"),
            ("CART_REQUEST_TIMEOUT_MS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(key, _) if key == "CART_REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn test_invalid_url() {
        let err =
            CartConfig::from_source(source(&[("CART_API_URL", "not a url")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(_, _)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = CartConfig::from_source(source(&[
            ("CART_API_URL", "https://cart.example.test/"),
            ("CART_API_TOKEN", "super_secret_token"),
        ]))
        .unwrap();
        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("cart.example.test"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_token"));
    }
}
