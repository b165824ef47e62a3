use std::net::SocketAddr;
use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Credential-isolating proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Upstream origin, e.g. `https://api.anthropic.com`.
    pub upstream_url: String,
    /// Header that carries the credential on both sides of the proxy.
    pub credential_header: String,
    /// Name of the real secret in the secrets store.
    pub secret_name: String,
    /// Per-call ceiling for the upstream exchange, body included.
    pub timeout_secs: u64,
    /// Maximum number of requests relayed at once.
    pub max_concurrency: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            upstream_url: "https://api.anthropic.com".to_string(),
            credential_header: "x-api-key".to_string(),
            secret_name: "ANTHROPIC_API_KEY".to_string(),
            timeout_secs: 300,
            max_concurrency: 10,
        }
    }
}

impl ProxyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: parse_string_env("PROXY_HOST", defaults.host)?,
            port: parse_optional_env("PROXY_PORT", defaults.port)?,
            upstream_url: parse_string_env("PROXY_UPSTREAM_URL", defaults.upstream_url)?,
            credential_header: parse_string_env(
                "PROXY_CREDENTIAL_HEADER",
                defaults.credential_header,
            )?,
            secret_name: parse_string_env("PROXY_SECRET_NAME", defaults.secret_name)?,
            timeout_secs: parse_optional_env("PROXY_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_concurrency: parse_optional_env(
                "PROXY_MAX_CONCURRENCY",
                defaults.max_concurrency,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.upstream_url.starts_with("http://") || self.upstream_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                key: "PROXY_UPSTREAM_URL".to_string(),
                message: format!("'{}' is not an http(s) origin", self.upstream_url),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROXY_MAX_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "PROXY_HOST".to_string(),
                message: format!("'{}' is not a valid listen address: {e}", self.host),
            })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listen_addr_is_all_interfaces() {
        let addr = ProxyConfig::default().listen_addr().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn rejects_non_http_upstream() {
        let config = ProxyConfig {
            upstream_url: "api.anthropic.com".to_string(),
            ..ProxyConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "PROXY_UPSTREAM_URL"
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = ProxyConfig {
            max_concurrency: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
