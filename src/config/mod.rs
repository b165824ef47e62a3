//! Configuration for sandbridge.
//!
//! Every component is configured from environment variables. A `.env` file in
//! the working directory is loaded first via dotenvy, which never overwrites
//! variables that are already set.
//!
//! Each process loads only the configuration it needs: the bridge never sees
//! secrets configuration, and only the proxy and synchronizer resolve secrets.

mod bridge;
pub(crate) mod helpers;
mod proxy;
mod secrets;
mod sync;

use crate::error::ConfigError;

pub use self::bridge::BridgeConfig;
pub use self::proxy::ProxyConfig;
pub use self::secrets::SecretsConfig;
pub use self::sync::SyncConfig;

fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("Ignoring unreadable .env file: {}", e),
    }
}

impl BridgeConfig {
    /// Load bridge configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::resolve()
    }
}

impl ProxyConfig {
    /// Load proxy and secrets configuration from the environment.
    pub fn from_env() -> Result<(Self, SecretsConfig), ConfigError> {
        load_dotenv();
        Ok((Self::resolve()?, SecretsConfig::resolve()?))
    }
}

impl SyncConfig {
    /// Load synchronizer and secrets configuration from the environment.
    pub fn from_env() -> Result<(Self, SecretsConfig), ConfigError> {
        load_dotenv();
        Ok((Self::resolve()?, SecretsConfig::resolve()?))
    }
}
