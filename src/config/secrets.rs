use std::path::PathBuf;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Where long-lived secrets are read from.
#[derive(Debug, Clone, Default)]
pub struct SecretsConfig {
    /// Directory with one file per secret (e.g. a mounted secret volume).
    /// `None` reads secrets from the process environment.
    pub dir: Option<PathBuf>,
}

impl SecretsConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            dir: optional_env("SECRETS_DIR")?.map(PathBuf::from),
        })
    }
}
