//! Secret loading for the processes that hold real credentials.

mod store;
mod types;

pub use store::{EnvSecretsStore, FileSecretsStore, SecretsStore, store_from_config};
pub use types::{DecryptedSecret, SecretError};
