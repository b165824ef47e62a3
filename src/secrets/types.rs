//! Secret value types.
//!
//! The sandbox NEVER sees these values. They exist only inside the proxy and
//! synchronizer processes, and only long enough to build an outbound header.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// A plaintext secret held in memory that is zeroed on drop.
///
/// This type:
/// - Zeros memory on drop
/// - Never appears in Debug output
/// - Is exposed only when building an outbound credential header
pub struct DecryptedSecret {
    value: SecretString,
}

impl DecryptedSecret {
    /// Create a new secret from raw bytes.
    ///
    /// Surrounding whitespace is trimmed; secret files and env vars commonly
    /// carry a trailing newline that would corrupt a header value.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SecretError> {
        let s = String::from_utf8(bytes).map_err(|_| SecretError::InvalidUtf8)?;
        Ok(Self::from_string(s))
    }

    pub fn from_string(s: String) -> Self {
        let trimmed = s.trim();
        let value = if trimmed.len() == s.len() {
            s
        } else {
            trimmed.to_string()
        };
        Self {
            value: SecretString::from(value),
        }
    }

    /// Expose the secret value.
    ///
    /// This is the ONLY way to access the plaintext. Use sparingly
    /// and ensure the exposed value isn't logged or persisted.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Get the length of the secret without exposing it.
    pub fn len(&self) -> usize {
        self.value.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DecryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecryptedSecret([REDACTED, {} bytes])", self.len())
    }
}

impl Clone for DecryptedSecret {
    fn clone(&self) -> Self {
        Self {
            value: SecretString::from(self.value.expose_secret().to_string()),
        }
    }
}

/// Errors that can occur while loading a secret.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Secret '{0}' is empty")]
    Empty(String),

    #[error("Secret value is not valid UTF-8")]
    InvalidUtf8,

    #[error("Failed to read secret '{name}': {reason}")]
    Unreadable { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypted_secret_redaction() {
        let secret = DecryptedSecret::from_bytes(b"super_secret_value".to_vec()).unwrap();
        let debug_str = format!("{:?}", secret);
        assert!(!debug_str.contains("super_secret_value"));
        assert!(debug_str.contains("REDACTED"));
    }

    #[test]
    fn test_decrypted_secret_expose() {
        let secret = DecryptedSecret::from_bytes(b"test_value".to_vec()).unwrap();
        assert_eq!(secret.expose(), "test_value");
        assert_eq!(secret.len(), 10);
    }

    #[test]
    fn test_trailing_newline_is_trimmed() {
        let secret = DecryptedSecret::from_bytes(b"sk-ant-real\n".to_vec()).unwrap();
        assert_eq!(secret.expose(), "sk-ant-real");
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let err = DecryptedSecret::from_bytes(vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, SecretError::InvalidUtf8));
    }
}
