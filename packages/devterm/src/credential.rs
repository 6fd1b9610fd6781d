//! Per-terminal basic-auth credentials.

use data_encoding::{BASE64, BASE64URL_NOPAD};
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::fmt;

pub const CREDENTIAL_USER: &str = "term";

/// Bytes of OS entropy behind every secret.
pub const SECRET_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("random source unavailable: {0}")]
    RandomSource(String),
}

/// A `user:secret` pair handed to one backend. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `user:secret`, the form the backend expects.
    pub fn as_pair(&self) -> String {
        format!("{}:{}", self.username, self.secret)
    }

    /// Value for an `Authorization` header on proxied requests.
    pub fn basic_auth_header(&self) -> String {
        format!("Basic {}", BASE64.encode(self.as_pair().as_bytes()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Where credentials come from. Generation fails closed.
pub trait CredentialSource: Send + Sync {
    fn generate(&self) -> Result<Credential, CredentialError>;
}

/// Reads secrets from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCredentials;

impl CredentialSource for OsCredentials {
    fn generate(&self) -> Result<Credential, CredentialError> {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CredentialError::RandomSource(e.to_string()))?;
        Ok(Credential::new(CREDENTIAL_USER, BASE64URL_NOPAD.encode(&bytes)))
    }
}

pub fn generate_credential() -> Result<Credential, CredentialError> {
    OsCredentials.generate()
}
