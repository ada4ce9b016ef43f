//! Credential payloads and the secret string they travel in.
//!
//! The secret store deals in opaque JSON strings; this module wraps them in
//! [`SecretString`] (zeroized on drop, redacted in debug output) and parses
//! them into the structured [`CredentialPayload`] the controller works with.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// A secret string that securely zeroizes memory on drop.
///
/// This type carries raw secret material (payload JSON, passwords) between
/// the store and the controller. Debug output is redacted and equality is
/// compared in constant time.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a string as secret material.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret as a string slice.
    ///
    /// Callers are responsible for not logging or persisting the exposed
    /// value outside the secret store.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the length of the secret in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the actual value in debug output
        f.debug_tuple("SecretString").field(&"[REDACTED]").finish()
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison to prevent timing attacks
        use subtle::ConstantTimeEq;
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A database credential as stored in one secret version.
///
/// `engine`, `host`, `username`, and `password` are required; `port` and
/// `dbname` are optional and pass through rotation untouched. The payload of
/// a written version is immutable; rotation only ever writes new versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialPayload {
    /// The database engine this credential is for (e.g. `postgres`).
    pub engine: String,
    /// The database host.
    pub host: String,
    /// The username the credential authenticates.
    pub username: String,
    /// The password. Redacted in debug output, zeroized on drop.
    pub password: SecretString,
    /// The port, if the payload carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// The database name, if the payload carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbname: Option<String>,
}

impl CredentialPayload {
    /// Parses a payload from the JSON a secret version holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretPayloadInvalid`] if the JSON does not parse, a
    /// required field is missing, or a required field is empty.
    pub fn from_secret(secret: &SecretString) -> Result<Self> {
        let payload: Self =
            serde_json::from_str(secret.expose()).map_err(|err| Error::SecretPayloadInvalid {
                reason: format!("payload is not a valid credential document: {err}"),
            })?;
        payload.validate()?;
        Ok(payload)
    }

    /// Serializes the payload back into store-ready JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretPayloadInvalid`] if serialization fails.
    pub fn to_secret(&self) -> Result<SecretString> {
        let json = serde_json::to_string(self).map_err(|err| Error::SecretPayloadInvalid {
            reason: format!("payload failed to serialize: {err}"),
        })?;
        Ok(SecretString::new(json))
    }

    /// Returns a copy of this payload with the password replaced.
    ///
    /// Used by the create phase: the current payload is the template, only
    /// the password changes.
    #[must_use]
    pub fn with_password(&self, password: SecretString) -> Self {
        let mut payload = self.clone();
        payload.password = password;
        payload
    }

    /// Checks that the payload is for the expected engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretPayloadInvalid`] on a mismatched engine tag.
    pub fn ensure_engine(&self, expected: &str) -> Result<()> {
        if self.engine == expected {
            Ok(())
        } else {
            Err(Error::SecretPayloadInvalid {
                reason: format!(
                    "payload engine '{}' does not match target engine '{expected}'",
                    self.engine
                ),
            })
        }
    }

    /// Checks that all required fields are present and non-empty.
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("engine", self.engine.as_str()),
            ("host", self.host.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.expose()),
        ] {
            if value.is_empty() {
                return Err(Error::SecretPayloadInvalid {
                    reason: format!("required field '{field}' is empty or missing"),
                });
            }
        }
        Ok(())
    }
}
