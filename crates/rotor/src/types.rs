//! Core types for the rotation protocol.
//!
//! This module defines the vocabulary shared by the controller and its
//! collaborators:
//! - [`SecretId`]: a validated identifier for a secret, stable across versions
//! - [`VersionId`]: a version identifier, doubling as the rotation request token
//! - [`Stage`]: the stage labels a version can carry
//! - [`Phase`]: the four rotation phases
//! - [`RotationRequest`]: one invocation's `(secret, token, phase)` triple
//! - [`SecretDescription`]: the store's view of a secret's versions and stages

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated identifier for a secret.
///
/// Secret IDs must:
/// - Be between 1 and 512 characters
/// - Contain no whitespace or control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretId(String);

impl SecretId {
    /// Maximum length of a secret identifier.
    pub const MAX_LENGTH: usize = 512;

    /// Creates a new `SecretId` after validating the input.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates a secret identifier string.
    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidSecretId {
                reason: "identifier cannot be empty".to_string(),
            });
        }

        if id.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidSecretId {
                reason: format!(
                    "identifier exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        for c in id.chars() {
            if c.is_whitespace() || c.is_control() {
                return Err(Error::InvalidSecretId {
                    reason: "identifier cannot contain whitespace or control characters"
                        .to_string(),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SecretId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SecretId> for String {
    fn from(id: SecretId) -> Self {
        id.0
    }
}

impl AsRef<str> for SecretId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A version identifier.
///
/// During rotation the same value serves as the request token: the
/// orchestrator mints one token per rotation and every phase invocation
/// carries it, so the token identifies the version being rotated rather
/// than a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    /// Creates a new version identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a random version identifier (a UUID v4), the conventional
    /// shape of an orchestrator-issued request token.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VersionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stage labels a secret version can carry.
///
/// Outside an in-flight rotation exactly one version holds [`Stage::Current`],
/// at most one holds [`Stage::Pending`], and at most one holds
/// [`Stage::Previous`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// The version serving live traffic.
    Current,
    /// The version being rotated in.
    Pending,
    /// The version most recently rotated out.
    Previous,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Pending => write!(f, "pending"),
            Self::Previous => write!(f, "previous"),
        }
    }
}

/// The four phases of the rotation protocol, invoked in order by the
/// orchestrator as separate invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Ensure a pending version with a fresh credential exists.
    Create,
    /// Push the pending credential to the target.
    Set,
    /// Verify the pending credential works.
    Test,
    /// Promote the pending version to current.
    Finish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Set => write!(f, "set"),
            Self::Test => write!(f, "test"),
            Self::Finish => write!(f, "finish"),
        }
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "set" => Ok(Self::Set),
            "test" => Ok(Self::Test),
            "finish" => Ok(Self::Finish),
            other => Err(Error::UnknownPhase {
                phase: other.to_string(),
            }),
        }
    }
}

/// One rotation invocation's request: which secret, which version token,
/// which phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRequest {
    /// The secret being rotated.
    pub secret_id: SecretId,
    /// The token naming the version undergoing rotation.
    pub token: VersionId,
    /// The phase to execute.
    pub phase: Phase,
}

impl RotationRequest {
    /// Creates a request from typed parts.
    #[must_use]
    pub fn new(secret_id: SecretId, token: VersionId, phase: Phase) -> Self {
        Self {
            secret_id,
            token,
            phase,
        }
    }

    /// Parses a request from the raw strings an invocation event carries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSecretId`] or [`Error::UnknownPhase`] when a
    /// field does not parse.
    pub fn parse(secret_id: &str, token: &str, phase: &str) -> Result<Self> {
        Ok(Self {
            secret_id: SecretId::new(secret_id)?,
            token: VersionId::new(token),
            phase: phase.parse()?,
        })
    }
}

/// The store's metadata view of a secret: whether rotation is enabled and
/// which stage labels each version carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescription {
    /// Whether rotation is enabled for this secret.
    pub rotation_enabled: bool,
    /// Stage labels per version.
    pub versions: BTreeMap<VersionId, BTreeSet<Stage>>,
}

impl SecretDescription {
    /// Returns the stage labels attached to a version, or `None` if the
    /// version does not exist.
    #[must_use]
    pub fn stages_of(&self, version: &VersionId) -> Option<&BTreeSet<Stage>> {
        self.versions.get(version)
    }

    /// Returns the version currently carrying the given stage label, if any.
    #[must_use]
    pub fn version_with(&self, stage: Stage) -> Option<&VersionId> {
        self.versions
            .iter()
            .find_map(|(version, stages)| stages.contains(&stage).then_some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ===================
    // SecretId Tests
    // ===================

    #[test]
    fn secret_id_valid_simple() {
        let id = SecretId::new("db-credentials").expect("should be valid");
        assert_eq!(id.as_str(), "db-credentials");
    }

    #[test]
    fn secret_id_valid_path_style() {
        let id = SecretId::new("prod/db/credentials").expect("should be valid");
        assert_eq!(id.as_str(), "prod/db/credentials");
    }

    #[test_case("" ; "empty string")]
    #[test_case("my secret" ; "contains space")]
    #[test_case("secret\n" ; "contains newline")]
    #[test_case("secret\t1" ; "contains tab")]
    fn secret_id_invalid(input: &str) {
        let result = SecretId::new(input);
        assert!(result.is_err(), "expected '{input}' to be invalid");
    }

    #[test]
    fn secret_id_max_length() {
        let long_id = "a".repeat(SecretId::MAX_LENGTH);
        let id = SecretId::new(&long_id).expect("max length should be valid");
        assert_eq!(id.as_str().len(), SecretId::MAX_LENGTH);

        let too_long = "a".repeat(SecretId::MAX_LENGTH + 1);
        assert!(SecretId::new(&too_long).is_err());
    }

    #[test]
    fn secret_id_serde_roundtrip() {
        let original = SecretId::new("db-credentials").expect("should be valid");
        let json = serde_json::to_string(&original).expect("serialize");
        let restored: SecretId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(original, restored);
    }

    #[test]
    fn secret_id_serde_rejects_invalid() {
        let json = "\"has a space\"";
        let result: std::result::Result<SecretId, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    // ===================
    // VersionId Tests
    // ===================

    #[test]
    fn version_id_random_is_unique() {
        let a = VersionId::random();
        let b = VersionId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn version_id_display() {
        let id = VersionId::new("token-1");
        assert_eq!(format!("{id}"), "token-1");
    }

    // ===================
    // Phase Tests
    // ===================

    #[test_case("create", Phase::Create)]
    #[test_case("set", Phase::Set)]
    #[test_case("test", Phase::Test)]
    #[test_case("finish", Phase::Finish)]
    fn phase_parses(input: &str, expected: Phase) {
        let phase: Phase = input.parse().expect("should parse");
        assert_eq!(phase, expected);
        assert_eq!(phase.to_string(), input);
    }

    #[test_case("" ; "empty string")]
    #[test_case("Create" ; "wrong case")]
    #[test_case("rollback" ; "unknown name")]
    fn phase_rejects_unknown(input: &str) {
        let result: Result<Phase> = input.parse();
        assert!(matches!(
            result.unwrap_err(),
            Error::UnknownPhase { .. }
        ));
    }

    // ===================
    // RotationRequest Tests
    // ===================

    #[test]
    fn rotation_request_parse() {
        let request =
            RotationRequest::parse("db-credentials", "token-1", "create").expect("should parse");
        assert_eq!(request.secret_id.as_str(), "db-credentials");
        assert_eq!(request.token.as_str(), "token-1");
        assert_eq!(request.phase, Phase::Create);
    }

    #[test]
    fn rotation_request_parse_rejects_bad_phase() {
        let result = RotationRequest::parse("db-credentials", "token-1", "promote");
        assert!(matches!(result.unwrap_err(), Error::UnknownPhase { .. }));
    }

    // ===================
    // SecretDescription Tests
    // ===================

    #[test]
    fn secret_description_stage_lookups() {
        let mut description = SecretDescription {
            rotation_enabled: true,
            ..Default::default()
        };
        description.versions.insert(
            VersionId::new("v1"),
            BTreeSet::from([Stage::Current]),
        );
        description.versions.insert(
            VersionId::new("v2"),
            BTreeSet::from([Stage::Pending]),
        );

        assert_eq!(
            description.version_with(Stage::Current),
            Some(&VersionId::new("v1"))
        );
        assert_eq!(
            description.version_with(Stage::Pending),
            Some(&VersionId::new("v2"))
        );
        assert_eq!(description.version_with(Stage::Previous), None);

        let stages = description
            .stages_of(&VersionId::new("v2"))
            .expect("v2 exists");
        assert!(stages.contains(&Stage::Pending));
        assert!(description.stages_of(&VersionId::new("v3")).is_none());
    }
}
