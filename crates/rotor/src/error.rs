//! Error types for the rotation controller.

use thiserror::Error;

/// Errors that can occur during a rotation invocation.
///
/// All variants are fatal to the current invocation. Nothing is retried
/// internally; the orchestrator retries by re-invoking the same phase,
/// which every phase tolerates.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid secret identifier format.
    #[error("invalid secret id: {reason}")]
    InvalidSecretId {
        /// The reason the identifier is invalid.
        reason: String,
    },

    /// Rotation is not enabled for the secret.
    #[error("rotation is not enabled for secret: {secret_id}")]
    RotationDisabled {
        /// The identifier of the secret.
        secret_id: String,
    },

    /// The request token does not name any version of the secret.
    #[error("secret {secret_id} has no version for token: {version_id}")]
    UnknownVersion {
        /// The identifier of the secret.
        secret_id: String,
        /// The token that matched no version.
        version_id: String,
    },

    /// The requested version carries neither the current nor the pending
    /// stage, which signals a desync between the orchestrator and the store.
    #[error("version {version_id} of secret {secret_id} is not staged for rotation")]
    InvalidStage {
        /// The identifier of the secret.
        secret_id: String,
        /// The version in the unexpected state.
        version_id: String,
    },

    /// The phase name is not one of create, set, test, or finish.
    #[error("unknown rotation phase: {phase}")]
    UnknownPhase {
        /// The unrecognized phase name.
        phase: String,
    },

    /// None of the pending, current, or previous credentials authenticate
    /// against the target. Requires operator intervention.
    #[error("no stored credential authenticates against the target for secret: {secret_id}")]
    NoValidCredential {
        /// The identifier of the secret.
        secret_id: String,
    },

    /// The pending credential failed its liveness check.
    #[error("pending credential validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong while validating.
        reason: String,
    },

    /// A fetched payload is missing required fields or carries the wrong
    /// engine tag.
    #[error("invalid secret payload: {reason}")]
    SecretPayloadInvalid {
        /// The reason the payload is invalid.
        reason: String,
    },

    /// Secret not found in the store.
    #[error("secret not found: {secret_id}")]
    SecretNotFound {
        /// The identifier of the secret that was not found.
        secret_id: String,
    },

    /// No version of the secret matches the requested stage (and token, if
    /// one was given).
    #[error("secret {secret_id} has no value staged {stage}")]
    StageNotFound {
        /// The identifier of the secret.
        secret_id: String,
        /// The stage that matched no version.
        stage: String,
    },

    /// A conditional create hit a version that already holds a value.
    #[error("secret {secret_id} already has a value at version: {version_id}")]
    VersionExists {
        /// The identifier of the secret.
        secret_id: String,
        /// The version that already exists.
        version_id: String,
    },

    /// The secret store failed to serve a request.
    #[error("secret store error: {reason}")]
    Store {
        /// The reason the store operation failed.
        reason: String,
    },

    /// The credential target failed to serve a request.
    #[error("credential target error: {reason}")]
    Target {
        /// The reason the target operation failed.
        reason: String,
    },
}

/// Result type alias for rotation operations.
pub type Result<T> = std::result::Result<T, Error>;
