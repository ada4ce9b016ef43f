//! The secret store interface and an in-memory reference implementation.
//!
//! The controller only ever talks to the store through [`SecretStore`], so
//! any versioned, stage-labeled store can sit behind it. [`MemoryStore`]
//! implements the full contract in memory and doubles as the test double
//! for the controller.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::payload::SecretString;
use crate::types::{SecretDescription, SecretId, Stage, VersionId};

/// A versioned secret store with staged labels per version.
///
/// Implementations must serialize concurrent stage mutations for the same
/// secret: [`SecretStore::put_value`] is a conditional create and
/// [`SecretStore::move_stage`] is a single atomic stage transition.
pub trait SecretStore: Send + Sync {
    /// Returns the rotation flag and the version/stage map for a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretNotFound`] if the secret does not exist.
    fn describe(&self, secret_id: &SecretId) -> Result<SecretDescription>;

    /// Fetches the value of the version carrying `stage`, optionally
    /// constrained to a specific version id.
    ///
    /// A version that carries the stage label but holds no value yet (a
    /// freshly staged pending version) does not match.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StageNotFound`] if no version matches.
    fn get_value(
        &self,
        secret_id: &SecretId,
        stage: Stage,
        version: Option<&VersionId>,
    ) -> Result<SecretString>;

    /// Writes a value for a version, attaching the given stage labels.
    ///
    /// This is a conditional create: the version id is the idempotency
    /// token, and a version that already holds a value is never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionExists`] if the version already holds a
    /// value.
    fn put_value(
        &self,
        secret_id: &SecretId,
        version: &VersionId,
        value: &SecretString,
        stages: &[Stage],
    ) -> Result<()>;

    /// Atomically moves a stage label onto `to`, removing it from `from`.
    ///
    /// When moving [`Stage::Current`] off a `from` version, the store
    /// demotes that version to [`Stage::Previous`] (retiring any older
    /// previous) and drops [`Stage::Pending`] from the promoted version in
    /// the same step, so there is no intermediate state with two current
    /// versions or none.
    ///
    /// # Errors
    ///
    /// Returns an error if either version is missing or `from` does not
    /// carry the stage.
    fn move_stage(
        &self,
        secret_id: &SecretId,
        stage: Stage,
        to: &VersionId,
        from: Option<&VersionId>,
    ) -> Result<()>;
}

/// One version of a stored secret.
///
/// A version can exist without a value: staging a rotation attaches the
/// pending label to a fresh version id before the create phase writes the
/// credential.
#[derive(Debug, Clone)]
struct StoredVersion {
    /// The version's payload, once written. Immutable thereafter.
    value: Option<SecretString>,
    /// The stage labels attached to this version.
    stages: BTreeSet<Stage>,
}

/// A stored secret with its versions.
#[derive(Debug, Clone, Default)]
struct StoredSecret {
    /// Whether rotation is enabled for this secret.
    rotation_enabled: bool,
    /// All versions, including staged-but-unwritten ones.
    versions: HashMap<VersionId, StoredVersion>,
}

/// An in-memory [`SecretStore`].
///
/// Implements the full store contract, including conditional creates and
/// atomic promote/demote stage moves, so the controller can run end to end
/// without a real secret service.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// In-memory storage for secrets.
    secrets: RwLock<HashMap<SecretId, StoredSecret>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a secret with an initial value staged current and rotation
    /// enabled, returning the initial version id.
    pub fn create_secret(&self, secret_id: &SecretId, value: &SecretString) -> VersionId {
        let version = VersionId::random();
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.entry(secret_id.clone()).or_default();
        secret.rotation_enabled = true;
        secret.versions.insert(
            version.clone(),
            StoredVersion {
                value: Some(value.clone()),
                stages: BTreeSet::from([Stage::Current]),
            },
        );
        version
    }

    /// Enables or disables rotation for a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretNotFound`] if the secret does not exist.
    pub fn set_rotation_enabled(&self, secret_id: &SecretId, enabled: bool) -> Result<()> {
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.get_mut(secret_id).ok_or_else(|| Error::SecretNotFound {
            secret_id: secret_id.to_string(),
        })?;
        secret.rotation_enabled = enabled;
        Ok(())
    }

    /// Stages a new rotation: mints a version id and attaches the pending
    /// label to it, without writing a value.
    ///
    /// This is the store-service side of starting a rotation; the returned
    /// id is the request token the orchestrator passes to every phase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretNotFound`] if the secret does not exist.
    pub fn begin_rotation(&self, secret_id: &SecretId) -> Result<VersionId> {
        let version = VersionId::random();
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.get_mut(secret_id).ok_or_else(|| Error::SecretNotFound {
            secret_id: secret_id.to_string(),
        })?;
        secret.versions.insert(
            version.clone(),
            StoredVersion {
                value: None,
                stages: BTreeSet::from([Stage::Pending]),
            },
        );
        Ok(version)
    }
}

impl SecretStore for MemoryStore {
    fn describe(&self, secret_id: &SecretId) -> Result<SecretDescription> {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.get(secret_id).ok_or_else(|| Error::SecretNotFound {
            secret_id: secret_id.to_string(),
        })?;

        Ok(SecretDescription {
            rotation_enabled: secret.rotation_enabled,
            versions: secret
                .versions
                .iter()
                .map(|(version, stored)| (version.clone(), stored.stages.clone()))
                .collect(),
        })
    }

    fn get_value(
        &self,
        secret_id: &SecretId,
        stage: Stage,
        version: Option<&VersionId>,
    ) -> Result<SecretString> {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.get(secret_id).ok_or_else(|| Error::SecretNotFound {
            secret_id: secret_id.to_string(),
        })?;

        secret
            .versions
            .iter()
            .find_map(|(id, stored)| {
                let matches = stored.stages.contains(&stage)
                    && version.is_none_or(|wanted| wanted == id);
                matches.then_some(stored.value.as_ref()).flatten()
            })
            .cloned()
            .ok_or_else(|| Error::StageNotFound {
                secret_id: secret_id.to_string(),
                stage: stage.to_string(),
            })
    }

    fn put_value(
        &self,
        secret_id: &SecretId,
        version: &VersionId,
        value: &SecretString,
        stages: &[Stage],
    ) -> Result<()> {
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.get_mut(secret_id).ok_or_else(|| Error::SecretNotFound {
            secret_id: secret_id.to_string(),
        })?;

        let stored = secret.versions.entry(version.clone()).or_insert_with(|| {
            StoredVersion {
                value: None,
                stages: BTreeSet::new(),
            }
        });

        if stored.value.is_some() {
            return Err(Error::VersionExists {
                secret_id: secret_id.to_string(),
                version_id: version.to_string(),
            });
        }

        stored.value = Some(value.clone());
        stored.stages.extend(stages.iter().copied());
        Ok(())
    }

    fn move_stage(
        &self,
        secret_id: &SecretId,
        stage: Stage,
        to: &VersionId,
        from: Option<&VersionId>,
    ) -> Result<()> {
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let secret = secrets.get_mut(secret_id).ok_or_else(|| Error::SecretNotFound {
            secret_id: secret_id.to_string(),
        })?;

        if !secret.versions.contains_key(to) {
            return Err(Error::UnknownVersion {
                secret_id: secret_id.to_string(),
                version_id: to.to_string(),
            });
        }

        if let Some(from) = from {
            let holds_stage = secret
                .versions
                .get(from)
                .is_some_and(|stored| stored.stages.contains(&stage));
            if !holds_stage {
                return Err(Error::Store {
                    reason: format!(
                        "stage {stage} is not attached to version {from} of secret {secret_id}"
                    ),
                });
            }
        }

        // The whole transition happens under one write lock: no reader ever
        // observes two current versions or none.
        if stage == Stage::Current {
            for stored in secret.versions.values_mut() {
                stored.stages.remove(&Stage::Previous);
            }
        }

        if let Some(from) = from {
            if let Some(stored) = secret.versions.get_mut(from) {
                stored.stages.remove(&stage);
                if stage == Stage::Current {
                    stored.stages.insert(Stage::Previous);
                }
            }
        }

        if let Some(stored) = secret.versions.get_mut(to) {
            stored.stages.insert(stage);
            if stage == Stage::Current {
                stored.stages.remove(&Stage::Pending);
            }
        }

        Ok(())
    }
}
