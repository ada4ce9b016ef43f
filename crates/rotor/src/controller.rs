//! The rotation state machine.
//!
//! One [`RotationController`] invocation executes one phase of the
//! four-phase protocol. The controller holds no state of its own between
//! invocations; everything it needs to resume lives in the store's stage
//! labels, which is what makes every phase safe to replay.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::password::generate_password;
use crate::payload::CredentialPayload;
use crate::store::SecretStore;
use crate::target::{CredentialTarget, TargetConnection};
use crate::types::{Phase, RotationRequest, SecretId, Stage, VersionId};

/// The read-only statement used to confirm a credential is minimally
/// functional, not just able to log in.
const LIVENESS_PROBE: &str = "SELECT 1";

/// Drives one credential through the four-phase rotation protocol.
///
/// The store and target are injected at construction, so the controller is
/// testable against in-memory fakes and reusable across invocations. Each
/// call to [`RotationController::rotate`] is one short-lived, sequential
/// execution: no internal retries, no background work, no connection held
/// beyond a single check or mutation.
#[derive(Debug)]
pub struct RotationController<S, T> {
    /// The versioned secret store.
    store: S,
    /// The system the credential authenticates against.
    target: T,
}

impl<S: SecretStore, T: CredentialTarget> RotationController<S, T> {
    /// Creates a controller over the given store and target.
    #[must_use]
    pub fn new(store: S, target: T) -> Self {
        Self { store, target }
    }

    /// Returns a reference to the secret store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a reference to the credential target.
    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Executes one rotation phase.
    ///
    /// Validates the request against the store's version/stage state, then
    /// dispatches to the phase handler. A token that already carries the
    /// current stage short-circuits to success, which is what makes
    /// replaying the finish phase (or any phase after completion) safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RotationDisabled`], [`Error::UnknownVersion`], or
    /// [`Error::InvalidStage`] when the request does not match the store's
    /// state, and the executing phase's error otherwise. All errors are
    /// fatal to this invocation; the orchestrator retries by re-invoking.
    pub fn rotate(&self, request: &RotationRequest) -> Result<()> {
        let description = self.store.describe(&request.secret_id)?;

        if !description.rotation_enabled {
            return Err(Error::RotationDisabled {
                secret_id: request.secret_id.to_string(),
            });
        }

        let Some(stages) = description.stages_of(&request.token) else {
            return Err(Error::UnknownVersion {
                secret_id: request.secret_id.to_string(),
                version_id: request.token.to_string(),
            });
        };

        if stages.contains(&Stage::Current) {
            info!(
                secret_id = %request.secret_id,
                version = %request.token,
                "version is already current, nothing to do"
            );
            return Ok(());
        }

        if !stages.contains(&Stage::Pending) {
            return Err(Error::InvalidStage {
                secret_id: request.secret_id.to_string(),
                version_id: request.token.to_string(),
            });
        }

        debug!(
            secret_id = %request.secret_id,
            version = %request.token,
            phase = %request.phase,
            "executing rotation phase"
        );

        match request.phase {
            Phase::Create => self.create_pending(request),
            Phase::Set => self.apply_pending(request),
            Phase::Test => self.verify_pending(request),
            Phase::Finish => self.promote_pending(request),
        }
    }

    /// Create phase: ensure a pending version with a fresh credential
    /// exists for the request token.
    ///
    /// The current payload is the template; only the password changes. The
    /// token is the write's idempotency key, so at most one password is
    /// ever generated per token even under retries and races.
    fn create_pending(&self, request: &RotationRequest) -> Result<()> {
        let template = self.staged_payload(&request.secret_id, Stage::Current, None)?;

        match self.staged_payload(&request.secret_id, Stage::Pending, Some(&request.token)) {
            Ok(_) => {
                info!(
                    secret_id = %request.secret_id,
                    version = %request.token,
                    "pending credential already staged"
                );
                return Ok(());
            }
            Err(Error::StageNotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        let pending = template.with_password(generate_password());
        match self.store.put_value(
            &request.secret_id,
            &request.token,
            &pending.to_secret()?,
            &[Stage::Pending],
        ) {
            Ok(()) => {
                info!(
                    secret_id = %request.secret_id,
                    version = %request.token,
                    "staged pending version with new credential"
                );
                Ok(())
            }
            // A concurrent invocation for the same token won the write;
            // the store kept its value, so this invocation has converged.
            Err(Error::VersionExists { .. }) => {
                info!(
                    secret_id = %request.secret_id,
                    version = %request.token,
                    "pending version was staged concurrently"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Set phase: make the pending credential live on the target.
    ///
    /// Walks the candidate chain pending, current, previous: the pending
    /// credential authenticating means the phase already ran and nothing
    /// mutates; otherwise the first authenticating candidate is used to
    /// change the pending user's password to the pending value. Every
    /// session is released before the next candidate is tried.
    fn apply_pending(&self, request: &RotationRequest) -> Result<()> {
        let pending =
            self.staged_payload(&request.secret_id, Stage::Pending, Some(&request.token))?;

        if let Some(session) = self.try_connect(&pending, Stage::Pending) {
            drop(session);
            info!(
                secret_id = %request.secret_id,
                version = %request.token,
                "pending credential is already live, no mutation needed"
            );
            return Ok(());
        }

        for stage in [Stage::Current, Stage::Previous] {
            let candidate = match self.staged_payload(&request.secret_id, stage, None) {
                Ok(payload) => payload,
                // A missing previous stage is not an error class of its
                // own; the chain just moves on.
                Err(Error::StageNotFound { .. }) => {
                    debug!(
                        secret_id = %request.secret_id,
                        stage = %stage,
                        "no credential staged, skipping candidate"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(mut session) = self.try_connect(&candidate, stage) else {
                continue;
            };

            let changed = session.change_password(&pending.username, pending.password.expose());
            drop(session);
            changed?;

            info!(
                secret_id = %request.secret_id,
                version = %request.token,
                via = %stage,
                user = %pending.username,
                "target password set to pending credential"
            );
            return Ok(());
        }

        warn!(
            secret_id = %request.secret_id,
            "no stored credential authenticates; the target password has drifted"
        );
        Err(Error::NoValidCredential {
            secret_id: request.secret_id.to_string(),
        })
    }

    /// Test phase: confirm the pending credential authenticates and can
    /// run a trivial read-only statement.
    fn verify_pending(&self, request: &RotationRequest) -> Result<()> {
        let pending =
            self.staged_payload(&request.secret_id, Stage::Pending, Some(&request.token))?;

        let Some(mut session) = self.try_connect(&pending, Stage::Pending) else {
            return Err(Error::ValidationFailed {
                reason: "pending credential failed to authenticate".to_string(),
            });
        };

        let probed = session.execute(LIVENESS_PROBE);
        drop(session);
        probed.map_err(|err| Error::ValidationFailed {
            reason: format!("liveness check failed: {err}"),
        })?;

        info!(
            secret_id = %request.secret_id,
            version = %request.token,
            "pending credential validated against target"
        );
        Ok(())
    }

    /// Finish phase: atomically promote the pending version to current.
    ///
    /// The store guarantees the stage move is a single atomic transition;
    /// the vacated version is demoted in the same step.
    fn promote_pending(&self, request: &RotationRequest) -> Result<()> {
        let description = self.store.describe(&request.secret_id)?;
        let current = description.version_with(Stage::Current);

        if current == Some(&request.token) {
            info!(
                secret_id = %request.secret_id,
                version = %request.token,
                "version already promoted"
            );
            return Ok(());
        }

        self.store
            .move_stage(&request.secret_id, Stage::Current, &request.token, current)?;

        info!(
            secret_id = %request.secret_id,
            version = %request.token,
            demoted = %current.map(ToString::to_string).unwrap_or_default(),
            "pending version promoted to current"
        );
        Ok(())
    }

    /// Fetches a staged payload, parses it, and checks its engine tag
    /// against the target driver. Fails before any target interaction when
    /// the payload is unusable.
    fn staged_payload(
        &self,
        secret_id: &SecretId,
        stage: Stage,
        version: Option<&VersionId>,
    ) -> Result<CredentialPayload> {
        let secret = self.store.get_value(secret_id, stage, version)?;
        let payload = CredentialPayload::from_secret(&secret)?;
        payload.ensure_engine(self.target.engine())?;
        Ok(payload)
    }

    /// Tries to authenticate with a credential; a failed connect is data
    /// (`None`), not an error, so the fallback chain stays a plain loop.
    fn try_connect(
        &self,
        credential: &CredentialPayload,
        stage: Stage,
    ) -> Option<Box<dyn TargetConnection + '_>> {
        match self.target.connect(credential) {
            Ok(session) => Some(session),
            Err(err) => {
                debug!(stage = %stage, error = %err, "credential did not authenticate");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::SecretString;
    use crate::store::MemoryStore;
    use crate::target::MemoryTarget;
    use test_case::test_case;

    fn secret_id() -> SecretId {
        SecretId::new("db-credentials").expect("valid id")
    }

    fn payload_json(username: &str, password: &str) -> SecretString {
        SecretString::new(format!(
            r#"{{"engine":"postgres","host":"db.internal","username":"{username}","password":"{password}","dbname":"orders"}}"#
        ))
    }

    /// A store seeded with one current version and a staged (valueless)
    /// pending rotation, and a target whose live password matches current.
    fn rotation_in_progress() -> (RotationController<MemoryStore, MemoryTarget>, VersionId) {
        let store = MemoryStore::new();
        store.create_secret(&secret_id(), &payload_json("app", "p0"));
        let token = store.begin_rotation(&secret_id()).expect("begin rotation");
        let target = MemoryTarget::new("postgres").with_user("app", "p0");
        (RotationController::new(store, target), token)
    }

    fn request(token: &VersionId, phase: Phase) -> RotationRequest {
        RotationRequest::new(secret_id(), token.clone(), phase)
    }

    fn pending_password(controller: &RotationController<MemoryStore, MemoryTarget>) -> String {
        let secret = controller
            .store()
            .get_value(&secret_id(), Stage::Pending, None)
            .expect("pending value");
        let payload = CredentialPayload::from_secret(&secret).expect("parse");
        payload.password.expose().to_string()
    }

    // ===================
    // Entry contract
    // ===================

    #[test_case(Phase::Create)]
    #[test_case(Phase::Set)]
    #[test_case(Phase::Test)]
    #[test_case(Phase::Finish)]
    fn rotation_disabled_fails_every_phase_before_touching_target(phase: Phase) {
        let (controller, token) = rotation_in_progress();
        controller
            .store()
            .set_rotation_enabled(&secret_id(), false)
            .expect("disable");

        let result = controller.rotate(&request(&token, phase));

        assert!(matches!(
            result.unwrap_err(),
            Error::RotationDisabled { .. }
        ));
        assert_eq!(controller.target().password_changes(), 0);
        assert_eq!(controller.target().open_sessions(), 0);
    }

    #[test]
    fn unknown_token_fails() {
        let (controller, _token) = rotation_in_progress();
        let result = controller.rotate(&request(&VersionId::new("bogus"), Phase::Create));
        assert!(matches!(
            result.unwrap_err(),
            Error::UnknownVersion { .. }
        ));
    }

    #[test_case(Phase::Create)]
    #[test_case(Phase::Set)]
    #[test_case(Phase::Test)]
    #[test_case(Phase::Finish)]
    fn token_already_current_is_a_no_op(phase: Phase) {
        let (controller, token) = rotation_in_progress();
        // Complete the whole rotation first
        for p in [Phase::Create, Phase::Set, Phase::Test, Phase::Finish] {
            controller.rotate(&request(&token, p)).expect("phase");
        }
        let changes_before = controller.target().password_changes();

        controller
            .rotate(&request(&token, phase))
            .expect("replay is a no-op");

        assert_eq!(controller.target().password_changes(), changes_before);
    }

    #[test_case(Phase::Create)]
    #[test_case(Phase::Set)]
    #[test_case(Phase::Test)]
    #[test_case(Phase::Finish)]
    fn version_without_rotation_stage_fails(phase: Phase) {
        let (controller, _token) = rotation_in_progress();
        let orphan = VersionId::new("orphan");
        controller
            .store()
            .put_value(&secret_id(), &orphan, &payload_json("app", "px"), &[])
            .expect("write orphan version");

        let result = controller.rotate(&request(&orphan, phase));
        assert!(matches!(result.unwrap_err(), Error::InvalidStage { .. }));
    }

    // ===================
    // Create phase
    // ===================

    #[test]
    fn create_generates_pending_credential_from_template() {
        let (controller, token) = rotation_in_progress();

        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");

        let secret = controller
            .store()
            .get_value(&secret_id(), Stage::Pending, Some(&token))
            .expect("pending value");
        let pending = CredentialPayload::from_secret(&secret).expect("parse");
        assert_eq!(pending.username, "app");
        assert_eq!(pending.host, "db.internal");
        assert_eq!(pending.dbname.as_deref(), Some("orders"));
        assert_ne!(pending.password.expose(), "p0");
        assert_eq!(pending.password.expose().len(), 128);
    }

    #[test]
    fn create_twice_generates_exactly_one_password() {
        let (controller, token) = rotation_in_progress();

        controller
            .rotate(&request(&token, Phase::Create))
            .expect("first create");
        let first = pending_password(&controller);

        controller
            .rotate(&request(&token, Phase::Create))
            .expect("second create");
        let second = pending_password(&controller);

        assert_eq!(first, second);
    }

    #[test]
    fn create_does_not_touch_target() {
        let (controller, token) = rotation_in_progress();
        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        assert_eq!(controller.target().password_changes(), 0);
        assert_eq!(controller.target().open_sessions(), 0);
    }

    #[test]
    fn create_rejects_wrong_engine_template() {
        let store = MemoryStore::new();
        store.create_secret(&secret_id(), &payload_json("app", "p0"));
        let token = store.begin_rotation(&secret_id()).expect("begin");
        let target = MemoryTarget::new("mysql").with_user("app", "p0");
        let controller = RotationController::new(store, target);

        let result = controller.rotate(&request(&token, Phase::Create));
        assert!(matches!(
            result.unwrap_err(),
            Error::SecretPayloadInvalid { .. }
        ));
    }

    // ===================
    // Set phase
    // ===================

    #[test]
    fn set_updates_target_via_current_credential() {
        let (controller, token) = rotation_in_progress();
        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");

        controller.rotate(&request(&token, Phase::Set)).expect("set");

        assert_eq!(controller.target().password_changes(), 1);
        assert_eq!(
            controller.target().password_of("app"),
            Some(pending_password(&controller))
        );
        assert_eq!(controller.target().open_sessions(), 0);
    }

    #[test]
    fn set_is_a_no_op_when_pending_already_live() {
        let (controller, token) = rotation_in_progress();
        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        controller.rotate(&request(&token, Phase::Set)).expect("set");

        // Replaying the phase after the password is already live
        controller
            .rotate(&request(&token, Phase::Set))
            .expect("set replay");

        assert_eq!(controller.target().password_changes(), 1);
    }

    #[test]
    fn set_falls_back_to_previous_credential() {
        let store = MemoryStore::new();
        store.create_secret(&secret_id(), &payload_json("app", "p0"));
        let previous = VersionId::new("older");
        store
            .put_value(
                &secret_id(),
                &previous,
                &payload_json("app", "p-old"),
                &[Stage::Previous],
            )
            .expect("stage previous");
        let token = store.begin_rotation(&secret_id()).expect("begin");

        // The target never picked up p0: its live password is the previous one
        let target = MemoryTarget::new("postgres").with_user("app", "p-old");
        let controller = RotationController::new(store, target);

        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        controller.rotate(&request(&token, Phase::Set)).expect("set");

        assert_eq!(controller.target().password_changes(), 1);
        assert_eq!(
            controller.target().password_of("app"),
            Some(pending_password(&controller))
        );
    }

    #[test]
    fn set_fails_when_no_credential_authenticates() {
        let store = MemoryStore::new();
        store.create_secret(&secret_id(), &payload_json("app", "p0"));
        let token = store.begin_rotation(&secret_id()).expect("begin");

        // The target's live password matches no stored version
        let target = MemoryTarget::new("postgres").with_user("app", "drifted");
        let controller = RotationController::new(store, target);

        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        let result = controller.rotate(&request(&token, Phase::Set));

        assert!(matches!(
            result.unwrap_err(),
            Error::NoValidCredential { .. }
        ));
        assert_eq!(controller.target().password_changes(), 0);
        assert_eq!(controller.target().open_sessions(), 0);
    }

    #[test]
    fn set_skips_missing_previous_stage_silently() {
        // No previous version exists at all; drifted target still yields
        // NoValidCredential, not a lookup error.
        let store = MemoryStore::new();
        store.create_secret(&secret_id(), &payload_json("app", "p0"));
        let token = store.begin_rotation(&secret_id()).expect("begin");
        let target = MemoryTarget::new("postgres").with_user("app", "drifted");
        let controller = RotationController::new(store, target);

        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        let result = controller.rotate(&request(&token, Phase::Set));

        assert!(matches!(
            result.unwrap_err(),
            Error::NoValidCredential { .. }
        ));
    }

    // ===================
    // Test phase
    // ===================

    #[test]
    fn test_phase_passes_after_set() {
        let (controller, token) = rotation_in_progress();
        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        controller.rotate(&request(&token, Phase::Set)).expect("set");

        controller
            .rotate(&request(&token, Phase::Test))
            .expect("test");
        assert_eq!(controller.target().open_sessions(), 0);
    }

    #[test]
    fn test_phase_fails_before_set() {
        let (controller, token) = rotation_in_progress();
        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");

        // The pending password is not live yet
        let result = controller.rotate(&request(&token, Phase::Test));
        assert!(matches!(
            result.unwrap_err(),
            Error::ValidationFailed { .. }
        ));
    }

    #[test]
    fn test_phase_fails_when_liveness_check_fails() {
        let (controller, token) = rotation_in_progress();
        controller
            .rotate(&request(&token, Phase::Create))
            .expect("create");
        controller.rotate(&request(&token, Phase::Set)).expect("set");

        // The pending credential authenticates, but the target cannot run
        // even a trivial statement
        controller.target().set_fail_statements(true);
        let result = controller.rotate(&request(&token, Phase::Test));
        match result.unwrap_err() {
            Error::ValidationFailed { reason } => {
                assert!(reason.contains("liveness check failed"), "reason: {reason}");
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
        assert_eq!(controller.target().open_sessions(), 0);

        // A recovered target lets the same phase pass
        controller.target().set_fail_statements(false);
        controller
            .rotate(&request(&token, Phase::Test))
            .expect("test after recovery");
    }

    // ===================
    // Finish phase
    // ===================

    #[test]
    fn finish_promotes_pending_and_demotes_current() {
        let (controller, token) = rotation_in_progress();
        let description = controller.store().describe(&secret_id()).expect("describe");
        let old_current = description
            .version_with(Stage::Current)
            .expect("has current")
            .clone();

        for phase in [Phase::Create, Phase::Set, Phase::Test, Phase::Finish] {
            controller.rotate(&request(&token, phase)).expect("phase");
        }

        let description = controller.store().describe(&secret_id()).expect("describe");
        assert_eq!(description.version_with(Stage::Current), Some(&token));
        assert_eq!(description.version_with(Stage::Previous), Some(&old_current));
        assert_eq!(description.version_with(Stage::Pending), None);
    }

    #[test]
    fn finish_twice_leaves_exactly_one_current() {
        let (controller, token) = rotation_in_progress();
        for phase in [Phase::Create, Phase::Set, Phase::Test, Phase::Finish] {
            controller.rotate(&request(&token, phase)).expect("phase");
        }

        controller
            .rotate(&request(&token, Phase::Finish))
            .expect("finish replay");

        let description = controller.store().describe(&secret_id()).expect("describe");
        let current_count = description
            .versions
            .values()
            .filter(|stages| stages.contains(&Stage::Current))
            .count();
        assert_eq!(current_count, 1);
        assert_eq!(description.version_with(Stage::Current), Some(&token));
    }
}
