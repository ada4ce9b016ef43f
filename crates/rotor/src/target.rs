//! The credential target interface and an in-memory stand-in.
//!
//! The target is whatever system the rotated credential authenticates
//! against (a database, usually). The controller reaches it exclusively
//! through [`CredentialTarget`], whose `connect` doubles as the explicit
//! try-authenticate probe the set-phase fallback chain is built on: a
//! failed connect means "not this credential", never control flow by
//! exception.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::payload::CredentialPayload;

/// A driver for the system that consumes the rotated credential.
pub trait CredentialTarget: Send + Sync {
    /// The engine tag this driver serves; payloads carrying a different
    /// tag are rejected before any connection attempt.
    fn engine(&self) -> &str;

    /// Establishes an authenticated session with the given credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Target`] if the credential does not authenticate
    /// or the target is unreachable.
    fn connect<'a>(
        &'a self,
        credential: &CredentialPayload,
    ) -> Result<Box<dyn TargetConnection + 'a>>;
}

/// An authenticated session with the credential target.
///
/// Sessions are scoped to a single check or mutation; dropping the boxed
/// connection releases it, so every exit path closes cleanly.
pub trait TargetConnection {
    /// Executes a statement. The rotation controller only ever sends a
    /// trivial read-only liveness probe through this.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Target`] if execution fails.
    fn execute(&mut self, statement: &str) -> Result<()>;

    /// Changes a user's password, authenticated as this session's user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Target`] if the change is rejected.
    fn change_password(&mut self, username: &str, new_password: &str) -> Result<()>;
}

/// An in-memory [`CredentialTarget`]: a username/password table with
/// constant-time verification.
///
/// Stands in for a real database in tests and local development. Tracks
/// how many password changes were applied and how many sessions are
/// currently open, so tests can assert that phases mutate exactly as often
/// as specified and never leak a connection.
pub struct MemoryTarget {
    /// The engine tag this target answers to.
    engine: String,
    /// Live passwords by username.
    users: RwLock<HashMap<String, String>>,
    /// Number of password changes applied.
    password_changes: AtomicUsize,
    /// Number of currently open sessions.
    open_sessions: AtomicUsize,
    /// When set, every statement execution fails.
    fail_statements: AtomicBool,
}

impl MemoryTarget {
    /// Creates an empty target for the given engine.
    #[must_use]
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            users: RwLock::new(HashMap::new()),
            password_changes: AtomicUsize::new(0),
            open_sessions: AtomicUsize::new(0),
            fail_statements: AtomicBool::new(false),
        }
    }

    /// Adds a user with a live password.
    #[must_use]
    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        {
            let mut users = self
                .users
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            users.insert(username.into(), password.into());
        }
        self
    }

    /// Returns a user's live password, if the user exists.
    #[must_use]
    pub fn password_of(&self, username: &str) -> Option<String> {
        self.users
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(username)
            .cloned()
    }

    /// Returns how many password changes have been applied.
    #[must_use]
    pub fn password_changes(&self) -> usize {
        self.password_changes.load(Ordering::SeqCst)
    }

    /// Returns how many sessions are currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Makes every subsequent statement execution fail.
    ///
    /// Authentication and password changes are unaffected: this simulates a
    /// target whose credentials work but whose query engine is broken.
    pub fn set_fail_statements(&self, fail: bool) {
        self.fail_statements.store(fail, Ordering::SeqCst);
    }

    /// Verifies a username/password pair in constant time.
    fn verify(&self, username: &str, password: &str) -> bool {
        use subtle::ConstantTimeEq;

        let users = self
            .users
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        users
            .get(username)
            .is_some_and(|live| live.as_bytes().ct_eq(password.as_bytes()).into())
    }
}

impl fmt::Debug for MemoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let user_count = self
            .users
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        f.debug_struct("MemoryTarget")
            .field("engine", &self.engine)
            .field("users", &user_count)
            .field("passwords", &"[REDACTED]")
            .finish()
    }
}

impl CredentialTarget for MemoryTarget {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn connect<'a>(
        &'a self,
        credential: &CredentialPayload,
    ) -> Result<Box<dyn TargetConnection + 'a>> {
        if !self.verify(&credential.username, credential.password.expose()) {
            return Err(Error::Target {
                reason: format!("authentication failed for user '{}'", credential.username),
            });
        }

        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            target: self,
            username: credential.username.clone(),
        }))
    }
}

/// An open session against a [`MemoryTarget`].
struct MemorySession<'a> {
    /// The target this session belongs to.
    target: &'a MemoryTarget,
    /// The authenticated user.
    username: String,
}

impl TargetConnection for MemorySession<'_> {
    fn execute(&mut self, statement: &str) -> Result<()> {
        if self.target.fail_statements.load(Ordering::SeqCst) {
            return Err(Error::Target {
                reason: format!("statement failed: '{statement}'"),
            });
        }
        Ok(())
    }

    fn change_password(&mut self, username: &str, new_password: &str) -> Result<()> {
        let mut users = self
            .target
            .users
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(live) = users.get_mut(username) else {
            return Err(Error::Target {
                reason: format!("no such user: '{username}'"),
            });
        };

        *live = new_password.to_string();
        self.target.password_changes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            session_user = %self.username,
            user = %username,
            "password changed on in-memory target"
        );
        Ok(())
    }
}

impl Drop for MemorySession<'_> {
    fn drop(&mut self) {
        self.target.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
