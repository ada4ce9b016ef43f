//! # Rotor
//!
//! Zero-downtime rotation of database credentials stored in a versioned,
//! stage-labeled secret store:
//!
//! - **Four-phase protocol**: `create`, `set`, `test`, `finish`, invoked
//!   one phase per call by an external orchestrator
//! - **Idempotent phases**: every phase is safe to replay; at most one
//!   password is ever generated per rotation token
//! - **Lockout-proof**: the set phase falls back through the pending,
//!   current, and previous credentials, so a half-finished rotation never
//!   strands the secret
//! - **Narrow seams**: the store and the credential target are traits,
//!   injected at construction; in-memory implementations ship with the
//!   crate
//!
//! ## Example
//!
//! ```rust
//! use rotor::{
//!     MemoryStore, MemoryTarget, Phase, RotationController, RotationRequest, SecretId,
//!     SecretString,
//! };
//!
//! // A secret whose current version matches the target's live password
//! let store = MemoryStore::new();
//! let secret_id = SecretId::new("prod/db/credentials").expect("valid id");
//! store.create_secret(
//!     &secret_id,
//!     &SecretString::new(
//!         r#"{"engine":"postgres","host":"db.internal","username":"app","password":"p0"}"#,
//!     ),
//! );
//! let target = MemoryTarget::new("postgres").with_user("app", "p0");
//!
//! // The orchestrator stages a rotation and drives the four phases
//! let token = store.begin_rotation(&secret_id).expect("begin rotation");
//! let controller = RotationController::new(store, target);
//! for phase in [Phase::Create, Phase::Set, Phase::Test, Phase::Finish] {
//!     let request = RotationRequest::new(secret_id.clone(), token.clone(), phase);
//!     controller.rotate(&request).expect("phase succeeds");
//! }
//! ```
//!
//! ## Security Considerations
//!
//! - Passwords and payloads use `zeroize` to clear memory on drop
//! - Secret-bearing types redact their debug output
//! - Generated passwords are 128 alphanumeric characters, safe to embed in
//!   shells and SQL without quoting

pub mod controller;
pub mod error;
pub mod password;
pub mod payload;
pub mod store;
pub mod target;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{Phase, RotationRequest, SecretDescription, SecretId, Stage, VersionId};

pub use payload::{CredentialPayload, SecretString};

pub use password::{GENERATED_PASSWORD_LENGTH, generate_password};

pub use store::{MemoryStore, SecretStore};

pub use target::{CredentialTarget, MemoryTarget, TargetConnection};

pub use controller::RotationController;
