//! Password generation for the create phase.

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::payload::SecretString;

/// Length of generated passwords, in characters.
///
/// 128 alphanumeric characters give well over 700 bits of entropy, far
/// beyond brute-force reach.
pub const GENERATED_PASSWORD_LENGTH: usize = 128;

/// Generates a new high-entropy password.
///
/// The alphabet is restricted to ASCII alphanumerics so the password never
/// needs quoting in shells, SQL statements, or connection strings.
#[must_use]
pub fn generate_password() -> SecretString {
    generate_password_of_length(GENERATED_PASSWORD_LENGTH)
}

/// Generates a password of the given length from the same alphabet.
#[must_use]
pub fn generate_password_of_length(length: usize) -> SecretString {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    SecretString::new(password)
}
