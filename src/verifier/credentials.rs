//! Credential check run by the verification consumer.

use crate::store::{normalize_email, CredentialStore};
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

pub const MSG_SUCCESS: &str = "Login successful";
pub const MSG_INVALID: &str = "Invalid credentials";
pub const MSG_DATABASE: &str = "Database error";
pub const MSG_INTERNAL: &str = "Internal error";

#[derive(Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "username")]
    pub email: String,
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Unknown user and wrong password look the same to the caller.
    InvalidCredentials,
    StoreUnavailable,
    Internal,
}

impl Outcome {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Success => MSG_SUCCESS,
            Self::InvalidCredentials => MSG_INVALID,
            Self::StoreUnavailable => MSG_DATABASE,
            Self::Internal => MSG_INTERNAL,
        }
    }
}

/// Look up the stored hash for `login.email` and compare it with the supplied
/// password. The email is normalised the way registration stores it. Hash
/// verification runs on the blocking pool.
pub async fn verify(store: &dyn CredentialStore, login: &LoginRequest) -> Outcome {
    let hash = match store.password_hash(&normalize_email(&login.email)).await {
        Ok(Some(hash)) => hash,
        Ok(None) => return Outcome::InvalidCredentials,
        Err(err) => {
            error!("credential lookup failed: {err:#}");
            return Outcome::StoreUnavailable;
        }
    };

    let password = login.password.clone();
    match tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await {
        Ok(true) => Outcome::Success,
        Ok(false) => Outcome::InvalidCredentials,
        Err(err) => {
            error!("password verification task failed: {err}");
            Outcome::Internal
        }
    }
}

/// # Errors
/// Returns an error if hashing fails (invalid parameters).
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        warn!("stored password hash is not in PHC format");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryUserStore;

    fn login(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("p1").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("p1", &hash));
        assert!(!verify_password("p2", &hash));
        assert!(!verify_password("p1", "not-a-phc-string"));
    }

    #[test]
    fn username_is_accepted_as_email() {
        let request: LoginRequest =
            serde_json::from_str(r#"{"username":"a@x.com","password":"p1"}"#).unwrap();
        assert_eq!(request.email, "a@x.com");
        assert!(!format!("{request:?}").contains("p1"));
    }

    #[tokio::test]
    async fn outcomes() {
        let hash = hash_password("p1").unwrap();
        let store = MemoryUserStore::new().with_user("a@x.com", &hash).await;

        assert_eq!(verify(&store, &login("a@x.com", "p1")).await, Outcome::Success);
        assert_eq!(
            verify(&store, &login(" A@X.com ", "p1")).await,
            Outcome::Success
        );
        assert_eq!(
            verify(&store, &login("a@x.com", "nope")).await,
            Outcome::InvalidCredentials
        );
        // indistinguishable from a wrong password
        assert_eq!(
            verify(&store, &login("ghost@x.com", "p1")).await.message(),
            MSG_INVALID
        );

        store.set_unavailable(true);
        let outcome = verify(&store, &login("a@x.com", "p1")).await;
        assert_eq!(outcome, Outcome::StoreUnavailable);
        assert_eq!(outcome.message(), "Database error");
    }
}
