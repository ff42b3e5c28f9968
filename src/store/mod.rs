//! Systems of record: user rows and uploaded files.

pub mod memory;
pub mod objects;
pub mod postgres;

pub use self::memory::MemoryUserStore;
pub use self::objects::{MemoryObjectStore, ObjectStore, S3ObjectStore, Upload};
pub use self::postgres::PgUserStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Utc};

/// Lookup used by the verification consumer.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// PHC-format password hash for `email`, or `None` when no such user exists.
    async fn password_hash(&self, email: &str) -> Result<Option<String>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub photo: Option<String>,
    pub documents: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(i64),
    Conflict,
}

/// Which unique field an existing user already holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Taken {
    Email,
    Phone,
}

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn find_conflict(&self, email: &str, phone: &str) -> Result<Option<Taken>>;

    /// Insert `user` under the next registration number.
    async fn insert_user(&self, user: &NewUser) -> Result<InsertOutcome>;

    async fn ping(&self) -> Result<()>;
}

/// Emails are stored and looked up trimmed and lowercased.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// First registration number of a year: `year * 10000 + 1000`.
#[must_use]
pub fn first_registration_number(year: i32) -> i64 {
    i64::from(year) * 10_000 + 1_000
}

#[must_use]
pub fn current_first_registration_number() -> i64 {
    first_registration_number(Utc::now().year())
}

/// Next number after `current_max`, never below the year's starting number.
#[must_use]
pub fn next_registration_number(current_max: Option<i64>, start: i64) -> i64 {
    current_max.map_or(start, |max| (max + 1).max(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_numbers() {
        assert_eq!(first_registration_number(2025), 20_251_000);
        assert_eq!(next_registration_number(None, 20_251_000), 20_251_000);
        assert_eq!(next_registration_number(Some(20_251_000), 20_251_000), 20_251_001);
        // numbering jumps forward when the year rolls over
        assert_eq!(next_registration_number(Some(20_251_042), 20_261_000), 20_261_000);
    }

    #[test]
    fn emails_are_case_folded() {
        assert_eq!(normalize_email(" Grace@Example.COM "), "grace@example.com");
        assert_eq!(normalize_email("ada@example.com"), "ada@example.com");
    }
}
