//! # Registrar
//!
//! User registration and login for a service whose credential checks run
//! behind a message broker.
//!
//! ## Registration
//!
//! `POST /register` accepts a multipart form, stores the uploaded files, writes
//! the user row under a yearly registration number (`YYYY1000`, `YYYY1001`,
//! ...) and publishes a `user.registered` event to `user_exchange`. Losing the
//! event never fails a signup that is already committed.
//!
//! ## Login
//!
//! `POST /login` is a request/response exchange over the broker. The HTTP
//! handler publishes a correlated request to `auth_exchange` and waits, up to
//! a deadline, for the matching reply on `login_response`. A verification
//! consumer checks the password hash and answers. A timeout is reported as
//! *pending*, never as a denial.
//!
//! ## Dead letters
//!
//! Every primary queue carries a per-message TTL and routes expired or
//! rejected messages to `dead_letter_exchange`, which fans out to
//! `dead_letter_queue`. Nothing consumes that queue; it exists for operators.

pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod store;
pub mod verifier;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
