//! In-memory user store for tests and `memory://` development runs.

use super::{
    current_first_registration_number, next_registration_number, CredentialStore, InsertOutcome,
    NewUser, RegistrationStore, Taken,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<BTreeMap<i64, NewUser>>,
    unavailable: AtomicBool,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user directly, bypassing registration.
    pub async fn with_user(self, email: &str, password_hash: &str) -> Self {
        {
            let mut users = self.users.lock().await;
            let regno = next_registration_number(
                users.keys().next_back().copied(),
                current_first_registration_number(),
            );
            users.insert(
                regno,
                NewUser {
                    name: email.to_string(),
                    email: email.to_string(),
                    phone: format!("+{regno}"),
                    password_hash: password_hash.to_string(),
                    photo: None,
                    documents: Vec::new(),
                },
            );
        }
        self
    }

    /// Make every call fail, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.lock().await.is_empty()
    }

    pub async fn user(&self, regno: i64) -> Option<NewUser> {
        self.users.lock().await.get(&regno).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("database unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryUserStore {
    async fn password_hash(&self, email: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|user| user.email == email)
            .map(|user| user.password_hash.clone()))
    }
}

#[async_trait]
impl RegistrationStore for MemoryUserStore {
    async fn find_conflict(&self, email: &str, phone: &str) -> Result<Option<Taken>> {
        self.check()?;
        let users = self.users.lock().await;
        if users.values().any(|user| user.email == email) {
            return Ok(Some(Taken::Email));
        }
        if users.values().any(|user| user.phone == phone) {
            return Ok(Some(Taken::Phone));
        }
        Ok(None)
    }

    async fn insert_user(&self, user: &NewUser) -> Result<InsertOutcome> {
        self.check()?;
        let mut users = self.users.lock().await;
        if users
            .values()
            .any(|existing| existing.email == user.email || existing.phone == user.phone)
        {
            return Ok(InsertOutcome::Conflict);
        }
        let regno = next_registration_number(
            users.keys().next_back().copied(),
            current_first_registration_number(),
        );
        users.insert(regno, user.clone());
        Ok(InsertOutcome::Created(regno))
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
