//! Credential verification seam
//!
//! Durable account storage is an external collaborator; the gateway only
//! needs to check and create (nick, password) pairs. `MemoryStore` is the
//! built-in implementation, seeded from the config's account table.

use std::collections::HashMap;

/// Verification and registration of client credentials
pub trait CredentialStore {
    /// Does an account exist for this nick?
    fn exists(&self, nick: &str) -> bool;

    /// Check a (nick, password) pair
    fn verify(&self, nick: &str, password: &str) -> bool;

    /// Create a new account; fails when the nick is already taken
    fn register(&mut self, nick: &str, password: &str) -> std::result::Result<(), RegisterError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    NickTaken,
    BadPassword,
}

/// In-memory store seeded from the deployment config
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new(accounts: HashMap<String, String>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|(nick, password)| (nick.to_ascii_lowercase(), password))
            .collect();
        Self { accounts }
    }
}

impl CredentialStore for MemoryStore {
    fn exists(&self, nick: &str) -> bool {
        self.accounts.contains_key(&nick.to_ascii_lowercase())
    }

    fn verify(&self, nick: &str, password: &str) -> bool {
        self.accounts
            .get(&nick.to_ascii_lowercase())
            .is_some_and(|stored| stored == password)
    }

    fn register(&mut self, nick: &str, password: &str) -> std::result::Result<(), RegisterError> {
        if password.is_empty() {
            return Err(RegisterError::BadPassword);
        }
        let key = nick.to_ascii_lowercase();
        if self.accounts.contains_key(&key) {
            return Err(RegisterError::NickTaken);
        }
        self.accounts.insert(key, password.to_string());
        Ok(())
    }
}
