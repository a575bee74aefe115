//! Pseudonymous identity derivation from client fingerprints.

use crate::types::UserId;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;

const MAX_FINGERPRINT_LEN: usize = 100;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IdentityError {
    /// Empty or oversized fingerprint. The connection must be closed.
    #[error("invalid fingerprint")]
    InvalidFingerprint,
    /// A connection may bind a fingerprint at most once.
    #[error("fingerprint already set")]
    AlreadyBound,
}

/// Derives stable pseudonymous user ids from client fingerprints.
///
/// The id is a one-way hash of fingerprint + server secret, so the same
/// fingerprint yields the same id across reconnects without the server ever
/// being able to recover the fingerprint's owner.
pub struct IdentityRegistry {
    secret: String,
    dev_mode: bool,
    reloaded: Mutex<HashSet<UserId>>,
}

impl IdentityRegistry {
    pub fn new(secret: String, dev_mode: bool) -> Self {
        Self {
            secret,
            dev_mode,
            reloaded: Mutex::new(HashSet::new()),
        }
    }

    /// Bind a fingerprint for a connection whose current binding is
    /// `existing`. Returns the derived user id; the caller stores it as the
    /// connection's identity.
    pub fn bind(
        &self,
        existing: &Option<UserId>,
        fingerprint: &str,
    ) -> Result<UserId, IdentityError> {
        if existing.is_some() {
            return Err(IdentityError::AlreadyBound);
        }
        if fingerprint.is_empty() || fingerprint.len() > MAX_FINGERPRINT_LEN {
            return Err(IdentityError::InvalidFingerprint);
        }
        Ok(self.user_id(fingerprint))
    }

    pub fn user_id(&self, fingerprint: &str) -> UserId {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.as_bytes());
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Dev-only: true the first time a user id shows up after a restart, so
    /// the client can be told to reload stale assets.
    pub fn should_reload(&self, user_id: &UserId) -> bool {
        if !self.dev_mode {
            return false;
        }
        match self.reloaded.lock() {
            Ok(mut seen) => seen.insert(user_id.clone()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new("server-secret".to_string(), false)
    }

    #[test]
    fn binding_is_deterministic() {
        let reg = registry();
        let a = reg.bind(&None, "abc").unwrap();
        let b = reg.bind(&None, "abc").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_fingerprints_get_different_ids() {
        let reg = registry();
        let a = reg.bind(&None, "abc").unwrap();
        let b = reg.bind(&None, "abd").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn different_secrets_get_different_ids() {
        let a = IdentityRegistry::new("one".to_string(), false).user_id("abc");
        let b = IdentityRegistry::new("two".to_string(), false).user_id("abc");
        assert_ne!(a, b);
    }

    #[test]
    fn second_bind_fails_and_keeps_first() {
        let reg = registry();
        let first = reg.bind(&None, "abc").unwrap();
        let result = reg.bind(&Some(first.clone()), "other");
        assert_eq!(result, Err(IdentityError::AlreadyBound));
        // The existing binding is untouched; rebinding the original
        // fingerprint still yields the same id.
        assert_eq!(reg.user_id("abc"), first);
    }

    #[test]
    fn empty_and_oversized_fingerprints_are_rejected() {
        let reg = registry();
        assert_eq!(reg.bind(&None, ""), Err(IdentityError::InvalidFingerprint));
        let long = "f".repeat(101);
        assert_eq!(
            reg.bind(&None, &long),
            Err(IdentityError::InvalidFingerprint)
        );
        let just_fits = "f".repeat(100);
        assert!(reg.bind(&None, &just_fits).is_ok());
    }

    #[test]
    fn reload_hint_fires_once_per_id_in_dev_mode() {
        let reg = IdentityRegistry::new("secret".to_string(), true);
        let id = reg.user_id("abc");
        assert!(reg.should_reload(&id));
        assert!(!reg.should_reload(&id));

        let prod = registry();
        let id = prod.user_id("abc");
        assert!(!prod.should_reload(&id));
    }
}
