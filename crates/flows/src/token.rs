//! Per-user mapping of opaque callback tokens to button payloads.
//!
//! Chat platforms limit inline-button callback data to a short ASCII string
//! (64 bytes on Telegram). Instead of serializing payloads into that space,
//! each rendered button gets a random token and the payload stays in memory.
//! Lookups are always scoped to the user who received the button, so a
//! token never resolves for anyone else.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use {tracing::debug, uuid::Uuid};

use parley_common::UserId;

use crate::payload::CallbackPayload;

#[cfg(feature = "metrics")]
use parley_metrics::{flows as flow_metrics, gauge};

/// Upper bound on callback data accepted by the transports we target.
pub const MAX_TOKEN_LEN: usize = 64;

type UserTokens = HashMap<String, CallbackPayload>;

/// Token store shared by every flow of one engine instance.
#[derive(Default)]
pub struct CallbackTokenRegistry {
    users: Mutex<HashMap<UserId, UserTokens>>,
}

impl CallbackTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, UserTokens>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `payload` for `user_id` under a fresh token and return the token.
    ///
    /// Tokens are v4 UUIDs in simple form (32 hex chars, 122 random bits) and
    /// are re-drawn until unique within the user's map.
    pub fn register(&self, user_id: UserId, payload: impl Into<CallbackPayload>) -> String {
        let payload = payload.into();
        let mut users = self.lock();
        let tokens = users.entry(user_id).or_default();
        let token = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !tokens.contains_key(&candidate) {
                break candidate;
            }
        };
        debug_assert!(token.len() <= MAX_TOKEN_LEN);
        debug!(%user_id, token, payload_type = payload.type_name(), "registered callback token");
        tokens.insert(token.clone(), payload);
        #[cfg(feature = "metrics")]
        gauge!(flow_metrics::REGISTERED_TOKENS).increment(1.0);
        token
    }

    /// Look up the payload behind `token`. Never mutates the registry.
    pub fn resolve(&self, user_id: UserId, token: &str) -> Option<CallbackPayload> {
        self.lock()
            .get(&user_id)
            .and_then(|tokens| tokens.get(token))
            .cloned()
    }

    /// Drop every token registered for `user_id`. Returns how many were removed.
    pub fn cleanup_user(&self, user_id: UserId) -> usize {
        let removed = self.lock().remove(&user_id).map_or(0, |tokens| tokens.len());
        if removed > 0 {
            debug!(%user_id, removed, "cleaned up callback tokens");
            #[cfg(feature = "metrics")]
            gauge!(flow_metrics::REGISTERED_TOKENS).decrement(removed as f64);
        }
        removed
    }

    /// Drop a single token. Returns whether it existed.
    pub fn cleanup_token(&self, user_id: UserId, token: &str) -> bool {
        let mut users = self.lock();
        let Some(tokens) = users.get_mut(&user_id) else {
            return false;
        };
        let removed = tokens.remove(token).is_some();
        if tokens.is_empty() {
            users.remove(&user_id);
        }
        if removed {
            debug!(%user_id, token, "invalidated callback token");
            #[cfg(feature = "metrics")]
            gauge!(flow_metrics::REGISTERED_TOKENS).decrement(1.0);
        }
        removed
    }

    /// Number of live tokens held for `user_id`.
    pub fn token_count(&self, user_id: UserId) -> usize {
        self.lock().get(&user_id).map_or(0, HashMap::len)
    }

    /// Number of users with at least one live token.
    pub fn user_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::*;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    #[derive(Debug, PartialEq)]
    struct Pick {
        item: u32,
    }

    #[test]
    fn tokens_fit_callback_data_limits() {
        let registry = CallbackTokenRegistry::new();
        let token = registry.register(ALICE, "x");
        assert_eq!(token.len(), 32);
        assert!(token.len() <= MAX_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn resolve_returns_original_payloads() {
        let registry = CallbackTokenRegistry::new();

        let text = registry.register(ALICE, "confirm");
        let mut map = HashMap::new();
        map.insert("size".to_string(), "large".to_string());
        let map_token = registry.register(ALICE, CallbackPayload::new(map.clone()));
        let pick = registry.register(ALICE, CallbackPayload::new(Pick { item: 7 }));

        assert_eq!(registry.resolve(ALICE, &text).unwrap().as_str(), Some("confirm"));
        assert_eq!(
            registry
                .resolve(ALICE, &map_token)
                .unwrap()
                .downcast_ref::<HashMap<String, String>>(),
            Some(&map)
        );
        assert_eq!(
            registry.resolve(ALICE, &pick).unwrap().downcast_ref::<Pick>(),
            Some(&Pick { item: 7 })
        );
        // Lookups do not consume the token.
        assert!(registry.resolve(ALICE, &text).is_some());
        assert_eq!(registry.token_count(ALICE), 3);
    }

    #[test]
    fn tokens_are_isolated_per_user() {
        let registry = CallbackTokenRegistry::new();
        let token = registry.register(ALICE, "mine");
        assert!(registry.resolve(BOB, &token).is_none());
        assert!(!registry.cleanup_token(BOB, &token));
        assert_eq!(registry.cleanup_user(BOB), 0);
        assert!(registry.resolve(ALICE, &token).is_some());
    }

    #[test]
    fn cleanup_user_is_idempotent() {
        let registry = CallbackTokenRegistry::new();
        let a = registry.register(ALICE, "a");
        registry.register(ALICE, "b");
        let b = registry.register(BOB, "b");

        assert_eq!(registry.cleanup_user(ALICE), 2);
        assert_eq!(registry.cleanup_user(ALICE), 0);
        assert!(registry.resolve(ALICE, &a).is_none());
        assert!(registry.resolve(BOB, &b).is_some());
        assert_eq!(registry.user_count(), 1);
    }

    #[test]
    fn cleanup_token_removes_only_that_token() {
        let registry = CallbackTokenRegistry::new();
        let keep = registry.register(ALICE, "keep");
        let stale = registry.register(ALICE, "stale");

        assert!(registry.cleanup_token(ALICE, &stale));
        assert!(!registry.cleanup_token(ALICE, &stale));
        assert!(registry.resolve(ALICE, &stale).is_none());
        assert!(registry.resolve(ALICE, &keep).is_some());

        assert!(registry.cleanup_token(ALICE, &keep));
        assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn concurrent_registration_yields_unique_tokens() {
        let registry = Arc::new(CallbackTokenRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|n| registry.register(ALICE, format!("{i}-{n}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(registry.token_count(ALICE), 800);
    }
}
