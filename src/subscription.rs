//! The register of the active external synchronization subscription.
//!
//! There is at most one subscription. Starting a new one replaces the
//! old one, whoever gets the lock last wins.
use std::sync::Arc;

use parking_lot::Mutex;

/// Subscription URL and the token the remote end must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub url: String,
    pub token: String,
}

/// A shared single-slot register. Cloning gives another handle to the same slot.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegister {
    slot: Arc<Mutex<Option<Subscription>>>,
}

impl SubscriptionRegister {
    pub fn new() -> SubscriptionRegister {
        SubscriptionRegister::default()
    }

    /// Record a new subscription, returning the one it replaced.
    pub fn start(&self, url: impl Into<String>, token: impl Into<String>) -> Option<Subscription> {
        let sub = Subscription {
            url: url.into(),
            token: token.into(),
        };
        debug!("subscription: start {}", sub.url);
        self.slot.lock().replace(sub)
    }

    pub fn current(&self) -> Option<Subscription> {
        self.slot.lock().clone()
    }

    /// Does `token` belong to the active subscription.
    pub fn check_token(&self, token: &str) -> bool {
        self.slot.lock().as_ref().is_some_and(|s| s.token == token)
    }

    pub fn clear(&self) -> Option<Subscription> {
        self.slot.lock().take()
    }
}
