//! Pending ACME HTTP-01 challenges
//!
//! The ACME provider deposits `(token, key authorization)` pairs here while
//! an order is in flight; the request pipeline answers
//! `/.well-known/acme-challenge/{token}` lookups from the same map.

use dashmap::DashMap;

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Clone, Default)]
pub struct ChallengeStore {
    inner: std::sync::Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token: String, key_authorization: String) {
        self.inner.insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.get(token).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, token: &str) {
        self.inner.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_remove() {
        let store = ChallengeStore::new();

        store.add("token123".to_string(), "token123.thumbprint".to_string());
        assert_eq!(
            store.get("token123"),
            Some("token123.thumbprint".to_string())
        );
        assert_eq!(store.get("missing"), None);

        store.remove("token123");
        assert_eq!(store.get("token123"), None);
    }

    #[test]
    fn remove_missing_is_total() {
        let store = ChallengeStore::new();
        store.remove("never-added");
    }

    #[test]
    fn concurrent_access() {
        let store = ChallengeStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let token = format!("token-{i}");
                    store.add(token.clone(), format!("auth-{i}"));
                    assert_eq!(store.get(&token), Some(format!("auth-{i}")));
                    store.remove(&token);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
