use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::domain::Fingerprint;
use tokio::time::Instant;
use tracing::debug;
use zeroize::Zeroize;

struct CachedPassword {
    password: String,
    /// `None` when the ttl reaches past what the clock can represent.
    expires_at: Option<Instant>,
}

impl Drop for CachedPassword {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Unlocked-key passwords remembered for a limited time. Cheap to clone.
#[derive(Clone)]
pub struct PasswordCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<Fingerprint, CachedPassword>>>,
}

impl PasswordCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, CachedPassword>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        let mut entries = self.lock();
        let expired = entries
            .get(fingerprint)
            .map(|entry| entry.expires_at.is_some_and(|at| at <= Instant::now()))?;
        if expired {
            entries.remove(fingerprint);
            debug!(%fingerprint, "cached password expired");
            return None;
        }
        entries.get(fingerprint).map(|entry| entry.password.clone())
    }

    pub fn set(&self, fingerprint: Fingerprint, password: String) {
        let expires_at = Instant::now().checked_add(self.ttl);
        self.lock().insert(
            fingerprint,
            CachedPassword {
                password,
                expires_at,
            },
        );
    }

    pub fn forget(&self, fingerprint: &Fingerprint) {
        self.lock().remove(fingerprint);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = PasswordCache::new(Duration::from_secs(60));
        let key = Fingerprint::from("AA");
        cache.set(key.clone(), "secret".into());
        assert_eq!(cache.get(&key).as_deref(), Some("secret"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&key), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn an_unrepresentable_ttl_never_expires() {
        let cache = PasswordCache::new(Duration::MAX);
        let key = Fingerprint::from("BB");
        cache.set(key.clone(), "secret".into());

        tokio::time::advance(Duration::from_secs(60 * 60 * 24 * 365)).await;
        assert_eq!(cache.get(&key).as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = PasswordCache::new(Duration::from_secs(60));
        let other = cache.clone();
        cache.set(Fingerprint::from("AA"), "secret".into());
        assert_eq!(other.len(), 1);
        other.forget(&Fingerprint::from("AA"));
        assert!(cache.is_empty());
    }
}
