use std::{sync::Arc, time::Duration};

use channel::{MissingSurfaceOpener, SurfaceOpener};
use crypto::{CryptoProvider, MissingCryptoProvider};
use keyring::{KeyStore, MissingKeyStore, PasswordCache};
use shared::protocol::Preferences;
use tokio::sync::RwLock;

pub const DEFAULT_PASSWORD_TTL: Duration = Duration::from_secs(600);

/// Collaborators handed to every controller factory.
#[derive(Clone)]
pub struct Services {
    pub crypto: Arc<dyn CryptoProvider>,
    pub keys: Arc<dyn KeyStore>,
    pub surfaces: Arc<dyn SurfaceOpener>,
    pub passwords: PasswordCache,
    pub preferences: Arc<RwLock<Preferences>>,
    pub watch_list: Arc<Vec<String>>,
    pub version: String,
}

impl Services {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        keys: Arc<dyn KeyStore>,
        surfaces: Arc<dyn SurfaceOpener>,
    ) -> Self {
        Self {
            crypto,
            keys,
            surfaces,
            passwords: PasswordCache::new(DEFAULT_PASSWORD_TTL),
            preferences: Arc::new(RwLock::new(Preferences::default())),
            watch_list: Arc::new(Vec::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_password_ttl(mut self, ttl: Duration) -> Self {
        self.passwords = PasswordCache::new(ttl);
        self
    }

    pub fn with_watch_list(mut self, watch_list: Vec<String>) -> Self {
        self.watch_list = Arc::new(watch_list);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(
            Arc::new(MissingCryptoProvider),
            Arc::new(MissingKeyStore),
            Arc::new(MissingSurfaceOpener),
        )
    }
}
