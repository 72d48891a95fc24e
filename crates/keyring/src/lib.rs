use std::collections::BTreeMap;

use async_trait::async_trait;
use crypto::armor::{self, KeyBody, Label};
use shared::{
    domain::Fingerprint,
    error::{DomainError, ErrorCode},
    protocol::KeyRecord,
};
use tokio::sync::RwLock;
use tracing::info;

mod password_cache;

pub use password_cache::PasswordCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyQuery {
    Fingerprint(Fingerprint),
    Address(String),
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn lookup(&self, query: &KeyQuery) -> Result<Option<KeyRecord>, DomainError>;
    /// Imports every key block found in `armored`; private blocks supersede public ones.
    async fn import(&self, armored: &str) -> Result<Vec<KeyRecord>, DomainError>;
    async fn export(&self, fingerprint: &Fingerprint) -> Result<String, DomainError>;
    async fn list(&self) -> Result<Vec<KeyRecord>, DomainError>;
}

fn unavailable() -> DomainError {
    DomainError::new(ErrorCode::Unavailable, "key store unavailable")
}

pub struct MissingKeyStore;

#[async_trait]
impl KeyStore for MissingKeyStore {
    async fn lookup(&self, _query: &KeyQuery) -> Result<Option<KeyRecord>, DomainError> {
        Err(unavailable())
    }

    async fn import(&self, _armored: &str) -> Result<Vec<KeyRecord>, DomainError> {
        Err(unavailable())
    }

    async fn export(&self, _fingerprint: &Fingerprint) -> Result<String, DomainError> {
        Err(unavailable())
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, DomainError> {
        Err(unavailable())
    }
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<BTreeMap<Fingerprint, KeyRecord>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn lookup(&self, query: &KeyQuery) -> Result<Option<KeyRecord>, DomainError> {
        let keys = self.keys.read().await;
        let found = match query {
            KeyQuery::Fingerprint(fingerprint) => keys.get(fingerprint).cloned(),
            KeyQuery::Address(address) => {
                let address = address.trim().to_ascii_lowercase();
                // Prefer a private key when several keys carry the address.
                keys.values()
                    .filter(|record| record.addresses().any(|candidate| candidate == address))
                    .max_by_key(|record| (record.private, record.created_at))
                    .cloned()
            }
        };
        Ok(found)
    }

    async fn import(&self, armored: &str) -> Result<Vec<KeyRecord>, DomainError> {
        let mut parsed = Vec::new();
        for (label, body) in armor::blocks(armored) {
            let private = match label {
                Label::PublicKey => false,
                Label::PrivateKey => true,
                Label::Message | Label::SignedMessage => continue,
            };
            let key: KeyBody = armor::decode_body(&body, ErrorCode::ImportFailed)?;
            parsed.push(key.into_record(private));
        }
        if parsed.is_empty() {
            return Err(DomainError::new(
                ErrorCode::ImportFailed,
                "no key block found in armored text",
            ));
        }

        let mut keys = self.keys.write().await;
        let mut imported = Vec::with_capacity(parsed.len());
        for mut record in parsed {
            if let Some(existing) = keys.get(&record.fingerprint) {
                record.private |= existing.private;
            }
            info!(fingerprint = %record.fingerprint, private = record.private, "key imported");
            keys.insert(record.fingerprint.clone(), record.clone());
            imported.push(record);
        }
        Ok(imported)
    }

    async fn export(&self, fingerprint: &Fingerprint) -> Result<String, DomainError> {
        let keys = self.keys.read().await;
        let record = keys.get(fingerprint).ok_or_else(|| {
            DomainError::new(ErrorCode::NotFound, format!("no key {fingerprint}"))
        })?;
        armor::encode(Label::PublicKey, &KeyBody::from(record))
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, DomainError> {
        Ok(self.keys.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn key_block(label: Label, fingerprint: &str, user_id: &str) -> String {
        armor::encode(
            label,
            &KeyBody {
                fingerprint: Fingerprint::from(fingerprint),
                user_ids: vec![user_id.to_string()],
                created_at: Utc::now(),
            },
        )
        .expect("armor")
    }

    #[tokio::test]
    async fn import_then_lookup_by_fingerprint_and_address() {
        let store = InMemoryKeyStore::new();
        let imported = store
            .import(&key_block(Label::PublicKey, "AA", "Alice <alice@example.org>"))
            .await
            .expect("import");
        assert_eq!(imported.len(), 1);
        assert!(!imported[0].private);

        let by_fingerprint = store
            .lookup(&KeyQuery::Fingerprint(Fingerprint::from("AA")))
            .await
            .expect("lookup");
        assert_eq!(by_fingerprint, Some(imported[0].clone()));

        let by_address = store
            .lookup(&KeyQuery::Address("ALICE@example.org".into()))
            .await
            .expect("lookup");
        assert_eq!(by_address.map(|r| r.fingerprint), Some(Fingerprint::from("AA")));
    }

    #[tokio::test]
    async fn public_reimport_keeps_private_flag() {
        let store = InMemoryKeyStore::new();
        store
            .import(&key_block(Label::PrivateKey, "BB", "bob@example.org"))
            .await
            .expect("private");
        let again = store
            .import(&key_block(Label::PublicKey, "BB", "bob@example.org"))
            .await
            .expect("public");
        assert!(again[0].private);
    }

    #[tokio::test]
    async fn import_without_key_blocks_fails() {
        let err = InMemoryKeyStore::new()
            .import("just some text")
            .await
            .expect_err("nothing to import");
        assert_eq!(err.code, ErrorCode::ImportFailed);
    }

    #[tokio::test]
    async fn export_round_trips_through_import() {
        let source = InMemoryKeyStore::new();
        source
            .import(&key_block(Label::PrivateKey, "CC", "carol@example.org"))
            .await
            .expect("import");
        let exported = source
            .export(&Fingerprint::from("CC"))
            .await
            .expect("export");

        let target = InMemoryKeyStore::new();
        let imported = target.import(&exported).await.expect("import");
        assert_eq!(imported[0].fingerprint, Fingerprint::from("CC"));
        assert!(!imported[0].private, "export only carries the public part");
    }

    #[tokio::test]
    async fn export_unknown_key_is_not_found() {
        let err = InMemoryKeyStore::new()
            .export(&Fingerprint::from("ZZ"))
            .await
            .expect_err("unknown");
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
