use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::Fingerprint,
    error::{DomainError, ErrorCode},
    protocol::{DecryptedPayload, SignaturePayload, VerifiedPayload},
};
use uuid::Uuid;

pub mod armor;

use armor::{KeyBody, Label, MessageBody};

const FINGERPRINT_LEN: usize = 40;

#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Fingerprints of the keys a message is encrypted to.
    async fn encryption_key_ids(&self, armored: &str) -> Result<Vec<Fingerprint>, DomainError>;
    async fn encrypt(
        &self,
        plaintext: &str,
        recipients: &[Fingerprint],
    ) -> Result<String, DomainError>;
    async fn decrypt(
        &self,
        armored: &str,
        key: &Fingerprint,
        password: &str,
    ) -> Result<DecryptedPayload, DomainError>;
    async fn sign(
        &self,
        plaintext: &str,
        signer: &Fingerprint,
        password: &str,
    ) -> Result<String, DomainError>;
    async fn verify(&self, armored: &str) -> Result<VerifiedPayload, DomainError>;
    /// Returns the armored private key block of a new key pair.
    async fn generate_key(
        &self,
        user_ids: &[String],
        passphrase: &str,
    ) -> Result<String, DomainError>;
}

fn unavailable() -> DomainError {
    DomainError::new(ErrorCode::Unavailable, "crypto backend unavailable")
}

pub struct MissingCryptoProvider;

#[async_trait]
impl CryptoProvider for MissingCryptoProvider {
    async fn encryption_key_ids(&self, _armored: &str) -> Result<Vec<Fingerprint>, DomainError> {
        Err(unavailable())
    }

    async fn encrypt(
        &self,
        _plaintext: &str,
        _recipients: &[Fingerprint],
    ) -> Result<String, DomainError> {
        Err(unavailable())
    }

    async fn decrypt(
        &self,
        _armored: &str,
        _key: &Fingerprint,
        _password: &str,
    ) -> Result<DecryptedPayload, DomainError> {
        Err(unavailable())
    }

    async fn sign(
        &self,
        _plaintext: &str,
        _signer: &Fingerprint,
        _password: &str,
    ) -> Result<String, DomainError> {
        Err(unavailable())
    }

    async fn verify(&self, _armored: &str) -> Result<VerifiedPayload, DomainError> {
        Err(unavailable())
    }

    async fn generate_key(
        &self,
        _user_ids: &[String],
        _passphrase: &str,
    ) -> Result<String, DomainError> {
        Err(unavailable())
    }
}

/// Reversible armor without real cryptography, for development hosts and tests.
///
/// Secret keys are represented by their passphrases; a key is usable for
/// decryption and signing only if this provider generated it or was told about
/// it through [`PassthroughCrypto::with_secret_key`].
#[derive(Default)]
pub struct PassthroughCrypto {
    secret_keys: Mutex<HashMap<Fingerprint, String>>,
}

impl PassthroughCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret_key(self, fingerprint: Fingerprint, passphrase: impl Into<String>) -> Self {
        self.secrets().insert(fingerprint, passphrase.into());
        self
    }

    fn secrets(&self) -> MutexGuard<'_, HashMap<Fingerprint, String>> {
        self.secret_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unlock(&self, key: &Fingerprint, password: &str, code: ErrorCode) -> Result<(), DomainError> {
        match self.secrets().get(key) {
            Some(passphrase) if passphrase == password => Ok(()),
            Some(_) => Err(DomainError::new(ErrorCode::KeyLocked, "wrong password")),
            None => Err(DomainError::new(
                code,
                format!("no secret key available for {key}"),
            )),
        }
    }

    fn signature(&self, signer: Option<Fingerprint>) -> Vec<SignaturePayload> {
        signer
            .map(|fingerprint| {
                let valid = self.secrets().contains_key(&fingerprint);
                vec![SignaturePayload { fingerprint, valid }]
            })
            .unwrap_or_default()
    }
}

fn new_fingerprint() -> Fingerprint {
    let mut hex = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
    .to_ascii_uppercase();
    hex.truncate(FINGERPRINT_LEN);
    Fingerprint(hex)
}

#[async_trait]
impl CryptoProvider for PassthroughCrypto {
    async fn encryption_key_ids(&self, armored: &str) -> Result<Vec<Fingerprint>, DomainError> {
        let body: MessageBody = armor::decode(Label::Message, armored, ErrorCode::DecryptFailed)?;
        Ok(body.recipients)
    }

    async fn encrypt(
        &self,
        plaintext: &str,
        recipients: &[Fingerprint],
    ) -> Result<String, DomainError> {
        if recipients.is_empty() {
            return Err(DomainError::new(
                ErrorCode::NoRecipients,
                "at least one recipient key is required",
            ));
        }
        armor::encode(
            Label::Message,
            &MessageBody {
                recipients: recipients.to_vec(),
                plaintext: plaintext.to_string(),
                signer: None,
            },
        )
    }

    async fn decrypt(
        &self,
        armored: &str,
        key: &Fingerprint,
        password: &str,
    ) -> Result<DecryptedPayload, DomainError> {
        let body: MessageBody = armor::decode(Label::Message, armored, ErrorCode::DecryptFailed)?;
        if !body.recipients.contains(key) {
            return Err(DomainError::new(
                ErrorCode::DecryptFailed,
                format!("message is not encrypted to {key}"),
            ));
        }
        self.unlock(key, password, ErrorCode::DecryptFailed)?;
        Ok(DecryptedPayload {
            signatures: self.signature(body.signer),
            plaintext: body.plaintext,
        })
    }

    async fn sign(
        &self,
        plaintext: &str,
        signer: &Fingerprint,
        password: &str,
    ) -> Result<String, DomainError> {
        self.unlock(signer, password, ErrorCode::EncryptFailed)?;
        armor::encode(
            Label::SignedMessage,
            &MessageBody {
                recipients: Vec::new(),
                plaintext: plaintext.to_string(),
                signer: Some(signer.clone()),
            },
        )
    }

    async fn verify(&self, armored: &str) -> Result<VerifiedPayload, DomainError> {
        let body: MessageBody =
            armor::decode(Label::SignedMessage, armored, ErrorCode::VerifyFailed)?;
        Ok(VerifiedPayload {
            signers: self.signature(body.signer),
            plaintext: body.plaintext,
        })
    }

    async fn generate_key(
        &self,
        user_ids: &[String],
        passphrase: &str,
    ) -> Result<String, DomainError> {
        if user_ids.is_empty() {
            return Err(DomainError::invalid("a key needs at least one user id"));
        }
        if passphrase.is_empty() {
            return Err(DomainError::invalid("passphrase must not be empty"));
        }
        let fingerprint = new_fingerprint();
        self.secrets()
            .insert(fingerprint.clone(), passphrase.to_string());
        armor::encode(
            Label::PrivateKey,
            &KeyBody {
                fingerprint,
                user_ids: user_ids.to_vec(),
                created_at: Utc::now(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encrypt_then_decrypt_with_generated_key() {
        let crypto = PassthroughCrypto::new();
        let key_block = crypto
            .generate_key(&["Alice <alice@example.org>".into()], "secret")
            .await
            .expect("key");
        let key: KeyBody =
            armor::decode(Label::PrivateKey, &key_block, ErrorCode::ImportFailed).expect("body");

        let armored = crypto
            .encrypt("hello", std::slice::from_ref(&key.fingerprint))
            .await
            .expect("encrypt");
        assert_eq!(
            crypto.encryption_key_ids(&armored).await.expect("ids"),
            vec![key.fingerprint.clone()]
        );

        let wrong = crypto
            .decrypt(&armored, &key.fingerprint, "nope")
            .await
            .expect_err("wrong password");
        assert_eq!(wrong.code, ErrorCode::KeyLocked);

        let decrypted = crypto
            .decrypt(&armored, &key.fingerprint, "secret")
            .await
            .expect("decrypt");
        assert_eq!(decrypted.plaintext, "hello");
    }

    #[tokio::test]
    async fn signatures_verify_only_for_known_signers() {
        let signer = Fingerprint::from("AAAA");
        let crypto = PassthroughCrypto::new().with_secret_key(signer.clone(), "pw");
        let signed = crypto.sign("text", &signer, "pw").await.expect("sign");

        let verified = crypto.verify(&signed).await.expect("verify");
        assert_eq!(verified.plaintext, "text");
        assert_eq!(
            verified.signers,
            vec![SignaturePayload {
                fingerprint: signer,
                valid: true
            }]
        );

        let stranger = PassthroughCrypto::new();
        let verified = stranger.verify(&signed).await.expect("verify");
        assert!(!verified.signers[0].valid);
    }

    #[tokio::test]
    async fn encrypt_requires_recipients() {
        let err = PassthroughCrypto::new()
            .encrypt("hello", &[])
            .await
            .expect_err("no recipients");
        assert_eq!(err.code, ErrorCode::NoRecipients);
    }

    #[tokio::test]
    async fn missing_provider_reports_unavailable() {
        let err = MissingCryptoProvider
            .verify("anything")
            .await
            .expect_err("unavailable");
        assert_eq!(err.code, ErrorCode::Unavailable);
    }
}
