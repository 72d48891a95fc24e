use std::sync::{Arc, Mutex};

use keyring::KeyQuery;
use messaging::RouterError;
use serde_json::{json, Value};
use shared::{
    domain::Fingerprint,
    error::{DomainError, ErrorCode},
    protocol::{EncryptPayload, Event, KeyRecord, RecipientsPayload},
};
use tracing::{debug, info};

use super::password::request_password;
use crate::{
    controller::{lock, Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    registry::WeakRegistry,
    services::Services,
};

/// Preference naming the fingerprint used for signing.
pub const PRIMARY_KEY_PREF: &str = "primaryKey";

/// Encrypt frame: turns editor plaintext into armored text for the page.
pub struct EncryptController {
    core: Arc<ControllerCore>,
    services: Services,
    registry: WeakRegistry,
    recipients: Mutex<Vec<String>>,
}

impl EncryptController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
            registry: context.registry,
            recipients: Mutex::new(Vec::new()),
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        lock(&self.recipients).clone()
    }

    async fn set_recipients(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let RecipientsPayload { recipients } = inbound.payload()?;
        debug!(endpoint = %self.core.name(), count = recipients.len(), "recipients set");
        *lock(&self.recipients) = recipients;
        Ok(Value::Null)
    }

    async fn encrypt_message(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let EncryptPayload { plaintext, sign } = inbound.payload()?;

        let mut recipients = self.recipients();
        if recipients.is_empty() {
            // The frame knows the addresses typed by the user; ask it.
            let reply = self
                .core
                .request_on(inbound.port, Event::GetRecipients, Value::Null)?
                .await?;
            let RecipientsPayload { recipients: asked } = serde_json::from_value(reply)?;
            recipients = asked;
        }
        if recipients.is_empty() {
            return Err(DomainError::new(
                ErrorCode::NoRecipients,
                "no recipients to encrypt for",
            ));
        }

        let mut keys = Vec::with_capacity(recipients.len());
        for address in &recipients {
            let record = self
                .services
                .keys
                .lookup(&KeyQuery::Address(address.clone()))
                .await?
                .ok_or_else(|| {
                    DomainError::new(ErrorCode::NotFound, format!("no key for {address}"))
                })?;
            keys.push(record.fingerprint);
        }

        let content = if sign {
            self.signed(&plaintext).await?
        } else {
            plaintext
        };
        let armored = self.services.crypto.encrypt(&content, &keys).await?;
        info!(endpoint = %self.core.name(), recipients = keys.len(), signed = sign, "message encrypted");
        self.publish(&inbound, armored)
    }

    async fn sign_only(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let EncryptPayload { plaintext, .. } = inbound.payload()?;
        let armored = self.signed(&plaintext).await?;
        self.publish(&inbound, armored)
    }

    fn publish(&self, inbound: &Inbound, armored: String) -> Result<Value, DomainError> {
        let payload = json!({ "armored": armored });
        self.core
            .emit_on(inbound.port, Event::SetArmoredText, payload.clone())?;
        Ok(payload)
    }

    async fn signed(&self, plaintext: &str) -> Result<String, DomainError> {
        let signer = self.signing_key().await?;
        let password = request_password(
            &self.core,
            &self.services,
            &self.registry,
            &signer,
            "sign",
        )
        .await?;
        match self
            .services
            .crypto
            .sign(plaintext, &signer.fingerprint, &password)
            .await
        {
            Err(err) if err.code == ErrorCode::KeyLocked => {
                self.services.passwords.forget(&signer.fingerprint);
                Err(err)
            }
            outcome => outcome,
        }
    }

    /// The preferred primary key, or else the newest private key.
    async fn signing_key(&self) -> Result<KeyRecord, DomainError> {
        let preferred = self
            .services
            .preferences
            .read()
            .await
            .0
            .get(PRIMARY_KEY_PREF)
            .and_then(Value::as_str)
            .map(Fingerprint::from);
        if let Some(fingerprint) = preferred {
            let record = self
                .services
                .keys
                .lookup(&KeyQuery::Fingerprint(fingerprint))
                .await?;
            if let Some(record) = record.filter(|record| record.private) {
                return Ok(record);
            }
        }
        self.services
            .keys
            .list()
            .await?
            .into_iter()
            .filter(|record| record.private)
            .max_by_key(|record| record.created_at)
            .ok_or_else(|| DomainError::new(ErrorCode::NotFound, "no private key to sign with"))
    }
}

impl Controller for EncryptController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table
            .on(Event::EframeRecipients, Self::set_recipients)?
            .on(Event::EncryptMessage, Self::encrypt_message)?
            .on(Event::SignOnly, Self::sign_only)?;
        Ok(())
    }
}
