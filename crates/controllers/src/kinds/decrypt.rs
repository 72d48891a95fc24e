use std::sync::{Arc, Mutex};

use keyring::KeyQuery;
use messaging::RouterError;
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::Fingerprint,
    error::{DomainError, ErrorCode},
    protocol::{ArmoredPayload, Event, KeyRecord},
};
use tracing::debug;

use super::password::request_password;
use crate::{
    controller::{lock, Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    registry::WeakRegistry,
    services::Services,
};

#[derive(Debug, Default, Deserialize)]
struct DecryptRequest {
    #[serde(default)]
    armored: Option<String>,
}

/// Decrypt frame: holds the armored message shown in a page and decrypts it on demand.
pub struct DecryptController {
    core: Arc<ControllerCore>,
    services: Services,
    registry: WeakRegistry,
    armored: Mutex<Option<String>>,
}

impl DecryptController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
            registry: context.registry,
            armored: Mutex::new(None),
        }
    }

    pub fn armored(&self) -> Option<String> {
        lock(&self.armored).clone()
    }

    async fn set_armored(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let ArmoredPayload { armored } = inbound.payload()?;
        if armored.trim().is_empty() {
            return Err(DomainError::invalid("armored text must not be empty"));
        }
        debug!(endpoint = %self.core.name(), bytes = armored.len(), "armored message set");
        *lock(&self.armored) = Some(armored);
        Ok(Value::Null)
    }

    async fn decrypt_message(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let request: DecryptRequest = if inbound.data.is_null() {
            DecryptRequest::default()
        } else {
            inbound.payload()?
        };
        let armored = request
            .armored
            .or_else(|| self.armored())
            .ok_or_else(|| DomainError::invalid("no armored message to decrypt"))?;

        let key_ids = self.services.crypto.encryption_key_ids(&armored).await?;
        let key = self.secret_key(&key_ids).await?;
        let password = request_password(
            &self.core,
            &self.services,
            &self.registry,
            &key,
            "decrypt",
        )
        .await?;

        let decrypted = match self
            .services
            .crypto
            .decrypt(&armored, &key.fingerprint, &password)
            .await
        {
            Err(err) if err.code == ErrorCode::KeyLocked => {
                self.services.passwords.forget(&key.fingerprint);
                return Err(err);
            }
            outcome => outcome?,
        };

        let payload = serde_json::to_value(&decrypted)?;
        self.core
            .emit_on(inbound.port, Event::DecryptedMessage, payload.clone())?;
        Ok(payload)
    }

    /// First private key among the message's recipients.
    async fn secret_key(&self, key_ids: &[Fingerprint]) -> Result<KeyRecord, DomainError> {
        for fingerprint in key_ids {
            let found = self
                .services
                .keys
                .lookup(&KeyQuery::Fingerprint(fingerprint.clone()))
                .await?;
            if let Some(record) = found.filter(|record| record.private) {
                return Ok(record);
            }
        }
        Err(DomainError::new(
            ErrorCode::DecryptFailed,
            "no private key for any recipient of this message",
        ))
    }
}

impl Controller for DecryptController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table
            .on(Event::SetArmored, Self::set_armored)?
            .on(Event::DecryptMessage, Self::decrypt_message)?;
        Ok(())
    }
}
