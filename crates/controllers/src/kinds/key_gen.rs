use std::sync::Arc;

use messaging::RouterError;
use serde_json::Value;
use shared::{
    error::DomainError,
    protocol::{Event, ImportedPayload, KeyGenPayload},
};
use tracing::info;

use crate::{
    controller::{Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    services::Services,
};

pub struct KeyGenController {
    core: Arc<ControllerCore>,
    services: Services,
}

impl KeyGenController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
        }
    }

    async fn generate_key(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let KeyGenPayload {
            user_ids,
            passphrase,
        } = inbound.payload()?;
        let armored = self
            .services
            .crypto
            .generate_key(&user_ids, &passphrase)
            .await?;
        let keys = self.services.keys.import(&armored).await?;
        if let Some(key) = keys.first() {
            info!(endpoint = %self.core.name(), fingerprint = %key.fingerprint, "key pair generated");
        }
        Ok(serde_json::to_value(ImportedPayload { keys })?)
    }
}

impl Controller for KeyGenController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table.on(Event::GenerateKey, Self::generate_key)?;
        Ok(())
    }
}
