use std::sync::Arc;

use messaging::RouterError;
use serde_json::Value;
use shared::{
    error::DomainError,
    protocol::{ArmoredPayload, Event},
};
use tracing::debug;

use crate::{
    controller::{Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    services::Services,
};

/// Verify frame: checks inline-signed text found in a page.
pub struct VerifyController {
    core: Arc<ControllerCore>,
    services: Services,
}

impl VerifyController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
        }
    }

    async fn verify_inline_sig(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let ArmoredPayload { armored } = inbound.payload()?;
        let verified = self.services.crypto.verify(&armored).await?;
        debug!(
            endpoint = %self.core.name(),
            signers = verified.signers.len(),
            "inline signature checked"
        );
        let payload = serde_json::to_value(&verified)?;
        self.core
            .emit_on(inbound.port, Event::VerifiedMessage, payload.clone())?;
        Ok(payload)
    }
}

impl Controller for VerifyController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table.on(Event::VerifyInlineSig, Self::verify_inline_sig)?;
        Ok(())
    }
}
