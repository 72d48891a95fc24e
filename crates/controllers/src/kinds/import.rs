use std::sync::Arc;

use messaging::RouterError;
use serde_json::{json, Value};
use shared::{
    error::{DomainError, ReplyError},
    protocol::{ArmoredPayload, Event, ImportedPayload},
};
use tracing::{info, warn};

use crate::{
    controller::{Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    services::Services,
};

/// Import frame: imports key blocks found in a page.
pub struct ImportController {
    core: Arc<ControllerCore>,
    services: Services,
}

impl ImportController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
        }
    }

    /// Reports the outcome with `import-done` or `import-error`. A failed
    /// notification is not also reported as `error-message`.
    async fn armored_key(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let ArmoredPayload { armored } = inbound.payload()?;
        match self.services.keys.import(&armored).await {
            Ok(keys) => {
                info!(endpoint = %self.core.name(), count = keys.len(), "keys imported");
                let payload = serde_json::to_value(ImportedPayload { keys })?;
                self.core
                    .emit_on(inbound.port, Event::ImportDone, payload.clone())?;
                Ok(payload)
            }
            Err(err) => {
                warn!(endpoint = %self.core.name(), code = %err.code, "key import failed");
                self.core.emit_on(
                    inbound.port,
                    Event::ImportError,
                    json!({ "error": ReplyError::from(err.clone()) }),
                )?;
                if inbound.is_request() {
                    Err(err)
                } else {
                    Ok(Value::Null)
                }
            }
        }
    }
}

impl Controller for ImportController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table.on(Event::ImframeArmoredKey, Self::armored_key)?;
        Ok(())
    }
}
