use std::sync::Arc;

use messaging::RouterError;
use serde_json::{json, Value};
use shared::{
    domain::{ControllerKind, EndpointName},
    error::{DomainError, ErrorCode},
    protocol::{BrowserActionPayload, Event},
};
use tracing::info;

use crate::{
    controller::{Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    services::Services,
};

/// Toolbar popup. Each action opens the surface that handles it.
pub struct MenuController {
    core: Arc<ControllerCore>,
    services: Services,
}

fn surface_for(action: &str) -> Option<ControllerKind> {
    match action {
        "options" | "manage-keys" | "setup" | "import-key" => Some(ControllerKind::App),
        "generate-key" => Some(ControllerKind::KeyGenDialog),
        _ => None,
    }
}

impl MenuController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
        }
    }

    async fn browser_action(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let BrowserActionPayload { action } = inbound.payload()?;
        let kind = surface_for(&action).ok_or_else(|| {
            DomainError::new(
                ErrorCode::UnknownAction,
                format!("unknown browser action '{action}'"),
            )
        })?;
        let surface = EndpointName::random(kind);
        self.services
            .surfaces
            .open_surface(&surface)
            .await
            .map_err(|err| DomainError::new(ErrorCode::Unavailable, format!("{err:#}")))?;
        info!(endpoint = %self.core.name(), %action, %surface, "surface opened");
        Ok(json!({ "action": action, "opened": surface.to_string() }))
    }
}

impl Controller for MenuController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table.on(Event::BrowserAction, Self::browser_action)?;
        Ok(())
    }
}
