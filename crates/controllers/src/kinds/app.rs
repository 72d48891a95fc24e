use std::sync::Arc;

use messaging::RouterError;
use serde_json::Value;
use shared::{
    error::DomainError,
    protocol::{Event, Preferences},
};
use tracing::debug;

use crate::{
    controller::{Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    services::Services,
};

/// Options and key management application.
pub struct AppController {
    core: Arc<ControllerCore>,
    services: Services,
}

impl AppController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
        }
    }

    async fn version(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        Ok(Value::String(self.services.version.clone()))
    }

    async fn all_key_data(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        let keys = self.services.keys.list().await?;
        Ok(serde_json::to_value(keys)?)
    }

    async fn prefs(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        let preferences = self.services.preferences.read().await.clone();
        Ok(serde_json::to_value(preferences)?)
    }

    /// Merges the given entries; a `null` value removes the entry.
    async fn set_prefs(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let Preferences(update) = inbound.payload()?;
        let mut preferences = self.services.preferences.write().await;
        for (key, value) in update {
            if value.is_null() {
                preferences.0.remove(&key);
            } else {
                preferences.0.insert(key, value);
            }
        }
        debug!(endpoint = %self.core.name(), entries = preferences.0.len(), "preferences updated");
        Ok(serde_json::to_value(&*preferences)?)
    }
}

impl Controller for AppController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table
            .on(Event::GetVersion, Self::version)?
            .on(Event::GetAllKeyData, Self::all_key_data)?
            .on(Event::GetPrefs, Self::prefs)?
            .on(Event::SetPrefs, Self::set_prefs)?;
        Ok(())
    }
}
