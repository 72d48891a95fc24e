use std::sync::{Arc, Mutex};

use messaging::RouterError;
use serde_json::Value;
use shared::{
    error::DomainError,
    protocol::{Event, SyncPayload},
};
use tracing::{debug, info};

use crate::controller::{lock, Controller, ControllerContext, ControllerCore, HandlerTable, Inbound};

/// Keyring synchronisation endpoint. The background drives it; the peer
/// does the actual storage round trips.
pub struct SyncController {
    core: Arc<ControllerCore>,
    last_done: Mutex<Option<SyncPayload>>,
}

impl SyncController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            last_done: Mutex::new(None),
        }
    }

    /// Asks the peer to run one sync step of type `kind` and returns its result.
    pub async fn sync(&self, kind: &str, data: Value) -> Result<Value, DomainError> {
        let payload = serde_json::to_value(SyncPayload {
            kind: kind.to_string(),
            data,
        })?;
        debug!(endpoint = %self.core.name(), kind, "sync requested");
        let reply = self.core.request(Event::SyncEvent, payload)?;
        Ok(reply.await?)
    }

    pub fn last_done(&self) -> Option<SyncPayload> {
        lock(&self.last_done).clone()
    }

    async fn sync_done(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let done: SyncPayload = inbound.payload()?;
        info!(endpoint = %self.core.name(), kind = %done.kind, "sync finished");
        *lock(&self.last_done) = Some(done);
        Ok(Value::Null)
    }
}

impl Controller for SyncController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table.on(Event::SyncDone, Self::sync_done)?;
        Ok(())
    }
}
