use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use messaging::RouterError;
use serde_json::Value;
use shared::{error::DomainError, protocol::Event};
use tracing::debug;

use crate::{
    controller::{Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    services::Services,
};

/// Main content script endpoint, shared by every tab under one fixed name.
pub struct MainContentController {
    core: Arc<ControllerCore>,
    services: Services,
    ready: AtomicUsize,
}

impl MainContentController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
            ready: AtomicUsize::new(0),
        }
    }

    /// Number of `ready` announcements received so far.
    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Relaxed)
    }

    fn watch_list(&self) -> Result<Value, DomainError> {
        Ok(serde_json::to_value(self.services.watch_list.as_ref())?)
    }

    async fn ready(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let count = self.ready.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(endpoint = %self.core.name(), port = %inbound.port, count, "content script ready");
        self.watch_list()
    }

    async fn get_watch_list(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        self.watch_list()
    }
}

impl Controller for MainContentController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table
            .on(Event::Ready, Self::ready)?
            .on(Event::GetWatchList, Self::get_watch_list)?;
        Ok(())
    }
}
