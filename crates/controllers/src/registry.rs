//! Routes inbound channels to controllers and owns their entries.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use channel::{Channel, Incoming};
use messaging::RouterError;
use serde::{Deserialize, Serialize};
use shared::domain::{ControllerKind, EndpointName};
use tracing::{debug, info, warn};

use crate::{
    controller::{lock, start, Controller, ControllerContext, ControllerHandle, Lifecycle},
    services::Services,
};

/// What happens when a channel connects under a name that already has a live controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Attach the new channel to the existing controller as another port.
    #[default]
    Reuse,
    /// Close the existing controller and build a fresh one for the new channel.
    Replace,
    /// Refuse the new channel and leave the existing controller untouched.
    #[serde(rename = "reject")]
    RejectDuplicate,
}

pub type Factory =
    Arc<dyn Fn(ControllerContext) -> Result<ControllerHandle, RouterError> + Send + Sync>;

#[derive(Clone)]
struct KindEntry {
    policy: DuplicatePolicy,
    factory: Factory,
}

struct RegistryInner {
    services: Services,
    kinds: RwLock<HashMap<ControllerKind, KindEntry>>,
    live: Mutex<HashMap<String, ControllerHandle>>,
    next_serial: AtomicU64,
}

/// Channel name to controller table plus the kind to factory table.
///
/// Cloning yields another handle to the same registry. Connection handling and
/// teardown each run as one step under the table lock, so no caller observes a
/// half-inserted entry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// Non-owning registry link held by controllers.
#[derive(Clone, Default)]
pub struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

impl Registry {
    pub fn new(services: Services) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                services,
                kinds: RwLock::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub fn register_kind<F>(
        &self,
        kind: ControllerKind,
        policy: DuplicatePolicy,
        factory: F,
    ) -> Result<(), RouterError>
    where
        F: Fn(ControllerContext) -> Result<ControllerHandle, RouterError> + Send + Sync + 'static,
    {
        let mut kinds = self
            .inner
            .kinds
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if kinds.contains_key(&kind) {
            return Err(RouterError::DuplicateKind(kind));
        }
        kinds.insert(
            kind,
            KindEntry {
                policy,
                factory: Arc::new(factory),
            },
        );
        debug!(%kind, ?policy, "controller kind registered");
        Ok(())
    }

    /// Registers a kind whose factory builds and starts a `C`.
    pub fn register_controller<C, F>(
        &self,
        kind: ControllerKind,
        policy: DuplicatePolicy,
        build: F,
    ) -> Result<(), RouterError>
    where
        C: Controller,
        F: Fn(ControllerContext) -> C + Send + Sync + 'static,
    {
        self.register_kind(kind, policy, move |context| {
            start(build(context)).map(ControllerHandle::new)
        })
    }

    pub fn policy(&self, kind: ControllerKind) -> Option<DuplicatePolicy> {
        self.kind_entry(kind).ok().map(|entry| entry.policy)
    }

    /// Routes `channel` to a controller according to its name and its kind's policy.
    ///
    /// A refused channel is disconnected and leaves the table untouched.
    pub fn handle_connection(
        &self,
        channel: Arc<dyn Channel>,
    ) -> Result<ControllerHandle, RouterError> {
        let mut retired = Vec::new();
        let outcome = self.route(Arc::clone(&channel), &mut retired);
        for controller in retired {
            controller.core().close();
        }
        match outcome {
            Ok(handle) => Ok(handle),
            Err(err) => {
                warn!(channel = %channel.name(), %err, "connection refused");
                channel.disconnect();
                Err(err)
            }
        }
    }

    fn route(
        &self,
        channel: Arc<dyn Channel>,
        retired: &mut Vec<ControllerHandle>,
    ) -> Result<ControllerHandle, RouterError> {
        let raw = channel.name().to_string();
        let name = EndpointName::parse(&raw)?;
        let kind = name.kind()?;
        let entry = self.kind_entry(kind)?;

        let mut live = lock(&self.inner.live);
        let existing = live
            .get(&raw)
            .filter(|handle| handle.state() != Lifecycle::Closed)
            .cloned();

        match existing {
            Some(existing) if existing.state() == Lifecycle::Unbound => {
                existing.core().attach(channel)?;
                info!(endpoint = %raw, "pre-registered endpoint bound");
                Ok(existing)
            }
            Some(existing) => match entry.policy {
                DuplicatePolicy::Reuse => {
                    existing.core().attach(channel)?;
                    info!(endpoint = %raw, ports = existing.core().port_count(), "controller reused");
                    Ok(existing)
                }
                DuplicatePolicy::RejectDuplicate => Err(RouterError::DuplicateEndpoint(raw)),
                DuplicatePolicy::Replace => {
                    let fresh = self.build(&entry, name, kind)?;
                    if let Err(err) = fresh.core().attach(channel) {
                        retired.push(fresh);
                        return Err(err);
                    }
                    live.insert(raw.clone(), fresh.clone());
                    retired.push(existing);
                    info!(endpoint = %raw, "controller replaced");
                    Ok(fresh)
                }
            },
            None => {
                let fresh = self.build(&entry, name, kind)?;
                if let Err(err) = fresh.core().attach(channel) {
                    retired.push(fresh);
                    return Err(err);
                }
                live.insert(raw.clone(), fresh.clone());
                info!(endpoint = %raw, %kind, "controller created");
                Ok(fresh)
            }
        }
    }

    /// Pre-registers a controller for a child endpoint whose channel has not connected yet.
    ///
    /// The first channel that connects under the returned name binds to it
    /// regardless of the kind's duplicate policy.
    pub fn spawn(&self, kind: ControllerKind) -> Result<ControllerHandle, RouterError> {
        let entry = self.kind_entry(kind)?;
        let name = EndpointName::random(kind);
        let mut live = lock(&self.inner.live);
        let handle = self.build(&entry, name.clone(), kind)?;
        live.insert(name.to_string(), handle.clone());
        info!(endpoint = %name, "child endpoint pre-registered");
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<ControllerHandle> {
        lock(&self.inner.live).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.live).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the entry for `name` if it still belongs to the controller with `serial`.
    pub(crate) fn release(&self, name: &EndpointName, serial: u64) {
        let key = name.to_string();
        let mut live = lock(&self.inner.live);
        let owned = live
            .get(&key)
            .is_some_and(|handle| handle.core().serial() == serial);
        if owned {
            live.remove(&key);
            debug!(endpoint = %key, remaining = live.len(), "registry entry removed");
        }
    }

    /// Closes every live controller and empties the table. Registered kinds stay.
    pub fn reset(&self) {
        let drained: Vec<ControllerHandle> = lock(&self.inner.live)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = drained.len();
        for handle in drained {
            handle.core().close();
        }
        info!(closed = count, "registry reset");
    }

    /// Accepts connections until the host stops delivering them.
    pub async fn serve(self, mut incoming: Incoming) {
        while let Some(channel) = incoming.recv().await {
            if let Ok(handle) = self.handle_connection(channel) {
                debug!(endpoint = %handle.name(), "connection routed");
            }
        }
        info!("listener closed, no more connections will be routed");
    }

    fn kind_entry(&self, kind: ControllerKind) -> Result<KindEntry, RouterError> {
        self.inner
            .kinds
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or_else(|| RouterError::UnknownControllerKind(kind.to_string()))
    }

    fn build(
        &self,
        entry: &KindEntry,
        name: EndpointName,
        kind: ControllerKind,
    ) -> Result<ControllerHandle, RouterError> {
        let context = ControllerContext {
            name,
            kind,
            services: self.inner.services.clone(),
            registry: self.downgrade(),
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
        };
        (entry.factory)(context)
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
