use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use channel::Channel;
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use messaging::{EventHandler, PendingReply, RouterError};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::{
    domain::{ControllerKind, CorrelationId, EndpointName},
    error::{DomainError, ReplyError},
    protocol::{Envelope, Event},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{registry::WeakRegistry, services::Services};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built, handler table installed, no channel attached yet.
    Unbound,
    Active,
    /// Terminal. A reconnect under the same name yields a fresh controller.
    Closed,
}

/// Identifies one channel attached to a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound envelope as seen by a controller handler.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub port: PortId,
    pub sender: String,
    pub data: Value,
    pub id: Option<CorrelationId>,
}

impl Inbound {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }
}

/// Everything a factory needs to build a controller for one endpoint.
#[derive(Clone)]
pub struct ControllerContext {
    pub name: EndpointName,
    pub kind: ControllerKind,
    pub services: Services,
    pub registry: WeakRegistry,
    pub(crate) serial: u64,
}

impl ControllerContext {
    /// Context for a controller that is not tracked by any registry.
    pub fn detached(kind: ControllerKind, services: Services) -> Self {
        Self {
            name: EndpointName::random(kind),
            kind,
            services,
            registry: WeakRegistry::default(),
            serial: 0,
        }
    }
}

type HandlerFuture = BoxFuture<'static, Result<Value, DomainError>>;
type Handler<C> = Arc<dyn Fn(Arc<C>, Inbound) -> HandlerFuture + Send + Sync>;

/// Maps each event a controller supports to exactly one async handler.
pub struct HandlerTable<C> {
    handlers: HashMap<Event, Handler<C>>,
}

impl<C: Send + Sync + 'static> HandlerTable<C> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `event`, replacing any earlier registration.
    pub fn on<F, Fut>(&mut self, event: Event, handler: F) -> Result<&mut Self, RouterError>
    where
        F: Fn(Arc<C>, Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
    {
        if event.is_empty() {
            return Err(RouterError::InvalidArgument(
                "event name must not be empty".to_string(),
            ));
        }
        let handler: Handler<C> = Arc::new(move |controller: Arc<C>, inbound: Inbound| {
            handler(controller, inbound).boxed()
        });
        self.handlers.insert(event, handler);
        Ok(self)
    }

    pub fn events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.handlers.keys().cloned().collect();
        events.sort();
        events
    }

    fn get(&self, event: &Event) -> Option<Handler<C>> {
        self.handlers.get(event).cloned()
    }
}

pub trait Controller: Send + Sync + Sized + 'static {
    fn core(&self) -> &Arc<ControllerCore>;

    /// Populates the handler table; runs once when the controller starts.
    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError>;
}

struct Port {
    id: PortId,
    handler: EventHandler,
}

struct Delivery {
    port: PortId,
    envelope: Envelope,
}

/// Lifecycle, ports and worker queue shared by every controller kind.
pub struct ControllerCore {
    name: EndpointName,
    kind: ControllerKind,
    serial: u64,
    registry: WeakRegistry,
    state: watch::Sender<Lifecycle>,
    ports: Mutex<Vec<Port>>,
    next_port: AtomicU64,
    queue: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    worker_queue: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    events: Mutex<Vec<Event>>,
    children: Mutex<Vec<Arc<ControllerCore>>>,
}

impl ControllerCore {
    pub fn new(context: &ControllerContext) -> Arc<Self> {
        let (queue, worker_queue) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(Lifecycle::Unbound);
        Arc::new(Self {
            name: context.name.clone(),
            kind: context.kind,
            serial: context.serial,
            registry: context.registry.clone(),
            state,
            ports: Mutex::new(Vec::new()),
            next_port: AtomicU64::new(1),
            queue: Mutex::new(Some(queue)),
            worker_queue: Mutex::new(Some(worker_queue)),
            events: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &EndpointName {
        &self.name
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == Lifecycle::Closed
    }

    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == Lifecycle::Closed).await;
    }

    pub fn port_count(&self) -> usize {
        lock(&self.ports).len()
    }

    /// Binds `channel` as another port of this controller.
    ///
    /// Every supported event arriving on the port is queued to the worker.
    pub fn attach(self: &Arc<Self>, channel: Arc<dyn Channel>) -> Result<PortId, RouterError> {
        let closed = || RouterError::ChannelClosed(self.name.to_string());
        let queue = lock(&self.queue).clone().ok_or_else(closed)?;

        let (port, handler) = {
            let mut ports = lock(&self.ports);
            if self.is_closed() {
                return Err(closed());
            }
            let handler = EventHandler::new(channel, self.name.to_string())?;
            let port = PortId(self.next_port.fetch_add(1, Ordering::Relaxed));
            for event in lock(&self.events).iter() {
                let queue = queue.clone();
                handler.on(event.clone(), move |envelope| {
                    let _ = queue.send(Delivery {
                        port,
                        envelope: envelope.clone(),
                    });
                })?;
            }
            ports.push(Port {
                id: port,
                handler: handler.clone(),
            });
            self.state.send_if_modified(|state| {
                let activate = *state == Lifecycle::Unbound;
                if activate {
                    *state = Lifecycle::Active;
                }
                activate
            });
            (port, handler)
        };

        info!(endpoint = %self.name, %port, "channel attached");
        let core = Arc::clone(self);
        tokio::spawn(async move {
            handler.closed().await;
            core.detach(port);
        });
        Ok(port)
    }

    /// Tears the controller down: disconnects every port, closes adopted
    /// children and removes the registry entry.
    pub fn close(&self) {
        let ports = {
            let mut ports = lock(&self.ports);
            if self.state.send_replace(Lifecycle::Closed) == Lifecycle::Closed {
                return;
            }
            std::mem::take(&mut *ports)
        };
        self.finish_close(ports);
    }

    /// Ties `child` to this controller's lifetime.
    pub fn adopt(&self, child: &Arc<ControllerCore>) {
        lock(&self.children).push(Arc::clone(child));
    }

    /// Notifies every attached port.
    pub fn emit(&self, event: Event, data: Value) -> Result<(), RouterError> {
        let handlers = self.handlers();
        let mut failure = RouterError::ChannelClosed(self.name.to_string());
        let mut delivered = false;
        for handler in handlers {
            match handler.emit(event.clone(), data.clone()) {
                Ok(()) => delivered = true,
                Err(err) => failure = err,
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(failure)
        }
    }

    pub fn emit_on(&self, port: PortId, event: Event, data: Value) -> Result<(), RouterError> {
        self.port(port)?.emit(event, data)
    }

    /// Sends a request on the earliest attached port that is still open.
    pub fn request(&self, event: Event, data: Value) -> Result<PendingReply, RouterError> {
        let handler = self
            .handlers()
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::ChannelClosed(self.name.to_string()))?;
        handler.send(event, data)
    }

    pub fn request_on(
        &self,
        port: PortId,
        event: Event,
        data: Value,
    ) -> Result<PendingReply, RouterError> {
        self.port(port)?.send(event, data)
    }

    fn handlers(&self) -> Vec<EventHandler> {
        lock(&self.ports)
            .iter()
            .map(|port| port.handler.clone())
            .collect()
    }

    fn port(&self, port: PortId) -> Result<EventHandler, RouterError> {
        lock(&self.ports)
            .iter()
            .find(|candidate| candidate.id == port)
            .map(|candidate| candidate.handler.clone())
            .ok_or_else(|| RouterError::ChannelClosed(format!("{} port {port}", self.name)))
    }

    fn install(&self, events: Vec<Event>) -> Result<mpsc::UnboundedReceiver<Delivery>, RouterError> {
        *lock(&self.events) = events;
        lock(&self.worker_queue).take().ok_or_else(|| {
            RouterError::InvalidArgument(format!("controller {} already started", self.name))
        })
    }

    fn detach(&self, port: PortId) {
        let last = {
            let mut ports = lock(&self.ports);
            ports.retain(|candidate| candidate.id != port);
            ports.is_empty() && self.state.send_replace(Lifecycle::Closed) != Lifecycle::Closed
        };
        debug!(endpoint = %self.name, %port, "channel detached");
        if last {
            self.finish_close(Vec::new());
        }
    }

    fn finish_close(&self, ports: Vec<Port>) {
        lock(&self.queue).take();
        for port in ports {
            port.handler.disconnect();
        }
        let children = std::mem::take(&mut *lock(&self.children));
        for child in children {
            child.close();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.name, self.serial);
        }
        info!(endpoint = %self.name, kind = %self.kind, "controller closed");
    }

    /// Turns a handler outcome into a reply or an `error-message` notification.
    fn settle(
        &self,
        port: PortId,
        event: Event,
        id: Option<CorrelationId>,
        outcome: Result<Value, DomainError>,
    ) {
        if let Err(err) = &outcome {
            warn!(endpoint = %self.name, %event, code = %err.code, "handler failed: {}", err.message);
        }
        let handler = match self.port(port) {
            Ok(handler) => handler,
            Err(_) => {
                debug!(endpoint = %self.name, %event, %port, "port gone before the handler finished");
                return;
            }
        };
        let delivered = match (id, outcome) {
            (Some(id), outcome) => handler.reply(id, event, outcome.map_err(ReplyError::from)),
            (None, Ok(_)) => Ok(()),
            (None, Err(err)) => handler.emit(
                Event::ErrorMessage,
                json!({ "event": event.as_str(), "error": ReplyError::from(err) }),
            ),
        };
        if let Err(err) = delivered {
            debug!(endpoint = %self.name, %err, "could not deliver handler outcome");
        }
    }
}

/// Installs the controller's handler table and spawns its worker.
pub fn start<C: Controller>(controller: C) -> Result<Arc<C>, RouterError> {
    let mut table = HandlerTable::new();
    C::register(&mut table)?;
    let controller = Arc::new(controller);
    let queue = controller.core().install(table.events())?;
    tokio::spawn(run_worker(Arc::clone(&controller), table, queue));
    Ok(controller)
}

/// Starts handlers in arrival order and lets them run side by side, so one
/// handler awaiting a reply or a collaborator never holds up the next envelope.
async fn run_worker<C: Controller>(
    controller: Arc<C>,
    table: HandlerTable<C>,
    mut queue: mpsc::UnboundedReceiver<Delivery>,
) {
    let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    loop {
        tokio::select! {
            delivery = queue.recv() => match delivery {
                Some(delivery) => {
                    if let Some(task) = dispatch(&controller, &table, delivery) {
                        running.push(task);
                    }
                }
                None => break,
            },
            Some(()) = running.next(), if !running.is_empty() => {}
        }
    }
    while running.next().await.is_some() {}
    debug!(endpoint = %controller.core().name(), "controller worker stopped");
}

fn dispatch<C: Controller>(
    controller: &Arc<C>,
    table: &HandlerTable<C>,
    Delivery { port, envelope }: Delivery,
) -> Option<BoxFuture<'static, ()>> {
    let core = Arc::clone(controller.core());
    let Some(handler) = table.get(&envelope.event) else {
        warn!(endpoint = %core.name(), event = %envelope.event, "no handler registered");
        return None;
    };
    let id = if envelope.is_request() {
        envelope.id.clone()
    } else {
        None
    };
    let event = envelope.event;
    let inbound = Inbound {
        port,
        sender: envelope.sender,
        data: envelope.data,
        id: id.clone(),
    };
    let handled = AssertUnwindSafe(handler(Arc::clone(controller), inbound)).catch_unwind();
    Some(
        async move {
            let outcome = match handled.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(endpoint = %core.name(), %event, "handler panicked");
                    Err(DomainError::internal(format!("handler for '{event}' panicked")))
                }
            };
            core.settle(port, event, id, outcome);
        }
        .boxed(),
    )
}

/// Type-erased reference to a running controller, as stored by the registry.
#[derive(Clone)]
pub struct ControllerHandle {
    core: Arc<ControllerCore>,
    instance: Arc<dyn Any + Send + Sync>,
}

impl ControllerHandle {
    pub fn new<C: Controller>(controller: Arc<C>) -> Self {
        Self {
            core: Arc::clone(controller.core()),
            instance: controller,
        }
    }

    pub fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    pub fn name(&self) -> &EndpointName {
        self.core.name()
    }

    pub fn kind(&self) -> ControllerKind {
        self.core.kind()
    }

    pub fn state(&self) -> Lifecycle {
        self.core.state()
    }

    pub fn downcast<C: Controller>(&self) -> Option<Arc<C>> {
        Arc::clone(&self.instance).downcast::<C>().ok()
    }

    pub fn same_as(&self, other: &ControllerHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("name", &self.core.name().to_string())
            .field("state", &self.core.state())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
