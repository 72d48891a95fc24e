use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use channel::{Channel, ChannelHost};
use futures::{stream::BoxStream, StreamExt};
use serde_json::Value;
use shared::{
    domain::{CorrelationId, EndpointName},
    error::ReplyError,
    protocol::{Envelope, Event},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::{pending::PendingTable, PendingReply, RouterError};

pub type Subscriber = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Items for the writer task; a disconnect is queued behind everything accepted before it.
enum Outbound {
    Envelope(Envelope),
    Disconnect,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Typed-event layer over exactly one channel.
///
/// Cloning yields another handle to the same handler. Outbound envelopes go
/// through a single queue, so emits, requests and replies reach the peer in the
/// order they were issued, and are held back until the channel reports ready.
#[derive(Clone)]
pub struct EventHandler {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    group: String,
    channel: Arc<dyn Channel>,
    subscribers: Mutex<HashMap<Event, Vec<Subscriber>>>,
    pending: PendingTable,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: AtomicBool,
    closed: watch::Sender<bool>,
}

impl EventHandler {
    /// Binds `channel`, sending as `sender`. Fails if the channel already has a handler.
    pub fn new(channel: Arc<dyn Channel>, sender: impl Into<String>) -> Result<Self, RouterError> {
        let inbound = channel
            .take_inbound()
            .map_err(|_| RouterError::ChannelAlreadyBound(channel.name().to_string()))?;
        let name = sender.into();
        let group = EndpointName::parse(&name)
            .map(|endpoint| endpoint.kind_tag().to_string())
            .unwrap_or_else(|_| name.clone());
        let (outbound, queue) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            name,
            group,
            channel: Arc::clone(&channel),
            subscribers: Mutex::new(HashMap::new()),
            pending: PendingTable::default(),
            outbound,
            closing: AtomicBool::new(false),
            closed,
        });

        tokio::spawn(write_loop(channel, queue));
        tokio::spawn(read_loop(Arc::clone(&shared), inbound));

        Ok(Self { shared })
    }

    /// Opens a channel named `name` through `host` and binds it under the same name.
    pub fn connect(host: &dyn ChannelHost, name: &str) -> Result<Self, RouterError> {
        let channel = host.connect(name)?;
        Self::new(channel, name)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn channel_name(&self) -> &str {
        self.shared.channel.name()
    }

    /// Adds `subscriber` for `event`; earlier subscribers for the same event run first.
    pub fn on<F>(&self, event: Event, subscriber: F) -> Result<(), RouterError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        ensure_event(&event)?;
        lock(&self.shared.subscribers)
            .entry(event)
            .or_default()
            .push(Arc::new(subscriber));
        Ok(())
    }

    /// Subscribes to `event` and yields matching envelopes as a queue.
    pub fn subscribe(&self, event: Event) -> Result<mpsc::UnboundedReceiver<Envelope>, RouterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on(event, move |envelope| {
            let _ = tx.send(envelope.clone());
        })?;
        Ok(rx)
    }

    pub fn emit(&self, event: Event, data: Value) -> Result<(), RouterError> {
        self.post(Envelope::notification(event, data, &self.shared.name))
    }

    /// Like [`emit`](Self::emit) but restricted to the endpoints of `group`.
    pub fn emit_to(&self, group: &str, event: Event, data: Value) -> Result<(), RouterError> {
        self.post(Envelope::notification(event, data, &self.shared.name).addressed_to(group))
    }

    /// Sends a request and returns a handle that resolves with the peer's reply.
    pub fn send(&self, event: Event, data: Value) -> Result<PendingReply, RouterError> {
        ensure_event(&event)?;
        let id = CorrelationId::random();
        let receiver = self.shared.pending.register(id.clone(), self.channel_name())?;
        let envelope = Envelope::request(event.clone(), data, &self.shared.name, id.clone());
        if let Err(err) = self.post(envelope) {
            drop(self.shared.pending.take(&id));
            return Err(err);
        }
        Ok(PendingReply::new(
            id,
            event,
            self.channel_name().to_string(),
            receiver,
        ))
    }

    pub fn reply(
        &self,
        id: CorrelationId,
        event: Event,
        outcome: Result<Value, ReplyError>,
    ) -> Result<(), RouterError> {
        self.post(Envelope::reply(event, id, outcome, &self.shared.name))
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
            || *self.shared.closed.borrow()
            || !self.shared.channel.is_open()
    }

    /// Resolves once the channel is gone and every pending request has been rejected.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Closes the channel after every envelope already accepted for send has
    /// been written. Later `emit`/`send`/`reply` calls fail with `ChannelClosed`.
    pub fn disconnect(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let ready = *self.shared.channel.ready().borrow();
        // A channel that never became ready has nothing in flight to flush.
        if !ready || self.shared.outbound.send(Outbound::Disconnect).is_err() {
            self.shared.channel.disconnect();
        }
    }

    fn post(&self, envelope: Envelope) -> Result<(), RouterError> {
        ensure_event(&envelope.event)?;
        if self.is_closed() {
            return Err(RouterError::ChannelClosed(self.channel_name().to_string()));
        }
        self.shared
            .outbound
            .send(Outbound::Envelope(envelope))
            .map_err(|_| RouterError::ChannelClosed(self.channel_name().to_string()))
    }
}

fn ensure_event(event: &Event) -> Result<(), RouterError> {
    if event.is_empty() {
        return Err(RouterError::InvalidArgument(
            "event name must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl Shared {
    fn dispatch(&self, mut envelope: Envelope) {
        if envelope.is_reply() {
            let resolver = envelope.id.as_ref().and_then(|id| self.pending.take(id));
            match resolver {
                Some(resolver) => {
                    let outcome = match envelope.error.take() {
                        Some(error) => Err(RouterError::Remote(error)),
                        None => Ok(envelope.result.take().unwrap_or(Value::Null)),
                    };
                    let _ = resolver.send(outcome);
                }
                None => warn!(
                    endpoint = %self.name,
                    event = %envelope.event,
                    sender = %envelope.sender,
                    "discarding stale reply with no pending request"
                ),
            }
            return;
        }

        if let Some(to) = envelope.to.as_deref() {
            if to != self.group && to != self.name {
                debug!(
                    endpoint = %self.name,
                    event = %envelope.event,
                    to,
                    "discarding envelope addressed to another group"
                );
                return;
            }
        }

        let subscribers = lock(&self.subscribers)
            .get(&envelope.event)
            .cloned()
            .unwrap_or_default();
        if subscribers.is_empty() {
            warn!(
                endpoint = %self.name,
                event = %envelope.event,
                sender = %envelope.sender,
                "unhandled event"
            );
            return;
        }

        for subscriber in subscribers {
            if panic::catch_unwind(AssertUnwindSafe(|| subscriber(&envelope))).is_err() {
                error!(
                    endpoint = %self.name,
                    event = %envelope.event,
                    "subscriber panicked"
                );
            }
        }
    }

    fn shutdown(&self) {
        let rejected = self
            .pending
            .reject_all(RouterError::ChannelClosed(self.channel.name().to_string()));
        lock(&self.subscribers).clear();
        self.channel.disconnect();
        self.closed.send_replace(true);
        debug!(endpoint = %self.name, rejected, "event handler closed");
    }
}

async fn read_loop(shared: Arc<Shared>, mut inbound: BoxStream<'static, Envelope>) {
    let mut closed = shared.channel.closed();
    loop {
        tokio::select! {
            biased;
            next = inbound.next() => match next {
                Some(envelope) => shared.dispatch(envelope),
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        }
    }
    shared.shutdown();
}

async fn write_loop(channel: Arc<dyn Channel>, mut queue: mpsc::UnboundedReceiver<Outbound>) {
    let mut ready = channel.ready();
    let mut closed = channel.closed();
    let became_ready = tokio::select! {
        result = ready.wait_for(|ready| *ready) => result.is_ok(),
        _ = closed.wait_for(|closed| *closed) => false,
    };
    if !became_ready {
        debug!(channel = %channel.name(), "channel closed before it became ready");
        return;
    }

    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Envelope(envelope) => {
                if let Err(err) = channel.send(envelope) {
                    debug!(channel = %channel.name(), %err, "stopping writer");
                    break;
                }
            }
            Outbound::Disconnect => {
                channel.disconnect();
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/event_handler_tests.rs"]
mod tests;
