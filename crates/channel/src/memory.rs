use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use shared::{domain::EndpointName, protocol::Envelope};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::{Channel, ChannelError, ChannelHost, SurfaceOpener};

pub type Incoming = mpsc::UnboundedReceiver<Arc<dyn Channel>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by both ends of one in-process channel.
struct Link {
    name: String,
    // Index 0 feeds the accepting end, index 1 feeds the connecting end.
    senders: Mutex<[Option<mpsc::UnboundedSender<Envelope>>; 2]>,
    closed: watch::Sender<bool>,
    ready: watch::Sender<bool>,
}

impl Link {
    fn close(&self) {
        let was_open = {
            let mut senders = lock(&self.senders);
            let was_open = senders.iter().any(Option::is_some);
            *senders = [None, None];
            was_open
        };
        if was_open {
            debug!(channel = %self.name, "memory channel disconnected");
        }
        self.closed.send_replace(true);
    }
}

/// One end of an in-process channel. Dropping an end disconnects the channel.
pub struct MemoryChannel {
    link: Arc<Link>,
    writes_to: usize,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl MemoryChannel {
    /// Two connected ends `(connecting, accepting)` named `name`.
    pub fn pair(name: &str, ready: bool) -> (Arc<Self>, Arc<Self>) {
        let (to_accepting, accepting_rx) = mpsc::unbounded_channel();
        let (to_connecting, connecting_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let (ready, _) = watch::channel(ready);
        let link = Arc::new(Link {
            name: name.to_string(),
            senders: Mutex::new([Some(to_accepting), Some(to_connecting)]),
            closed,
            ready,
        });
        let connecting = Arc::new(Self {
            link: Arc::clone(&link),
            writes_to: 0,
            inbound: Mutex::new(Some(connecting_rx)),
        });
        let accepting = Arc::new(Self {
            link,
            writes_to: 1,
            inbound: Mutex::new(Some(accepting_rx)),
        });
        (connecting, accepting)
    }

    pub fn mark_ready(&self) {
        self.link.ready.send_replace(true);
    }
}

impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.link.name
    }

    fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let senders = lock(&self.link.senders);
        senders[self.writes_to]
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.link.name.clone()))?
            .send(envelope)
            .map_err(|_| ChannelError::Closed(self.link.name.clone()))
    }

    fn take_inbound(&self) -> Result<BoxStream<'static, Envelope>, ChannelError> {
        let receiver = lock(&self.inbound)
            .take()
            .ok_or_else(|| ChannelError::InboundTaken(self.link.name.clone()))?;
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.link.closed.subscribe()
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.link.ready.subscribe()
    }

    fn disconnect(&self) {
        self.link.close();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.link.close();
    }
}

/// In-process host: hands the accepting end of every connection to one listener
/// and relays surface-open requests to whoever plays the UI side.
pub struct MemoryHost {
    listener: mpsc::UnboundedSender<Arc<dyn Channel>>,
    surfaces: broadcast::Sender<EndpointName>,
}

impl MemoryHost {
    pub fn new() -> (Arc<Self>, Incoming) {
        let (listener, incoming) = mpsc::unbounded_channel();
        let (surfaces, _) = broadcast::channel(64);
        (
            Arc::new(Self {
                listener,
                surfaces,
            }),
            incoming,
        )
    }

    pub fn connect_memory(&self, name: &str) -> Result<Arc<MemoryChannel>, ChannelError> {
        self.open(name, true)
    }

    /// Connects a channel that buffers on both ends until [`MemoryChannel::mark_ready`].
    pub fn connect_deferred(&self, name: &str) -> Result<Arc<MemoryChannel>, ChannelError> {
        self.open(name, false)
    }

    pub fn subscribe_surfaces(&self) -> broadcast::Receiver<EndpointName> {
        self.surfaces.subscribe()
    }

    fn open(&self, name: &str, ready: bool) -> Result<Arc<MemoryChannel>, ChannelError> {
        let (connecting, accepting) = MemoryChannel::pair(name, ready);
        let accepting: Arc<dyn Channel> = accepting;
        self.listener
            .send(accepting)
            .map_err(|_| ChannelError::NoListener(name.to_string()))?;
        Ok(connecting)
    }
}

impl ChannelHost for MemoryHost {
    fn connect(&self, name: &str) -> Result<Arc<dyn Channel>, ChannelError> {
        let channel: Arc<dyn Channel> = self.connect_memory(name)?;
        Ok(channel)
    }
}

#[async_trait]
impl SurfaceOpener for MemoryHost {
    async fn open_surface(&self, name: &EndpointName) -> anyhow::Result<()> {
        let observers = self.surfaces.send(name.clone()).unwrap_or(0);
        debug!(surface = %name, observers, "surface open requested");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
