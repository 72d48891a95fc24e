//! Host-supplied two-party channels.
//!
//! The routing core consumes channels through [`Channel`] and never re-implements
//! them. Implementations must deliver envelopes in order and at most once per
//! direction while open, make a disconnect observable by both ends, and treat a
//! send after disconnect as a reported error rather than a crash.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{domain::EndpointName, protocol::Envelope};
use thiserror::Error;
use tokio::sync::watch;

mod memory;

pub use memory::{Incoming, MemoryChannel, MemoryHost};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel '{0}' is closed")]
    Closed(String),
    #[error("inbound side of channel '{0}' is already taken")]
    InboundTaken(String),
    #[error("no listener accepts connections for '{0}'")]
    NoListener(String),
}

pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, envelope: Envelope) -> Result<(), ChannelError>;

    /// Inbound envelopes in arrival order; the stream ends on disconnect.
    ///
    /// Can be taken once, which is what keeps a channel to a single event handler.
    fn take_inbound(&self) -> Result<BoxStream<'static, Envelope>, ChannelError>;

    /// Flips to `true` once either party disconnects.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Flips to `true` once the host reports the channel usable.
    fn ready(&self) -> watch::Receiver<bool>;

    fn disconnect(&self);

    fn is_open(&self) -> bool {
        !*self.closed().borrow()
    }
}

pub trait ChannelHost: Send + Sync {
    fn connect(&self, name: &str) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// Asks the host to open a UI surface that will connect back under `name`.
#[async_trait]
pub trait SurfaceOpener: Send + Sync {
    async fn open_surface(&self, name: &EndpointName) -> anyhow::Result<()>;
}

pub struct MissingSurfaceOpener;

#[async_trait]
impl SurfaceOpener for MissingSurfaceOpener {
    async fn open_surface(&self, name: &EndpointName) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "no host available to open surface {name}"
        ))
    }
}
