//! Publish/subscribe and request/response on top of one host channel.

pub mod error;
mod event_handler;
mod pending;

pub use error::RouterError;
pub use event_handler::{EventHandler, Subscriber};
pub use pending::PendingReply;
