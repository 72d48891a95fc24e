use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use serde_json::Value;
use shared::{domain::CorrelationId, protocol::Event};
use tokio::sync::oneshot;

use crate::RouterError;

type Resolver = oneshot::Sender<Result<Value, RouterError>>;

/// Outstanding requests of one event handler, keyed by correlation id.
///
/// There is no timeout: an entry leaves the table when its reply arrives or
/// when the channel closes, whichever happens first.
#[derive(Default)]
pub(crate) struct PendingTable {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    closed: bool,
    requests: HashMap<CorrelationId, Resolver>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        id: CorrelationId,
        endpoint: &str,
    ) -> Result<oneshot::Receiver<Result<Value, RouterError>>, RouterError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RouterError::ChannelClosed(endpoint.to_string()));
        }
        let (resolver, receiver) = oneshot::channel();
        state.requests.insert(id, resolver);
        Ok(receiver)
    }

    pub(crate) fn take(&self, id: &CorrelationId) -> Option<Resolver> {
        self.lock().requests.remove(id)
    }

    /// Closes the table and rejects every outstanding request under one lock.
    pub(crate) fn reject_all(&self, error: RouterError) -> usize {
        let drained: Vec<Resolver> = {
            let mut state = self.lock();
            state.closed = true;
            state.requests.drain().map(|(_, resolver)| resolver).collect()
        };
        let rejected = drained.len();
        for resolver in drained {
            let _ = resolver.send(Err(error.clone()));
        }
        rejected
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().requests.len()
    }
}

/// Eventual result of [`crate::EventHandler::send`].
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    id: CorrelationId,
    event: Event,
    endpoint: String,
    receiver: oneshot::Receiver<Result<Value, RouterError>>,
}

impl PendingReply {
    pub(crate) fn new(
        id: CorrelationId,
        event: Event,
        endpoint: String,
        receiver: oneshot::Receiver<Result<Value, RouterError>>,
    ) -> Self {
        Self {
            id,
            event,
            endpoint,
            receiver,
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl Future for PendingReply {
    type Output = Result<Value, RouterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The resolver was dropped without an answer: the handler went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RouterError::ChannelClosed(
                self.endpoint.clone(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reject_all_closes_table_for_new_requests() {
        let table = PendingTable::default();
        let first = table
            .register(CorrelationId::from("1"), "dFrame-1")
            .expect("register");
        let second = table
            .register(CorrelationId::from("2"), "dFrame-1")
            .expect("register");

        let rejected = table.reject_all(RouterError::ChannelClosed("dFrame-1".into()));
        assert_eq!(rejected, 2);
        assert_eq!(table.len(), 0);

        for receiver in [first, second] {
            assert_eq!(
                receiver.await.expect("answered"),
                Err(RouterError::ChannelClosed("dFrame-1".into()))
            );
        }
        assert!(table
            .register(CorrelationId::from("3"), "dFrame-1")
            .is_err());
    }

    #[tokio::test]
    async fn dropped_resolver_reads_as_channel_closed() {
        let table = PendingTable::default();
        let id = CorrelationId::from("1");
        let receiver = table.register(id.clone(), "eFrame-1").expect("register");
        let reply = PendingReply::new(id.clone(), Event::GetRecipients, "eFrame-1".into(), receiver);
        drop(table.take(&id));
        assert_eq!(
            reply.await,
            Err(RouterError::ChannelClosed("eFrame-1".into()))
        );
    }
}
