//! Per-session fan-out of [`SessionEvent`]s.
//!
//! A `Broadcaster` lives inside the session state and is only touched while
//! the session mutex is held, so a new subscriber's initial snapshot and its
//! registration happen atomically with respect to publishing.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::events::SessionEvent;

#[derive(Debug, Default)]
pub(crate) struct Broadcaster {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl Broadcaster {
    /// Deliver to every live subscriber, pruning those whose receiver was
    /// dropped. Never blocks.
    pub(crate) fn publish(&mut self, event: &SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Register a subscriber whose first item is `initial`.
    pub(crate) fn subscribe(&mut self, initial: SessionEvent) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);
        self.subscribers.push(tx);
        Subscription { rx }
    }

    /// Drop every sender; subscribers drain what is queued and then end.
    pub(crate) fn close(&mut self) {
        self.subscribers.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// Receiving end of a session subscription.
///
/// Ends once the session is deleted or the hub drops it.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
