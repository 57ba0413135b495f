use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::engine::{events::OutputEvent, session::SessionId};

struct Topic {
    sender: UnboundedSender<OutputEvent>,
    cancel: CancellationToken,
}

/// Per-session publish/subscribe. One writer (the session task) and one
/// subscriber per session; a topic lives from `subscribe` until its terminal
/// event is published or the subscriber goes away.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<DashMap<SessionId, Topic>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &SessionId) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let previous = self.topics.insert(
            session_id.clone(),
            Topic {
                sender,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Subscription {
            session_id: session_id.clone(),
            receiver,
            cancel,
            topics: self.topics.clone(),
        }
    }

    /// Cancellation signal of the session, fired when its subscriber leaves.
    pub fn cancellation(&self, session_id: &SessionId) -> Option<CancellationToken> {
        self.topics.get(session_id).map(|topic| topic.cancel.clone())
    }

    /// Enqueues `event` without waiting. Returns `false` when the event was
    /// dropped: nobody subscribed, the subscriber left, or the session
    /// already ended. A terminal event closes the topic.
    pub fn publish(&self, session_id: &SessionId, event: OutputEvent) -> bool {
        if event.is_terminal() {
            let Some((_, topic)) = self.topics.remove(session_id) else {
                return false;
            };
            return topic.sender.send(event).is_ok();
        }

        match self.topics.get(session_id) {
            Some(topic) => topic.sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn unsubscribe(&self, session_id: &SessionId) {
        if let Some((_, topic)) = self.topics.remove(session_id) {
            topic.cancel.cancel();
        }
    }

    pub fn is_open(&self, session_id: &SessionId) -> bool {
        self.topics.contains_key(session_id)
    }

    /// Fires every open session's cancellation. Topics stay open so each
    /// session can still deliver its terminal event.
    pub fn cancel_all(&self) {
        for topic in self.topics.iter() {
            topic.cancel.cancel();
        }
    }
}

/// Receiving end of one session's events. Ends after the terminal event.
/// Dropping it before then cancels the session.
pub struct Subscription {
    session_id: SessionId,
    receiver: UnboundedReceiver<OutputEvent>,
    cancel: CancellationToken,
    topics: Arc<DashMap<SessionId, Topic>>,
}

impl Subscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = OutputEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topics.remove(&self.session_id);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::EventBus;
    use crate::engine::{
        events::{OutputEvent, StatusKind},
        session::SessionId,
    };

    #[tokio::test]
    async fn delivers_in_order_and_closes_after_terminal() {
        let bus = EventBus::new();
        let id = SessionId::generate();
        let mut sub = bus.subscribe(&id);

        assert!(bus.publish(&id, OutputEvent::stdout(id.as_str(), "a")));
        assert!(bus.publish(&id, OutputEvent::stdout(id.as_str(), "b")));
        assert!(bus.publish(&id, OutputEvent::status(id.as_str(), StatusKind::Completed)));
        assert!(!bus.publish(&id, OutputEvent::stdout(id.as_str(), "late")));
        assert!(!bus.publish(&id, OutputEvent::status(id.as_str(), StatusKind::Error)));

        let mut received = Vec::new();
        while let Some(event) = sub.recv().await {
            received.push(event);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0], OutputEvent::stdout(id.as_str(), "a"));
        assert_eq!(received[1], OutputEvent::stdout(id.as_str(), "b"));
        assert!(received[2].is_terminal());
    }

    #[tokio::test]
    async fn events_without_subscriber_are_dropped() {
        let bus = EventBus::new();
        let id = SessionId::generate();
        assert!(!bus.publish(&id, OutputEvent::stdout(id.as_str(), "nobody")));
        assert!(bus.cancellation(&id).is_none());
    }

    #[tokio::test]
    async fn dropping_the_subscription_cancels_the_session() {
        let bus = EventBus::new();
        let id = SessionId::generate();
        let sub = bus.subscribe(&id);
        let cancel = bus.cancellation(&id).unwrap();
        assert!(!cancel.is_cancelled());

        drop(sub);

        assert!(cancel.is_cancelled());
        assert!(!bus.is_open(&id));
        assert!(!bus.publish(&id, OutputEvent::stdout(id.as_str(), "gone")));
    }

    #[tokio::test]
    async fn cancel_all_keeps_topics_open_for_the_terminal_event() {
        let bus = EventBus::new();
        let (first, second) = (SessionId::generate(), SessionId::generate());
        let mut sub = bus.subscribe(&first);
        let _other = bus.subscribe(&second);

        bus.cancel_all();

        assert!(bus.cancellation(&first).unwrap().is_cancelled());
        assert!(bus.cancellation(&second).unwrap().is_cancelled());
        assert!(bus.publish(&first, OutputEvent::status(first.as_str(), StatusKind::Terminated)));
        assert!(sub.recv().await.unwrap().is_terminal());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn explicit_unsubscribe_cancels_and_ends_stream() {
        let bus = EventBus::new();
        let id = SessionId::generate();
        let mut sub = bus.subscribe(&id);
        let cancel = bus.cancellation(&id).unwrap();

        bus.unsubscribe(&id);

        assert!(cancel.is_cancelled());
        assert!(sub.recv().await.is_none());
    }
}
