//! Real-time dispatcher.
//!
//! Delivers newly committed message and notification rows to live
//! subscribers, keyed by `channel:{id}` / `user:{id}`. Delivery is
//! at-least-once and consumers de-duplicate by row id; within one channel,
//! publish order matches persisted order because every publish happens
//! after its row's commit on the same call path.
//!
//! This is a low-latency notice, not a durable delivery log: a subscriber
//! that disconnects gets no replay and reconciles via the backfill query.
//! Slow subscribers have events dropped rather than ever blocking the
//! publisher.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parley_shared::SubjectKey;
use parley_store::{Message, Notification};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// A committed row handed to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message(Message),
    Notification(Notification),
}

impl Event {
    /// Row id, for client-side de-duplication.
    pub fn row_id(&self) -> Uuid {
        match self {
            Event::Message(m) => m.id,
            Event::Notification(n) => n.id,
        }
    }
}

type SubscriberMap = HashMap<SubjectKey, HashMap<Uuid, mpsc::Sender<Event>>>;

/// Registry of live subscriptions.
#[derive(Clone)]
pub struct Dispatcher {
    subjects: Arc<RwLock<SubscriberMap>>,
    buffer: usize,
}

impl Dispatcher {
    pub fn new(buffer: usize) -> Self {
        Self {
            subjects: Arc::new(RwLock::new(HashMap::new())),
            buffer,
        }
    }

    /// Register a subscriber for one subject key.
    ///
    /// Registration returns immediately; events arrive on the returned
    /// [`Subscription`], which unregisters itself when dropped.
    pub async fn subscribe(&self, key: SubjectKey) -> Subscription {
        let (tx, rx) = mpsc::channel::<Event>(self.buffer);
        let id = Uuid::new_v4();

        let mut subjects = self.subjects.write().await;
        subjects.entry(key).or_default().insert(id, tx);

        debug!(subject = %key, subscriber = %id, "subscriber registered");

        Subscription {
            dispatcher: self.clone(),
            key,
            id,
            rx,
        }
    }

    /// Remove one subscriber. Dropping its [`Subscription`] calls this.
    pub async fn unsubscribe(&self, key: SubjectKey, id: Uuid) {
        let mut subjects = self.subjects.write().await;
        if let Some(subscribers) = subjects.get_mut(&key) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                subjects.remove(&key);
            }
        }
        debug!(subject = %key, subscriber = %id, "subscriber removed");
    }

    /// Deliver an event to every live subscriber of the key. Returns the
    /// number of subscribers reached. Subscribers whose receiver is gone
    /// are pruned; subscribers whose buffer is full have this event
    /// dropped (they reconcile via backfill).
    pub async fn publish(&self, key: SubjectKey, event: Event) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subjects = self.subjects.read().await;
            let Some(subscribers) = subjects.get(&key) else {
                return 0;
            };
            for (id, tx) in subscribers {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subject = %key, subscriber = %id, "dropping event for slow subscriber");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subjects = self.subjects.write().await;
            if let Some(subscribers) = subjects.get_mut(&key) {
                for id in closed {
                    subscribers.remove(&id);
                }
                if subscribers.is_empty() {
                    subjects.remove(&key);
                }
            }
        }

        delivered
    }

    /// Drop subject entries whose subscribers have all gone away without
    /// an intervening publish. Run periodically from a background task.
    pub async fn purge_idle(&self) {
        let mut subjects = self.subjects.write().await;
        subjects.retain(|_, subscribers| {
            subscribers.retain(|_, tx| !tx.is_closed());
            !subscribers.is_empty()
        });
    }

    /// Live subscriber count for a key.
    pub async fn subscriber_count(&self, key: SubjectKey) -> usize {
        self.subjects
            .read()
            .await
            .get(&key)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// One live subscription. A [`Stream`] of [`Event`]s; unregisters its
/// filter on drop so a no-longer-interested consumer can never receive
/// further delivery.
pub struct Subscription {
    dispatcher: Dispatcher,
    key: SubjectKey,
    id: Uuid,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Await the next event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn key(&self) -> SubjectKey {
        self.key
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        let dispatcher = self.dispatcher.clone();
        let key = self.key;
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                dispatcher.unsubscribe(key, id).await;
            });
        }
        // Outside a runtime the entry is pruned lazily on the next publish,
        // since the closed receiver makes try_send fail.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::Message;

    fn test_message(channel_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id,
            sender_id: Uuid::new_v4(),
            content: Some("hi".into()),
            attachments: Vec::new(),
            is_edited: false,
            deleted_at: None,
            created_at: chrono::SubsecRound::trunc_subsecs(chrono::Utc::now(), 6),
        }
    }

    #[tokio::test]
    async fn delivers_only_to_matching_subject() {
        let dispatcher = Dispatcher::new(16);
        let channel = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut sub = dispatcher.subscribe(SubjectKey::Channel(channel)).await;
        let mut unrelated = dispatcher.subscribe(SubjectKey::Channel(other)).await;

        let message = test_message(channel);
        let delivered = dispatcher
            .publish(SubjectKey::Channel(channel), Event::Message(message.clone()))
            .await;
        assert_eq!(delivered, 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.row_id(), message.id);

        // The unrelated subscriber saw nothing.
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), unrelated.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn publish_order_matches_per_key() {
        let dispatcher = Dispatcher::new(16);
        let channel = Uuid::new_v4();
        let mut sub = dispatcher.subscribe(SubjectKey::Channel(channel)).await;

        let first = test_message(channel);
        let second = test_message(channel);
        dispatcher
            .publish(SubjectKey::Channel(channel), Event::Message(first.clone()))
            .await;
        dispatcher
            .publish(SubjectKey::Channel(channel), Event::Message(second.clone()))
            .await;

        assert_eq!(sub.recv().await.unwrap().row_id(), first.id);
        assert_eq!(sub.recv().await.unwrap().row_id(), second.id);
    }

    #[tokio::test]
    async fn dropped_subscription_unregisters_the_filter() {
        let dispatcher = Dispatcher::new(16);
        let channel = Uuid::new_v4();

        let sub = dispatcher.subscribe(SubjectKey::Channel(channel)).await;
        assert_eq!(dispatcher.subscriber_count(SubjectKey::Channel(channel)).await, 1);

        drop(sub);
        tokio::task::yield_now().await;

        // Either the spawned unsubscribe already ran, or the next publish
        // prunes the closed sender. Both end with zero delivery.
        let delivered = dispatcher
            .publish(SubjectKey::Channel(channel), Event::Message(test_message(channel)))
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(dispatcher.subscriber_count(SubjectKey::Channel(channel)).await, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let dispatcher = Dispatcher::new(1);
        let channel = Uuid::new_v4();
        let mut sub = dispatcher.subscribe(SubjectKey::Channel(channel)).await;

        let first = test_message(channel);
        let second = test_message(channel);
        assert_eq!(
            dispatcher
                .publish(SubjectKey::Channel(channel), Event::Message(first.clone()))
                .await,
            1
        );
        // Buffer full: the second event is dropped, publish returns at once.
        assert_eq!(
            dispatcher
                .publish(SubjectKey::Channel(channel), Event::Message(second))
                .await,
            0
        );
        assert_eq!(sub.recv().await.unwrap().row_id(), first.id);
    }
}
