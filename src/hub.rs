//! Subscriber bookkeeping and fan-out for snapshot payloads.

use std::sync::Arc;

use tokio::sync::broadcast;

/// Answers whether anyone currently wants telemetry.
pub trait SubscriberGate: Send + Sync {
    fn has_subscribers(&self) -> bool;
}

/// Pushes a serialized snapshot to every current subscriber.
///
/// Delivery to individual subscribers is the transport's concern; publishing
/// never fails from the poller's point of view.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, payload: Arc<str>);
}

impl<T: SubscriberGate + ?Sized> SubscriberGate for Arc<T> {
    fn has_subscribers(&self) -> bool {
        (**self).has_subscribers()
    }
}

impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    fn publish(&self, payload: Arc<str>) {
        (**self).publish(payload)
    }
}

/// In-process pub/sub room backed by a broadcast channel.
///
/// Every live receiver counts as one subscriber; dropping the receiver
/// (client disconnect) removes it.
#[derive(Debug, Clone)]
pub struct SubscriberHub {
    sender: broadcast::Sender<Arc<str>>,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        let receiver = self.sender.subscribe();
        tracing::debug!(subscribers = self.sender.receiver_count(), "subscriber joined");
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(16)
    }
}

impl SubscriberGate for SubscriberHub {
    fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Broadcaster for SubscriberHub {
    fn publish(&self, payload: Arc<str>) {
        // only fails when nobody is listening
        if let Ok(delivered) = self.sender.send(payload) {
            tracing::trace!(delivered, "snapshot published");
        }
    }
}
