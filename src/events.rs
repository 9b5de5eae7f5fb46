//! Event bus
//!
//! Fans typed events out to zero-or-more subscribers over a bounded
//! broadcast channel. A slow subscriber never blocks publishers: once its
//! buffer fills, the oldest events are discarded and the receiving edge
//! observes a lag it reports as a single synthesized overflow log event.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::Event;

/// Per-subscriber buffer capacity
pub const BUS_CAPACITY: usize = 256;

/// Handle for publishing and subscribing to the daemon's event stream
///
/// Cloning is cheap; all clones publish into the same channel. Dropping a
/// [`EventStream`] unsubscribes it.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event to every current subscriber, best-effort
    pub fn publish(&self, event: Event) {
        trace!(kind = event.kind(), "publishing event");
        // Send only fails when there are no subscribers, which is fine.
        let _ = self.sender.send(event);
    }

    /// Publish a `log` event
    pub fn log(&self, message: impl Into<String>) {
        self.publish(Event::log(message));
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to the event bus
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
}

/// Outcome of waiting on an [`EventStream`]
pub enum BusMessage {
    Event(Event),
    /// `n` events were dropped because this subscriber lagged behind
    Overflow(u64),
    /// The bus was torn down
    Closed,
}

impl EventStream {
    /// Wait for the next event
    ///
    /// On overflow the dropped count is surfaced once and the stream
    /// resumes from the oldest retained event.
    pub async fn recv(&mut self) -> BusMessage {
        match self.receiver.recv().await {
            Ok(event) => BusMessage::Event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => BusMessage::Overflow(n),
            Err(broadcast::error::RecvError::Closed) => BusMessage::Closed,
        }
    }

    /// Non-blocking poll used by tests
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}
