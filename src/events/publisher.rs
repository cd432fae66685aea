use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcast publisher for batch lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub batch_id: String,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a lifecycle event for a batch, returning how many subscribers received it.
    ///
    /// Having no subscribers is not an error; lifecycle events are informational.
    pub fn publish(
        &self,
        event_name: impl Into<String>,
        batch_id: impl Into<String>,
        context: Value,
    ) -> usize {
        let event = PublishedEvent {
            name: event_name.into(),
            batch_id: batch_id.into(),
            context,
            published_at: chrono::Utc::now(),
        };

        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
