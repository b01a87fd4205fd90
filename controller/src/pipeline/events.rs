//! Event broadcasting for asynchronous consumers.

use std::sync::Arc;
use streamctl_types::PipelineEvent;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Fans every [`PipelineEvent`] of a pipeline out to any number of
/// subscribers. Slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBroadcaster {
    /// `buffer_size` events are kept for the slowest receiver.
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Broadcast an event to all subscribers.
    pub fn broadcast(&self, event: PipelineEvent) {
        debug!("Broadcasting event: {}", event.description());
        // No receiver is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe and get the events as a stream, skipping over lag.
    pub fn stream(&self) -> impl Stream<Item = PipelineEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Event subscriber lagging, skipping events: {}", e);
                None
            }
        })
    }

    /// Receivers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
