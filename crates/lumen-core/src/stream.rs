//! Broadcast of partial results to any number of subscribers.
//!
//! The channel is bounded and never blocks the producer: a subscriber that
//! falls more than `capacity` events behind silently loses the oldest ones.
//! A request's terminal event is always the last event pushed for it, so a
//! lagging subscriber may miss fragments but still observes the terminal.

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{PartialResult, RequestId};

#[derive(Debug, Clone)]
pub struct ResultStream {
    sender: broadcast::Sender<PartialResult>,
}

impl ResultStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Push an event. Returns `false` if nobody is subscribed.
    pub fn push(&self, event: PartialResult) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A live view of the stream, starting at the moment of subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<PartialResult>,
}

impl Subscription {
    /// Next event of any request, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<PartialResult> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        event = "subscriber_lagged",
                        skipped = skipped,
                        "Subscriber lagged, oldest events dropped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event of `id`, skipping events of other requests.
    pub async fn recv_for(&mut self, id: RequestId) -> Option<PartialResult> {
        loop {
            let event = self.recv().await?;
            if event.request_id == id {
                return Some(event);
            }
        }
    }

    /// The events of `id` as a stream that ends after its terminal event.
    pub fn into_request_stream(self, id: RequestId) -> impl Stream<Item = PartialResult> {
        futures::stream::unfold(Some(self), move |subscription| async move {
            let mut subscription = subscription?;
            let event = subscription.recv_for(id).await?;
            let next = (!event.done).then_some(subscription);
            Some((event, next))
        })
    }
}
