//! Inbound fan-out: one bounded multicast buffer, many filtered readers.
//!
//! Overflow policy is drop-oldest per reader: the producer never blocks, and
//! a reader that falls more than the buffer capacity behind skips the events
//! it missed (logged) and resumes from the oldest retained one.

use crate::NotificationEvent;
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

/// Owner of the inbound multicast buffer.
pub struct Fanout {
    sender: Mutex<Option<broadcast::Sender<NotificationEvent>>>,
}

impl Fanout {
    /// Create a fan-out buffer holding up to `capacity` events per reader.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Producer handle, or `None` once the fan-out has completed.
    pub fn publisher(&self) -> Option<FanoutPublisher> {
        self.sender.lock().as_ref().map(|sender| FanoutPublisher {
            sender: sender.clone(),
        })
    }

    /// New reader, or `None` once the fan-out has completed.
    pub fn attach(&self) -> Option<broadcast::Receiver<NotificationEvent>> {
        self.sender.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Stop accepting readers. Existing readers see end-of-stream once every
    /// outstanding publisher handle has been dropped.
    pub fn complete(&self) {
        self.sender.lock().take();
    }

    /// Number of attached readers.
    pub fn reader_count(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// Producer side held by the connection receive loop.
#[derive(Clone)]
pub struct FanoutPublisher {
    sender: broadcast::Sender<NotificationEvent>,
}

impl FanoutPublisher {
    /// Push an event to every attached reader. Never blocks and never fails
    /// the caller; an event with no reader is dropped.
    pub fn push(&self, event: NotificationEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(
                channel = %event.channel,
                "No subscribers attached, notification dropped"
            );
        }
    }
}

/// A subscriber's view of the inbound notifications, filtered to its
/// channels.
///
/// Ends when the bus shuts down. Dropping it detaches only this reader.
pub struct Subscription {
    inner: Option<BroadcastStream<NotificationEvent>>,
    channels: HashSet<String>,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<NotificationEvent>, channels: HashSet<String>) -> Self {
        Self {
            inner: Some(BroadcastStream::new(receiver)),
            channels,
        }
    }

    /// A subscription that is already complete.
    pub fn empty() -> Self {
        Self {
            inner: None,
            channels: HashSet::new(),
        }
    }

    /// Channels this subscription receives.
    pub fn channels(&self) -> &HashSet<String> {
        &self.channels
    }

    /// Whether this subscription can still yield events.
    pub fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }
}

impl Stream for Subscription {
    type Item = NotificationEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };

            match Pin::new(inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if this.channels.contains(&event.channel) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(
                        skipped = skipped,
                        "Subscriber lagging behind, oldest notifications dropped"
                    );
                }
                Poll::Ready(None) => {
                    this.inner = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
