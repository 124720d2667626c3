//! Set of channels the bus listens on.

use crate::connection::LiveConnection;
use crate::PubSubResult;
use dashmap::DashSet;
use tracing::{debug, error};

/// Insert-only, concurrently shared set of listened channels.
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: DashSet<String>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `channels`, returning only those that were not yet registered.
    ///
    /// Insertion is atomic per channel, so two concurrent callers never both
    /// receive the same channel back.
    pub fn register<'a>(&self, channels: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        channels
            .into_iter()
            .filter(|channel| self.channels.insert((*channel).clone()))
            .cloned()
            .collect()
    }

    /// Whether `channel` is registered.
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// All registered channels in sorted order.
    pub fn snapshot(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        channels.sort();
        channels
    }
}

/// Listen on each channel on `connection`, in order, stopping at the first
/// failure. Channels already listened on that connection send nothing; one
/// whose `LISTEN` is still in flight is waited for.
pub async fn listen_channels(connection: &LiveConnection, channels: &[String]) -> PubSubResult<()> {
    for channel in channels {
        if let Err(e) = connection.listen(channel).await {
            error!(
                channel = %channel,
                channels = channels.len(),
                error = %e,
                "Error executing LISTEN"
            );
            return Err(e);
        }
    }

    if !channels.is_empty() {
        debug!(count = channels.len(), "Listening on channels");
    }
    Ok(())
}
