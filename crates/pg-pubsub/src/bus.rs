//! The notification bus facade.

use crate::config::PubSubConfig;
use crate::connection::{ConnectionSlot, Connector};
use crate::fanout::{Fanout, Subscription};
use crate::identifier::validate_channel;
use crate::outbound::{
    outbound_queue, BatchWorker, EnqueueError, NotifyExecutor, OutboundReceiver, OutboundSender,
};
use crate::registry::{listen_channels, SubscriptionRegistry};
use crate::supervisor::{Supervisor, SupervisorState};
use crate::{NotificationRequest, PubSubError, PubSubResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

enum Lifecycle {
    Idle,
    Running { shutdown_tx: broadcast::Sender<()> },
    Closed,
}

/// Publish/subscribe bus multiplexing many subscribers and publishers over
/// one listening connection.
///
/// Subscribing and publishing work before [`NotificationBus::connect`]:
/// channels are listened on once a connection is up, and fire-and-forget
/// requests wait in the queue. After [`NotificationBus::shutdown`] the bus
/// cannot be restarted.
pub struct NotificationBus {
    config: PubSubConfig,
    connector: Arc<dyn Connector>,
    slot: Arc<ConnectionSlot>,
    registry: Arc<SubscriptionRegistry>,
    fanout: Fanout,
    executor: Arc<NotifyExecutor>,
    outbound_tx: Mutex<Option<OutboundSender>>,
    outbound_rx: Mutex<Option<OutboundReceiver>>,
    state: Arc<watch::Sender<SupervisorState>>,
    lifecycle: Mutex<Lifecycle>,
}

impl NotificationBus {
    /// Create an idle bus. Fails only if `config` is invalid.
    pub fn new(connector: impl Connector, config: PubSubConfig) -> PubSubResult<Self> {
        config.validate()?;

        let slot = Arc::new(ConnectionSlot::new());
        let (outbound_tx, outbound_rx) = outbound_queue(config.outbound_queue_capacity);
        let (state, _) = watch::channel(SupervisorState::Idle);

        Ok(Self {
            fanout: Fanout::new(config.inbound_buffer_size),
            executor: Arc::new(NotifyExecutor::new(slot.clone())),
            registry: Arc::new(SubscriptionRegistry::new()),
            connector: Arc::new(connector),
            slot,
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::Idle),
            config,
        })
    }

    /// Bus configuration.
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Subscribe to `channels`.
    ///
    /// Every name is validated before anything else happens. An empty set
    /// returns an already-completed subscription. When a connection is live
    /// this returns only after every requested channel is listened on it,
    /// sharing any `LISTEN` another caller already has in flight. A failure
    /// there is logged and recovered by the next reconnect.
    pub async fn subscribe<I, S>(&self, channels: I) -> PubSubResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: HashSet<String> = channels.into_iter().map(Into::into).collect();
        for channel in &channels {
            validate_channel(channel)?;
        }

        if channels.is_empty() {
            return Ok(Subscription::empty());
        }

        // Attach before LISTEN so nothing delivered after it can be missed.
        let Some(receiver) = self.fanout.attach() else {
            debug!("Bus is shut down, returning completed subscription");
            return Ok(Subscription::empty());
        };

        let added = self.registry.register(&channels);
        if !added.is_empty() {
            debug!(count = added.len(), "Registered new channels");
        }

        // Every requested channel, not only the new ones: another
        // subscriber's LISTEN for the same channel may still be in flight.
        if let Some(live) = self.slot.current() {
            let mut pending: Vec<String> = channels.iter().cloned().collect();
            pending.sort();
            if listen_channels(&live, &pending).await.is_err() {
                warn!(
                    count = pending.len(),
                    "LISTEN failed for channels, they will be listened on after reconnect"
                );
            }
        }

        Ok(Subscription::new(receiver, channels))
    }

    /// Publish one notification and wait for the database round trip.
    pub async fn publish(&self, channel: impl Into<String>, payload: Option<String>) -> PubSubResult<()> {
        self.publish_all(vec![NotificationRequest::new(channel, payload)])
            .await
    }

    /// Publish `requests` in order and wait for every round trip.
    ///
    /// Requests are sent in batches of `outbound_batch_size`; the first
    /// failing batch aborts the rest.
    pub async fn publish_all(&self, requests: impl IntoIterator<Item = NotificationRequest>) -> PubSubResult<()> {
        let requests: Vec<NotificationRequest> = requests.into_iter().collect();
        for request in &requests {
            validate_channel(&request.channel)?;
        }

        let closed = matches!(*self.lifecycle.lock(), Lifecycle::Closed);
        if closed {
            return Err(PubSubError::NoActiveConnection);
        }

        self.executor
            .execute_chunked(
                &requests,
                self.config.outbound_batch_size,
                &self.config.notify_retry_policy(),
            )
            .await
    }

    /// Queue a notification and return immediately.
    ///
    /// Only validation can fail. Delivery problems are logged and the
    /// notification dropped.
    pub fn publish_async(&self, channel: impl Into<String>, payload: Option<String>) -> PubSubResult<()> {
        let request = NotificationRequest::new(channel, payload);
        validate_channel(&request.channel)?;

        let outbound_tx = self.outbound_tx.lock();
        let Some(sender) = outbound_tx.as_ref() else {
            debug!(channel = %request.channel, "Bus is shut down, notification dropped");
            return Ok(());
        };

        match sender.enqueue(request) {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                warn!("Outbound queue is full, notification dropped");
            }
            Err(EnqueueError::Closed) => {
                debug!("Outbound worker stopped, notification dropped");
            }
        }
        Ok(())
    }

    /// Start the connection supervisor and the outbound worker.
    ///
    /// Must be called from within a tokio runtime. Calling it while running
    /// does nothing; calling it after shutdown logs a warning and does
    /// nothing.
    pub fn connect(&self) {
        let mut lifecycle = self.lifecycle.lock();

        match *lifecycle {
            Lifecycle::Running { .. } => {
                debug!("Notification bus already running");
                return;
            }
            Lifecycle::Closed => {
                warn!("Notification bus was shut down and cannot be restarted");
                return;
            }
            Lifecycle::Idle => {}
        }

        let Some(publisher) = self.fanout.publisher() else {
            warn!("Notification fan-out already completed");
            return;
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let outbound = self.outbound_rx.lock().take().map(|receiver| {
            let worker = BatchWorker {
                executor: self.executor.clone(),
                batch_size: self.config.outbound_batch_size,
                window: self.config.outbound_batch_window(),
                parallelism: self.config.outbound_parallelism,
                policy: self.config.outbound_retry_policy(),
            };
            tokio::spawn(worker.run(receiver))
        });

        let supervisor = Supervisor {
            connector: self.connector.clone(),
            slot: self.slot.clone(),
            registry: self.registry.clone(),
            publisher,
            state: self.state.clone(),
            policy: self.config.reconnect_policy(),
            outbound,
        };
        tokio::spawn(supervisor.run(shutdown_rx));

        *lifecycle = Lifecycle::Running { shutdown_tx };
        info!(
            batch_size = self.config.outbound_batch_size,
            parallelism = self.config.outbound_parallelism,
            "Notification bus started"
        );
    }

    /// Stop the bus.
    ///
    /// Completes every subscription and closes the queue. Fire-and-forget
    /// requests already queued are sent before the connection is closed.
    /// Idempotent; does not wait for the background tasks.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);

        match previous {
            Lifecycle::Closed => return,
            Lifecycle::Running { shutdown_tx } => {
                let _ = shutdown_tx.send(());
            }
            Lifecycle::Idle => {
                self.state.send_replace(SupervisorState::Closed);
            }
        }

        self.outbound_tx.lock().take();
        self.outbound_rx.lock().take();
        self.fanout.complete();
        info!("Notification bus shut down");
    }

    /// Whether [`NotificationBus::connect`] was called and the bus has not
    /// been shut down.
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Whether a connection is live right now.
    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    /// Current connection state.
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Receiver observing connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.fanout.reader_count()
    }

    /// Every channel subscribed so far, sorted.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.registry.snapshot()
    }
}

impl Drop for NotificationBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn bus(broker: &MemoryBroker) -> NotificationBus {
        NotificationBus::new(broker.connector(), PubSubConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let broker = MemoryBroker::new();
        let config = PubSubConfig {
            outbound_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            NotificationBus::new(broker.connector(), config),
            Err(PubSubError::Config(_))
        ));

        // Would otherwise panic inside the channel constructors.
        let config = PubSubConfig {
            inbound_buffer_size: usize::MAX,
            outbound_parallelism: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(
            NotificationBus::new(broker.connector(), config),
            Err(PubSubError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_new_bus_is_idle() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        assert_eq!(bus.state(), SupervisorState::Idle);
        assert!(!bus.is_running());
        assert!(!bus.is_connected());
        assert_eq!(broker.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_registers_only() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);

        let subscription = bus.subscribe(["a", "b"]).await.unwrap();
        assert_eq!(subscription.channels().len(), 2);
        assert_eq!(bus.subscribed_channels(), vec!["a", "b"]);
        assert!(broker.executed_commands().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected_before_registration() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);

        let result = bus.subscribe(["good", "bad-name"]).await;
        assert!(matches!(result, Err(PubSubError::InvalidChannel(_))));
        assert!(bus.subscribed_channels().is_empty());

        assert!(matches!(
            bus.publish_async("no spaces", None),
            Err(PubSubError::InvalidChannel(_))
        ));
        assert!(matches!(
            bus.publish("semi;colon", None).await,
            Err(PubSubError::InvalidChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_without_connect() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);

        bus.shutdown();
        bus.shutdown();
        assert_eq!(bus.state(), SupervisorState::Closed);

        bus.connect();
        assert!(!bus.is_running());
        assert_eq!(broker.connect_count(), 0);

        assert!(bus.subscribe(["a"]).await.unwrap().is_terminated());
        assert!(bus.publish_async("a", None).is_ok());
        assert!(matches!(
            bus.publish("a", None).await,
            Err(PubSubError::NoActiveConnection)
        ));
    }
}
